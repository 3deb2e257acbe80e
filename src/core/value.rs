/// Value Module
///
/// Driver-neutral scalar values, parameter sets and tabular results. These are
/// the types that cross every boundary of the crate: the mapper writes them,
/// the builder binds them, drivers read and return them.
use crate::core::{RelError, Result};
use serde::de::{Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// Marker prefix every parameter name carries once normalized.
pub const PARAM_MARKER: char = '@';

/// Whole reals in `[I64_LOWER, I64_UPPER)` convert to `i64` without saturating
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

/// Core value types bound to and read from SQL statements
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns true for `Value::Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, coercing booleans, whole reals and numeric text
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            Value::Real(f) if f.fract() == 0.0 && (I64_LOWER..I64_UPPER).contains(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text view of the value, if it holds text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a JSON value into a bindable value.
    ///
    /// Arrays and objects have no scalar counterpart and are stored as their
    /// JSON text.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Real(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        }
    }

    /// Converts the value into its JSON counterpart
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Blob(b) => serde_json::Value::from(b.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<BLOB: {} bytes>", b.len()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $conv)
                }
            }
        )*
    };
}

value_from!(
    i8 => Integer as i64,
    i16 => Integer as i64,
    i32 => Integer as i64,
    i64 => Integer as i64,
    u8 => Integer as i64,
    u16 => Integer as i64,
    u32 => Integer as i64,
    f32 => Real as f64,
    f64 => Real as f64,
);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

/// Normalizes a parameter name to carry exactly one marker prefix.
///
/// Leading `@`, `:` and `?` markers are stripped before the canonical `@` is
/// prepended, so `Name`, `@Name` and `:Name` all normalize to `@Name`.
pub fn normalize_param_name(name: &str) -> String {
    let bare = name.trim().trim_start_matches(['@', ':', '?']);
    format!("{}{}", PARAM_MARKER, bare)
}

fn bare_name(name: &str) -> &str {
    name.trim().trim_start_matches(['@', ':', '?'])
}

/// Ordered parameter bindings for a SQL statement.
///
/// Names are stored normalized (`@Name`). Lookups ignore case and the marker,
/// and inserting a differently-cased variant of an existing name replaces it,
/// so a set never holds two spellings of one logical parameter.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParameterSet {
    entries: Vec<(String, Value)>,
}

impl ParameterSet {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a parameter set from any serializable object or map.
    ///
    /// Struct fields and map keys become parameter names in declaration order.
    pub fn from_serialize<T: Serialize + ?Sized>(data: &T) -> Result<Self> {
        match serde_json::to_value(data)? {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| (k, Value::from_json(v)))
                .collect()),
            serde_json::Value::Null => Ok(Self::new()),
            other => Err(RelError::Argument(format!(
                "parameters must be an object or map, got {}",
                other
            ))),
        }
    }

    /// Adds or replaces a named value
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        let normalized = normalize_param_name(name);
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.entries[idx] = (normalized, value),
            None => self.entries.push((normalized, value)),
        }
    }

    /// Builder-style `insert`
    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Looks up a value by name, ignoring case and marker
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    /// Returns true if the set holds a value for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Removes and returns the value bound to `name`
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    /// Number of bound parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no parameters are bound
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(normalized name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Normalized parameter names in insertion order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let wanted = bare_name(name);
        self.entries
            .iter()
            .position(|(k, _)| bare_name(k).eq_ignore_ascii_case(wanted))
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for (k, v) in iter {
            set.insert(k.as_ref(), v);
        }
        set
    }
}

impl Serialize for ParameterSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(bare_name(k), v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let OrderedRow(entries) = OrderedRow::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

/// Rows returned by a query, with their column names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Row values, one vector per row, aligned with `columns`
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Creates a RowSet from column names and row data
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        RowSet { columns, rows }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no rows were returned
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column, matched case-insensitively
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value at `row` for the named column
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// First column of the first row, or `Null` when the set is empty
    pub fn scalar(&self) -> Value {
        self.rows
            .first()
            .and_then(|r| r.first())
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Keeps only the first row
    pub fn truncate_to_first(mut self) -> Self {
        self.rows.truncate(1);
        self
    }
}

struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl Serialize for RowRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (c, v) in self.columns.iter().zip(self.values) {
            map.serialize_entry(c, v)?;
        }
        map.end()
    }
}

/// Serializes as an array of `{column: value}` objects
impl Serialize for RowSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in &self.rows {
            seq.serialize_element(&RowRef {
                columns: &self.columns,
                values: row,
            })?;
        }
        seq.end()
    }
}

/// One JSON object with its key order kept
struct OrderedRow(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for OrderedRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = OrderedRow;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a row object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<OrderedRow, A::Error> {
                let mut entries = Vec::new();
                while let Some((name, value)) = map.next_entry::<String, Value>()? {
                    entries.push((name, value));
                }
                Ok(OrderedRow(entries))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// Reads an array of row objects; columns appear in first-seen order and
/// rows lacking a column get `Null`
impl<'de> Deserialize<'de> for RowSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RowSetVisitor;

        impl<'de> Visitor<'de> for RowSetVisitor {
            type Value = RowSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of row objects")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<RowSet, A::Error> {
                let mut set = RowSet::default();
                while let Some(OrderedRow(entries)) = seq.next_element()? {
                    for (name, _) in &entries {
                        if set.column_index(name).is_none() {
                            set.columns.push(name.clone());
                            for row in set.rows.iter_mut() {
                                row.push(Value::Null);
                            }
                        }
                    }
                    let mut row = vec![Value::Null; set.columns.len()];
                    for (name, value) in entries {
                        if let Some(idx) = set.column_index(&name) {
                            row[idx] = value;
                        }
                    }
                    set.rows.push(row);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_seq(RowSetVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[test]
    fn test_param_names_are_normalized() {
        assert_eq!(normalize_param_name("Name"), "@Name");
        assert_eq!(normalize_param_name("@Name"), "@Name");
        assert_eq!(normalize_param_name(" :Name "), "@Name");
        assert_eq!(normalize_param_name("@@Name"), "@Name");
    }

    #[test]
    fn test_case_variants_collapse_to_one_entry() {
        let mut params = ParameterSet::new();
        params.insert("name", "ann");
        params.insert("@Name", "bob");
        params.insert("NAME", "cid");

        assert_eq!(params.len(), 1);
        assert_eq!(params.get("Name"), Some(&Value::Text("cid".to_string())));
        assert_eq!(params.names(), vec!["@NAME"]);
    }

    #[test]
    fn test_from_serialize_keeps_field_order() {
        #[derive(Serialize)]
        struct Filter {
            name: String,
            age: i32,
            email: Option<String>,
        }

        let params = ParameterSet::from_serialize(&Filter {
            name: "Ann".to_string(),
            age: 30,
            email: None,
        })
        .unwrap();

        assert_eq!(params.names(), vec!["@name", "@age", "@email"]);
        assert_eq!(params.get("age"), Some(&Value::Integer(30)));
        assert_eq!(params.get("email"), Some(&Value::Null));
    }

    #[test]
    fn test_from_serialize_keeps_non_alphabetical_order() {
        #[derive(Serialize)]
        struct Keys {
            zeta: i32,
            alpha: i32,
        }

        let params = ParameterSet::from_serialize(&Keys { zeta: 1, alpha: 2 }).unwrap();
        assert_eq!(params.names(), vec!["@zeta", "@alpha"]);

        let parsed: ParameterSet = serde_json::from_str(r#"{"Zeta": 1, "Mid": 2, "Alpha": 3}"#).unwrap();
        assert_eq!(parsed.names(), vec!["@Zeta", "@Mid", "@Alpha"]);
    }

    #[test]
    fn test_as_i64_rejects_out_of_range_reals() {
        assert_eq!(Value::Real(42.0).as_i64(), Some(42));
        assert_eq!(Value::Real(-9_223_372_036_854_775_808.0).as_i64(), Some(i64::MIN));
        assert_eq!(Value::Real(9_223_372_036_854_775_808.0).as_i64(), None);
        assert_eq!(Value::Real(1e19).as_i64(), None);
        assert_eq!(Value::Real(-1e19).as_i64(), None);
        assert_eq!(Value::Real(f64::INFINITY).as_i64(), None);
        assert_eq!(Value::Real(f64::NAN).as_i64(), None);
        assert_eq!(Value::Real(2.5).as_i64(), None);
    }

    #[test]
    fn test_from_serialize_rejects_scalars() {
        let err = ParameterSet::from_serialize(&42).unwrap_err();
        assert!(matches!(err, RelError::Argument(_)));
    }

    #[test]
    fn test_parameter_set_json_round_trip() {
        let params: ParameterSet =
            serde_json::from_str(r#"{"Id": 7, "Name": "Ann", "Score": 1.5, "Flag": true}"#).unwrap();
        assert_eq!(params.get("@id"), Some(&Value::Integer(7)));
        assert_eq!(params.get("score"), Some(&Value::Real(1.5)));

        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"Id":7,"Name":"Ann","Score":1.5,"Flag":true}"#);
    }

    #[test]
    fn test_rowset_accessors_and_json() {
        let rows = RowSet::new(
            vec!["Id".to_string(), "Name".to_string()],
            vec![
                vec![Value::Integer(1), Value::from("Ann")],
                vec![Value::Integer(2), Value::Null],
            ],
        );

        assert_eq!(rows.scalar(), Value::Integer(1));
        assert_eq!(rows.get(1, "name"), Some(&Value::Null));
        assert_eq!(
            serde_json::to_string(&rows).unwrap(),
            r#"[{"Id":1,"Name":"Ann"},{"Id":2,"Name":null}]"#
        );
        assert_eq!(RowSet::default().scalar(), Value::Null);
    }

    #[test]
    fn test_rowset_from_json_keeps_column_order() {
        let rows: RowSet =
            serde_json::from_str(r#"[{"Name":"Ann","Id":1},{"Id":2,"Email":"b@x"}]"#).unwrap();
        assert_eq!(rows.columns, vec!["Name", "Id", "Email"]);
        assert_eq!(rows.rows[0], vec![Value::from("Ann"), Value::Integer(1), Value::Null]);
        assert_eq!(rows.get(1, "Name"), Some(&Value::Null));
        assert_eq!(rows.get(1, "email"), Some(&Value::from("b@x")));
    }

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::from("42").as_i64(), Some(42));
        assert_eq!(Value::Real(3.0).as_i64(), Some(3));
        assert_eq!(Value::Real(3.5).as_i64(), None);
        assert_eq!(Value::from(Some(5)), Value::Integer(5));
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }
}
