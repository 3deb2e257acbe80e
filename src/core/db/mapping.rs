/// Entity Mapping Module
///
/// This module turns an entity's declared field table into cached
/// `TableMetadata` and moves values between entities and rows.
///
/// Values travel through `serde_json::Value`: the write path serializes the
/// caller's data and formats each mapped field, the read path starts from
/// `T::default()` and overwrites the fields whose columns are present.
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::{RelError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use serde::de::{DeserializeOwned, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Format applied to `FieldKind::DateTime` values on write when no other format is set
///
/// Sub-second digits are written only when present.
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Shape the read path normalizes naive timestamps to
const NAIVE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Declared value kind of an entity field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Integer,
    Real,
    Text,
    DateTime,
    Blob,
}

/// Write-path formatting for a field value
#[derive(Debug, Clone, Copy)]
pub enum ValueFormat {
    /// chrono format string applied to temporal values
    Temporal(&'static str),
    /// Arbitrary conversion applied to the bound value
    Custom(fn(Value) -> Value),
}

/// One entry of an entity's field table
#[derive(Debug, Clone)]
pub struct FieldSpec {
    property: &'static str,
    kind: FieldKind,
    column: Option<&'static str>,
    key: bool,
    generated: bool,
    ignored: bool,
    format: Option<ValueFormat>,
}

impl FieldSpec {
    /// Declares a field by its serialized property name
    pub fn new(property: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            property,
            kind,
            column: None,
            key: false,
            generated: false,
            ignored: false,
            format: None,
        }
    }

    /// Maps the field to a column with a different name
    pub fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    /// Marks the field as the record key
    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Marks the field as database-generated; it is never inserted or updated
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Excludes the field from mapping entirely
    pub fn ignore(mut self) -> Self {
        self.ignored = true;
        self
    }

    /// Sets the write-path format
    pub fn format(mut self, format: ValueFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// A record type that maps onto one table
///
/// `fields()` names every property the way the type serializes it.
///
/// ```ignore
/// impl Entity for Person {
///     const TABLE: Option<&'static str> = Some("people");
///
///     fn fields() -> Vec<FieldSpec> {
///         vec![
///             FieldSpec::new("Id", FieldKind::Integer).key().generated(),
///             FieldSpec::new("Name", FieldKind::Text),
///         ]
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Table name; defaults to the type's short name
    const TABLE: Option<&'static str> = None;

    /// Ordered field table
    fn fields() -> Vec<FieldSpec>;
}

/// Resolved mapping of one field
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub property: String,
    pub column: String,
    pub kind: FieldKind,
    pub key: bool,
    pub generated: bool,
    pub ignored: bool,
    pub format: Option<ValueFormat>,
}

impl FieldMeta {
    /// Whether insert and update may write this field
    pub fn is_writable(&self) -> bool {
        !self.ignored && !self.generated
    }
}

/// Column mapping for one entity type. Never mutated once built.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// Short type name, used as a qualifier in field paths
    pub type_name: String,
    /// Table the entity maps to
    pub table: String,
    /// Fields in declaration order, ignored ones included
    pub fields: Vec<FieldMeta>,
}

impl TableMetadata {
    /// Looks up a mapped field by property name.
    ///
    /// An exact match wins over a case-insensitive one.
    pub fn field(&self, property: &str) -> Option<&FieldMeta> {
        self.mapped()
            .find(|f| f.property == property)
            .or_else(|| self.mapped().find(|f| f.property.eq_ignore_ascii_case(property)))
    }

    /// Looks up a mapped field by column name, ignoring case
    pub fn by_column(&self, column: &str) -> Option<&FieldMeta> {
        self.mapped().find(|f| f.column.eq_ignore_ascii_case(column))
    }

    /// The first field marked as key
    pub fn key(&self) -> Option<&FieldMeta> {
        self.mapped().find(|f| f.key)
    }

    /// Mapped (non-ignored) fields in declaration order
    pub fn mapped(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| !f.ignored)
    }

    /// Whether `name` qualifies a member path: the type name or the table name
    pub fn is_qualifier(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.type_name) || name.eq_ignore_ascii_case(&self.table)
    }
}

/// Per-call property → column overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnOverrides {
    entries: Vec<(String, String)>,
}

impl ColumnOverrides {
    /// Creates an empty override list
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `property` to `column` for this call
    pub fn column(mut self, property: &str, column: &str) -> Self {
        self.entries.retain(|(p, _)| !p.eq_ignore_ascii_case(property));
        self.entries.push((property.to_string(), column.to_string()));
        self
    }

    fn get(&self, property: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, _)| p.eq_ignore_ascii_case(property))
            .map(|(_, c)| c.as_str())
    }

    /// `(property, column)` pairs in the order they were added
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializes as a `{property: column}` object
impl Serialize for ColumnOverrides {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (p, c) in &self.entries {
            map.serialize_entry(p, c)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ColumnOverrides {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OverridesVisitor;

        impl<'de> Visitor<'de> for OverridesVisitor {
            type Value = ColumnOverrides;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping properties to columns")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<ColumnOverrides, A::Error> {
                let mut overrides = ColumnOverrides::new();
                while let Some((property, column)) = map.next_entry::<String, String>()? {
                    overrides = overrides.column(&property, &column);
                }
                Ok(overrides)
            }
        }

        deserializer.deserialize_map(OverridesVisitor)
    }
}

impl<P: AsRef<str>, C: AsRef<str>> FromIterator<(P, C)> for ColumnOverrides {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ColumnOverrides::new(), |acc, (p, c)| acc.column(p.as_ref(), c.as_ref()))
    }
}

static METADATA_CACHE: Lazy<RwLock<HashMap<TypeId, Arc<TableMetadata>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Serializes first builds
static BUILD_LOCK: Mutex<()> = Mutex::new(());

static BUILD_COUNTS: Lazy<Mutex<HashMap<TypeId, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

thread_local! {
    /// Per-thread copies of shared cache entries; hits here take no lock
    static LOCAL_METADATA: RefCell<HashMap<TypeId, Arc<TableMetadata>>> = RefCell::new(HashMap::new());
}

/// Returns the cached metadata for `T`, building it on first use
///
/// Concurrent first calls build the metadata exactly once. Each thread then
/// keeps its own copy of the entry, so repeated lookups are lock-free.
pub fn metadata<T: Entity>() -> Result<Arc<TableMetadata>> {
    let id = TypeId::of::<T>();
    if let Some(meta) = LOCAL_METADATA.with(|local| local.borrow().get(&id).cloned()) {
        return Ok(meta);
    }
    let meta = shared_metadata::<T>(id)?;
    LOCAL_METADATA.with(|local| local.borrow_mut().insert(id, Arc::clone(&meta)));
    Ok(meta)
}

fn shared_metadata<T: Entity>(id: TypeId) -> Result<Arc<TableMetadata>> {
    if let Some(meta) = cached(id) {
        return Ok(meta);
    }

    let _build = BUILD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(meta) = cached(id) {
        return Ok(meta);
    }

    let meta = Arc::new(build_metadata::<T>(None)?);
    debug!(
        entity = %meta.type_name,
        table = %meta.table,
        fields = meta.fields.len(),
        "built entity metadata"
    );
    METADATA_CACHE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id, Arc::clone(&meta));
    *BUILD_COUNTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(id)
        .or_insert(0) += 1;
    Ok(meta)
}

/// Metadata for `T` with per-call overrides applied
///
/// Without overrides this is the cached metadata; with overrides an
/// uncached variant is built for the call.
pub fn metadata_with<T: Entity>(overrides: Option<&ColumnOverrides>) -> Result<Arc<TableMetadata>> {
    match overrides {
        None => metadata::<T>(),
        Some(o) => Ok(Arc::new(build_metadata::<T>(Some(o))?)),
    }
}

/// Number of times the cached metadata for `T` has been built
pub fn metadata_builds<T: Entity>() -> usize {
    BUILD_COUNTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&TypeId::of::<T>())
        .copied()
        .unwrap_or(0)
}

fn cached(id: TypeId) -> Option<Arc<TableMetadata>> {
    METADATA_CACHE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned()
}

/// Short name of `T` without module path or generic arguments
fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

fn build_metadata<T: Entity>(overrides: Option<&ColumnOverrides>) -> Result<TableMetadata> {
    let type_name = short_type_name::<T>();
    let table = T::TABLE.map(str::to_string).unwrap_or_else(|| type_name.clone());

    let mut fields: Vec<FieldMeta> = Vec::new();
    for spec in T::fields() {
        if fields.iter().any(|f| f.property.eq_ignore_ascii_case(spec.property)) {
            return Err(RelError::Configuration(format!(
                "{} declares field '{}' twice",
                type_name, spec.property
            )));
        }
        let column = overrides
            .and_then(|o| o.get(spec.property))
            .map(str::to_string)
            .or_else(|| spec.column.map(str::to_string))
            .unwrap_or_else(|| spec.property.to_string());
        fields.push(FieldMeta {
            property: spec.property.to_string(),
            column,
            kind: spec.kind,
            key: spec.key,
            generated: spec.generated,
            ignored: spec.ignored,
            format: spec.format,
        });
    }

    if let Some(o) = overrides {
        if let Some((unknown, _)) = o
            .entries
            .iter()
            .find(|(p, _)| !fields.iter().any(|f| f.property.eq_ignore_ascii_case(p)))
        {
            return Err(RelError::Configuration(format!(
                "column override names unknown field '{}' of {}",
                unknown, type_name
            )));
        }
    }

    let meta = TableMetadata {
        type_name,
        table,
        fields,
    };
    if meta.mapped().next().is_none() {
        return Err(RelError::Configuration(format!(
            "{} has no mapped fields",
            meta.type_name
        )));
    }
    Ok(meta)
}

/// Builds the parameter set for a caller's data object
///
/// Every serialized property becomes a parameter. Properties that name a
/// mapped field carry the field's write-path formatting.
pub fn data_params<D: Serialize + ?Sized>(data: &D, meta: &TableMetadata) -> Result<ParameterSet> {
    let raw = ParameterSet::from_serialize(data)?;
    let mut params = ParameterSet::new();
    for (name, value) in raw.iter() {
        let bare = name.trim_start_matches('@');
        match meta.field(bare) {
            Some(field) => params.insert(&field.property, format_value(field, value.clone())?),
            None => params.insert(bare, value.clone()),
        }
    }
    Ok(params)
}

/// Applies a field's write-path format to a value
pub fn format_value(field: &FieldMeta, value: Value) -> Result<Value> {
    match (field.format, field.kind) {
        (Some(ValueFormat::Custom(convert)), _) => Ok(convert(value)),
        (_, _) if value.is_null() => Ok(Value::Null),
        (Some(ValueFormat::Temporal(fmt)), _) => format_temporal(field, value, fmt),
        (None, FieldKind::DateTime) => format_temporal(field, value, DEFAULT_DATETIME_FORMAT),
        _ => Ok(value),
    }
}

fn format_temporal(field: &FieldMeta, value: Value, fmt: &str) -> Result<Value> {
    let parsed = match &value {
        Value::Text(s) => parse_datetime(s),
        Value::Integer(ts) => DateTime::from_timestamp(*ts, 0).map(|dt| dt.naive_utc()),
        _ => None,
    };
    parsed
        .map(|dt| Value::Text(dt.format(fmt).to_string()))
        .ok_or_else(|| {
            RelError::Mapping(format!(
                "value {} of field '{}' is not a date/time",
                value, field.property
            ))
        })
}

/// Parses the timestamp shapes drivers and serde commonly produce
fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Maps every row of `rows` onto `T`
///
/// Columns are matched to fields case-insensitively; unknown columns are
/// ignored and absent columns keep the `Default` value. A NULL keeps the
/// default unless the default itself is null.
pub fn rows_to_entities<T: Entity>(rows: &RowSet, meta: &TableMetadata) -> Result<Vec<T>> {
    let base = match serde_json::to_value(T::default())? {
        serde_json::Value::Object(map) => map,
        _ => {
            return Err(RelError::Mapping(format!(
                "{} does not serialize as a record",
                meta.type_name
            )))
        }
    };
    let fields: Vec<Option<&FieldMeta>> = rows.columns.iter().map(|c| meta.by_column(c)).collect();

    let mut entities = Vec::with_capacity(rows.len());
    for row in &rows.rows {
        let mut record = base.clone();
        for (field, raw) in fields.iter().zip(row) {
            let Some(field) = field else { continue };
            let default = base.get(&field.property).unwrap_or(&serde_json::Value::Null);
            if raw.is_null() {
                if default.is_null() {
                    record.insert(field.property.clone(), serde_json::Value::Null);
                }
                continue;
            }
            record.insert(field.property.clone(), convert_value(field, raw, default)?);
        }
        let entity = serde_json::from_value(serde_json::Value::Object(record)).map_err(|e| {
            RelError::Mapping(format!("cannot build {} from row: {}", meta.type_name, e))
        })?;
        entities.push(entity);
    }
    Ok(entities)
}

/// Converts a raw column value to the field's declared kind
fn convert_value(field: &FieldMeta, raw: &Value, default: &serde_json::Value) -> Result<serde_json::Value> {
    let mismatch = || {
        RelError::Mapping(format!(
            "cannot convert {} into {:?} field '{}'",
            raw, field.kind, field.property
        ))
    };

    match field.kind {
        FieldKind::Bool => match raw {
            Value::Bool(b) => Ok((*b).into()),
            Value::Integer(i) => Ok((*i != 0).into()),
            Value::Real(f) => Ok((*f != 0.0).into()),
            Value::Text(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "t" | "yes" | "y" => Ok(true.into()),
                "0" | "false" | "f" | "no" | "n" => Ok(false.into()),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        FieldKind::Integer => raw.as_i64().map(Into::into).ok_or_else(mismatch),
        FieldKind::Real => {
            let real = match raw {
                Value::Real(f) => Some(*f),
                Value::Integer(i) => Some(*i as f64),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Text(s) => s.trim().parse().ok(),
                _ => None,
            };
            real.and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .ok_or_else(mismatch)
        }
        FieldKind::Text => match raw {
            Value::Blob(b) => String::from_utf8(b.clone())
                .map(Into::into)
                .map_err(|_| mismatch()),
            other => Ok(other.to_string().into()),
        },
        FieldKind::DateTime => {
            let wants_offset = default
                .as_str()
                .map(|s| DateTime::parse_from_rfc3339(s).is_ok());
            match raw {
                Value::Text(s) => {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
                        if wants_offset != Some(false) {
                            return Ok(dt.to_rfc3339().into());
                        }
                    }
                    let naive = parse_datetime(s).ok_or_else(mismatch)?;
                    Ok(render_naive(naive, wants_offset))
                }
                Value::Integer(ts) => DateTime::from_timestamp(*ts, 0)
                    .map(|dt| render_naive(dt.naive_utc(), wants_offset))
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            }
        }
        FieldKind::Blob => match raw {
            Value::Blob(b) => Ok(b.clone().into()),
            Value::Text(s) => Ok(s.as_bytes().to_vec().into()),
            _ => Err(mismatch()),
        },
    }
}

fn render_naive(naive: NaiveDateTime, wants_offset: Option<bool>) -> serde_json::Value {
    if wants_offset == Some(true) {
        naive.and_utc().to_rfc3339().into()
    } else {
        naive.format(NAIVE_DATETIME_FORMAT).to_string().into()
    }
}
