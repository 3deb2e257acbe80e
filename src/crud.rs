/// Typed CRUD Module
///
/// `Query<T>` collects everything a typed request can carry (filter,
/// projection, ordering, bound values, column overrides, read hint, table
/// override) and the `Executor` methods here turn it into commands through
/// the translator and the command builder.
use crate::command::{CommandBuilder, SelectParts};
use crate::core::db::mapping::{self, data_params, ColumnOverrides, Entity, TableMetadata};
use crate::core::db::{CommandSpec, Executor};
use crate::core::value::{ParameterSet, Value};
use crate::core::{RelError, Result};
use crate::expr::{field, param, OrderBy, Predicate, Projection};
use crate::translate::{translate_order, translate_projection, translate_where};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// How `exists` treats a record's own key
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExistsPolicy {
    /// Any matching row counts
    #[default]
    Any,
    /// Rows whose key equals the value are not counted; used for uniqueness
    /// checks while editing an existing record
    ExcludingKey(Value),
}

/// A typed request against the table of `T`
pub struct Query<T: Entity> {
    filter: Option<Predicate>,
    projection: Projection,
    order: OrderBy,
    params: ParameterSet,
    overrides: Option<ColumnOverrides>,
    no_lock: Option<bool>,
    table: Option<String>,
    ignore: Vec<String>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Default for Query<T> {
    fn default() -> Self {
        Query {
            filter: None,
            projection: Projection::default(),
            order: OrderBy::default(),
            params: ParameterSet::new(),
            overrides: None,
            no_lock: None,
            table: None,
            ignore: Vec::new(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Clone for Query<T> {
    fn clone(&self) -> Self {
        Query {
            filter: self.filter.clone(),
            projection: self.projection.clone(),
            order: self.order.clone(),
            params: self.params.clone(),
            overrides: self.overrides.clone(),
            no_lock: self.no_lock,
            table: self.table.clone(),
            ignore: self.ignore.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Query<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter; repeated calls are combined with `and`
    pub fn filter(mut self, pred: Predicate) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(pred),
            None => pred,
        });
        self
    }

    /// Selects an explicit field list instead of `*`
    pub fn select(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }

    /// Binds a value for a parameter referenced by the filter
    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name, value);
        self
    }

    /// Binds every value of `params`
    pub fn params(mut self, params: ParameterSet) -> Self {
        for (name, value) in params.iter() {
            self.params.insert(name, value.clone());
        }
        self
    }

    /// Applies per-call property → column overrides
    pub fn overrides(mut self, overrides: ColumnOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Overrides the executor's read-hint setting for this request
    pub fn no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = Some(no_lock);
        self
    }

    /// Targets a different table than the entity's own
    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Leaves the named properties out of inserts and updates
    pub fn ignore<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignore
            .extend(properties.into_iter().map(|p| p.as_ref().to_string()));
        self
    }

    pub fn filter_expr(&self) -> Option<&Predicate> {
        self.filter.as_ref()
    }

    pub fn order_expr(&self) -> &OrderBy {
        &self.order
    }

    pub fn bound_params(&self) -> &ParameterSet {
        &self.params
    }

    pub(crate) fn resolve(&self, builder: &CommandBuilder) -> Result<Resolved> {
        let meta = mapping::metadata_with::<T>(self.overrides.as_ref())?;
        let dialect = builder.dialect();
        let filter = match &self.filter {
            Some(pred) => translate_where(pred, &meta, dialect)?,
            None => String::new(),
        };
        let fields = translate_projection(&self.projection, &meta, dialect)?;
        let order = translate_order(&self.order, &meta, dialect)?;
        let table = self.table.clone().unwrap_or_else(|| meta.table.clone());
        let builder = match self.no_lock {
            Some(no_lock) => builder.with_no_lock(no_lock),
            None => *builder,
        };
        Ok(Resolved {
            meta,
            table,
            filter,
            fields,
            order,
            builder,
        })
    }
}

/// A query translated for one dialect
pub(crate) struct Resolved {
    pub meta: Arc<TableMetadata>,
    pub table: String,
    pub filter: String,
    pub fields: String,
    pub order: String,
    pub builder: CommandBuilder,
}

impl Resolved {
    fn select(&self, data: &ParameterSet, single: bool) -> Result<CommandSpec> {
        self.builder.select(
            SelectParts {
                table: &self.table,
                fields: &self.fields,
                filter: &self.filter,
                order: &self.order,
                single,
            },
            data,
        )
    }
}

/// Merges the data's values with the query's bound values; bound values win
fn merge(data: ParameterSet, bound: &ParameterSet) -> ParameterSet {
    let mut merged = data;
    for (name, value) in bound.iter() {
        merged.insert(name, value.clone());
    }
    merged
}

fn key_filter(meta: &TableMetadata) -> Result<Predicate> {
    let key = meta.key().ok_or_else(|| {
        RelError::Argument(format!("{} declares no key field", meta.type_name))
    })?;
    Ok(field(&key.property).eq(param(&key.property)))
}

impl<'c> Executor<'c> {
    /// Inserts an entity; generated fields are left to the database
    pub fn insert<T: Entity>(&mut self, entity: &T) -> Result<u64> {
        self.insert_data(entity, &Query::<T>::new())
    }

    /// Inserts an entity, leaving out the named properties
    pub fn insert_ignoring<T: Entity>(&mut self, entity: &T, ignore: &[&str]) -> Result<u64> {
        self.insert_data(entity, &Query::<T>::new().ignore(ignore))
    }

    /// Inserts any serializable data object into the table of `T`
    ///
    /// Only writable mapped fields present in `data` are inserted. The
    /// query supplies the table override, ignore list and column overrides.
    pub fn insert_data<T: Entity, D: Serialize + ?Sized>(&mut self, data: &D, query: &Query<T>) -> Result<u64> {
        let resolved = query.resolve(self.builder())?;
        let params = data_params(data, &resolved.meta)?;
        let command = resolved
            .builder
            .insert(&resolved.table, &resolved.meta, &params, &query.ignore)?;
        self.execute(&command)
    }

    /// Inserts `data` into a table that has no entity type
    pub fn insert_into<D: Serialize + ?Sized>(&mut self, table: &str, data: &D) -> Result<u64> {
        let params = ParameterSet::from_serialize(data)?;
        let command = self.builder().insert_raw(table, &params, &[])?;
        self.execute(&command)
    }

    /// Updates the rows matched by the query's filter with the fields present in `data`
    ///
    /// # Errors
    ///
    /// `RelError::Argument` when the query has no filter.
    pub fn update<T: Entity, D: Serialize + ?Sized>(&mut self, data: &D, query: &Query<T>) -> Result<u64> {
        let resolved = query.resolve(self.builder())?;
        let values = data_params(data, &resolved.meta)?;
        let lookup = merge(values.clone(), &query.params);
        let command = resolved.builder.update(
            &resolved.table,
            &resolved.meta,
            &values,
            &resolved.filter,
            &lookup,
            &query.ignore,
        )?;
        self.execute(&command)
    }

    /// Updates an entity's row, located by its key
    pub fn update_entity<T: Entity>(&mut self, entity: &T) -> Result<u64> {
        let meta = mapping::metadata::<T>()?;
        let query = Query::<T>::new().filter(key_filter(&meta)?);
        self.update(entity, &query)
    }

    /// Deletes the rows matched by the query's filter
    ///
    /// # Errors
    ///
    /// `RelError::Argument` when the query has no filter.
    pub fn delete<T: Entity>(&mut self, query: &Query<T>) -> Result<u64> {
        let resolved = query.resolve(self.builder())?;
        let command = resolved
            .builder
            .delete(&resolved.table, &resolved.filter, &query.params)?;
        self.execute(&command)
    }

    /// Deletes an entity's row, located by its key
    pub fn delete_entity<T: Entity>(&mut self, entity: &T) -> Result<u64> {
        let meta = mapping::metadata::<T>()?;
        let query = Query::<T>::new()
            .filter(key_filter(&meta)?)
            .params(data_params(entity, &meta)?);
        self.delete(&query)
    }

    /// Lists every row matched by the query
    pub fn list<T: Entity>(&mut self, query: &Query<T>) -> Result<Vec<T>> {
        let resolved = query.resolve(self.builder())?;
        let command = resolved.select(&query.params, false)?;
        let rows = self.query(&command)?;
        mapping::rows_to_entities(&rows, &resolved.meta)
    }

    /// Returns the first row matched by the query
    pub fn single<T: Entity>(&mut self, query: &Query<T>) -> Result<Option<T>> {
        let resolved = query.resolve(self.builder())?;
        let command = resolved.select(&query.params, true)?;
        let rows = self.query(&command)?.truncate_to_first();
        Ok(mapping::rows_to_entities(&rows, &resolved.meta)?.into_iter().next())
    }

    /// Counts the rows matched by the query
    pub fn count<T: Entity>(&mut self, query: &Query<T>) -> Result<u64> {
        let resolved = query.resolve(self.builder())?;
        let command = resolved
            .builder
            .count(&resolved.table, &resolved.filter, &query.params)?;
        count_value(self.scalar(&command)?)
    }

    /// Checks whether any row matches the query
    ///
    /// # Arguments
    ///
    /// * `query` - Rows to look for
    /// * `policy` - `ExcludingKey(v)` ignores the row whose key is `v`
    pub fn exists<T: Entity>(&mut self, query: &Query<T>, policy: ExistsPolicy) -> Result<bool> {
        let query = match policy {
            ExistsPolicy::Any => query.clone(),
            ExistsPolicy::ExcludingKey(value) => {
                let meta = mapping::metadata_with::<T>(query.overrides.as_ref())?;
                let key = meta.key().ok_or_else(|| {
                    RelError::Argument(format!("{} declares no key field", meta.type_name))
                })?;
                query.clone().filter(field(&key.property).ne(value))
            }
        };
        let resolved = query.resolve(self.builder())?;
        let command = resolved
            .builder
            .exists(&resolved.table, &resolved.filter, &query.params)?;
        Ok(count_value(self.scalar(&command)?)? > 0)
    }

    /// Reads one field of the first matching row
    ///
    /// # Returns
    ///
    /// `None` when no row matches or the value is NULL.
    pub fn first<T: Entity, K: DeserializeOwned>(&mut self, path: &str, query: &Query<T>) -> Result<Option<K>> {
        let query = query.clone().select(Projection::fields([path]));
        let resolved = query.resolve(self.builder())?;
        let command = resolved
            .builder
            .first(&resolved.table, &resolved.fields, &resolved.filter, &query.params)?;
        match self.scalar(&command)? {
            Value::Null => Ok(None),
            value => serde_json::from_value(value.to_json())
                .map(Some)
                .map_err(|e| RelError::Mapping(format!("cannot read {} as requested type: {}", path, e))),
        }
    }
}

fn count_value(value: Value) -> Result<u64> {
    match value {
        Value::Null => Ok(0),
        other => other
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| RelError::Mapping(format!("count returned non-numeric {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Person, TestDb};
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_insert_count_delete_example() {
        let db = TestDb::new();
        let mut conn = db.connection();
        let mut exec = conn.executor();

        let inserted = exec
            .insert_data(&json!({"Name": "Ann", "Age": 30}), &Query::<Person>::new())
            .unwrap();
        assert_eq!(inserted, 1);

        let adults = Query::<Person>::new().filter(field("Age").ge(30));
        assert_eq!(exec.count(&adults).unwrap(), 1);

        let id: i64 = exec
            .first("Id", &Query::<Person>::new().filter(field("Name").eq("Ann")))
            .unwrap()
            .unwrap();
        let removed = exec
            .delete(&Query::<Person>::new().filter(field("Id").eq(param("Id"))).bind("Id", id))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(exec.count(&Query::<Person>::new()).unwrap(), 0);
    }

    #[test]
    fn test_entity_round_trip_keeps_datetime_precision() {
        let db = TestDb::new();
        let mut conn = db.connection();
        let mut exec = conn.executor();

        let created = NaiveDate::from_ymd_opt(2024, 5, 6)
            .and_then(|d| d.and_hms_milli_opt(7, 8, 9, 250))
            .unwrap();
        let ann = Person {
            name: "Ann".to_string(),
            age: 30,
            email: Some("ann@example.com".to_string()),
            created_at: Some(created),
            ..Default::default()
        };
        exec.insert(&ann).unwrap();

        let stored = exec
            .single(&Query::<Person>::new().filter(field("Name").eq("Ann")))
            .unwrap()
            .unwrap();
        assert_eq!(stored.created_at, Some(created));
        assert_eq!(Person { id: stored.id, ..ann }, stored);
    }

    #[test]
    fn test_list_single_with_projection_and_order() {
        let db = TestDb::new();
        db.seed(&[("Ann", 30), ("Bob", 41), ("Cid", 25)]);
        let mut conn = db.connection();
        let mut exec = conn.executor();

        let people = exec
            .list(
                &Query::<Person>::new()
                    .filter(field("Age").gt(26))
                    .select(Projection::fields(["Name", "Age"]))
                    .order(OrderBy::desc("Age")),
            )
            .unwrap();
        let names: Vec<&str> = people.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Ann"]);
        assert_eq!(people[0].id, 0);

        let youngest = exec
            .single(&Query::<Person>::new().order(OrderBy::asc("Age")))
            .unwrap()
            .unwrap();
        assert_eq!(youngest.name, "Cid");

        let nobody = exec
            .single(&Query::<Person>::new().filter(field("Age").gt(100)))
            .unwrap();
        assert!(nobody.is_none());
    }

    #[test]
    fn test_update_and_entity_helpers() {
        let db = TestDb::new();
        db.seed(&[("Ann", 30)]);
        let mut conn = db.connection();
        let mut exec = conn.executor();

        let mut ann = exec
            .single(&Query::<Person>::new().filter(field("Name").eq("Ann")))
            .unwrap()
            .unwrap();
        ann.age = 31;
        ann.email = Some("ann@example.com".to_string());
        assert_eq!(exec.update_entity(&ann).unwrap(), 1);

        let changed = exec
            .update(
                &json!({"Age": 40}),
                &Query::<Person>::new().filter(field("Name").eq(param("Name"))).bind("Name", "Ann"),
            )
            .unwrap();
        assert_eq!(changed, 1);

        let reloaded = exec.list(&Query::<Person>::new()).unwrap();
        assert_eq!(reloaded[0].age, 40);
        assert_eq!(reloaded[0].email.as_deref(), Some("ann@example.com"));

        assert_eq!(exec.delete_entity(&reloaded[0]).unwrap(), 1);
        assert_eq!(exec.count(&Query::<Person>::new()).unwrap(), 0);
    }

    #[test]
    fn test_update_and_delete_without_filter_are_rejected() {
        let db = TestDb::new();
        db.seed(&[("Ann", 30)]);
        let mut conn = db.connection();
        let mut exec = conn.executor();

        assert!(matches!(
            exec.update(&json!({"Age": 1}), &Query::<Person>::new()),
            Err(RelError::Argument(_))
        ));
        assert!(matches!(
            exec.delete(&Query::<Person>::new()),
            Err(RelError::Argument(_))
        ));
        assert_eq!(exec.count(&Query::<Person>::new()).unwrap(), 1);
    }

    #[test]
    fn test_exists_policies() {
        let db = TestDb::new();
        db.seed(&[("Ann", 30)]);
        let mut conn = db.connection();
        let mut exec = conn.executor();

        let id: i64 = exec.first("Id", &Query::<Person>::new()).unwrap().unwrap();
        let same_name = Query::<Person>::new().filter(field("Name").eq("Ann"));

        assert!(exec.exists(&same_name, ExistsPolicy::Any).unwrap());
        assert!(!exec
            .exists(&same_name, ExistsPolicy::ExcludingKey(Value::Integer(id)))
            .unwrap());
        assert!(exec
            .exists(&same_name, ExistsPolicy::ExcludingKey(Value::Integer(id + 1)))
            .unwrap());
        assert!(!exec
            .exists(
                &Query::<Person>::new().filter(field("Name").eq("Zed")),
                ExistsPolicy::Any
            )
            .unwrap());
    }

    #[test]
    fn test_insert_ignoring_and_raw_table() {
        let db = TestDb::new();
        let mut conn = db.connection();
        let mut exec = conn.executor();

        let person = Person {
            name: "Dee".to_string(),
            age: 52,
            email: Some("dee@example.com".to_string()),
            ..Default::default()
        };
        exec.insert_ignoring(&person, &["Email"]).unwrap();
        let stored = exec.list(&Query::<Person>::new()).unwrap();
        assert_eq!(stored[0].email, None);

        exec.insert_into("audit", &json!({"Action": "insert", "Target": "people"}))
            .unwrap();
        let audit = exec
            .query_raw("select Action from audit", &ParameterSet::new())
            .unwrap();
        assert_eq!(audit.scalar(), Value::from("insert"));
    }

    #[test]
    fn test_column_overrides_and_table_override() {
        let db = TestDb::new();
        let mut conn = db.connection();
        let mut exec = conn.executor();
        exec.execute_script("create table people_archive(Id integer primary key, full_name text, Age integer)")
            .unwrap();

        let query = Query::<Person>::new()
            .table("people_archive")
            .overrides(ColumnOverrides::new().column("Name", "full_name"));
        exec.insert_data(&json!({"Name": "Eve", "Age": 60}), &query).unwrap();

        let people = exec.list(&query).unwrap();
        assert_eq!(people[0].name, "Eve");
        let raw = exec
            .query_raw("select full_name from people_archive", &ParameterSet::new())
            .unwrap();
        assert_eq!(raw.scalar(), Value::from("Eve"));
    }

    #[test]
    fn test_unresolved_filter_param_is_argument_error() {
        let db = TestDb::new();
        let mut conn = db.connection();
        let result = conn
            .executor()
            .list(&Query::<Person>::new().filter(field("Name").eq(param("Name"))));
        assert!(matches!(result, Err(RelError::Argument(_))));
    }
}
