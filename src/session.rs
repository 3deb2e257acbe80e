/// Session Module
///
/// A `Session` carries a connection profile, a driver registry and the
/// read-hint setting. Every call opens a private connection, runs on it and
/// closes it before returning; callers that want several calls on one
/// connection use `with_connection` or `transaction`.
use crate::bulk::{ColumnSelection, TableBuffer};
use crate::config::Config;
use crate::core::db::{
    resolve_profile, ColumnOverrides, CommandSpec, Connection, ConnectionProfile, Dialect, DriverRegistry, Entity,
    Executor, Outcome,
};
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::Result;
use crate::crud::{ExistsPolicy, Query};
use crate::pagination::{PageRequest, PageSource, PaginationResult, RowPage};
use crate::transaction::{self, StepResult, TransactionStep};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

/// Entry point for blocking database work
#[derive(Debug, Clone)]
pub struct Session {
    profile: ConnectionProfile,
    registry: DriverRegistry,
    no_lock: bool,
}

impl Session {
    /// A session on `profile` using the built-in drivers
    pub fn new(profile: ConnectionProfile) -> Self {
        Session {
            profile,
            registry: DriverRegistry::default(),
            no_lock: true,
        }
    }

    /// A session on the process-wide default profile
    ///
    /// # Errors
    ///
    /// `RelError::Configuration` when no default profile is set.
    pub fn from_default() -> Result<Self> {
        Ok(Session::new(resolve_profile(None)?))
    }

    /// A session described by a loaded configuration file
    pub fn from_config(config: &Config) -> Self {
        Session::new(config.profile()).with_no_lock(config.no_lock())
    }

    /// Replaces the driver registry
    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Enables or disables the `with(nolock)` read hint
    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn dialect(&self) -> Dialect {
        self.profile.dialect
    }

    pub fn no_lock(&self) -> bool {
        self.no_lock
    }

    /// Creates an unopened connection owned by the caller
    pub fn connect(&self) -> Result<Connection> {
        Connection::create(Some(&self.profile), &self.registry)
    }

    /// Runs `f` on a private connection that is closed afterwards
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Executor<'_>) -> Result<R>) -> Result<R> {
        let mut conn = self.connect()?;
        let mut exec = conn.executor().with_no_lock(self.no_lock);
        f(&mut exec)
    }

    /// Runs `f` inside one transaction
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the error otherwise.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Executor<'_>) -> Result<R>) -> Result<R> {
        let mut conn = self.connect()?;
        let mut tx = conn.transaction()?;
        let result = {
            let mut exec = tx.executor().with_no_lock(self.no_lock);
            f(&mut exec)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                info!("transaction committed");
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "transaction rolled back");
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Runs `steps` atomically and returns the last step's result
    pub fn run_steps(&self, steps: &[TransactionStep]) -> Result<StepResult> {
        let mut conn = self.connect()?;
        transaction::run_steps(&mut conn, steps)
    }

    pub fn run(&self, command: &CommandSpec) -> Result<Outcome> {
        self.with_connection(|exec| exec.run(command))
    }

    pub fn execute(&self, command: &CommandSpec) -> Result<u64> {
        self.with_connection(|exec| exec.execute(command))
    }

    pub fn scalar(&self, command: &CommandSpec) -> Result<Value> {
        self.with_connection(|exec| exec.scalar(command))
    }

    pub fn query(&self, command: &CommandSpec) -> Result<RowSet> {
        self.with_connection(|exec| exec.query(command))
    }

    /// Every result set of a multi-statement batch, in order
    pub fn query_sets(&self, command: &CommandSpec) -> Result<Vec<RowSet>> {
        self.with_connection(|exec| exec.query_sets(command))
    }

    pub fn query_entities<T: Entity>(&self, command: &CommandSpec, overrides: Option<&ColumnOverrides>) -> Result<Vec<T>> {
        self.with_connection(|exec| exec.query_entities(command, overrides))
    }

    pub fn execute_raw(&self, sql: &str, params: &ParameterSet) -> Result<u64> {
        self.with_connection(|exec| exec.execute_raw(sql, params))
    }

    pub fn query_raw(&self, sql: &str, params: &ParameterSet) -> Result<RowSet> {
        self.with_connection(|exec| exec.query_raw(sql, params))
    }

    pub fn query_sets_raw(&self, sql: &str, params: &ParameterSet) -> Result<Vec<RowSet>> {
        self.with_connection(|exec| exec.query_sets_raw(sql, params))
    }

    pub fn scalar_raw(&self, sql: &str, params: &ParameterSet) -> Result<Value> {
        self.with_connection(|exec| exec.scalar_raw(sql, params))
    }

    pub fn execute_script(&self, sql: &str) -> Result<()> {
        self.with_connection(|exec| exec.execute_script(sql))
    }

    pub fn insert<T: Entity>(&self, entity: &T) -> Result<u64> {
        self.with_connection(|exec| exec.insert(entity))
    }

    pub fn insert_ignoring<T: Entity>(&self, entity: &T, ignore: &[&str]) -> Result<u64> {
        self.with_connection(|exec| exec.insert_ignoring(entity, ignore))
    }

    pub fn insert_data<T: Entity, D: Serialize + ?Sized>(&self, data: &D, query: &Query<T>) -> Result<u64> {
        self.with_connection(|exec| exec.insert_data(data, query))
    }

    pub fn insert_into<D: Serialize + ?Sized>(&self, table: &str, data: &D) -> Result<u64> {
        self.with_connection(|exec| exec.insert_into(table, data))
    }

    pub fn update<T: Entity, D: Serialize + ?Sized>(&self, data: &D, query: &Query<T>) -> Result<u64> {
        self.with_connection(|exec| exec.update(data, query))
    }

    pub fn update_entity<T: Entity>(&self, entity: &T) -> Result<u64> {
        self.with_connection(|exec| exec.update_entity(entity))
    }

    pub fn delete<T: Entity>(&self, query: &Query<T>) -> Result<u64> {
        self.with_connection(|exec| exec.delete(query))
    }

    pub fn delete_entity<T: Entity>(&self, entity: &T) -> Result<u64> {
        self.with_connection(|exec| exec.delete_entity(entity))
    }

    pub fn list<T: Entity>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.with_connection(|exec| exec.list(query))
    }

    pub fn single<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.with_connection(|exec| exec.single(query))
    }

    pub fn count<T: Entity>(&self, query: &Query<T>) -> Result<u64> {
        self.with_connection(|exec| exec.count(query))
    }

    pub fn exists<T: Entity>(&self, query: &Query<T>, policy: ExistsPolicy) -> Result<bool> {
        self.with_connection(|exec| exec.exists(query, policy))
    }

    pub fn first<T: Entity, K: DeserializeOwned>(&self, path: &str, query: &Query<T>) -> Result<Option<K>> {
        self.with_connection(|exec| exec.first(path, query))
    }

    pub fn paginate<T: Entity>(&self, query: &Query<T>, request: &PageRequest) -> Result<PaginationResult<T>> {
        self.with_connection(|exec| exec.paginate(query, request))
    }

    pub fn paginate_rows(&self, source: PageSource<'_>, request: &PageRequest, data: &ParameterSet) -> Result<RowPage> {
        self.with_connection(|exec| exec.paginate_rows(source, request, data))
    }

    pub fn paginate_command(&self, command: CommandSpec, request: &PageRequest) -> Result<RowPage> {
        self.with_connection(|exec| exec.paginate_command(command, request))
    }

    pub fn bulk_import(&self, table: &str, buffer: &TableBuffer) -> Result<u64> {
        self.with_connection(|exec| exec.bulk_import(table, buffer))
    }

    pub fn bulk_import_entities<T: Entity>(&self, entities: &[T], selection: ColumnSelection<'_>) -> Result<u64> {
        self.with_connection(|exec| exec.bulk_import_entities(entities, selection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{clear_default, set_default};
    use crate::core::RelError;
    use crate::expr::{field, param, Projection};
    use crate::test_utils::{lock_default_profile, FakeDriver, Person, TestDb};
    use std::sync::Arc;

    #[test]
    fn test_typed_crud_through_session() {
        let db = TestDb::new();
        let session = db.session();

        let ann = Person {
            name: "Ann".to_string(),
            age: 30,
            ..Default::default()
        };
        assert_eq!(session.insert(&ann).unwrap(), 1);
        assert_eq!(session.count(&Query::<Person>::new()).unwrap(), 1);

        let stored = session
            .single(&Query::<Person>::new().filter(field("Name").eq(param("Name"))).bind("Name", "Ann"))
            .unwrap()
            .unwrap();
        assert!(stored.id > 0);
        assert!(session
            .exists(
                &Query::<Person>::new().filter(field("Name").eq("Ann")),
                ExistsPolicy::ExcludingKey(Value::Integer(stored.id + 1))
            )
            .unwrap());

        let names: Vec<String> = session
            .list(&Query::<Person>::new().select(Projection::fields(["Name"])))
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Ann".to_string()]);
    }

    #[test]
    fn test_transaction_closure_commits_on_ok() {
        let db = TestDb::new();
        let session = db.session();
        let inserted = session
            .transaction(|exec| {
                exec.insert_into("people", &serde_json::json!({"Name": "Ann", "Age": 30}))?;
                exec.insert_into("people", &serde_json::json!({"Name": "Bob", "Age": 41}))
            })
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.count_people(), 2);
    }

    #[test]
    fn test_transaction_closure_rolls_back_on_err() {
        let db = TestDb::new();
        let session = db.session();
        let result: Result<()> = session.transaction(|exec| {
            exec.insert_into("people", &serde_json::json!({"Name": "Ann", "Age": 30}))?;
            Err(RelError::Argument("stop".to_string()))
        });
        assert!(matches!(result, Err(RelError::Argument(msg)) if msg == "stop"));
        assert_eq!(db.count_people(), 0);
    }

    #[test]
    fn test_from_default_profile() {
        let _guard = lock_default_profile();
        clear_default();
        assert!(matches!(Session::from_default(), Err(RelError::Configuration(_))));

        let db = TestDb::new();
        set_default(db.profile().connection_string.clone(), Dialect::Sqlite);
        let session = Session::from_default().unwrap();
        assert_eq!(session.profile(), db.profile());
        assert_eq!(session.count(&Query::<Person>::new()).unwrap(), 0);
        clear_default();
    }

    #[test]
    fn test_no_lock_setting_reaches_commands() {
        let fake = FakeDriver::new();
        let registry = DriverRegistry::empty().with_driver(Arc::new(fake.clone()));
        let profile = ConnectionProfile::new("Server=.;Database=app", Dialect::SqlServer);

        let locked = Session::new(profile.clone()).with_registry(registry.clone());
        locked.count(&Query::<Person>::new()).unwrap();
        let unlocked = Session::new(profile).with_registry(registry).with_no_lock(false);
        unlocked.count(&Query::<Person>::new()).unwrap();

        let sql: Vec<String> = fake.commands().into_iter().map(|c| c.sql).collect();
        assert_eq!(
            sql,
            vec![
                "select count(*) from people with(nolock)".to_string(),
                "select count(*) from people".to_string()
            ]
        );
        assert_eq!(fake.opened().len(), 2);
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml_str(
            "[database]\nconnection_string = \"app.db\"\ndialect = \"mysql\"\nno_lock = false\n",
        )
        .unwrap();
        let session = Session::from_config(&config);
        assert_eq!(session.dialect(), Dialect::MySql);
        assert!(!session.no_lock());
        assert!(matches!(session.connect(), Err(RelError::Configuration(_))));
    }
}
