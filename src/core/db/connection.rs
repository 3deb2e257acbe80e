/// Connection Management Module
///
/// This module provides the connection factory, the driver registry, the
/// process-wide default profile and the transaction lifecycle for relbridge.
///
/// A `Connection` is created unopened from a `ConnectionProfile`; it opens on
/// first use and closes when dropped. Dropping a connection (or a
/// `Transaction` guard) with a transaction still open rolls it back.
use crate::bulk::TableBuffer;
use crate::core::db::query::{CommandSpec, Executor, Outcome, StatementType};
use crate::core::db::sqlite::SqliteDriver;
use crate::core::value::RowSet;
use crate::core::{RelError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// SQL dialects the builder knows how to target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Microsoft SQL Server
    SqlServer,
    /// MySQL / MariaDB
    MySql,
    /// SQLite, served by the bundled driver
    Sqlite,
}

impl Dialect {
    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "sqlserver",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Whether the dialect understands the `with(nolock)` table hint
    pub fn supports_read_hint(&self) -> bool {
        matches!(self, Dialect::SqlServer)
    }

    /// Whether the dialect has a native bulk-copy path
    pub fn supports_bulk_copy(&self) -> bool {
        matches!(self, Dialect::SqlServer)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = RelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlserver" | "mssql" | "sql" => Ok(Dialect::SqlServer),
            "mysql" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(RelError::Configuration(format!(
                "unknown database dialect '{}'",
                other
            ))),
        }
    }
}

impl Serialize for Dialect {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Dialect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Driver-specific connection string
    pub connection_string: String,
    /// Target dialect
    pub dialect: Dialect,
}

impl ConnectionProfile {
    /// Creates a profile from a connection string and dialect
    pub fn new(connection_string: impl Into<String>, dialect: Dialect) -> Self {
        ConnectionProfile {
            connection_string: connection_string.into(),
            dialect,
        }
    }
}

/// Process-wide fallback profile
static DEFAULT_PROFILE: Lazy<RwLock<Option<ConnectionProfile>>> = Lazy::new(|| RwLock::new(None));

/// Sets the process-wide default profile used when a call names none
pub fn set_default(connection_string: impl Into<String>, dialect: Dialect) {
    let mut guard = DEFAULT_PROFILE
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *guard = Some(ConnectionProfile::new(connection_string, dialect));
}

/// Returns a copy of the process-wide default profile, if one is set
pub fn default_profile() -> Option<ConnectionProfile> {
    DEFAULT_PROFILE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Removes the process-wide default profile
pub fn clear_default() {
    let mut guard = DEFAULT_PROFILE
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *guard = None;
}

/// Picks the explicit profile, falling back to the process-wide default
///
/// # Returns
///
/// The profile to connect with, or `RelError::Configuration` when neither is set.
pub fn resolve_profile(explicit: Option<&ConnectionProfile>) -> Result<ConnectionProfile> {
    match explicit {
        Some(profile) => Ok(profile.clone()),
        None => default_profile().ok_or_else(|| {
            RelError::Configuration(
                "no connection profile given and no default profile is set".to_string(),
            )
        }),
    }
}

/// A database driver able to open connections for one dialect
pub trait Driver: Send + Sync {
    /// Dialect served by this driver
    fn dialect(&self) -> Dialect;

    /// Opens a live connection
    fn open(&self, connection_string: &str) -> Result<Box<dyn DriverConnection>>;
}

/// A live driver-level connection
///
/// Implementations bind every parameter in `CommandSpec::params` by name,
/// report the row count of non-queries and return declared output
/// parameters in `Outcome::outputs`.
pub trait DriverConnection: Send {
    /// Executes one command
    fn run(&mut self, command: &CommandSpec) -> Result<Outcome>;

    /// Executes a batch and returns every result set it produces, in order
    ///
    /// Drivers that cannot split a batch return the rows of `run`.
    fn query_sets(&mut self, command: &CommandSpec) -> Result<Vec<RowSet>> {
        Ok(vec![self.run(command)?.rows])
    }

    /// Executes a parameterless script of one or more statements
    fn execute_script(&mut self, sql: &str) -> Result<()>;

    /// Starts a transaction
    fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction
    fn commit(&mut self) -> Result<()>;

    /// Rolls back the open transaction
    fn rollback(&mut self) -> Result<()>;

    /// Streams a buffer into `table` using the native bulk-copy path
    ///
    /// `mappings` pairs each source buffer column with its destination column.
    fn bulk_copy(
        &mut self,
        table: &str,
        _buffer: &TableBuffer,
        _mappings: &[(String, String)],
    ) -> Result<u64> {
        Err(RelError::Unsupported(format!(
            "bulk copy into '{}' is not supported by this driver",
            table
        )))
    }
}

/// Maps dialects to the drivers that serve them
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: HashMap<Dialect, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// A registry with no drivers at all
    pub fn empty() -> Self {
        DriverRegistry {
            drivers: HashMap::new(),
        }
    }

    /// Registers (or replaces) the driver for its dialect
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.dialect(), driver);
    }

    /// Builder-style `register`
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.register(driver);
        self
    }

    /// Looks up the driver for `dialect`
    pub fn driver(&self, dialect: Dialect) -> Result<Arc<dyn Driver>> {
        self.drivers.get(&dialect).cloned().ok_or_else(|| {
            RelError::Configuration(format!(
                "no driver registered for dialect '{}'; only sqlite is built in, others are added with DriverRegistry::register",
                dialect
            ))
        })
    }
}

impl Default for DriverRegistry {
    /// The built-in registry, holding the SQLite driver
    fn default() -> Self {
        DriverRegistry::empty().with_driver(Arc::new(SqliteDriver))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dialects: Vec<&str> = self.drivers.keys().map(|d| d.name()).collect();
        dialects.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("dialects", &dialects)
            .finish()
    }
}

/// Represents database transaction states
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TransactionState {
    /// No active transaction (autocommit mode)
    #[default]
    Autocommit,
    /// Transaction in progress
    Transaction,
    /// A statement failed inside the transaction; only rollback is allowed
    Failed,
}

/// A dialect-specific connection handle
///
/// Created unopened by `Connection::create`; the caller owns it. The
/// underlying driver connection opens on `open()` or on first use.
pub struct Connection {
    profile: ConnectionProfile,
    driver: Arc<dyn Driver>,
    inner: Option<Box<dyn DriverConnection>>,
    transaction_state: TransactionState,
}

impl Connection {
    /// Creates an unopened connection
    ///
    /// # Arguments
    ///
    /// * `profile` - Explicit profile; `None` falls back to the process-wide default
    /// * `registry` - Drivers to choose from
    ///
    /// # Returns
    ///
    /// An unopened `Connection`, or `RelError::Configuration` when no profile is
    /// available or no driver serves the profile's dialect.
    pub fn create(profile: Option<&ConnectionProfile>, registry: &DriverRegistry) -> Result<Self> {
        let profile = resolve_profile(profile)?;
        let driver = registry.driver(profile.dialect)?;
        Ok(Connection {
            profile,
            driver,
            inner: None,
            transaction_state: TransactionState::Autocommit,
        })
    }

    /// Opens the connection if it is not open yet
    pub fn open(&mut self) -> Result<()> {
        if self.inner.is_none() {
            debug!(dialect = %self.profile.dialect, "opening connection");
            self.inner = Some(self.driver.open(&self.profile.connection_string)?);
        }
        Ok(())
    }

    /// Checks if the underlying driver connection is open
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Dialect of this connection
    pub fn dialect(&self) -> Dialect {
        self.profile.dialect
    }

    /// Profile this connection was created from
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// Gets the current transaction state
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    /// Closes the connection, rolling back any open transaction
    pub fn close(&mut self) -> Result<()> {
        let rolled_back = if self.transaction_state != TransactionState::Autocommit {
            self.rollback_transaction()
        } else {
            Ok(())
        };
        self.inner = None;
        rolled_back
    }

    /// Starts a transaction and returns its guard
    ///
    /// The guard rolls back when dropped without `commit`.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.begin_transaction()?;
        Ok(Transaction {
            conn: self,
            finished: false,
        })
    }

    /// Borrows the connection into an executor
    pub fn executor(&mut self) -> Executor<'_> {
        Executor::new(self)
    }

    /// Executes one command, opening the connection if needed
    pub fn run(&mut self, command: &CommandSpec) -> Result<Outcome> {
        debug!(
            kind = ?StatementType::from_sql(&command.sql),
            params = command.params.len(),
            sql = %command.sql,
            "executing command"
        );
        let result = self.live()?.run(command);
        if result.is_err() && self.transaction_state == TransactionState::Transaction {
            self.transaction_state = TransactionState::Failed;
        }
        result
    }

    /// Executes a batch, returning each of its result sets
    pub fn query_sets(&mut self, command: &CommandSpec) -> Result<Vec<RowSet>> {
        debug!(params = command.params.len(), sql = %command.sql, "executing batch");
        let result = self.live()?.query_sets(command);
        if result.is_err() && self.transaction_state == TransactionState::Transaction {
            self.transaction_state = TransactionState::Failed;
        }
        result
    }

    /// Executes a parameterless multi-statement script
    pub fn execute_script(&mut self, sql: &str) -> Result<()> {
        debug!(sql = %sql, "executing script");
        self.live()?.execute_script(sql)
    }

    pub(crate) fn bulk_copy(
        &mut self,
        table: &str,
        buffer: &TableBuffer,
        mappings: &[(String, String)],
    ) -> Result<u64> {
        debug!(table = %table, rows = buffer.len(), "bulk copy");
        self.live()?.bulk_copy(table, buffer, mappings)
    }

    fn live(&mut self) -> Result<&mut Box<dyn DriverConnection>> {
        self.open()?;
        self.inner
            .as_mut()
            .ok_or_else(|| RelError::Configuration("connection is not open".to_string()))
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction_state != TransactionState::Autocommit {
            return Err(RelError::Argument(
                "Transaction already in progress".to_string(),
            ));
        }
        self.live()?.begin()?;
        self.transaction_state = TransactionState::Transaction;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction_state {
            TransactionState::Autocommit => {
                Err(RelError::Argument("No transaction in progress".to_string()))
            }
            TransactionState::Failed => Err(RelError::Argument(
                "Transaction has failed and can only be rolled back".to_string(),
            )),
            TransactionState::Transaction => {
                self.live()?.commit()?;
                self.transaction_state = TransactionState::Autocommit;
                Ok(())
            }
        }
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if self.transaction_state == TransactionState::Autocommit {
            return Err(RelError::Argument("No transaction in progress".to_string()));
        }
        self.transaction_state = TransactionState::Autocommit;
        self.live()?.rollback()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("dialect", &self.profile.dialect)
            .field("open", &self.is_open())
            .field("transaction_state", &self.transaction_state)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            if self.transaction_state != TransactionState::Autocommit {
                warn!("connection dropped with an open transaction; rolling back");
                if let Err(e) = inner.rollback() {
                    warn!(error = %e, "rollback on drop failed");
                }
            }
        }
    }
}

/// Scoped transaction over a borrowed connection
///
/// Commits only through `commit`; any other exit path rolls back.
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    finished: bool,
}

impl<'c> Transaction<'c> {
    /// Borrows the transaction's connection into an executor
    pub fn executor(&mut self) -> Executor<'_> {
        Executor::new(self.conn)
    }

    /// The connection the transaction runs on
    pub fn connection(&mut self) -> &mut Connection {
        self.conn
    }

    /// Commits the transaction
    pub fn commit(mut self) -> Result<()> {
        self.conn.commit_transaction()?;
        self.finished = true;
        Ok(())
    }

    /// Rolls the transaction back
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.rollback_transaction()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && self.conn.transaction_state() != TransactionState::Autocommit {
            warn!("transaction dropped without commit; rolling back");
            if let Err(e) = self.conn.rollback_transaction() {
                warn!(error = %e, "rollback on drop failed");
            }
        }
    }
}

/// Creates an unopened connection from the built-in driver registry
///
/// # Arguments
///
/// * `profile` - Explicit profile; `None` falls back to the process-wide default
pub fn create_connection(profile: Option<&ConnectionProfile>) -> Result<Connection> {
    Connection::create(profile, &DriverRegistry::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::ParameterSet;
    use crate::test_utils::{lock_default_profile, FakeDriver, TestDb};

    #[test]
    fn test_dialect_names_and_aliases() {
        assert_eq!("mssql".parse::<Dialect>().unwrap(), Dialect::SqlServer);
        assert_eq!("SQL".parse::<Dialect>().unwrap(), Dialect::SqlServer);
        assert_eq!("MySql".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert_eq!("sqlite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert!(matches!(
            "oracle".parse::<Dialect>(),
            Err(RelError::Configuration(_))
        ));
        assert_eq!(Dialect::SqlServer.to_string(), "sqlserver");
    }

    #[test]
    fn test_connection_is_created_unopened() {
        let db = TestDb::new();
        let conn = Connection::create(Some(db.profile()), &DriverRegistry::default()).unwrap();
        assert!(!conn.is_open());
        assert_eq!(conn.dialect(), Dialect::Sqlite);
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);
    }

    #[test]
    fn test_missing_profile_is_configuration_error() {
        let _guard = lock_default_profile();
        clear_default();
        let result = create_connection(None);
        assert!(matches!(result, Err(RelError::Configuration(_))));
    }

    #[test]
    fn test_default_profile_fallback() {
        let _guard = lock_default_profile();
        let db = TestDb::new();
        set_default(db.profile().connection_string.clone(), Dialect::Sqlite);

        let mut conn = create_connection(None).unwrap();
        conn.open().unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.profile(), db.profile());

        clear_default();
        assert!(default_profile().is_none());
    }

    #[test]
    fn test_missing_driver_is_configuration_error() {
        let profile = ConnectionProfile::new("Server=.;Database=app", Dialect::MySql);
        let result = Connection::create(Some(&profile), &DriverRegistry::default());
        match result {
            Err(RelError::Configuration(msg)) => assert!(msg.contains("mysql")),
            other => panic!("Expected configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_transaction_state_management() {
        let db = TestDb::new();
        let mut conn = db.connection();

        let tx = conn.transaction().unwrap();
        tx.commit().unwrap();
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);

        let mut tx = conn.transaction().unwrap();
        assert_eq!(
            tx.connection().transaction_state(),
            TransactionState::Transaction
        );
        // A second begin on the same connection must fail
        assert!(tx.connection().transaction().is_err());
        tx.rollback().unwrap();
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let db = TestDb::new();
        let mut conn = db.connection();
        {
            let mut tx = conn.transaction().unwrap();
            tx.executor()
                .execute_raw(
                    "insert into people(Name, Age) values(@Name, @Age)",
                    &ParameterSet::new().with_value("Name", "Ann").with_value("Age", 30),
                )
                .unwrap();
        }
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);
        assert_eq!(db.count_people(), 0);
    }

    #[test]
    fn test_dropped_connection_rolls_back_open_transaction() {
        let db = TestDb::new();
        {
            let mut conn = db.connection();
            conn.begin_transaction().unwrap();
            conn.executor()
                .execute_raw(
                    "insert into people(Name, Age) values('Bob', 41)",
                    &ParameterSet::new(),
                )
                .unwrap();
        }
        assert_eq!(db.count_people(), 0);
    }

    #[test]
    fn test_failed_statement_poisons_transaction() {
        let db = TestDb::new();
        let mut conn = db.connection();
        let mut tx = conn.transaction().unwrap();
        assert!(tx
            .executor()
            .execute_raw("insert into missing_table values(1)", &ParameterSet::new())
            .is_err());
        assert_eq!(tx.connection().transaction_state(), TransactionState::Failed);
        assert!(matches!(tx.commit(), Err(RelError::Argument(_))));
        assert_eq!(conn.transaction_state(), TransactionState::Autocommit);
    }

    #[test]
    fn test_registry_accepts_external_drivers() {
        let fake = FakeDriver::new();
        let registry = DriverRegistry::default().with_driver(Arc::new(fake.clone()));
        let profile = ConnectionProfile::new("Server=.;Database=app", Dialect::SqlServer);

        let mut conn = Connection::create(Some(&profile), &registry).unwrap();
        conn.open().unwrap();
        assert_eq!(fake.opened(), vec!["Server=.;Database=app".to_string()]);
        assert!(format!("{:?}", registry).contains("sqlserver"));
    }
}
