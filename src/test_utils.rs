/// # Test Utilities Module
///
/// Shared fixtures for the crate's unit tests:
/// - `Person`, an entity mapped onto the `people` table
/// - `TestDb`, a temp-file SQLite database with the test schema
/// - `FakeDriver`, a recording driver standing in for SqlServer/MySql
/// - `lock_default_profile`, serializing tests that touch the process-wide profile
use crate::bulk::TableBuffer;
use crate::core::db::{
    CommandSpec, Connection, ConnectionProfile, Dialect, Driver, DriverConnection, DriverRegistry, Entity, FieldKind,
    FieldSpec, Outcome,
};
use crate::core::value::ParameterSet;
use crate::core::Result;
use crate::session::Session;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;

const SCHEMA: &str = "
    create table people(
        Id integer primary key autoincrement,
        Name text not null,
        Age integer not null default 0,
        Email text,
        CreatedAt text
    );
    create table audit(
        Action text,
        Target text
    );
";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub age: i32,
    pub email: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

impl Entity for Person {
    const TABLE: Option<&'static str> = Some("people");

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("Id", FieldKind::Integer).key().generated(),
            FieldSpec::new("Name", FieldKind::Text),
            FieldSpec::new("Age", FieldKind::Integer),
            FieldSpec::new("Email", FieldKind::Text),
            FieldSpec::new("CreatedAt", FieldKind::DateTime),
        ]
    }
}

/// Isolated file-backed SQLite database, removed on drop
pub struct TestDb {
    _dir: TempDir,
    profile: ConnectionProfile,
}

impl TestDb {
    /// Creates the database and its schema
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        let profile = ConnectionProfile::new(path.display().to_string(), Dialect::Sqlite);
        let db = TestDb { _dir: dir, profile };
        db.connection()
            .execute_script(SCHEMA)
            .expect("Failed to create test schema");
        db
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// A fresh unopened connection to the database
    pub fn connection(&self) -> Connection {
        Connection::create(Some(&self.profile), &DriverRegistry::default())
            .expect("Failed to create connection")
    }

    pub fn session(&self) -> Session {
        Session::new(self.profile.clone())
    }

    /// Inserts `(Name, Age)` rows into `people`
    pub fn seed(&self, people: &[(&str, i32)]) {
        let mut conn = self.connection();
        let mut exec = conn.executor();
        for (name, age) in people {
            exec.execute_raw(
                "insert into people(Name, Age) values(@Name, @Age)",
                &ParameterSet::new().with_value("Name", *name).with_value("Age", *age),
            )
            .expect("Failed to seed people");
        }
    }

    pub fn count_people(&self) -> i64 {
        self.connection()
            .executor()
            .scalar_raw("select count(*) from people", &ParameterSet::new())
            .expect("Failed to count people")
            .as_i64()
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct FakeState {
    opened: Vec<String>,
    commands: Vec<CommandSpec>,
    outcomes: VecDeque<Outcome>,
    bulk_copies: Vec<(String, usize, Vec<(String, String)>)>,
}

/// Driver that records everything it is asked to do
///
/// Commands return queued outcomes in order, then empty outcomes.
#[derive(Clone)]
pub struct FakeDriver {
    dialect: Dialect,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    /// A recording SqlServer driver
    pub fn new() -> Self {
        Self::for_dialect(Dialect::SqlServer)
    }

    pub fn for_dialect(dialect: Dialect) -> Self {
        FakeDriver {
            dialect,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the outcome of the next command
    pub fn push_outcome(&self, outcome: Outcome) {
        self.state().outcomes.push_back(outcome);
    }

    /// Connection strings opened so far
    pub fn opened(&self) -> Vec<String> {
        self.state().opened.clone()
    }

    /// Commands run so far
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.state().commands.clone()
    }

    /// `(table, row count, column mappings)` of every bulk copy
    pub fn bulk_copies(&self) -> Vec<(String, usize, Vec<(String, String)>)> {
        self.state().bulk_copies.clone()
    }
}

impl Driver for FakeDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn open(&self, connection_string: &str) -> Result<Box<dyn DriverConnection>> {
        self.state().opened.push(connection_string.to_string());
        Ok(Box::new(FakeConnection {
            driver: self.clone(),
        }))
    }
}

struct FakeConnection {
    driver: FakeDriver,
}

impl DriverConnection for FakeConnection {
    fn run(&mut self, command: &CommandSpec) -> Result<Outcome> {
        let mut state = self.driver.state();
        state.commands.push(command.clone());
        Ok(state.outcomes.pop_front().unwrap_or_default())
    }

    fn execute_script(&mut self, sql: &str) -> Result<()> {
        self.driver.state().commands.push(CommandSpec::text(sql));
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn bulk_copy(&mut self, table: &str, buffer: &TableBuffer, mappings: &[(String, String)]) -> Result<u64> {
        self.driver
            .state()
            .bulk_copies
            .push((table.to_string(), buffer.len(), mappings.to_vec()));
        Ok(buffer.len() as u64)
    }
}

static DEFAULT_PROFILE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes tests that set or clear the process-wide default profile
pub fn lock_default_profile() -> MutexGuard<'static, ()> {
    DEFAULT_PROFILE_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

