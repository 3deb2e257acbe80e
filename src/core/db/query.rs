/// Query Execution Module
///
/// This module provides the unit of execution (`CommandSpec`), its result
/// (`Outcome`) and the `Executor` that runs commands on a borrowed
/// connection. Typed CRUD, pagination and bulk import are layered on
/// `Executor` in their own modules.
use crate::command::CommandBuilder;
use crate::core::db::connection::{Connection, Dialect};
use crate::core::db::mapping::{self, ColumnOverrides, Entity};
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::Result;

/// How a command's text is interpreted by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// Plain SQL text
    #[default]
    Text,
    /// Name of a stored procedure
    StoredProcedure,
}

/// A fully built command, ready to be executed once
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandSpec {
    /// SQL text or procedure name
    pub sql: String,
    /// Interpretation of `sql`
    pub kind: CommandKind,
    /// Input parameters
    pub params: ParameterSet,
    /// Names of output parameters the driver must read back
    pub outputs: Vec<String>,
}

impl CommandSpec {
    /// A text command with no parameters
    pub fn text(sql: impl Into<String>) -> Self {
        CommandSpec {
            sql: sql.into(),
            ..Default::default()
        }
    }

    /// A stored procedure call
    pub fn procedure(name: impl Into<String>) -> Self {
        CommandSpec {
            sql: name.into(),
            kind: CommandKind::StoredProcedure,
            ..Default::default()
        }
    }

    /// Replaces the input parameters
    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }

    /// Declares an output parameter
    pub fn with_output(mut self, name: &str) -> Self {
        self.outputs.push(name.trim_start_matches('@').to_string());
        self
    }
}

/// Everything a driver reports back for one command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Rows produced by the last result set, if any
    pub rows: RowSet,
    /// Rows changed by a non-query
    pub rows_affected: u64,
    /// Values of declared output parameters
    pub outputs: ParameterSet,
}

impl Outcome {
    /// Outcome of a non-query
    pub fn affected(rows_affected: u64) -> Self {
        Outcome {
            rows_affected,
            ..Default::default()
        }
    }

    /// Outcome of a query
    pub fn rows(rows: RowSet) -> Self {
        Outcome {
            rows,
            ..Default::default()
        }
    }
}

/// Command execution service that operates on a borrowed connection
///
/// The executor opens the connection if it is unopened but never closes it;
/// the connection's owner decides its lifetime.
pub struct Executor<'c> {
    conn: &'c mut Connection,
    builder: CommandBuilder,
}

impl<'c> Executor<'c> {
    /// Creates an executor for `conn` with the read hint enabled
    pub fn new(conn: &'c mut Connection) -> Self {
        let builder = CommandBuilder::new(conn.dialect());
        Executor { conn, builder }
    }

    /// Enables or disables the `with(nolock)` read hint for built selects
    pub fn with_no_lock(mut self, no_lock: bool) -> Self {
        self.builder = self.builder.with_no_lock(no_lock);
        self
    }

    /// Dialect of the underlying connection
    pub fn dialect(&self) -> Dialect {
        self.builder.dialect()
    }

    /// Command builder configured for this executor
    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    /// The borrowed connection
    pub fn connection(&mut self) -> &mut Connection {
        self.conn
    }

    /// Runs a command and returns the full outcome, including output parameters
    pub fn run(&mut self, command: &CommandSpec) -> Result<Outcome> {
        self.conn.run(command)
    }

    /// Runs a non-query and returns the number of affected rows
    pub fn execute(&mut self, command: &CommandSpec) -> Result<u64> {
        Ok(self.run(command)?.rows_affected)
    }

    /// Runs a command and returns the first column of the first row
    ///
    /// # Returns
    ///
    /// `Value::Null` when the command produced no rows.
    pub fn scalar(&mut self, command: &CommandSpec) -> Result<Value> {
        Ok(self.run(command)?.rows.scalar())
    }

    /// Runs a query and returns its rows
    pub fn query(&mut self, command: &CommandSpec) -> Result<RowSet> {
        Ok(self.run(command)?.rows)
    }

    /// Runs a batch and returns every result set it produces
    pub fn query_sets(&mut self, command: &CommandSpec) -> Result<Vec<RowSet>> {
        self.conn.query_sets(command)
    }

    /// Runs a query and maps every row onto `T`
    ///
    /// # Arguments
    ///
    /// * `command` - Query to run
    /// * `overrides` - Optional per-call property → column overrides
    pub fn query_entities<T: Entity>(
        &mut self,
        command: &CommandSpec,
        overrides: Option<&ColumnOverrides>,
    ) -> Result<Vec<T>> {
        let rows = self.query(command)?;
        let meta = mapping::metadata_with::<T>(overrides)?;
        mapping::rows_to_entities(&rows, &meta)
    }

    /// Runs raw SQL text as a non-query
    pub fn execute_raw(&mut self, sql: &str, params: &ParameterSet) -> Result<u64> {
        self.execute(&CommandSpec::text(sql).with_params(params.clone()))
    }

    /// Runs raw SQL text as a query
    pub fn query_raw(&mut self, sql: &str, params: &ParameterSet) -> Result<RowSet> {
        self.query(&CommandSpec::text(sql).with_params(params.clone()))
    }

    /// Runs a raw SQL batch and returns all of its result sets
    pub fn query_sets_raw(&mut self, sql: &str, params: &ParameterSet) -> Result<Vec<RowSet>> {
        self.query_sets(&CommandSpec::text(sql).with_params(params.clone()))
    }

    /// Runs raw SQL text and returns its scalar result
    pub fn scalar_raw(&mut self, sql: &str, params: &ParameterSet) -> Result<Value> {
        self.scalar(&CommandSpec::text(sql).with_params(params.clone()))
    }

    /// Runs a parameterless multi-statement script
    pub fn execute_script(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_script(sql)
    }
}

/// Represents different SQL statement types for logging
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatementType {
    /// SELECT statement
    Select,
    /// INSERT statement
    Insert,
    /// UPDATE statement
    Update,
    /// DELETE statement
    Delete,
    /// Multi-statement script or variable assignment
    Script,
    /// Other statement types
    Other,
}

impl StatementType {
    /// Determines the statement type from a SQL string
    ///
    /// # Arguments
    ///
    /// * `sql` - SQL statement to analyze
    ///
    /// # Returns
    ///
    /// The classified statement type
    pub fn from_sql(sql: &str) -> Self {
        let sql_lower = sql.trim().to_lowercase();

        if sql_lower.starts_with("select @") || sql_lower.starts_with("declare") {
            StatementType::Script
        } else if sql_lower.starts_with("select") {
            StatementType::Select
        } else if sql_lower.starts_with("insert") {
            StatementType::Insert
        } else if sql_lower.starts_with("update") {
            StatementType::Update
        } else if sql_lower.starts_with("delete") {
            StatementType::Delete
        } else {
            StatementType::Other
        }
    }
}
