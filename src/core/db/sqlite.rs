/// SQLite Driver Module
///
/// Built-in `Driver` backed by `rusqlite`. Parameters are bound by name:
/// every `@name` placeholder in the statement is looked up in the command's
/// `ParameterSet`, so extra entries in the set are harmless.
use crate::core::db::connection::{Dialect, Driver, DriverConnection};
use crate::core::db::query::{CommandKind, CommandSpec, Outcome};
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::{RelError, Result};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use std::time::Duration;

/// How long a statement waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver for `Dialect::Sqlite`
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn open(&self, connection_string: &str) -> Result<Box<dyn DriverConnection>> {
        let path = database_path(connection_string);
        let conn = rusqlite::Connection::open(&path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// Extracts the database path from a connection string.
///
/// Accepts either a bare path (`app.db`, `:memory:`) or a key/value string
/// such as `Data Source=app.db;Cache=Shared`.
pub fn database_path(connection_string: &str) -> String {
    let trimmed = connection_string.trim();
    if !trimmed.contains('=') {
        return trimmed.to_string();
    }
    trimmed
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| {
            matches!(
                key.trim().to_lowercase().as_str(),
                "data source" | "datasource" | "filename" | "path"
            )
        })
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Live SQLite connection
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl DriverConnection for SqliteConnection {
    fn run(&mut self, command: &CommandSpec) -> Result<Outcome> {
        if command.kind == CommandKind::StoredProcedure {
            return Err(RelError::Unsupported(
                "stored procedures are not available on sqlite".to_string(),
            ));
        }
        if !command.outputs.is_empty() {
            return Err(RelError::Unsupported(
                "output parameters are not available on sqlite".to_string(),
            ));
        }

        let mut stmt = self.conn.prepare(&command.sql)?;
        bind_named(&mut stmt, &command.params)?;

        if stmt.column_count() == 0 {
            let affected = stmt.raw_execute()?;
            return Ok(Outcome::affected(affected as u64));
        }
        Ok(Outcome::rows(collect_rows(&mut stmt)?))
    }

    /// Runs each statement of the batch in turn, keeping the rows of those that return any
    fn query_sets(&mut self, command: &CommandSpec) -> Result<Vec<RowSet>> {
        if command.kind == CommandKind::StoredProcedure {
            return Err(RelError::Unsupported(
                "stored procedures are not available on sqlite".to_string(),
            ));
        }
        let mut sets = Vec::new();
        let mut batch = rusqlite::Batch::new(&self.conn, &command.sql);
        while let Some(mut stmt) = batch.next()? {
            bind_named(&mut stmt, &command.params)?;
            if stmt.column_count() == 0 {
                stmt.raw_execute()?;
            } else {
                sets.push(collect_rows(&mut stmt)?);
            }
        }
        Ok(sets)
    }

    fn execute_script(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

/// Binds every `@name` placeholder of `stmt` from `params`
fn bind_named(stmt: &mut rusqlite::Statement<'_>, params: &ParameterSet) -> Result<()> {
    let names: Vec<Option<String>> = (1..=stmt.parameter_count())
        .map(|i| stmt.parameter_name(i).map(str::to_string))
        .collect();
    for (idx, name) in names.iter().enumerate() {
        let name = name.as_deref().ok_or_else(|| {
            RelError::Argument(format!(
                "positional parameter {} cannot be bound by name",
                idx + 1
            ))
        })?;
        let value = params.get(name).ok_or_else(|| {
            RelError::Argument(format!("no value supplied for parameter {}", name))
        })?;
        stmt.raw_bind_parameter(idx + 1, value)?;
    }
    Ok(())
}

fn collect_rows(stmt: &mut rusqlite::Statement<'_>) -> Result<RowSet> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.raw_query();
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(read_value(row.get_ref(i)?));
        }
        rows.push(values);
    }
    Ok(RowSet::new(columns, rows))
}

/// Converts a SQLite value into a driver-neutral value
fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Bool(b) => ToSqlOutput::Borrowed(ValueRef::Integer(*b as i64)),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}
