/// Transaction Orchestration Module
///
/// Runs an ordered list of `TransactionStep`s atomically on one connection.
/// A step can name an output; later steps list that name among their inputs
/// to have the recorded value bound to their same-named parameter.
///
/// ```ignore
/// let steps = vec![
///     TransactionStep::non_query("insert into people(Name, Age) values(@Name, @Age)")
///         .param("Name", "Ann")
///         .param("Age", 30),
///     TransactionStep::scalar("select last_insert_rowid()").output("Id"),
///     TransactionStep::non_query("insert into audit(Action, Target) values('insert', @Id)")
///         .param("Id", 0)
///         .input("Id"),
/// ];
/// let last = run_steps(&mut conn, &steps)?;
/// ```
use crate::core::db::mapping::{self, ColumnOverrides, Entity, TableMetadata};
use crate::core::db::{CommandSpec, Connection, Executor};
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::{RelError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a step's command returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Affected row count
    #[default]
    #[serde(alias = "NonQuery", alias = "ExecuteNonQuery")]
    NonQuery,
    /// First column of the first row
    #[serde(alias = "Scalar", alias = "ExecuteScalar")]
    Scalar,
    /// Every row
    #[serde(alias = "EntityList", alias = "ToEntityList")]
    EntityList,
    /// The first row only
    #[serde(alias = "Entity", alias = "ToEntity")]
    Entity,
}

/// One command of a transaction
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionStep {
    #[serde(alias = "CommandText")]
    pub command_text: String,
    #[serde(default, alias = "ParameterList")]
    pub parameters: ParameterSet,
    #[serde(default, alias = "ExecuteType")]
    pub result_kind: ResultKind,
    /// Names of earlier outputs to bind into this step's parameters
    #[serde(default, alias = "InputList")]
    pub inputs: Vec<String>,
    /// Name under which this step's result is recorded
    #[serde(default, alias = "OutputName")]
    pub output: Option<String>,
    /// Property → column pairs renaming this step's result columns back to property names
    #[serde(default, alias = "PropertyMatchList", skip_serializing_if = "ColumnOverrides::is_empty")]
    pub overrides: ColumnOverrides,
}

impl TransactionStep {
    pub fn new(command_text: impl Into<String>, result_kind: ResultKind) -> Self {
        TransactionStep {
            command_text: command_text.into(),
            result_kind,
            ..Default::default()
        }
    }

    pub fn non_query(command_text: impl Into<String>) -> Self {
        Self::new(command_text, ResultKind::NonQuery)
    }

    pub fn scalar(command_text: impl Into<String>) -> Self {
        Self::new(command_text, ResultKind::Scalar)
    }

    pub fn entity_list(command_text: impl Into<String>) -> Self {
        Self::new(command_text, ResultKind::EntityList)
    }

    pub fn entity(command_text: impl Into<String>) -> Self {
        Self::new(command_text, ResultKind::Entity)
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.parameters = params;
        self
    }

    pub fn input(mut self, name: &str) -> Self {
        self.inputs.push(name.to_string());
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.output = Some(name.to_string());
        self
    }

    /// Reads result column `column` as property `property`
    pub fn column(mut self, property: &str, column: &str) -> Self {
        self.overrides = self.overrides.column(property, column);
        self
    }

    pub fn with_overrides(mut self, overrides: ColumnOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Affected(u64),
    Scalar(Value),
    Rows(RowSet),
}

impl StepResult {
    /// The value this result binds to a parameter; row results bind nothing
    pub fn as_param(&self) -> Option<Value> {
        match self {
            StepResult::Affected(n) => Some(Value::Integer(i64::try_from(*n).unwrap_or(i64::MAX))),
            StepResult::Scalar(v) => Some(v.clone()),
            StepResult::Rows(_) => None,
        }
    }

    /// Maps a row result onto entities
    pub fn into_entities<T: Entity>(self) -> Result<Vec<T>> {
        match self {
            StepResult::Rows(rows) => {
                let meta = mapping::metadata::<T>()?;
                mapping::rows_to_entities(&property_columns(rows, &meta), &meta)
            }
            other => Err(RelError::Mapping(format!(
                "step result {:?} holds no rows",
                other
            ))),
        }
    }

    /// Maps the first row of a row result onto an entity
    pub fn into_entity<T: Entity>(self) -> Result<Option<T>> {
        Ok(self.into_entities::<T>()?.into_iter().next())
    }
}

/// Lifecycle of an orchestrated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Started,
    Bound,
    Executed,
    OutputRecorded,
    Committed,
    RolledBack,
}

/// Outputs recorded so far, matched case-insensitively by name
#[derive(Debug, Default)]
struct OutputTable {
    entries: Vec<(String, StepResult)>,
}

impl OutputTable {
    fn get(&self, name: &str) -> Option<&StepResult> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, r)| r)
    }

    fn record(&mut self, name: &str, result: StepResult) {
        match self.entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = result,
            None => self.entries.push((name.to_string(), result)),
        }
    }
}

struct StepRun {
    state: StepState,
    outputs: OutputTable,
}

impl StepRun {
    fn advance(&mut self, next: StepState, step: usize) {
        debug!(step, from = ?self.state, to = ?next, "transaction step");
        self.state = next;
    }

    /// Builds the step's command, overwriting or adding parameters from recorded outputs
    fn bind(&self, step: &TransactionStep) -> Result<CommandSpec> {
        let mut params = step.parameters.clone();
        for input in &step.inputs {
            if let Some(result) = self.outputs.get(input) {
                let value = result.as_param().ok_or_else(|| {
                    RelError::Argument(format!(
                        "output '{}' holds rows and cannot be bound to parameter @{}",
                        input,
                        input.trim_start_matches('@')
                    ))
                })?;
                params.insert(input, value);
            }
        }
        Ok(CommandSpec::text(step.command_text.as_str()).with_params(params))
    }

    fn run_all(&mut self, exec: &mut Executor<'_>, steps: &[TransactionStep]) -> Result<StepResult> {
        let mut last = StepResult::Affected(0);
        for (i, step) in steps.iter().enumerate() {
            let command = self.bind(step)?;
            self.advance(StepState::Bound, i);
            let result = execute_step(exec, &command, step)?;
            self.advance(StepState::Executed, i);
            if let Some(name) = &step.output {
                self.outputs.record(name, result.clone());
                self.advance(StepState::OutputRecorded, i);
            }
            last = result;
        }
        Ok(last)
    }
}

/// Renames columns that an override maps to a property
fn apply_overrides(mut rows: RowSet, overrides: &ColumnOverrides) -> RowSet {
    for column in rows.columns.iter_mut() {
        if let Some((property, _)) = overrides.iter().find(|(_, c)| c.eq_ignore_ascii_case(column.as_str())) {
            *column = property.to_string();
        }
    }
    rows
}

/// Renames columns holding a property name to that property's mapped column
fn property_columns(mut rows: RowSet, meta: &TableMetadata) -> RowSet {
    for column in rows.columns.iter_mut() {
        if meta.by_column(column).is_none() {
            if let Some(field) = meta.field(column) {
                *column = field.column.clone();
            }
        }
    }
    rows
}

fn execute_step(exec: &mut Executor<'_>, command: &CommandSpec, step: &TransactionStep) -> Result<StepResult> {
    Ok(match step.result_kind {
        ResultKind::NonQuery => StepResult::Affected(exec.execute(command)?),
        ResultKind::Scalar => StepResult::Scalar(exec.scalar(command)?),
        ResultKind::EntityList => StepResult::Rows(apply_overrides(exec.query(command)?, &step.overrides)),
        ResultKind::Entity => {
            StepResult::Rows(apply_overrides(exec.query(command)?.truncate_to_first(), &step.overrides))
        }
    })
}

/// Runs `steps` in one transaction on `conn`
///
/// # Returns
///
/// The result of the last step. Any failure rolls the whole transaction back
/// before the error is returned.
///
/// # Errors
///
/// `RelError::Argument` for an empty step list or a row output bound to a
/// parameter; any driver error of a step.
pub fn run_steps(conn: &mut Connection, steps: &[TransactionStep]) -> Result<StepResult> {
    if steps.is_empty() {
        return Err(RelError::Argument(
            "a transaction needs at least one step".to_string(),
        ));
    }
    let mut tx = conn.transaction()?;
    let mut run = StepRun {
        state: StepState::Started,
        outputs: OutputTable::default(),
    };
    let result = {
        let mut exec = tx.executor();
        run.run_all(&mut exec, steps)
    };
    match result {
        Ok(last) => {
            tx.commit()?;
            run.advance(StepState::Committed, steps.len());
            info!(steps = steps.len(), "transaction committed");
            Ok(last)
        }
        Err(e) => {
            run.advance(StepState::RolledBack, steps.len());
            warn!(error = %e, "transaction rolled back");
            if let Err(rollback) = tx.rollback() {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}
