use crate::config::{load_config, Config};
use crate::core::value::ParameterSet;
use crate::core::{RelError, Result};
use crate::session::Session;
use crate::transaction::TransactionStep;
use serde_json::json;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const USAGE: &str = "usage: relbridge <config.toml> <exec|query|scalar|tx> <sql|steps.json> [params-json]";

/// What to do with the configured database.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Run a non-query and report the affected row count
    Exec(String),
    /// Run a query and print its rows
    Query(String),
    /// Run a query and print its first value
    Scalar(String),
    /// Run the transaction steps stored in a JSON file
    Tx(String),
}

/// Represents a parsed command line.
#[derive(Debug, PartialEq)]
pub enum Command {
    Run {
        config: String,
        action: Action,
        params: Option<String>,
    },
    Help,
    Unknown(String),
}

/// Parses the arguments following the program name into a `Command`.
pub fn parse_args(args: &[String]) -> Command {
    let parts: Vec<&str> = args.iter().map(|a| a.trim()).collect();
    if parts.is_empty() || matches!(parts[0], "-h" | "--help" | "help") {
        return Command::Help;
    }
    if parts.len() < 3 || parts.len() > 4 {
        return Command::Unknown(parts.join(" "));
    }
    let target = parts[2].to_string();
    let action = match parts[1] {
        "exec" => Action::Exec(target),
        "query" => Action::Query(target),
        "scalar" => Action::Scalar(target),
        "tx" => {
            if parts.len() == 4 {
                return Command::Unknown(parts.join(" "));
            }
            Action::Tx(target)
        }
        _ => return Command::Unknown(parts.join(" ")),
    };
    Command::Run {
        config: parts[0].to_string(),
        action,
        params: parts.get(3).map(|p| p.to_string()),
    }
}

/// Installs the stderr log subscriber.
///
/// `RUST_LOG` wins over the configured filter; without either only warnings
/// are shown.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter().unwrap_or("warn")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs one action on the session and returns its JSON result.
pub fn execute(session: &Session, action: &Action, params: Option<&str>) -> Result<serde_json::Value> {
    let params: ParameterSet = match params {
        Some(raw) => serde_json::from_str(raw)?,
        None => ParameterSet::new(),
    };
    match action {
        Action::Exec(sql) => {
            let affected = session.execute_raw(sql, &params)?;
            Ok(json!({ "rows_affected": affected }))
        }
        Action::Query(sql) => Ok(serde_json::to_value(session.query_raw(sql, &params)?)?),
        Action::Scalar(sql) => Ok(session.scalar_raw(sql, &params)?.to_json()),
        Action::Tx(path) => {
            let steps: Vec<TransactionStep> = serde_json::from_str(&fs::read_to_string(path)?)?;
            Ok(serde_json::to_value(session.run_steps(&steps)?)?)
        }
    }
}

/// Runs a parsed command line and returns the text to print.
pub fn run(command: &Command) -> Result<String> {
    match command {
        Command::Help => Ok(USAGE.to_string()),
        Command::Unknown(input) => Err(RelError::Argument(format!(
            "cannot parse '{}'\n{}",
            input, USAGE
        ))),
        Command::Run {
            config,
            action,
            params,
        } => {
            let config = load_config(config)?;
            init_logging(&config);
            info!(dialect = %config.database.dialect, "relbridge starting");
            let session = Session::from_config(&config);
            let output = execute(&session, action, params.as_deref())?;
            Ok(output.to_string())
        }
    }
}
