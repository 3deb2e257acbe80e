/// Relbridge Error Module
///
/// This module defines the error taxonomy shared by every layer of the crate.
/// Driver failures are carried through untouched; everything else names the
/// layer that rejected the request.
use thiserror::Error;

/// Failure raised by an underlying database driver.
///
/// The built-in SQLite driver surfaces `rusqlite` errors directly; drivers
/// registered from outside the crate box their own error types.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Error from the bundled SQLite driver
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Error from any other registered driver
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Error type for every relbridge operation.
///
/// - `Configuration`: no connection profile or no driver for the dialect
/// - `Translation`: an expression outside the supported grammar
/// - `Argument`: a request the builder refuses (missing WHERE, bad page size)
/// - `Unsupported`: an operation the active dialect cannot perform
/// - `Driver`: passthrough from the database driver
/// - `Mapping`: a value that cannot be converted into an entity field
#[derive(Error, Debug)]
pub enum RelError {
    /// No usable connection profile or driver
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Expression node outside the supported grammar
    #[error("Translation error: {0}")]
    Translation(String),

    /// Invalid argument supplied by the caller
    #[error("Argument error: {0}")]
    Argument(String),

    /// Operation not available for the active dialect or driver
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Connectivity, constraint or timeout failure from the driver
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Row value that cannot be converted to the declared field type
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding and decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for RelError {
    fn from(err: rusqlite::Error) -> Self {
        RelError::Driver(DriverError::Sqlite(err))
    }
}

impl RelError {
    /// Wraps an arbitrary driver error without reinterpreting it.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RelError::Driver(DriverError::Other(Box::new(err)))
    }
}

/// Type alias for Result with `RelError` as the error type.
pub type Result<T> = std::result::Result<T, RelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let db_err: RelError = rusqlite::Error::ExecuteReturnedResults.into();
        assert!(db_err.to_string().contains("Driver error"));

        let translation_err = RelError::Translation("unknown field Foo".to_string());
        assert!(translation_err.to_string().contains("Translation error"));

        let config_err = RelError::Configuration("no profile".to_string());
        assert!(config_err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let rel_err: RelError = io_err.into();
        match rel_err {
            RelError::Io(_) => {}
            _ => panic!("Expected IO error"),
        }

        let json_err: std::result::Result<serde_json::Value, serde_json::Error> =
            serde_json::from_str("{ invalid json }");
        let rel_err: RelError = json_err.unwrap_err().into();
        match rel_err {
            RelError::Json(_) => {}
            _ => panic!("Expected JSON error"),
        }
    }

    #[test]
    fn test_driver_errors_pass_through() {
        let rel_err: RelError = rusqlite::Error::QueryReturnedNoRows.into();
        match rel_err {
            RelError::Driver(DriverError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => {}
            other => panic!("Expected untouched sqlite error, got {other:?}"),
        }

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timeout");
        let rel_err = RelError::driver(io);
        assert!(rel_err.to_string().contains("socket timeout"));
    }
}
