/// Core Module for relbridge
///
/// This module contains the shared infrastructure every other layer builds
/// on: the value model, the error taxonomy and the database plumbing.

pub mod db;
pub mod error;
pub mod value;

// Re-export commonly used types for convenience
pub use error::{DriverError, RelError, Result};
pub use value::{ParameterSet, RowSet, Value};
