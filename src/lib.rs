// Core infrastructure modules
pub mod core;

// Query construction
pub mod command;
pub mod expr;
pub mod translate;

// Execution features
pub mod bulk;
pub mod crud;
pub mod pagination;
pub mod transaction;

// Entry points
pub mod async_session;
pub mod cli;
pub mod config;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use crate::async_session::AsyncSession;
pub use crate::core::db::{
    clear_default, set_default, ColumnOverrides, CommandSpec, Connection, ConnectionProfile, Dialect, Entity,
    FieldKind, FieldSpec, ValueFormat,
};
pub use crate::core::{ParameterSet, RelError, Result, RowSet, Value};
pub use crate::crud::{ExistsPolicy, Query};
pub use crate::expr::{field, lit, param, OrderBy, Predicate, Projection};
pub use crate::pagination::{PageRequest, PaginationResult};
pub use crate::session::Session;
pub use crate::transaction::{ResultKind, StepResult, TransactionStep};
