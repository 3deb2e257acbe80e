/// Database Module
///
/// This module provides the driver-facing half of relbridge, organized into
/// focused submodules.
///
/// ## Architecture
///
/// - **Connection Management** (`connection.rs`): dialects, profiles, the driver registry and transactions
/// - **SQLite Driver** (`sqlite.rs`): the bundled `rusqlite` driver
/// - **Entity Mapping** (`mapping.rs`): cached column mappings and the row/entity conversions
/// - **Query Execution** (`query.rs`): commands, outcomes and the `Executor`
///
/// ## Error Handling
///
/// All database operations use `RelError`; driver failures pass through untouched.
pub mod connection;
pub mod mapping;
pub mod query;
pub mod sqlite;

pub use connection::*;
pub use mapping::{ColumnOverrides, Entity, FieldKind, FieldMeta, FieldSpec, TableMetadata, ValueFormat};
pub use query::*;
pub use sqlite::SqliteDriver;
