/// Bulk Import Module
///
/// `TableBuffer` is a fully materialized table handed to a driver's native
/// bulk-copy path. Only SqlServer has one; other dialects report
/// `RelError::Unsupported`. Source columns map one-to-one onto destination
/// columns of the same name.
use crate::core::db::mapping::{self, data_params};
use crate::core::db::{Entity, Executor};
use crate::core::value::Value;
use crate::core::{RelError, Result};
use tracing::info;

/// Which entity properties become buffer columns
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ColumnSelection<'a> {
    /// Every writable mapped field
    #[default]
    All,
    /// Only the named properties
    Include(&'a [&'a str]),
    /// Every writable mapped field except the named properties
    Exclude(&'a [&'a str]),
}

impl ColumnSelection<'_> {
    fn keeps(&self, property: &str) -> bool {
        let listed = |names: &[&str]| names.iter().any(|n| n.eq_ignore_ascii_case(property));
        match self {
            ColumnSelection::All => true,
            ColumnSelection::Include(names) => listed(names),
            ColumnSelection::Exclude(names) => !listed(names),
        }
    }
}

/// Column names plus rows of values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableBuffer {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl TableBuffer {
    /// Creates an empty buffer with the given columns
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TableBuffer {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row
    ///
    /// # Errors
    ///
    /// `RelError::Argument` when the row width differs from the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(RelError::Argument(format!(
                "row has {} values but the buffer has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Builds a buffer from entities, one column per selected writable field
    ///
    /// Columns carry database column names; values get the same formatting
    /// as an insert.
    pub fn from_entities<T: Entity>(entities: &[T], selection: ColumnSelection<'_>) -> Result<Self> {
        let meta = mapping::metadata::<T>()?;
        let fields: Vec<_> = meta
            .mapped()
            .filter(|f| f.is_writable() && selection.keeps(&f.property))
            .collect();
        if fields.is_empty() {
            return Err(RelError::Argument(format!(
                "no columns of {} selected for the buffer",
                meta.type_name
            )));
        }
        let mut buffer = TableBuffer::new(fields.iter().map(|f| f.column.clone()));
        for entity in entities {
            let params = data_params(entity, &meta)?;
            let row = fields
                .iter()
                .map(|f| params.get(&f.property).cloned().unwrap_or_default())
                .collect();
            buffer.push_row(row)?;
        }
        Ok(buffer)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Source → destination column pairs; every column maps onto its own name
    pub fn mappings(&self) -> Vec<(String, String)> {
        self.columns.iter().map(|c| (c.clone(), c.clone())).collect()
    }
}

impl<'c> Executor<'c> {
    /// Streams `buffer` into `table` through the driver's bulk-copy path
    ///
    /// # Returns
    ///
    /// The number of rows copied.
    ///
    /// # Errors
    ///
    /// `RelError::Unsupported` on dialects without bulk copy and
    /// `RelError::Argument` for an empty buffer.
    pub fn bulk_import(&mut self, table: &str, buffer: &TableBuffer) -> Result<u64> {
        if !self.dialect().supports_bulk_copy() {
            return Err(RelError::Unsupported(format!(
                "bulk import is not available for {}",
                self.dialect()
            )));
        }
        if buffer.is_empty() {
            return Err(RelError::Argument(format!(
                "nothing to import into {}",
                table
            )));
        }
        let copied = self
            .connection()
            .bulk_copy(table, buffer, &buffer.mappings())?;
        info!(table = %table, rows = copied, "bulk import finished");
        Ok(copied)
    }

    /// Bulk-imports entities into their own table
    pub fn bulk_import_entities<T: Entity>(&mut self, entities: &[T], selection: ColumnSelection<'_>) -> Result<u64> {
        let meta = mapping::metadata::<T>()?;
        let buffer = TableBuffer::from_entities(entities, selection)?;
        self.bulk_import(&meta.table, &buffer)
    }
}
