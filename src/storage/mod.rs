//! Storage collaborator contract.
//!
//! The engine never owns table data. A [`RowStore`] persists rows for the
//! configured tables and reports every change to an [`EventSink`] so
//! subscription endpoints can react. [`MemoryStore`] is the in-process
//! reference implementation.

mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::column::TransformError;
use crate::core::ids::IdError;
use crate::domain::TableEvent;

pub use memory::MemoryStore;

/// A row or predicate: column name to value
pub type Row = Map<String, Value>;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Unknown column '{table}.{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("Column '{table}.{column}' may not be null")]
    NotNull { table: String, column: String },

    #[error("Duplicate key {key} in table '{table}'")]
    DuplicateKey { table: String, key: String },

    #[error("Row in '{table}' references a missing '{target}' row through '{constraint}'")]
    MissingReference {
        table: String,
        constraint: String,
        target: String,
    },

    #[error("'{constraint}' restricts this change: {dependents} dependent row(s) in '{table}'")]
    Restricted {
        table: String,
        constraint: String,
        dependents: usize,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Id(#[from] IdError),
}

/// Receives row-level change events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TableEvent);
}

/// Row persistence for configured tables.
///
/// Predicates are equality matches on every given column. Implementations
/// apply column transforms: `write` to stored values, `args` to predicate
/// values and `read` to returned rows.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert a row and return it as stored (after read transforms)
    async fn insert(&self, table: &str, row: Row, user: Option<&str>) -> StorageResult<Row>;

    /// Apply `changes` to every row matching `filter`; returns the count
    async fn update(
        &self,
        table: &str,
        filter: Row,
        changes: Row,
        user: Option<&str>,
    ) -> StorageResult<usize>;

    /// Delete every row matching `filter`, cascading where configured;
    /// returns the number of rows removed across all tables
    async fn delete(&self, table: &str, filter: Row, user: Option<&str>) -> StorageResult<usize>;

    async fn select(&self, table: &str, filter: Row) -> StorageResult<Vec<Row>>;

    /// Count rows matching `filter`
    async fn count(&self, table: &str, filter: Row) -> StorageResult<usize> {
        Ok(self.select(table, filter).await?.len())
    }
}
