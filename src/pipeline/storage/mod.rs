//! Relational store ports used by the batch loader, with a SQLite adapter for
//! real runs and an in-memory adapter with scripted faults for tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Row;
use crate::error::StoreError;
use crate::schema::TableSpec;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteConnector;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A group of rows committed as one atomic unit.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    /// Digest of the artifact the rows came from; keys the load checkpoint.
    pub artifact_digest: String,
    pub rows: Vec<Row>,
}

/// A row the store refused, identified by its offset inside the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub batch_index: usize,
    pub offset: usize,
    pub reason: String,
}

/// Result of applying a batch row by row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolatedCommit {
    pub committed: usize,
    pub rejected: Vec<RejectedRow>,
}

/// Opens one session per table load.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, table: &TableSpec) -> StoreResult<Box<dyn TableSession>>;
}

/// A connection scoped to one table load. Dropping it releases the connection.
#[async_trait]
pub trait TableSession: Send {
    /// Whether [`write_batch_isolating`](TableSession::write_batch_isolating) is available.
    fn supports_partial_application(&self) -> bool;

    /// Batches already confirmed for this table and artifact.
    async fn confirmed_batches(&mut self, artifact_digest: &str) -> StoreResult<BTreeSet<usize>>;

    /// Upsert all rows and confirm the batch, atomically. Returns rows committed.
    async fn write_batch(&mut self, batch: &Batch) -> StoreResult<usize>;

    /// Upsert row by row, skipping rejected rows, and confirm the batch.
    async fn write_batch_isolating(&mut self, batch: &Batch) -> StoreResult<IsolatedCommit>;

    async fn row_count(&mut self) -> StoreResult<u64>;
}
