//! Core traits for reading source tables and reconciling into a destination.
//!
//! - [`SourceReader`]: streams rows of a table with FK identities joined in
//! - [`ImportTarget`]: set-based staging, matching and apply operations
//!   against a destination inside one open transaction
//! - [`ProgressSink`]: fire-and-forget progress messages
//!
//! The engine (`export`, `import`) only talks to these traits; the
//! PostgreSQL and in-memory drivers implement them.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

use super::schema::TableDescriptor;
use super::value::SqlValue;

/// Default number of rows per batch when streaming or staging.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// A foreign key value as read from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReference {
    /// Raw surrogate key stored in the FK column.
    pub key: Option<i64>,
    /// Durable identity of the referenced row, if the row exists and has one.
    pub identity: Option<Uuid>,
    /// Whether a referenced row was found for `key`.
    pub found: bool,
}

impl SourceReference {
    pub fn null() -> Self {
        Self {
            key: None,
            identity: None,
            found: false,
        }
    }
}

/// One row read from a source table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// Source surrogate key.
    pub key: i64,
    /// Durable identity; `None` for legacy rows that predate the column.
    pub identity: Option<Uuid>,
    /// Values of `TableDescriptor::columns`, in order.
    pub values: Vec<SqlValue>,
    /// Values of `TableDescriptor::foreign_keys`, in order.
    pub references: Vec<SourceReference>,
}

/// A batch of source rows.
pub type SourceBatch = Vec<SourceRow>;

/// A row ready for staging.
///
/// `values` follow `TableDescriptor::staged_columns()` after the identity
/// column: data columns, then external FKs already rewritten to destination
/// surrogate keys.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub identity: Uuid,
    pub values: Vec<SqlValue>,
}

/// New value of a self-referencing column for one destination row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfReferenceUpdate {
    /// Destination surrogate key of the row to update.
    pub key: i64,
    /// Destination surrogate key it should reference, or NULL.
    pub reference: Option<i64>,
}

/// A (durable identity, destination surrogate key) pair.
pub type IdentityKey = (Uuid, i64);

/// Read rows from a source database.
///
/// # Streaming
///
/// [`SourceReader::read_table`] returns a channel receiver. The reader fills
/// it from a background task in surrogate key order, so a table is never
/// materialized in memory and the consumer applies backpressure.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Start streaming rows of `table` in batches of `batch_size`.
    fn read_table(
        &self,
        table: &TableDescriptor,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<SourceBatch>>;

    /// Number of rows in `table`.
    async fn row_count(&self, table: &TableDescriptor) -> Result<i64>;

    /// Database type identifier (e.g. "postgres").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}

/// Destination operations used by the reconciler.
///
/// An `ImportTarget` is created with an open transaction; every method runs
/// inside it. Nothing becomes visible to other sessions until
/// [`ImportTarget::commit`]. Dropping a target without committing must roll
/// the transaction back.
#[async_trait]
pub trait ImportTarget: Send {
    /// All (identity, key) pairs currently in `table`.
    ///
    /// Used to seed the identity map of tables that are referenced but not
    /// imported in this session.
    async fn existing_identities(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>>;

    /// Create the (empty) staging structure for `table`.
    async fn create_staging(&mut self, table: &TableDescriptor) -> Result<()>;

    /// Append rows to the staging structure.
    async fn stage_rows(&mut self, table: &TableDescriptor, rows: &[StagedRow]) -> Result<u64>;

    /// Staged identities with no matching destination row.
    async fn unmatched_identities(&mut self, table: &TableDescriptor) -> Result<Vec<Uuid>>;

    /// Overwrite staged columns of destination rows whose identity is staged.
    async fn apply_updates(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>>;

    /// Insert staged rows whose identity does not exist in the destination.
    async fn apply_inserts(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>>;

    /// Set a self-referencing column for the given rows.
    async fn update_self_reference(
        &mut self,
        table: &TableDescriptor,
        column: &str,
        updates: &[SelfReferenceUpdate],
    ) -> Result<u64>;

    /// Discard the staging structure for `table`.
    async fn drop_staging(&mut self, table: &TableDescriptor) -> Result<()>;

    /// Make every change durable.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every change made in the transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Database type identifier (e.g. "postgres").
    fn db_type(&self) -> &str;
}

/// Receives human-readable progress messages.
///
/// Reporting never affects control flow.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        self(message)
    }
}

/// A sink that discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _message: &str) {}
}
