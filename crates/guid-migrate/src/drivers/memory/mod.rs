//! In-memory database.
//!
//! Implements [`SourceReader`] and, through [`MemoryDatabase::begin`],
//! [`ImportTarget`]. Used to run exports and imports without a server.
//!
//! A transaction is a snapshot of the whole database taken at `begin`.
//! Writes go straight to the shared state; rollback, or dropping the target
//! without committing, restores the snapshot. Surrogate keys are handed out
//! from a configurable start and step so two databases never agree on keys
//! by accident.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::schema::TableDescriptor;
use crate::core::traits::{
    IdentityKey, ImportTarget, SelfReferenceUpdate, SourceBatch, SourceReader, SourceReference,
    SourceRow, StagedRow,
};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub key: i64,
    pub identity: Option<Uuid>,
    /// Data and foreign key columns by name. Missing columns read as NULL.
    pub values: HashMap<String, SqlValue>,
}

impl MemoryRow {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    /// Value of a foreign key column as a surrogate key.
    pub fn reference(&self, column: &str) -> Option<i64> {
        self.values.get(column).and_then(SqlValue::as_i64)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: BTreeMap<i64, MemoryRow>,
    next_key: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
}

/// A database held in memory.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
    first_key: i64,
    key_step: i64,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_keys(1, 1)
    }

    /// Hand out surrogate keys `first, first + step, ...` in every table.
    pub fn with_keys(first: i64, step: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            first_key: first,
            key_step: step.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a row directly, outside of any import. Returns its key.
    pub fn insert(
        &self,
        table: &str,
        identity: Option<Uuid>,
        values: impl IntoIterator<Item = (&'static str, SqlValue)>,
    ) -> i64 {
        let mut state = self.lock();
        let (first, step) = (self.first_key, self.key_step);
        let stored = state.tables.entry(table.to_string()).or_default();
        let key = allocate_key(stored, first, step);
        stored.rows.insert(
            key,
            MemoryRow {
                key,
                identity,
                values: values
                    .into_iter()
                    .map(|(c, v)| (c.to_string(), v))
                    .collect(),
            },
        );
        key
    }

    /// Overwrite one column of one row. Returns false if the row is absent.
    pub fn set(&self, table: &str, key: i64, column: &str, value: SqlValue) -> bool {
        let mut state = self.lock();
        match state.tables.get_mut(table).and_then(|t| t.rows.get_mut(&key)) {
            Some(row) => {
                row.values.insert(column.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// All rows of `table` in key order.
    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, table: &str, identity: Uuid) -> Option<MemoryRow> {
        self.lock().tables.get(table).and_then(|t| {
            t.rows
                .values()
                .find(|r| r.identity == Some(identity))
                .cloned()
        })
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Open an import transaction.
    pub fn begin(&self) -> MemoryTarget {
        let snapshot = self.lock().clone();
        MemoryTarget {
            db: self.clone(),
            snapshot: Some(snapshot),
            staging: HashMap::new(),
        }
    }

    fn read_rows(&self, table: &TableDescriptor) -> Result<Vec<SourceRow>> {
        let state = self.lock();
        let Some(stored) = state.tables.get(&table.name) else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::with_capacity(stored.rows.len());
        for row in stored.rows.values() {
            let values = table
                .columns
                .iter()
                .map(|c| {
                    row.values
                        .get(&c.name)
                        .cloned()
                        .unwrap_or(SqlValue::Null(c.column_type))
                })
                .collect();

            let references = table
                .foreign_keys
                .iter()
                .map(|fk| match row.reference(&fk.column) {
                    Some(key) => {
                        let referenced = state
                            .tables
                            .get(&fk.references)
                            .and_then(|t| t.rows.get(&key));
                        SourceReference {
                            key: Some(key),
                            identity: referenced.and_then(|r| r.identity),
                            found: referenced.is_some(),
                        }
                    }
                    None => SourceReference::null(),
                })
                .collect();

            rows.push(SourceRow {
                key: row.key,
                identity: row.identity,
                values,
                references,
            });
        }
        Ok(rows)
    }
}

fn allocate_key(table: &mut MemoryTable, first: i64, step: i64) -> i64 {
    let key = table.next_key.unwrap_or(first);
    table.next_key = Some(key + step);
    key
}

#[async_trait]
impl SourceReader for MemoryDatabase {
    fn read_table(
        &self,
        table: &TableDescriptor,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<SourceBatch>> {
        let batches: Vec<Result<SourceBatch>> = match self.read_rows(table) {
            Ok(rows) => rows
                .chunks(batch_size.max(1))
                .map(|chunk| Ok(chunk.to_vec()))
                .collect(),
            Err(e) => vec![Err(e)],
        };

        // Everything is already in memory, so the channel holds it all.
        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            let _ = tx.try_send(batch);
        }
        rx
    }

    async fn row_count(&self, table: &TableDescriptor) -> Result<i64> {
        Ok(self.count(&table.name) as i64)
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// Import transaction on a [`MemoryDatabase`].
pub struct MemoryTarget {
    db: MemoryDatabase,
    snapshot: Option<State>,
    staging: HashMap<String, Vec<StagedRow>>,
}

impl MemoryTarget {
    fn staged(&self, table: &TableDescriptor) -> Result<&Vec<StagedRow>> {
        self.staging.get(&table.name).ok_or_else(|| {
            MigrateError::Config(format!("no staging table for {}", table.name))
        })
    }

    fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.db.lock() = snapshot;
        }
    }

    /// Write the staged columns of `staged` into `row`.
    fn assign(table: &TableDescriptor, staged: &StagedRow, row: &mut MemoryRow) {
        let names = table.staged_columns();
        for (name, value) in names.iter().skip(1).zip(&staged.values) {
            row.values.insert(name.to_string(), value.clone());
        }
    }

    /// Reject foreign keys that point at no row, like a database constraint.
    fn check_references(state: &State, table: &TableDescriptor, row: &MemoryRow) -> Result<()> {
        for fk in &table.foreign_keys {
            if let Some(key) = row.reference(&fk.column) {
                let exists = state
                    .tables
                    .get(&fk.references)
                    .is_some_and(|t| t.rows.contains_key(&key));
                if !exists {
                    return Err(MigrateError::invalid_record(
                        &table.name,
                        format!(
                            "foreign key violation: {} = {} has no row in {}",
                            fk.column, key, fk.references
                        ),
                    ));
                }
            } else if !fk.nullable && fk.references != table.name {
                return Err(MigrateError::invalid_record(
                    &table.name,
                    format!("NULL in required column {}", fk.column),
                ));
            }
        }
        Ok(())
    }

    fn apply(&mut self, table: &TableDescriptor, insert: bool) -> Result<Vec<IdentityKey>> {
        let staged = self.staged(table)?.clone();
        let (first, step) = (self.db.first_key, self.db.key_step);
        let mut state = self.db.lock();
        let mut stored = state.tables.remove(&table.name).unwrap_or_default();

        let mut by_identity: HashMap<Uuid, i64> = stored
            .rows
            .values()
            .filter_map(|r| r.identity.map(|id| (id, r.key)))
            .collect();

        let mut applied = Vec::new();
        let mut result = Ok(());
        for row in &staged {
            let existing = by_identity.get(&row.identity).copied();
            let updated = match (existing, insert) {
                (Some(key), false) => stored.rows.get_mut(&key),
                (None, true) => {
                    let key = allocate_key(&mut stored, first, step);
                    by_identity.insert(row.identity, key);
                    Some(stored.rows.entry(key).or_insert(MemoryRow {
                        key,
                        identity: Some(row.identity),
                        values: HashMap::new(),
                    }))
                }
                _ => None,
            };
            if let Some(target) = updated {
                Self::assign(table, row, target);
                applied.push((row.identity, target.key));
            }
        }

        state.tables.insert(table.name.clone(), stored);
        for (_, key) in &applied {
            if let Some(row) = state.tables.get(&table.name).and_then(|t| t.rows.get(key)) {
                if let Err(e) = Self::check_references(&state, table, row) {
                    result = Err(e);
                    break;
                }
            }
        }

        result.map(|()| applied)
    }
}

#[async_trait]
impl ImportTarget for MemoryTarget {
    async fn existing_identities(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>> {
        Ok(self
            .db
            .rows(&table.name)
            .into_iter()
            .filter_map(|r| r.identity.map(|id| (id, r.key)))
            .collect())
    }

    async fn create_staging(&mut self, table: &TableDescriptor) -> Result<()> {
        self.staging.insert(table.name.clone(), Vec::new());
        Ok(())
    }

    async fn stage_rows(&mut self, table: &TableDescriptor, rows: &[StagedRow]) -> Result<u64> {
        let expected = table.staged_columns().len() - 1;
        if let Some(bad) = rows.iter().find(|r| r.values.len() != expected) {
            return Err(MigrateError::invalid_record(
                &table.name,
                format!(
                    "staged row {} has {} values, expected {}",
                    bad.identity,
                    bad.values.len(),
                    expected
                ),
            ));
        }
        let staged = self.staging.get_mut(&table.name).ok_or_else(|| {
            MigrateError::Config(format!("no staging table for {}", table.name))
        })?;
        staged.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn unmatched_identities(&mut self, table: &TableDescriptor) -> Result<Vec<Uuid>> {
        let existing: HashSet<Uuid> = self
            .db
            .rows(&table.name)
            .into_iter()
            .filter_map(|r| r.identity)
            .collect();
        let mut unmatched: Vec<Uuid> = self
            .staged(table)?
            .iter()
            .map(|r| r.identity)
            .filter(|id| !existing.contains(id))
            .collect();
        unmatched.sort();
        Ok(unmatched)
    }

    async fn apply_updates(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>> {
        self.apply(table, false)
    }

    async fn apply_inserts(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>> {
        self.apply(table, true)
    }

    async fn update_self_reference(
        &mut self,
        table: &TableDescriptor,
        column: &str,
        updates: &[SelfReferenceUpdate],
    ) -> Result<u64> {
        let mut written = 0;
        for update in updates {
            if self.db.set(&table.name, update.key, column, update.reference.into()) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn drop_staging(&mut self, table: &TableDescriptor) -> Result<()> {
        self.staging.remove(&table.name);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        debug!("Memory transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.restore();
        debug!("Memory transaction rolled back");
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

impl Drop for MemoryTarget {
    fn drop(&mut self) {
        if self.snapshot.is_some() {
            warn!("Memory transaction dropped without commit; restoring snapshot");
            self.restore();
        }
    }
}
