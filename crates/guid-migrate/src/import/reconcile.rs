//! Per-table reconciliation.
//!
//! For one table: stage the portable records with their foreign keys
//! rewritten to destination keys, check the match against the destination,
//! apply updates then inserts, record the resulting identity map, and
//! finally write self-references once every row of the table exists.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::identity::{IdentityMap, IdentityMaps};
use crate::core::schema::TableDescriptor;
use crate::core::traits::{ImportTarget, SelfReferenceUpdate, StagedRow};
use crate::error::{MigrateError, Result};
use crate::portable::{PortableReader, PortableRecord};
use crate::registry::Registry;

/// Per-table import result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableImportStats {
    pub table: String,
    pub staged: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Rows whose self-referencing columns were written in the second pass.
    pub self_references: u64,
}

/// Self-reference identities of one staged record, one per self FK.
struct PendingSelfReferences {
    identity: Uuid,
    references: Vec<Option<Uuid>>,
}

/// Reconciles one table inside an open session.
pub(crate) struct TableReconciler<'a> {
    pub table: &'a TableDescriptor,
    pub registry: &'a Registry,
    pub target: &'a mut dyn ImportTarget,
    pub maps: &'a mut IdentityMaps,
    pub batch_size: usize,
    pub cancel: &'a CancellationToken,
}

impl<'a> TableReconciler<'a> {
    pub async fn run(mut self, file: &Path) -> Result<TableImportStats> {
        let table = self.table;
        let mut stats = TableImportStats {
            table: table.name.clone(),
            ..Default::default()
        };

        self.seed_referenced_maps().await?;

        // Stage, resolving external FKs on the way in.
        self.target.create_staging(table).await?;
        let pending = self.stage_file(file, &mut stats).await?;
        debug!("{}: staged {} records", table.name, stats.staged);

        // Match
        if !table.insertable {
            let unmatched = self.target.unmatched_identities(table).await?;
            if let Some(&identity) = unmatched.first() {
                return Err(MigrateError::NonInsertable {
                    table: table.name.clone(),
                    identity,
                });
            }
        }

        // Apply
        let updated = self.target.apply_updates(table).await?;
        let inserted = if table.insertable {
            self.target.apply_inserts(table).await?
        } else {
            Vec::new()
        };
        stats.updated = updated.len() as u64;
        stats.inserted = inserted.len() as u64;

        let map = self.maps.table_mut(&table.name);
        map.extend(updated);
        map.extend(inserted);

        // Self-referential pass, now that every row exists.
        if table.has_self_references() {
            stats.self_references = self.apply_self_references(&pending).await?;
        }

        self.target.drop_staging(table).await?;

        info!(
            "{}: {} inserted, {} updated",
            table.name, stats.inserted, stats.updated
        );
        Ok(stats)
    }

    /// Make sure every referenced table has an identity map.
    ///
    /// Tables reconciled earlier in the session already have one. A table
    /// that is not part of this import is read from the destination. A
    /// self-referencing table also starts from its destination rows, so a
    /// record may point at a row the file does not carry.
    async fn seed_referenced_maps(&mut self) -> Result<()> {
        let table = self.table;
        for fk in &table.foreign_keys {
            if self.maps.contains_table(&fk.references) {
                continue;
            }
            let referenced = self.registry.get(&fk.references).ok_or_else(|| {
                MigrateError::Config(format!(
                    "{}.{} references unregistered table '{}'",
                    table.name, fk.column, fk.references
                ))
            })?;

            let existing: IdentityMap = self
                .target
                .existing_identities(referenced)
                .await?
                .into_iter()
                .collect();
            debug!(
                "{}: loaded {} existing identities of {} from the destination",
                table.name,
                existing.len(),
                referenced.name
            );
            self.maps.insert_table(&referenced.name, existing);
        }
        Ok(())
    }

    async fn stage_file(
        &mut self,
        file: &Path,
        stats: &mut TableImportStats,
    ) -> Result<Vec<PendingSelfReferences>> {
        let table = self.table;
        let mut reader = PortableReader::open(file)?;
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut pending = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let batch = reader.next_batch(self.batch_size)?;
            if batch.is_empty() {
                break;
            }

            let mut rows = Vec::with_capacity(batch.len());
            for record in &batch {
                let row = self.stage_record(record, &mut seen, &mut pending)?;
                rows.push(row);
            }

            stats.staged += self.target.stage_rows(table, &rows).await?;
        }

        Ok(pending)
    }

    /// Convert one record into a staged row.
    fn stage_record(
        &self,
        record: &PortableRecord,
        seen: &mut HashSet<Uuid>,
        pending: &mut Vec<PendingSelfReferences>,
    ) -> Result<StagedRow> {
        let table = self.table;
        record.check_fields(table)?;

        let identity = record.identity(table)?;
        if !seen.insert(identity) {
            return Err(MigrateError::DuplicateIdentity {
                table: table.name.clone(),
                identity,
            });
        }

        let mut values = Vec::with_capacity(table.columns.len() + table.foreign_keys.len());
        for column in &table.columns {
            values.push(record.value(table, column)?);
        }

        for fk in table.external_references() {
            let key = match record.reference(table, fk)? {
                Some(reference) => Some(self.maps.resolve(table, fk, identity, reference)?),
                None => None,
            };
            values.push(key.into());
        }

        if table.has_self_references() {
            let references = table
                .self_references()
                .map(|fk| record.reference(table, fk))
                .collect::<Result<Vec<_>>>()?;
            pending.push(PendingSelfReferences {
                identity,
                references,
            });
        }

        Ok(StagedRow { identity, values })
    }

    async fn apply_self_references(&mut self, pending: &[PendingSelfReferences]) -> Result<u64> {
        let table = self.table;
        let mut written = 0;

        for (i, fk) in table.self_references().enumerate() {
            let mut updates = Vec::with_capacity(pending.len());
            for entry in pending {
                let key = self.maps.resolve(table, fk, entry.identity, entry.identity)?;
                let reference = match entry.references[i] {
                    Some(reference) => Some(self.maps.resolve(table, fk, entry.identity, reference)?),
                    None => None,
                };
                updates.push(SelfReferenceUpdate { key, reference });
            }

            for chunk in updates.chunks(self.batch_size.max(1)) {
                self.target.update_self_reference(table, &fk.column, chunk).await?;
            }
            written = written.max(updates.len() as u64);
            debug!("{}.{}: {} self-references written", table.name, fk.column, updates.len());
        }

        Ok(written)
    }
}
