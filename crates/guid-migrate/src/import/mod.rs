//! Importer: a directory of portable files into a destination database.
//!
//! The whole import runs inside one [`ImportSession`]. Tables are reconciled
//! in dependency order; any failure rolls the session back before the error
//! is returned, so a destination never holds a partial import.
//!
//! ```text
//! let mut importer = Importer::begin(target, registry, options);
//! let summary = importer.import(&NoProgress).await?;
//! importer.commit().await?;
//! ```

mod identity;
mod reconcile;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::schema::TableDescriptor;
use crate::core::traits::{ImportTarget, ProgressSink, DEFAULT_BATCH_SIZE};
use crate::error::{MigrateError, Result};
use crate::portable::Manifest;
use crate::registry::Registry;

pub use identity::{IdentityMap, IdentityMaps};
pub use reconcile::TableImportStats;
pub use session::{ImportSession, SessionState};

use reconcile::TableReconciler;

/// What to import and from where.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Export directory holding the manifest and table files.
    pub directory: PathBuf,
    /// Import the LabDE tables.
    pub include_labde: bool,
    /// Additional tables to leave out.
    pub exclude_tables: Vec<String>,
    /// Records per staging batch.
    pub batch_size: usize,
}

impl ImportOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            include_labde: true,
            exclude_tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Result of an import run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportSummary {
    pub tables: Vec<TableImportStats>,
    /// Registry tables that were not imported, with the reason.
    pub skipped: Vec<SkippedTable>,
    pub inserted: u64,
    pub updated: u64,
    pub duration_seconds: f64,
}

impl ImportSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn table(&self, name: &str) -> Option<&TableImportStats> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// A registry table left out of an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
}

/// Drives per-table reconciliation inside one session.
pub struct Importer {
    session: ImportSession,
    registry: Arc<Registry>,
    options: ImportOptions,
    cancel: CancellationToken,
}

impl Importer {
    /// Open an import session on `target`.
    ///
    /// `target` must already hold an open transaction.
    pub fn begin(target: Box<dyn ImportTarget>, registry: Arc<Registry>, options: ImportOptions) -> Self {
        Self {
            session: ImportSession::new(target),
            registry,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between batches and tables when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Identity maps built so far.
    pub fn identity_maps(&self) -> &IdentityMaps {
        self.session.maps()
    }

    /// Reconcile every selected table.
    ///
    /// On failure the session is rolled back before the error is returned.
    /// On success nothing is durable until [`Importer::commit`].
    pub async fn import(&mut self, progress: &dyn ProgressSink) -> Result<ImportSummary> {
        match self.run(progress).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("Import failed, rolling back: {}", e);
                if self.session.is_open() {
                    if let Err(rollback_err) = self.session.rollback().await {
                        warn!("Rollback failed: {}", rollback_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Make the import durable.
    pub async fn commit(mut self) -> Result<()> {
        self.session.commit().await
    }

    /// Discard the import.
    pub async fn rollback(mut self) -> Result<()> {
        self.session.rollback().await
    }

    async fn run(&mut self, progress: &dyn ProgressSink) -> Result<ImportSummary> {
        let started = Instant::now();
        let directory = self.options.directory.clone();

        let manifest = Manifest::load(&directory)?;
        self.check_manifest(&manifest)?;
        manifest.verify(&directory)?;
        info!(
            "Importing {} records from {:?} (export run {})",
            manifest.total_records(),
            directory,
            manifest.run_id
        );

        let mut summary = ImportSummary::default();
        let registry = Arc::clone(&self.registry);
        let plan = self.plan(&registry, &manifest, &mut summary.skipped);
        let total = plan.len();

        for (i, table) in plan.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            progress.report(&format!("Importing {} ({}/{})", table.name, i + 1, total));

            let file = directory.join(table.file_name());
            let (target, maps) = self.session.parts()?;
            let reconciler = TableReconciler {
                table,
                registry: &registry,
                target,
                maps,
                batch_size: self.options.batch_size.max(1),
                cancel: &self.cancel,
            };
            let stats = reconciler
                .run(&file)
                .await
                .map_err(|e| e.in_table(&table.name))?;

            summary.inserted += stats.inserted;
            summary.updated += stats.updated;
            summary.tables.push(stats);
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        progress.report(&format!(
            "Import complete: {} inserted, {} updated in {} tables",
            summary.inserted,
            summary.updated,
            summary.tables.len()
        ));
        Ok(summary)
    }

    /// Reject manifests that do not match the registry.
    fn check_manifest(&self, manifest: &Manifest) -> Result<()> {
        for entry in &manifest.tables {
            let table = self.registry.get(&entry.table).ok_or_else(|| {
                MigrateError::Config(format!(
                    "Export contains unknown table '{}'",
                    entry.table
                ))
            })?;
            if entry.file != table.file_name() {
                return Err(MigrateError::Config(format!(
                    "Manifest lists file '{}' for table '{}', expected '{}'",
                    entry.file,
                    entry.table,
                    table.file_name()
                )));
            }
        }
        Ok(())
    }

    /// Tables to reconcile, in dependency order.
    fn plan<'r>(
        &self,
        registry: &'r Registry,
        manifest: &Manifest,
        skipped: &mut Vec<SkippedTable>,
    ) -> Vec<&'r TableDescriptor> {
        let mut plan = Vec::new();
        for table in registry.ordered(true) {
            let reason = if table.is_labde() && !self.options.include_labde {
                Some("LabDE tables disabled")
            } else if self.options.exclude_tables.contains(&table.name) {
                Some("excluded")
            } else if manifest.entry(&table.name).is_none() {
                Some("not in export")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!("Skipping {}: {}", table.name, reason);
                    skipped.push(SkippedTable {
                        table: table.name.clone(),
                        reason: reason.to_string(),
                    });
                }
                None => plan.push(table),
            }
        }
        plan
    }
}
