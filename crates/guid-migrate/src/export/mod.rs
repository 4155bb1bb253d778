//! Exporter: source database to a directory of portable files.
//!
//! Tables are exported in dependency order, one `<table>.jsonl` file each.
//! The manifest is written only after every table succeeded. Export does not
//! modify the source and is not transactional: on failure the files already
//! written stay in place and the directory has no manifest, so the importer
//! rejects it. Re-running the export is the recovery path.

mod serializer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::schema::TableDescriptor;
use crate::core::traits::{ProgressSink, SourceReader, DEFAULT_BATCH_SIZE};
use crate::error::{MigrateError, Result};
use crate::portable::{FileSummary, Manifest, PortableWriter, MANIFEST_FILE};
use crate::registry::Registry;

pub use serializer::{legacy_identity, RecordSerializer};

/// What to export and where.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Output directory, created if absent.
    pub directory: PathBuf,
    /// Export the LabDE tables.
    pub include_labde: bool,
    /// Additional tables to leave out.
    pub exclude_tables: Vec<String>,
    /// Export fixed-vocabulary tables too. Off by default: their rows only
    /// import into a destination that already holds the same identities.
    pub include_fixed_vocabulary: bool,
    /// Rows per source batch.
    pub batch_size: usize,
}

impl ExportOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            include_labde: true,
            exclude_tables: Vec::new(),
            include_fixed_vocabulary: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Per-table export result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableExportStats {
    pub table: String,
    pub records: u64,
    /// Rows that had no identity and were given a derived one.
    pub legacy_rows: u64,
}

/// Result of an export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub run_id: Uuid,
    pub directory: PathBuf,
    pub tables: Vec<TableExportStats>,
    pub records: u64,
    pub duration_seconds: f64,
}

impl ExportSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Drives the [`RecordSerializer`] over every selected table.
pub struct Exporter {
    source: Arc<dyn SourceReader>,
    registry: Arc<Registry>,
    options: ExportOptions,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(source: Arc<dyn SourceReader>, registry: Arc<Registry>, options: ExportOptions) -> Self {
        Self {
            source,
            registry,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between batches when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Tables this export will write, in dependency order.
    pub fn selected_tables(&self) -> Vec<&TableDescriptor> {
        self.registry
            .ordered(self.options.include_labde)
            .iter()
            .filter(|t| t.insertable || self.options.include_fixed_vocabulary)
            .filter(|t| !self.options.exclude_tables.contains(&t.name))
            .collect()
    }

    /// Run the export.
    pub async fn export(&self, progress: &dyn ProgressSink) -> Result<ExportSummary> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let directory = &self.options.directory;

        std::fs::create_dir_all(directory)?;
        // A manifest from an earlier run would vouch for files we overwrite.
        let stale = directory.join(MANIFEST_FILE);
        if stale.exists() {
            std::fs::remove_file(&stale)?;
        }
        info!("Exporting to {:?} (run {})", directory, run_id);

        let mut manifest = Manifest::new(run_id, self.options.include_labde);
        let mut stats = Vec::new();
        let tables = self.selected_tables();
        let total = tables.len();

        for (i, table) in tables.into_iter().enumerate() {
            let rows = self
                .source
                .row_count(table)
                .await
                .map_err(|e| e.in_table(&table.name))?;
            progress.report(&format!(
                "Exporting {} ({}/{}, {} rows)",
                table.name,
                i + 1,
                total,
                rows
            ));

            let (summary, legacy_rows) = self
                .export_table(table, run_id)
                .await
                .map_err(|e| e.in_table(&table.name))?;

            if legacy_rows > 0 {
                warn!(
                    "{}: {} rows had no identity and were assigned one for this export",
                    table.name, legacy_rows
                );
            }
            info!("Exported {} records from {}", summary.records, table.name);

            manifest.add(&table.name, &summary);
            stats.push(TableExportStats {
                table: table.name.clone(),
                records: summary.records,
                legacy_rows,
            });
        }

        manifest.save(directory)?;
        progress.report(&format!(
            "Export complete: {} records in {} tables",
            manifest.total_records(),
            stats.len()
        ));

        Ok(ExportSummary {
            run_id,
            directory: directory.clone(),
            records: manifest.total_records(),
            tables: stats,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    async fn export_table(&self, table: &TableDescriptor, run_id: Uuid) -> Result<(FileSummary, u64)> {
        let path = self.options.directory.join(table.file_name());
        let mut writer = PortableWriter::create(&path)?;
        let mut serializer =
            RecordSerializer::new(table, self.source.as_ref(), run_id, self.options.batch_size);

        while let Some(batch) = serializer.next_batch().await? {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            for record in &batch {
                writer.write(record)?;
            }
            debug!("{}: {} records written", table.name, writer.records());
        }

        let legacy_rows = serializer.legacy_rows();
        Ok((writer.finish()?, legacy_rows))
    }
}
