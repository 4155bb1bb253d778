//! Orchestrator - wires configuration, connections and the engine together.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, DatabaseConfig};
use crate::core::traits::{ImportTarget, ProgressSink, SourceReader};
use crate::drivers::postgres::{self, PostgresReader, PostgresTarget};
use crate::error::Result;
use crate::export::{ExportOptions, ExportSummary, Exporter};
use crate::import::{ImportOptions, ImportSummary, Importer};
use crate::registry::Registry;

/// Source connections used by an export.
const EXPORT_POOL_SIZE: usize = 2;

/// An import holds exactly one connection.
const IMPORT_POOL_SIZE: usize = 1;

/// Progress sink that logs every message at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, message: &str) {
        info!("{}", message);
    }
}

/// Result of an import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    #[serde(flatten)]
    pub summary: ImportSummary,
    /// Changes were rolled back instead of committed.
    pub dry_run: bool,
    pub committed: bool,
}

impl ImportReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Import into an already opened target, then commit, or roll back when
/// `dry_run` is set.
pub async fn run_import(
    target: Box<dyn ImportTarget>,
    registry: Arc<Registry>,
    options: ImportOptions,
    cancel: CancellationToken,
    dry_run: bool,
    progress: &dyn ProgressSink,
) -> Result<ImportReport> {
    let mut importer = Importer::begin(target, registry, options).with_cancellation(cancel);
    let summary = importer.import(progress).await?;

    if dry_run {
        importer.rollback().await?;
        info!(
            "Dry run: {} inserts and {} updates rolled back",
            summary.inserted, summary.updated
        );
    } else {
        importer.commit().await?;
    }

    Ok(ImportReport {
        summary,
        dry_run,
        committed: !dry_run,
    })
}

/// Result of a connection health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// Runs export, import and health checks from a [`Config`].
pub struct Orchestrator {
    config: Config,
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            registry: Arc::new(Registry::standard()?),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop at the next batch boundary when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn export_options(&self) -> ExportOptions {
        let transfer = &self.config.transfer;
        ExportOptions {
            directory: transfer.directory.clone(),
            include_labde: transfer.include_labde,
            exclude_tables: transfer.exclude_tables.clone(),
            include_fixed_vocabulary: transfer.include_fixed_vocabulary,
            batch_size: transfer.batch_size,
        }
    }

    pub fn import_options(&self) -> ImportOptions {
        let transfer = &self.config.transfer;
        ImportOptions {
            directory: transfer.directory.clone(),
            include_labde: transfer.include_labde,
            exclude_tables: transfer.exclude_tables.clone(),
            batch_size: transfer.batch_size,
        }
    }

    /// Export the source database.
    pub async fn export(&self, progress: &dyn ProgressSink) -> Result<ExportSummary> {
        let source = &self.config.source;
        let pool = postgres::connect(source, EXPORT_POOL_SIZE).await?;
        let reader = Arc::new(PostgresReader::new(pool, source.schema.clone()));

        let exporter = Exporter::new(reader.clone(), self.registry.clone(), self.export_options())
            .with_cancellation(self.cancel.clone());
        let result = exporter.export(progress).await;

        reader.close().await;
        result
    }

    /// Import into the target database.
    pub async fn import(&self, dry_run: bool, progress: &dyn ProgressSink) -> Result<ImportReport> {
        let target = &self.config.target;
        let pool = postgres::connect(target, IMPORT_POOL_SIZE).await?;
        let session = PostgresTarget::begin(&pool, target.schema.clone()).await?;

        let result = run_import(
            Box::new(session),
            self.registry.clone(),
            self.import_options(),
            self.cancel.clone(),
            dry_run,
            progress,
        )
        .await;

        pool.close();
        result
    }

    /// Check that both databases accept connections.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let (source_connected, source_latency_ms, source_error) =
            check_connection(&self.config.source).await;
        let (target_connected, target_latency_ms, target_error) =
            check_connection(&self.config.target).await;

        Ok(HealthCheckResult {
            source_connected,
            source_latency_ms,
            source_error,
            target_connected,
            target_latency_ms,
            target_error,
            healthy: source_connected && target_connected,
        })
    }
}

async fn check_connection(config: &DatabaseConfig) -> (bool, u64, Option<String>) {
    let started = Instant::now();
    match postgres::connect(config, 1).await {
        Ok(pool) => {
            pool.close();
            (true, started.elapsed().as_millis() as u64, None)
        }
        Err(e) => {
            warn!("Health check failed for {}: {}", config.describe(), e);
            (false, started.elapsed().as_millis() as u64, Some(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::SqlValue;
    use crate::core::traits::NoProgress;
    use crate::drivers::memory::MemoryDatabase;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_dry_run_rolls_back() {
        let registry = Arc::new(Registry::standard().unwrap());
        let dir = tempfile::tempdir().unwrap();

        let source = MemoryDatabase::new();
        source.insert("tag", Some(Uuid::new_v4()), [("name", SqlValue::Text("Urgent".into()))]);
        let exporter = Exporter::new(
            Arc::new(source),
            registry.clone(),
            ExportOptions::new(dir.path()),
        );
        exporter.export(&NoProgress).await.unwrap();

        let dest = MemoryDatabase::with_keys(500, 1);
        let report = run_import(
            Box::new(dest.begin()),
            registry,
            ImportOptions::new(dir.path()),
            CancellationToken::new(),
            true,
            &NoProgress,
        )
        .await
        .unwrap();

        assert!(report.dry_run);
        assert!(!report.committed);
        assert_eq!(report.summary.table("tag").unwrap().inserted, 1);
        assert_eq!(dest.count("tag"), 0);
    }

    #[test]
    fn test_import_report_json_is_flat() {
        let report = ImportReport {
            summary: ImportSummary::default(),
            dry_run: false,
            committed: true,
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["committed"], true);
        assert!(json["tables"].is_array());
    }
}
