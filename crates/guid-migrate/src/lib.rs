//! # guid-migrate
//!
//! Identity-stable export and import of a relational schema between
//! PostgreSQL databases whose surrogate keys disagree.
//!
//! Every migratable row carries a durable GUID. Export writes each table to
//! a portable JSON Lines file with foreign keys expressed as the referenced
//! row's GUID. Import reconciles those files into a destination in
//! dependency order: rows whose GUID exists are updated in place, the rest
//! are inserted, and every foreign key is rewritten to the destination's
//! surrogate key. The whole import is a single transaction.
//!
//! - **Registry** of table descriptors with a dependency-ordered import plan
//! - **Exporter** streaming rows through the record serializer
//! - **Importer** staging with `COPY`, set-based update/insert, self-reference pass
//! - **Drivers** for PostgreSQL and an in-memory database
//!
//! ## Example
//!
//! ```rust,no_run
//! use guid_migrate::{Config, LogProgress, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> guid_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config)?;
//!     orchestrator.export(&LogProgress).await?;
//!     let report = orchestrator.import(false, &LogProgress).await?;
//!     println!("{} inserted, {} updated", report.summary.inserted, report.summary.updated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod export;
pub mod import;
pub mod orchestrator;
pub mod portable;
pub mod registry;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, TransferConfig};
pub use core::{
    ColumnType, ImportTarget, NoProgress, ProgressSink, SourceReader, SqlValue, TableDescriptor,
    TableDomain,
};
pub use error::{MigrateError, Result};
pub use export::{ExportOptions, ExportSummary, Exporter};
pub use import::{ImportOptions, ImportSession, ImportSummary, Importer, SessionState};
pub use orchestrator::{run_import, HealthCheckResult, ImportReport, LogProgress, Orchestrator};
pub use portable::{Manifest, PortableRecord};
pub use registry::Registry;
