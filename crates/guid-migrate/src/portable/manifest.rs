//! Export manifest.
//!
//! The manifest is the last file an export writes. Its presence marks the
//! directory as complete; the importer refuses directories without one and
//! verifies every listed checksum before it touches any table.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::file::{verify_checksum, FileSummary};
use crate::error::{MigrateError, Result};

/// File name of the manifest inside an export directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Version of the portable format written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Description of a complete export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,

    /// Export run identifier. Also the namespace for identities assigned to
    /// legacy rows during this export.
    pub run_id: Uuid,

    pub exported_at: DateTime<Utc>,

    /// Whether the LabDE tables were exported.
    pub include_labde: bool,

    /// Exported tables in dependency order.
    pub tables: Vec<ManifestEntry>,
}

/// One exported table file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub table: String,
    pub file: String,
    pub records: u64,
    pub sha256: String,
}

impl Manifest {
    pub fn new(run_id: Uuid, include_labde: bool) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            run_id,
            exported_at: Utc::now(),
            include_labde,
            tables: Vec::new(),
        }
    }

    /// Record a finished table file.
    pub fn add(&mut self, table: &str, summary: &FileSummary) {
        let file = summary
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.tables.push(ManifestEntry {
            table: table.to_string(),
            file,
            records: summary.records,
            sha256: summary.sha256.clone(),
        });
    }

    pub fn entry(&self, table: &str) -> Option<&ManifestEntry> {
        self.tables.iter().find(|e| e.table == table)
    }

    pub fn total_records(&self) -> u64 {
        self.tables.iter().map(|e| e.records).sum()
    }

    /// Load the manifest of an export directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(MigrateError::portable(
                &path,
                "manifest not found; the export directory is missing or incomplete",
            ));
        }

        let content = std::fs::read_to_string(&path)?;
        let manifest: Self = serde_json::from_str(&content)
            .map_err(|e| MigrateError::portable(&path, e.to_string()))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(MigrateError::portable(
                &path,
                format!(
                    "unsupported format version {} (expected {})",
                    manifest.format_version, FORMAT_VERSION
                ),
            ));
        }

        Ok(manifest)
    }

    /// Save the manifest (atomic write).
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Verify every listed file against its checksum.
    pub fn verify(&self, dir: &Path) -> Result<()> {
        for entry in &self.tables {
            verify_checksum(&dir.join(&entry.file), &entry.sha256)?;
        }
        Ok(())
    }
}
