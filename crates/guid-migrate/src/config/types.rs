//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::traits::DEFAULT_BATCH_SIZE;
use crate::drivers::postgres::SslMode;
use crate::error::{MigrateError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database exported from.
    pub source: DatabaseConfig,

    /// Database imported into.
    pub target: DatabaseConfig,

    /// Export/import behavior.
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// PostgreSQL connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Environment variable holding the password. Takes precedence over
    /// `password` and is read at connect time.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Schema holding the migrated tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,
}

impl DatabaseConfig {
    /// The password to connect with.
    pub fn resolve_password(&self) -> Result<String> {
        match &self.password_env {
            Some(var) => std::env::var(var).map_err(|_| {
                MigrateError::Config(format!(
                    "password_env '{}' is not set for {}:{}/{}",
                    var, self.host, self.port, self.database
                ))
            }),
            None => Ok(self.password.clone()),
        }
    }

    /// `host:port/database`, for logs and errors.
    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("password_env", &self.password_env)
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Export/import behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Export directory (default: ./export).
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Include the LabDE tables (default: true).
    #[serde(default = "default_true")]
    pub include_labde: bool,

    /// Tables to leave out of export and import.
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Export fixed-vocabulary tables such as db_info (default: false).
    #[serde(default)]
    pub include_fixed_vocabulary: bool,

    /// Rows per batch when streaming and staging (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            include_labde: true,
            exclude_tables: Vec::new(),
            include_fixed_vocabulary: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from("./export")
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
