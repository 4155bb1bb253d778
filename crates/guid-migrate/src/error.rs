//! Error types for the export/import engine.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Exit code for configuration errors (bad YAML, broken table registry).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code when a database connection cannot be opened.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for errors raised by the database itself.
pub const EXIT_DATABASE_ERROR: u8 = 3;
/// Exit code for reconciliation failures (the import was rolled back).
pub const EXIT_RECONCILE_ERROR: u8 = 4;
/// Exit code for unreadable or inconsistent portable files and export failures.
pub const EXIT_PORTABLE_ERROR: u8 = 5;
/// Exit code for a cancelled run.
pub const EXIT_CANCELLED: u8 = 6;
/// Exit code for filesystem errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for export and import operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, bad table registry, missing fields).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not open or test a database connection.
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Error returned by PostgreSQL.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A fixed-vocabulary table received a record with an unknown identity.
    #[error("Table {table} does not accept new rows, but record {identity} has no match in the destination")]
    NonInsertable { table: String, identity: Uuid },

    /// A foreign key identity could not be mapped to a destination key.
    #[error(
        "Record {identity} in {table}.{column} references {referenced_table} row {reference} which is not known to the destination"
    )]
    UnresolvedReference {
        table: String,
        column: String,
        identity: Uuid,
        referenced_table: String,
        reference: Uuid,
    },

    /// The same identity appears twice in one portable table file.
    #[error("Duplicate identity {identity} in portable data for table {table}")]
    DuplicateIdentity { table: String, identity: Uuid },

    /// A portable record does not fit the table's declared columns.
    #[error("Invalid record for table {table}: {message}")]
    InvalidRecord { table: String, message: String },

    /// A step failed while processing a specific table.
    #[error("Failed processing table {table}: {source}")]
    Table {
        table: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// Portable file is missing, malformed or fails its checksum.
    #[error("Portable file error ({}): {message}", .path.display())]
    PortableFile { path: PathBuf, message: String },

    /// Export of a table failed.
    #[error("Export failed for table {table}: {message}")]
    Export { table: String, message: String },

    /// The import session was already committed or rolled back.
    #[error("Import session is closed ({0})")]
    SessionClosed(&'static str),

    /// The run was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        MigrateError::connection(e, "getting PostgreSQL connection from pool")
    }
}

impl MigrateError {
    /// Create a Connection error with context about where it occurred.
    pub fn connection(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a PortableFile error.
    pub fn portable(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        MigrateError::PortableFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidRecord error.
    pub fn invalid_record(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::InvalidRecord {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Attach the table being processed. Errors already carrying a table are
    /// returned unchanged.
    pub fn in_table(self, table: impl Into<String>) -> Self {
        match self {
            e @ (MigrateError::Table { .. }
            | MigrateError::NonInsertable { .. }
            | MigrateError::UnresolvedReference { .. }
            | MigrateError::DuplicateIdentity { .. }
            | MigrateError::InvalidRecord { .. }
            | MigrateError::Export { .. }
            | MigrateError::Cancelled) => e,
            other => MigrateError::Table {
                table: table.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through `Table` wrappers.
    pub fn root(&self) -> &MigrateError {
        match self {
            MigrateError::Table { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Connection { .. } => EXIT_CONNECTION_ERROR,
            MigrateError::Database(_) => EXIT_DATABASE_ERROR,
            MigrateError::NonInsertable { .. }
            | MigrateError::UnresolvedReference { .. }
            | MigrateError::DuplicateIdentity { .. }
            | MigrateError::InvalidRecord { .. }
            | MigrateError::SessionClosed(_) => EXIT_RECONCILE_ERROR,
            MigrateError::PortableFile { .. } | MigrateError::Export { .. } | MigrateError::Json(_) => {
                EXIT_PORTABLE_ERROR
            }
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Table { .. } => EXIT_RECONCILE_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_table_wraps_once() {
        let err = MigrateError::Config("boom".into()).in_table("action");
        let err = err.in_table("workflow");
        match &err {
            MigrateError::Table { table, .. } => assert_eq!(table, "action"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.exit_code(), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_reconcile_errors_keep_their_shape() {
        let err = MigrateError::NonInsertable {
            table: "db_info".into(),
            identity: Uuid::nil(),
        }
        .in_table("db_info");
        assert!(matches!(err, MigrateError::NonInsertable { .. }));
        assert_eq!(err.exit_code(), EXIT_RECONCILE_ERROR);
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let err = MigrateError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"))
            .in_table("login");
        let text = err.format_detailed();
        assert!(text.contains("login"));
        assert!(text.contains("Caused by"));
        assert_eq!(err.exit_code(), EXIT_IO_ERROR);
    }
}
