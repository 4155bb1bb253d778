//! Configuration validation.

use super::{Config, DatabaseConfig};
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};
use crate::registry::Registry;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("source", &config.source)?;
    validate_database("target", &config.target)?;

    // Exporting into the database being exported is never intended.
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    if config.transfer.batch_size == 0 {
        return Err(MigrateError::Config(
            "transfer.batch_size must be at least 1".into(),
        ));
    }

    let registry = Registry::standard()?;
    for table in &config.transfer.exclude_tables {
        if !registry.contains(table) {
            return Err(MigrateError::Config(format!(
                "transfer.exclude_tables: unknown table '{}'",
                table
            )));
        }
    }

    Ok(())
}

fn validate_database(section: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", section)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", section)));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", section)));
    }
    validate_identifier(&db.schema)
        .map_err(|e| MigrateError::Config(format!("{}.schema: {}", section, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::drivers::postgres::SslMode;

    fn database(name: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: name.to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            password_env: None,
            schema: "public".to_string(),
            ssl_mode: SslMode::Disable,
        }
    }

    fn valid_config() -> Config {
        Config {
            source: database("fam_source"),
            target: database("fam_target"),
            transfer: TransferConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_config();
        config.source.host = String::new();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.host"));
    }

    #[test]
    fn test_missing_target_user() {
        let mut config = valid_config();
        config.target.user = String::new();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("target.user"));
    }

    #[test]
    fn test_same_database() {
        let mut config = valid_config();
        config.target.database = config.source.database.clone();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("same database"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.transfer.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_excluded_table() {
        let mut config = valid_config();
        config.transfer.exclude_tables = vec!["dashboard".to_string()];
        assert!(validate(&config).is_ok());

        config.transfer.exclude_tables = vec!["no_such_table".to_string()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("no_such_table"));
    }

    #[test]
    fn test_invalid_schema() {
        let mut config = valid_config();
        config.target.schema = String::new();
        assert!(validate(&config).is_err());
    }
}
