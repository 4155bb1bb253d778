//! PostgreSQL driver.
//!
//! - [`PostgresReader`]: streams source tables with FK identities joined in
//! - [`PostgresTarget`]: staging, matching and apply inside one transaction
//! - [`connect`]: pool construction shared by both, with optional TLS

mod reader;
mod tls;
mod writer;

use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};

pub use reader::PostgresReader;
pub use tls::{SslMode, TlsBuilder};
pub use writer::PostgresTarget;

/// Connection timeout for new pool connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a connection pool and check that the server answers.
pub async fn connect(config: &DatabaseConfig, max_size: usize) -> Result<Pool> {
    let password = config.resolve_password()?;

    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&password);
    pg_config.application_name("guid-migrate");

    // Connection options for reliability
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(CONNECT_TIMEOUT);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = match TlsBuilder::new(config.ssl_mode).build()? {
        Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        None => {
            warn!(
                "TLS is disabled for {}. Credentials will be transmitted in plaintext.",
                config.describe()
            );
            Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
        }
    };

    let pool = Pool::builder(mgr)
        .max_size(max_size.max(1))
        .build()
        .map_err(|e| MigrateError::connection(e, format!("creating pool for {}", config.describe())))?;

    // Test connection
    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::connection(e, format!("connecting to {}", config.describe())))?;
    client.simple_query("SELECT 1").await?;

    info!("Connected to PostgreSQL: {}", config.describe());
    Ok(pool)
}
