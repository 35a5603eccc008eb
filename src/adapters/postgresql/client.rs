//! PostgreSQL connection pool

use crate::config::schema::PostgreSQLConfig;
use crate::domain::{IasoError, Result};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{NoTls, Socket};

/// Pooled PostgreSQL client for the IASO database
pub struct PostgreSQLClient {
    pool: Pool,
    config: PostgreSQLConfig,
}

impl PostgreSQLClient {
    /// Create a new PostgreSQL client
    ///
    /// `ssl_mode` = `require`, `verify-ca` or `verify-full` connects through
    /// native-tls; other modes connect in plain text.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid or the pool
    /// cannot be built.
    pub async fn new(config: PostgreSQLConfig) -> Result<Self> {
        let mut pg_config: tokio_postgres::Config = config
            .connection_string
            .expose_secret()
            .as_ref()
            .parse()
            .map_err(|e| {
                IasoError::Configuration(format!("Invalid PostgreSQL connection string: {e}"))
            })?;

        let pool = match config.ssl_mode.as_str() {
            "require" | "verify-ca" | "verify-full" => {
                pg_config.ssl_mode(SslMode::Require);
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(config.ssl_mode == "require")
                    .danger_accept_invalid_hostnames(config.ssl_mode != "verify-full")
                    .build()
                    .map_err(|e| {
                        IasoError::Configuration(format!("Failed to build TLS connector: {e}"))
                    })?;
                build_pool(pg_config, MakeTlsConnector::new(connector), &config)?
            }
            "disable" => {
                pg_config.ssl_mode(SslMode::Disable);
                build_pool(pg_config, NoTls, &config)?
            }
            _ => build_pool(pg_config, NoTls, &config)?,
        };

        Ok(Self { pool, config })
    }

    /// Runs `SELECT 1` on a pooled connection
    pub async fn test_connection(&self) -> Result<()> {
        let client = self.get_connection().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| IasoError::Database(format!("Connection test failed: {e}")))?;

        tracing::info!(database = %self.connection_string_safe(), "PostgreSQL connection test successful");
        Ok(())
    }

    /// Get a connection from the pool with the configured statement timeout applied
    pub async fn get_connection(&self) -> Result<Object> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "SET statement_timeout = {}",
                self.config.statement_timeout_seconds * 1000
            ))
            .await
            .map_err(|e| IasoError::Database(format!("Failed to set statement timeout: {e}")))?;
        Ok(client)
    }

    /// Connection string with credentials removed, for logs
    pub fn connection_string_safe(&self) -> String {
        redact_connection_string(self.config.connection_string.expose_secret().as_ref())
    }

    pub fn pool_status(&self) -> deadpool_postgres::Status {
        self.pool.status()
    }
}

fn build_pool<T>(pg_config: tokio_postgres::Config, tls: T, config: &PostgreSQLConfig) -> Result<Pool>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let manager = Manager::from_config(
        pg_config,
        tls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );

    let timeout = Some(Duration::from_secs(config.connection_timeout_seconds));
    Pool::builder(manager)
        .max_size(config.max_connections)
        .wait_timeout(timeout)
        .create_timeout(timeout)
        .recycle_timeout(timeout)
        .runtime(deadpool_postgres::Runtime::Tokio1)
        .build()
        .map_err(|e| IasoError::Database(format!("Failed to create connection pool: {e}")))
}

fn redact_connection_string(raw: &str) -> String {
    raw.rsplit_once('@')
        .map(|(_, host)| format!("postgresql://***@{host}"))
        .unwrap_or_else(|| "postgresql://***".to_string())
}
