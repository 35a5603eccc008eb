//! Repository factory
//!
//! Builds the three persistence seams from configuration, sharing one
//! underlying store.

use crate::adapters::database::traits::{ExportLedger, InstanceRepository, MappingRepository};
use crate::adapters::postgresql::client::PostgreSQLClient;
use crate::adapters::postgresql::store::PostgresStore;
use crate::config::schema::{DatabaseTarget, IasoConfig};
use crate::domain::{IasoError, Result};
use std::sync::Arc;

/// Handles on the persistence seams used by the pipeline
#[derive(Clone)]
pub struct Repositories {
    pub instances: Arc<dyn InstanceRepository>,
    pub mappings: Arc<dyn MappingRepository>,
    pub ledger: Arc<dyn ExportLedger>,
}

impl Repositories {
    /// Uses one store for all three seams
    ///
    /// # Example
    ///
    /// ```
    /// use iaso_export::adapters::database::Repositories;
    /// use iaso_export::adapters::memory::MemoryStore;
    /// use std::sync::Arc;
    ///
    /// let repositories = Repositories::from_store(Arc::new(MemoryStore::new()));
    /// ```
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: InstanceRepository + MappingRepository + ExportLedger + 'static,
    {
        Self {
            instances: store.clone(),
            mappings: store.clone(),
            ledger: store,
        }
    }

    /// Connects to the configured database
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration lacks the target's section or the
    /// connection pool cannot be created.
    pub async fn connect(config: &IasoConfig) -> Result<Self> {
        match config.database_target {
            DatabaseTarget::PostgreSQL => {
                let pg_config = config.postgresql.as_ref().ok_or_else(|| {
                    IasoError::Configuration(
                        "postgresql configuration is required when database_target = 'postgresql'"
                            .to_string(),
                    )
                })?;

                tracing::info!("Creating PostgreSQL store");
                let client = PostgreSQLClient::new(pg_config.clone()).await?;
                let store = PostgresStore::new(Arc::new(client));
                store.ensure_ledger_schema().await?;

                Ok(Self::from_store(Arc::new(store)))
            }
        }
    }
}
