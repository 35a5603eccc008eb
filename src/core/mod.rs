//! Export pipeline.
//!
//! # Modules
//!
//! - [`value_formatter`] - coercion of raw answers into DHIS2 values
//! - [`mapping`] - mapping versions of a submission's form version
//! - [`handlers`] - payload building and submission per mapping type
//! - [`export`] - export request building and execution
//!
//! # Export Workflow
//!
//! 1. **Build**: select the eligible submissions and queue an export request
//!    with one status per (submission, mapping version)
//! 2. **Page**: walk the request's statuses in pages
//! 3. **Map**: turn each submission into the payload of its mapping type
//! 4. **Send**: submit the payloads to DHIS2, logging every exchange
//! 5. **Record**: flag statuses EXPORTED or ERRORED and update the request counters
//!
//! # Example
//!
//! ```rust,no_run
//! use iaso_export::adapters::database::Repositories;
//! use iaso_export::adapters::dhis2::HttpApiFactory;
//! use iaso_export::config::load_config;
//! use iaso_export::core::export::{DataValueExporter, ExportRequestBuilder};
//! use iaso_export::domain::{AccountId, InstanceFilters, Launcher, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("iaso-export.toml")?;
//! let repositories = Repositories::connect(&config).await?;
//!
//! let launcher = Launcher {
//!     user_id: UserId::new(1),
//!     account_id: AccountId::new(1),
//! };
//! let mut request = ExportRequestBuilder::new(&repositories)
//!     .build_export_request(InstanceFilters::default(), launcher, false, None)
//!     .await?;
//!
//! let exporter = DataValueExporter::new(
//!     &repositories,
//!     Arc::new(HttpApiFactory::new(config.dhis2.clone())),
//! );
//! let summary = exporter.export_instances(&mut request, 25, false).await?;
//! println!("Exported: {}", summary.exported);
//! # Ok(())
//! # }
//! ```

pub mod export;
pub mod handlers;
pub mod mapping;
pub mod value_formatter;
