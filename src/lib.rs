// IASO Export - DHIS2 data value export
// Copyright (c) 2025 IASO Contributors
// Licensed under the MIT License

//! # iaso-export - DHIS2 data value export
//!
//! Exports IASO form submissions to DHIS2 servers as aggregate data value
//! sets, single events, or tracked entities with multi-stage enrollments,
//! and keeps an audit ledger of every export.
//!
//! ## Overview
//!
//! This library provides the core functionality for:
//! - **Selecting** the submissions eligible for export and queueing an export request
//! - **Mapping** answers to DHIS2 values through versioned form mappings
//! - **Sending** payloads to the DHIS2 Web API, page by page
//! - **Recording** every status transition and HTTP exchange in the export ledger
//!
//! ## Architecture
//!
//! iaso-export follows a layered architecture:
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`core`] - Pipeline logic (value formatting, mapping, handlers, export)
//! - [`adapters`] - External integrations (DHIS2, PostgreSQL, in-memory store)
//! - [`domain`] - Core domain types and errors
//! - [`config`] - Configuration management
//! - [`logging`] - Structured logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iaso_export::adapters::database::Repositories;
//! use iaso_export::adapters::dhis2::HttpApiFactory;
//! use iaso_export::config::load_config;
//! use iaso_export::core::export::{DataValueExporter, ExportRequestBuilder};
//! use iaso_export::domain::{AccountId, InstanceFilters, Launcher, UserId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config("iaso-export.toml")?;
//!     let repositories = Repositories::connect(&config).await?;
//!
//!     let launcher = Launcher {
//!         user_id: UserId::new(1),
//!         account_id: AccountId::new(1),
//!     };
//!     let mut request = ExportRequestBuilder::new(&repositories)
//!         .build_export_request(InstanceFilters::default(), launcher, false, None)
//!         .await?;
//!
//!     let exporter = DataValueExporter::new(
//!         &repositories,
//!         Arc::new(HttpApiFactory::new(config.dhis2.clone())),
//!     );
//!     let summary = exporter
//!         .export_instances(&mut request, config.export.page_size, false)
//!         .await?;
//!
//!     println!("Exported {} units", summary.exported);
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! All library errors are [`domain::IasoError`]. Mapping and import failures
//! of a page surface as [`domain::InstanceExportError`], which
//! `continue_on_error` may tolerate; transport and storage failures always
//! stop the export.
//!
//! ## Logging
//!
//! iaso-export uses structured logging with the `tracing` crate:
//!
//! ```rust,no_run
//! use tracing::{info, warn};
//!
//! info!(export_request_id = 12, "Export started");
//! warn!(instance_id = 7, "Skipping export unit");
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod logging;
