//! PostgreSQL database integration
//!
//! This module reads submissions and mappings from the IASO PostgreSQL
//! schema and stores the export ledger next to them.

pub mod client;
pub mod models;
pub mod store;

pub use client::PostgreSQLClient;
pub use store::PostgresStore;
