//! External system integrations.
//!
//! - [`dhis2`] - DHIS2 Web API client, audit logger and response normalization
//! - [`database`] - persistence traits and the repository factory
//! - [`memory`] - in-process store implementing every persistence trait
//! - [`postgresql`] - store over the IASO PostgreSQL schema
//!
//! Adapters isolate external dependencies behind traits so the pipeline can
//! be exercised against mock servers and the in-memory store.

pub mod database;
pub mod dhis2;
pub mod memory;
pub mod postgresql;
