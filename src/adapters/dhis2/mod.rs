//! DHIS2 Web API integration
//!
//! - [`api`] - the client seam ([`Dhis2Api`]) and its factory
//! - [`client`] - reqwest implementation with Basic auth and retries
//! - [`logger`] - [`ApiLogger`], recording every exchange as an export log
//! - [`models`] - [`ImportResult`], one shape for every server version's import response

pub mod api;
pub mod client;
pub mod logger;
pub mod models;

pub use api::{ApiResponse, Dhis2Api, Dhis2ApiFactory, Dhis2Result};
pub use client::{Dhis2Client, HttpApiFactory};
pub use logger::{ApiLogger, NON_JSON_DESCRIPTION};
pub use models::{Conflict, ImportResult};
