//! Export request construction and execution
//!
//! - [`request_builder`] - selects eligible submissions and queues an export request
//! - [`exporter`] - runs a queued request page by page against DHIS2
//! - [`summary`] - outcome of one run

pub mod exporter;
pub mod request_builder;
pub mod summary;

pub use exporter::{DataValueExporter, DEFAULT_PAGE_SIZE};
pub use request_builder::{ExportRequestBuilder, ELIGIBLE_PAGE_SIZE};
pub use summary::{ExportError, ExportErrorType, ExportSummary};
