//! Logging and observability
//!
//! Structured logging through `tracing`:
//! - Console output for operators
//! - Rolling JSON file (`iaso-export.log`), daily or hourly
//! - Structured fields (`export_request_id`, `page`, `instance_id`, ...)
//!
//! # Example
//!
//! ```no_run
//! use iaso_export::logging::init_logging;
//! use iaso_export::config::LoggingConfig;
//!
//! let config = LoggingConfig::default();
//! let _guard = init_logging("info", &config).expect("Failed to initialize logging");
//!
//! tracing::info!(export_request_id = 12, "Export started");
//! ```

pub mod structured;

pub use structured::{init_logging, LoggingGuard, LOG_FILE_NAME};

/// Log the start of an export page
///
/// # Example
///
/// ```no_run
/// use iaso_export::log_page_start;
/// use iaso_export::domain::ExportRequestId;
///
/// log_page_start!(ExportRequestId::new(3), 1, 25);
/// ```
#[macro_export]
macro_rules! log_page_start {
    ($request_id:expr, $page:expr, $units:expr) => {
        tracing::info!(
            export_request_id = %$request_id,
            page = $page,
            units = $units,
            "Processing export page"
        );
    };
}

/// Log a failed export page
///
/// # Example
///
/// ```no_run
/// use iaso_export::log_page_failure;
/// use iaso_export::domain::{ExportRequestId, IasoError};
///
/// let error = IasoError::Validation("bad page".to_string());
/// log_page_failure!(ExportRequestId::new(3), 2, &error);
/// ```
#[macro_export]
macro_rules! log_page_failure {
    ($request_id:expr, $page:expr, $error:expr) => {
        tracing::error!(
            export_request_id = %$request_id,
            page = $page,
            error = %$error,
            "Export page failed"
        );
    };
}

/// Log a retry attempt
///
/// # Example
///
/// ```no_run
/// use iaso_export::log_retry_attempt;
///
/// log_retry_attempt!(2, 3, "503 Service Unavailable");
/// ```
#[macro_export]
macro_rules! log_retry_attempt {
    ($attempt:expr, $max_attempts:expr, $reason:expr) => {
        tracing::warn!(
            attempt = $attempt,
            max_attempts = $max_attempts,
            reason = %$reason,
            "Retrying DHIS2 request"
        );
    };
}
