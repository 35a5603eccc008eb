//! CLI command implementations
//!
//! This module contains all CLI command implementations.

pub mod export;
pub mod init;
pub mod status;
pub mod validate;

use crate::cli::{EXIT_CONFIG, EXIT_CONNECTION, EXIT_FATAL, EXIT_INTERRUPTED};
use crate::domain::{Dhis2Error, IasoError};

/// Process exit code reported for an error
pub fn exit_code_for(error: &IasoError) -> i32 {
    match error {
        e if e.is_request_validation_error() => EXIT_CONFIG,
        IasoError::Configuration(_) | IasoError::Validation(_) => EXIT_CONFIG,
        IasoError::Database(_) | IasoError::Dhis2(Dhis2Error::Connection(_)) => EXIT_CONNECTION,
        IasoError::Cancelled => EXIT_INTERRUPTED,
        _ => EXIT_FATAL,
    }
}
