//! Export summary and reporting
//!
//! This module defines structures for tracking and reporting the outcome of
//! one export request run.

use crate::domain::{Dhis2Error, ExportRequestId, IasoError};
use std::time::Duration;

/// Summary of an export run
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub export_request_id: ExportRequestId,

    /// Pages processed, including failed ones
    pub pages: usize,

    /// Export statuses of the request
    pub total_units: usize,

    pub exported: usize,

    pub errored: usize,

    /// Units left QUEUED: no answers, no mapping version, or a DERIVED mapping
    pub skipped: usize,

    pub duration: Duration,

    /// Errors tolerated during the run
    pub errors: Vec<ExportError>,
}

impl ExportSummary {
    pub fn new(export_request_id: ExportRequestId) -> Self {
        Self {
            export_request_id,
            pages: 0,
            total_units: 0,
            exported: 0,
            errored: 0,
            skipped: 0,
            duration: Duration::from_secs(0),
            errors: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn add_error(&mut self, error: ExportError) {
        self.errors.push(error);
    }

    /// Check if the export was successful (no errored unit)
    pub fn is_successful(&self) -> bool {
        self.errored == 0
    }

    /// Share of attempted units that were exported, as a percentage
    pub fn success_rate(&self) -> f64 {
        let attempted = self.exported + self.errored;
        if attempted == 0 {
            return 100.0;
        }
        (self.exported as f64 / attempted as f64) * 100.0
    }

    pub fn log_summary(&self) {
        tracing::info!(
            export_request_id = %self.export_request_id,
            pages = self.pages,
            total_units = self.total_units,
            exported = self.exported,
            errored = self.errored,
            skipped = self.skipped,
            duration_secs = self.duration.as_secs(),
            success_rate = format!("{:.2}%", self.success_rate()),
            "Export completed"
        );

        if !self.errors.is_empty() {
            tracing::warn!(
                export_request_id = %self.export_request_id,
                error_count = self.errors.len(),
                "Export completed with errors"
            );
            for error in &self.errors {
                tracing::warn!(
                    error_type = ?error.error_type,
                    message = %error.message,
                    context = error.context.as_deref().unwrap_or(""),
                    "Export error"
                );
            }
        }
    }
}

/// Type of export error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportErrorType {
    /// Answers could not be mapped to DHIS2 values
    Mapping,
    /// DHIS2 rejected or ignored part of an import
    Import,
    /// DHIS2 could not be reached
    Connection,
    /// Tracked entity lookup failed
    TrackedEntity,
    Unknown,
}

impl ExportErrorType {
    pub fn of(error: &IasoError) -> Self {
        match error {
            IasoError::InstanceExport(_) => ExportErrorType::Import,
            IasoError::Dhis2(Dhis2Error::Connection(_)) => ExportErrorType::Connection,
            IasoError::Dhis2(_) => ExportErrorType::Import,
            IasoError::TrackedEntityNotFound { .. } => ExportErrorType::TrackedEntity,
            _ => ExportErrorType::Unknown,
        }
    }
}

/// Export error with context
#[derive(Debug, Clone)]
pub struct ExportError {
    pub error_type: ExportErrorType,
    pub message: String,

    /// Page number or submission id
    pub context: Option<String>,
}

impl ExportError {
    pub fn new(error_type: ExportErrorType, message: String) -> Self {
        Self {
            error_type,
            message,
            context: None,
        }
    }

    pub fn from_error(error: &IasoError) -> Self {
        Self::new(ExportErrorType::of(error), error.to_string())
    }

    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }
}
