//! Domain error types
//!
//! This module defines the error hierarchy for the export pipeline.
//! Errors are domain-specific and don't expose third-party types.

use super::export::{ExportState, ImportCount};
use super::ids::{FormId, InstanceId, MappingVersionId};
use serde_json::Value;
use thiserror::Error;

/// Main error type
///
/// This is the primary error type used throughout the crate. Request
/// construction errors (`NothingToExport`, `Mapping`, `NotSupported`) are
/// user-facing validation failures; `InstanceExport` is the per-page business
/// error; everything else is unexpected and always propagated.
#[derive(Debug, Error)]
pub enum IasoError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// DHIS2 transport errors
    #[error("DHIS2 error: {0}")]
    Dhis2(#[from] Dhis2Error),

    /// Mapping lookup errors
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// No submission matched the export filters
    #[error("Nothing to export")]
    NothingToExport,

    /// Operation refused for this mapping type
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// DHIS2 rejected a page, or a page could not be mapped
    #[error(transparent)]
    InstanceExport(#[from] InstanceExportError),

    /// A unique number was supplied but DHIS2 has no matching tracked entity
    #[error("Tracked entity should exist with {attribute} = {value} but was not found")]
    TrackedEntityNotFound { attribute: String, value: String },

    /// Attempt to move an export status backwards
    #[error("Invalid export status transition from {from} to {to}")]
    InvalidTransition { from: ExportState, to: ExportState },

    /// The run was stopped between pages
    #[error("Export cancelled")]
    Cancelled,
}

impl IasoError {
    /// Whether the error is a per-page business error that `continue_on_error` may tolerate
    pub fn is_business_error(&self) -> bool {
        matches!(self, IasoError::InstanceExport(_))
    }

    /// Whether the error is raised while building an export request from user input
    pub fn is_request_validation_error(&self) -> bool {
        matches!(
            self,
            IasoError::NothingToExport | IasoError::NotSupported(_) | IasoError::Mapping(_)
        )
    }
}

/// DHIS2 transport errors
///
/// These errors don't expose third-party HTTP client types.
#[derive(Debug, Error)]
pub enum Dhis2Error {
    /// Non-2xx response; `description` holds the decoded error body
    #[error("request to {url} failed with status {code}: {description}")]
    Request {
        code: u16,
        url: String,
        description: Value,
    },

    /// Failed to reach the server
    #[error("Failed to connect to DHIS2: {0}")]
    Connection(String),

    /// 2xx response that could not be interpreted
    #[error("Invalid response from DHIS2: {0}")]
    InvalidResponse(String),
}

/// Errors raised while resolving a submission to its mapping versions
#[derive(Debug, Clone, Error)]
pub enum MappingError {
    /// The submission carries neither `_version` nor `version`
    #[error("instance {instance_id} has no version tag")]
    MissingVersionTag { instance_id: InstanceId },

    /// No mapping version matches the form and tag
    #[error("no mapping for form {form_id} and version {version}")]
    NoMappingForVersion { form_id: FormId, version: String },

    /// The stored mapping JSON cannot be parsed
    #[error("invalid mapping version {mapping_version_id}: {reason}")]
    InvalidDefinition {
        mapping_version_id: MappingVersionId,
        reason: String,
    },
}

/// Errors raised by value formatting, one per question
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    #[error("unknown value '{value}' for option set of {data_element}")]
    UnknownOptionValue { value: String, data_element: String },

    #[error("invalid numeric value '{0}'")]
    InvalidNumericValue(String),

    #[error("invalid integer value '{0}'")]
    InvalidIntegerValue(String),

    #[error("invalid boolean value '{0}'")]
    InvalidBooleanValue(String),

    #[error("invalid coordinate value '{0}'")]
    InvalidCoordinateValue(String),

    #[error("unknown org unit id '{0}'")]
    UnknownOrgUnit(String),

    #[error("unsupported value type {value_type} for {data_element}")]
    UnsupportedValueType {
        value_type: String,
        data_element: String,
    },

    #[error("org unit '{0}' has no DHIS2 reference")]
    MissingOrgUnitReference(String),

    #[error("submission has no period")]
    MissingPeriod,
}

/// A formatting failure tagged with the question it came from
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub question: String,
    pub error: FormatError,
}

impl FieldError {
    pub fn new(question: impl Into<String>, error: FormatError) -> Self {
        Self {
            question: question.into(),
            error,
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.question, self.error)
    }
}

/// Business failure of one export page
///
/// Carries the import counts reported by DHIS2 (when any) and the
/// deduplicated human-readable descriptions.
#[derive(Debug, Clone, Error)]
#[error("{message}{}", join_descriptions(.descriptions))]
pub struct InstanceExportError {
    pub message: String,
    pub counts: Option<ImportCount>,
    pub descriptions: Vec<String>,
}

impl InstanceExportError {
    pub fn new(message: impl Into<String>, descriptions: Vec<String>) -> Self {
        Self {
            message: message.into(),
            counts: None,
            descriptions,
        }
    }

    pub fn with_counts(mut self, counts: Option<ImportCount>) -> Self {
        self.counts = counts;
        self
    }

    /// Builds the composite page error from per-submission mapping failures
    pub fn from_field_errors<'a>(
        message: impl Into<String>,
        errors: impl IntoIterator<Item = &'a FieldError>,
    ) -> Self {
        Self::new(message, errors.into_iter().map(|e| e.to_string()).collect())
    }
}

fn join_descriptions(descriptions: &[String]) -> String {
    if descriptions.is_empty() {
        String::new()
    } else {
        format!(": {}", descriptions.join("; "))
    }
}

impl From<std::io::Error> for IasoError {
    fn from(err: std::io::Error) -> Self {
        IasoError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IasoError {
    fn from(err: serde_json::Error) -> Self {
        IasoError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for IasoError {
    fn from(err: toml::de::Error) -> Self {
        IasoError::Configuration(format!("TOML parse error: {err}"))
    }
}

impl From<tokio_postgres::Error> for IasoError {
    fn from(err: tokio_postgres::Error) -> Self {
        IasoError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for IasoError {
    fn from(err: reqwest::Error) -> Self {
        IasoError::Dhis2(Dhis2Error::Connection(err.to_string()))
    }
}

impl From<deadpool_postgres::PoolError> for IasoError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        IasoError::Database(format!("Failed to get connection from pool: {err}"))
    }
}
