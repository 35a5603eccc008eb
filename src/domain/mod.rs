//! Domain models for the export pipeline.
//!
//! The domain layer holds the typed entities shared by every other layer:
//!
//! - **Identifiers** ([`InstanceId`], [`MappingVersionId`], ...) as numeric newtypes
//! - **Submissions** ([`Instance`], [`OrgUnit`]) and the filters selecting them
//! - **Mappings** ([`MappingVersion`], [`MappingDefinition`], [`QuestionMapping`])
//! - **Export ledger** ([`ExportRequest`], [`ExportStatus`], [`ExportLog`])
//! - **Errors** ([`IasoError`] and the narrower error types it wraps)
//!
//! # Example
//!
//! ```rust
//! use iaso_export::domain::{ExportState, MappingDefinition, MappingType, QuestionMapping};
//! use serde_json::json;
//!
//! let definition = MappingDefinition::parse(
//!     MappingType::Aggregate,
//!     &json!({
//!         "data_set_id": "ds1",
//!         "question_mappings": {"age": {"id": "deAge", "valueType": "INTEGER"}}
//!     }),
//!     &[],
//! )
//! .unwrap();
//! assert!(matches!(definition.mappings_for("age"), [QuestionMapping::SimpleDataElement(_)]));
//! assert!(ExportState::Queued.is_alive());
//! ```

pub mod errors;
pub mod export;
pub mod ids;
pub mod instance;
pub mod mapping;
pub mod query;
pub mod result;

pub use errors::{
    Dhis2Error, FieldError, FormatError, IasoError, InstanceExportError, MappingError,
};
pub use export::{
    ExportLog, ExportRequest, ExportState, ExportStatus, ExportUnit, ImportCount, Launcher,
    NewExportLog, NewExportRequest, NewExportStatus,
};
pub use ids::{
    AccountId, ExportLogId, ExportRequestId, ExportStatusId, FormId, InstanceId,
    MappingVersionId, OrgUnitId, UserId,
};
pub use instance::{Instance, InstanceBuilder, Location, OrgUnit};
pub use mapping::{
    repeat_group_names, ChoiceOption, DataElement, Dhis2Credentials, MappingDefinition,
    MappingType, MappingVersion, OptionEntry, OptionSet, QuestionMapping, SubformOverrides,
    ValueType,
};
pub use query::{EligibilityQuery, InstanceFilters, Selection};
pub use result::Result;
