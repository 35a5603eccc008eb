//! DHIS2 payload handlers
//!
//! One module per mapping type:
//!
//! - [`aggregate`] - data value sets plus complete registrations, one call per page
//! - [`event`] - single-stage events, one call per page
//! - [`event_tracker`] - tracked entities with multi-stage enrollments and
//!   repeat-group relationships, exported one submission at a time
//!
//! Mapping functions collect per-question [`FieldError`]s instead of failing on
//! the first bad answer. Export functions go through an [`ApiLogger`] so that
//! every exchange ends up in the export ledger.

pub mod aggregate;
pub mod event;
pub mod event_tracker;

use crate::adapters::dhis2::{ApiLogger, ImportResult};
use crate::core::value_formatter::{format_value, OrgUnitResolver};
use crate::domain::{ChoiceOption, DataElement, Dhis2Error, FieldError, IasoError, Instance, Result};
use serde_json::{json, Value};

/// Message of the business error raised for a failed page
pub const PAGE_ERROR_MESSAGE: &str = "ERROR while processing page";

/// Message of the business error raised for a failed tracked entity submission
pub const SUBMISSION_ERROR_MESSAGE: &str = "ERROR while processing submission";

/// Turns a DHIS2 rejection into a business error
///
/// The [`ApiLogger`] has already recorded the exchange and decoded the error
/// body. Other errors are returned unchanged.
pub(crate) fn rejection_to_export_error(err: IasoError, message: &str) -> IasoError {
    match err {
        IasoError::Dhis2(Dhis2Error::Request { description, .. }) => {
            ImportResult::from_response(&description)
                .into_export_error(message)
                .into()
        }
        other => other,
    }
}

/// POSTs an import and checks the import summary
pub(crate) async fn submit_import(
    api: &mut ApiLogger,
    path: &str,
    body: &Value,
    message: &str,
) -> Result<ImportResult> {
    let response = api
        .post(path, body)
        .await
        .map_err(|e| rejection_to_export_error(e, message))?;
    check_import(&response, message)
}

pub(crate) fn check_import(response: &Value, message: &str) -> Result<ImportResult> {
    let result = ImportResult::from_response(response);
    if result.is_error() {
        return Err(result.into_export_error(message).into());
    }
    Ok(result)
}

/// DHIS2 reference of the submission's org unit
pub(crate) fn org_unit_ref(instance: &Instance) -> Option<&str> {
    instance.org_unit.as_ref().and_then(|ou| ou.dhis2_ref())
}

/// One boolean value per option of a multiple-choice question
///
/// The raw answer is a space-separated list of selected option codes.
pub(crate) fn multiple_choice_values(
    options: &[ChoiceOption],
    raw: &Value,
) -> Vec<(String, Value)> {
    let answer = match raw {
        Value::String(s) => s.clone(),
        Value::Null => return Vec::new(),
        other => other.to_string(),
    };
    let selected: Vec<&str> = answer.split_whitespace().collect();
    options
        .iter()
        .map(|option| {
            (
                option.element.id.clone(),
                Value::Bool(selected.contains(&option.code.as_str())),
            )
        })
        .collect()
}

/// Formats one answer, recording a failure against its question
pub(crate) fn format_answer(
    question: &str,
    element: &DataElement,
    raw: &Value,
    org_units: &dyn OrgUnitResolver,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    match format_value(element, raw, org_units) {
        Ok(value) => Some(value.unwrap_or(Value::Null)),
        Err(error) => {
            errors.push(FieldError::new(question, error));
            None
        }
    }
}

/// `{"dataElement": .., "value": ..}` entry
pub(crate) fn data_value(element_id: &str, value: Value) -> Value {
    json!({"dataElement": element_id, "value": value})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InstanceExportError;

    fn option(code: &str, element_id: &str) -> ChoiceOption {
        ChoiceOption {
            code: code.to_string(),
            element: serde_json::from_value(json!({"id": element_id, "valueType": "BOOLEAN"}))
                .unwrap(),
        }
    }

    #[test]
    fn test_multiple_choice_fans_out_booleans() {
        let options = vec![option("fever", "deFever"), option("cough", "deCough")];
        let values = multiple_choice_values(&options, &json!("cough rash"));
        assert_eq!(
            values,
            vec![
                ("deFever".to_string(), json!(false)),
                ("deCough".to_string(), json!(true)),
            ]
        );
        assert!(multiple_choice_values(&options, &Value::Null).is_empty());
    }

    #[test]
    fn test_rejection_becomes_business_error() {
        let err = IasoError::Dhis2(Dhis2Error::Request {
            code: 409,
            url: "https://dhis2.test/api/events".to_string(),
            description: json!({
                "status": "ERROR",
                "response": {"importSummaries": [{"status": "ERROR", "description": "Program is not assigned"}]}
            }),
        });
        let converted = rejection_to_export_error(err, PAGE_ERROR_MESSAGE);
        assert!(converted.is_business_error());
        assert_eq!(
            converted.to_string(),
            "ERROR while processing page: Program is not assigned"
        );
    }

    #[test]
    fn test_connection_errors_stay_fatal() {
        let err = IasoError::Dhis2(Dhis2Error::Connection("refused".to_string()));
        assert!(!rejection_to_export_error(err, PAGE_ERROR_MESSAGE).is_business_error());
    }

    #[test]
    fn test_check_import_detects_conflicts() {
        let err = check_import(
            &json!({"status": "WARNING", "conflicts": [{"object": "de", "value": "bad value"}]}),
            PAGE_ERROR_MESSAGE,
        )
        .unwrap_err();
        match err {
            IasoError::InstanceExport(InstanceExportError { descriptions, .. }) => {
                assert_eq!(descriptions, vec!["bad value".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
