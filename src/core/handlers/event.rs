//! Single-stage event export
//!
//! Each submission becomes one COMPLETED event of the mapped program. A page
//! is sent as one `events` import.

use super::{
    data_value, format_answer, multiple_choice_values, org_unit_ref, submit_import,
    PAGE_ERROR_MESSAGE,
};
use crate::adapters::dhis2::ApiLogger;
use crate::core::value_formatter::OrgUnitResolver;
use crate::domain::{
    FieldError, FormatError, Instance, MappingDefinition, QuestionMapping, Result,
};
use serde_json::{json, Map, Value};

/// Builds the event of one submission
///
/// A submission without a DHIS2 org unit reference still has its answers
/// mapped so that every problem is reported at once.
pub fn map_to_values(
    instance: &Instance,
    definition: &MappingDefinition,
    org_units: &dyn OrgUnitResolver,
) -> std::result::Result<Value, Vec<FieldError>> {
    let mut errors = Vec::new();

    let org_unit = org_unit_ref(instance).unwrap_or_default();
    if org_unit.is_empty() {
        let name = instance
            .org_unit
            .as_ref()
            .map(|ou| ou.name.clone())
            .unwrap_or_default();
        errors.push(FieldError::new(
            "orgUnit",
            FormatError::MissingOrgUnitReference(name),
        ));
    }

    let mut data_values = Vec::new();
    let empty = Map::new();
    for (question, raw) in instance.answers().unwrap_or(&empty) {
        for mapping in definition.mappings_for(question) {
            match mapping {
                QuestionMapping::SimpleDataElement(element) => {
                    if let Some(value) =
                        format_answer(question, element, raw, org_units, &mut errors)
                    {
                        data_values.push(data_value(&element.id, value));
                    }
                }
                QuestionMapping::MultipleChoice(options) => {
                    data_values.extend(
                        multiple_choice_values(options, raw)
                            .into_iter()
                            .map(|(element_id, value)| data_value(&element_id, value)),
                    );
                }
                _ => {}
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut event = json!({
        "program": definition.program_id,
        "orgUnit": org_unit,
        "eventDate": instance.created_date(),
        "status": "COMPLETED",
        "dataValues": data_values,
    });
    if let Some(export_id) = &instance.export_id {
        event["event"] = Value::String(export_id.clone());
    }
    if let Some(location) = &instance.location {
        event["coordinate"] = json!({
            "latitude": location.latitude,
            "longitude": location.longitude,
        });
    }
    Ok(event)
}

/// Sends a page of events in one import
///
/// Both the flat and the `response`-nested import summary shapes are
/// checked for failures.
pub async fn export_page(events: &[Value], api: &mut ApiLogger) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }

    let result = submit_import(
        api,
        "events",
        &json!({ "events": events }),
        PAGE_ERROR_MESSAGE,
    )
    .await?;

    tracing::debug!(
        events = events.len(),
        references = result.references.len(),
        "Events imported"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::dhis2::api::{ApiResponse, Dhis2Api, Dhis2Result};
    use crate::core::value_formatter::OrgUnitIndex;
    use crate::domain::{
        AccountId, Dhis2Error, FormId, IasoError, InstanceBuilder, InstanceId, Location,
        MappingType, OrgUnit, OrgUnitId,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn definition() -> MappingDefinition {
        MappingDefinition::parse(
            MappingType::Event,
            &json!({
                "program_id": "progVisit",
                "question_mappings": {
                    "weight": {"id": "deWeight", "valueType": "NUMBER"},
                    "symptoms": {
                        "type": "multiple",
                        "fever": {"id": "deFever", "valueType": "BOOLEAN"},
                        "cough": {"id": "deCough", "valueType": "BOOLEAN"}
                    }
                }
            }),
            &[],
        )
        .unwrap()
    }

    fn instance(source_ref: Option<&str>, answers: Value) -> Instance {
        InstanceBuilder::new()
            .id(InstanceId::new(5))
            .export_id("evUid000005")
            .account_id(AccountId::new(1))
            .form_id(FormId::new(1))
            .org_unit(OrgUnit::new(OrgUnitId::new(3), "Clinic", source_ref))
            .created_at(chrono::Utc.with_ymd_and_hms(2023, 3, 2, 8, 0, 0).unwrap())
            .location(Location {
                latitude: 50.5,
                longitude: 4.25,
                altitude: None,
            })
            .json(answers)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builds_event() {
        let event = map_to_values(
            &instance(Some("ouClinic"), json!({"weight": "12.5", "symptoms": "fever"})),
            &definition(),
            &OrgUnitIndex::default(),
        )
        .unwrap();

        assert_eq!(event["program"], "progVisit");
        assert_eq!(event["event"], "evUid000005");
        assert_eq!(event["orgUnit"], "ouClinic");
        assert_eq!(event["eventDate"], "2023-03-02");
        assert_eq!(event["status"], "COMPLETED");
        assert_eq!(event["coordinate"], json!({"latitude": 50.5, "longitude": 4.25}));

        let values = event["dataValues"].as_array().unwrap();
        assert_eq!(values.len(), 3);
        assert!(values.contains(&json!({"dataElement": "deFever", "value": true})));
        assert!(values.contains(&json!({"dataElement": "deCough", "value": false})));
        assert!(values.contains(&json!({"dataElement": "deWeight", "value": 12.5})));
    }

    #[test]
    fn test_blank_org_unit_reported_with_other_errors() {
        let errors = map_to_values(
            &instance(Some("  "), json!({"weight": "heavy"})),
            &definition(),
            &OrgUnitIndex::default(),
        )
        .unwrap_err();
        let questions: Vec<&str> = errors.iter().map(|e| e.question.as_str()).collect();
        assert_eq!(questions, vec!["orgUnit", "weight"]);
    }

    struct RejectingApi {
        bodies: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Dhis2Api for RejectingApi {
        fn base_url(&self) -> &str {
            "https://dhis2.test"
        }

        async fn get(&self, _path: &str, _query: &[(&str, &str)]) -> Dhis2Result<ApiResponse> {
            Err(Dhis2Error::Connection("unexpected".to_string()))
        }

        async fn post(&self, _path: &str, body: &Value) -> Dhis2Result<ApiResponse> {
            self.bodies.lock().unwrap().push(body.clone());
            Err(Dhis2Error::Request {
                code: 409,
                url: "https://dhis2.test/api/events".to_string(),
                description: Value::String(
                    json!({
                        "httpStatus": "Conflict",
                        "status": "ERROR",
                        "response": {
                            "status": "ERROR",
                            "importSummaries": [
                                {"status": "ERROR", "description": "Event.orgUnit does not point to a valid organisation unit"},
                                {"status": "ERROR", "description": "Event.orgUnit does not point to a valid organisation unit"}
                            ]
                        }
                    })
                    .to_string(),
                ),
            })
        }

        async fn put(&self, _path: &str, _body: &Value) -> Dhis2Result<ApiResponse> {
            Err(Dhis2Error::Connection("unexpected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_rejected_page_is_business_error_with_log() {
        let api = Arc::new(RejectingApi {
            bodies: Mutex::new(Vec::new()),
        });
        let mut logger = ApiLogger::new(api.clone());

        let err = export_page(&[json!({"program": "p"}), json!({"program": "p"})], &mut logger)
            .await
            .unwrap_err();

        assert!(matches!(err, IasoError::InstanceExport(_)));
        assert_eq!(
            err.to_string(),
            "ERROR while processing page: Event.orgUnit does not point to a valid organisation unit"
        );
        assert_eq!(api.bodies.lock().unwrap()[0]["events"].as_array().unwrap().len(), 2);

        let logs = logger.pop_export_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].http_status, 409);
    }
}
