//! Tracked entity export with multi-stage enrollments
//!
//! A submission becomes a tracked entity enrolled in the mapped program, with
//! one event per program stage that received answers. When the mapping names
//! a unique-number attribute, an existing entity carrying the same number is
//! updated instead of creating a new one. Answer sets of repeat groups become
//! child tracked entities linked to the parent through relationships.
//!
//! Submissions are exported one at a time; the caller isolates failures per
//! submission.

use super::{
    check_import, format_answer, org_unit_ref, rejection_to_export_error, submit_import,
    SUBMISSION_ERROR_MESSAGE,
};
use crate::adapters::dhis2::ApiLogger;
use crate::core::value_formatter::OrgUnitResolver;
use crate::domain::{
    Dhis2Error, FieldError, FormatError, IasoError, Instance, InstanceExportError,
    MappingDefinition, QuestionMapping, Result,
};
use serde_json::{json, Map, Value};

const DEFAULT_EVENT_STATUS: &str = "COMPLETED";

/// Builds the tracked entity of one submission
///
/// The status of a stage event defaults to COMPLETED and can be overridden
/// by a `status_<stage>` answer. Stages without any value are left out.
pub fn map_to_values(
    instance: &Instance,
    definition: &MappingDefinition,
    org_units: &dyn OrgUnitResolver,
) -> std::result::Result<Value, Vec<FieldError>> {
    let mut errors = Vec::new();

    let org_unit = org_unit_ref(instance).unwrap_or_default().to_string();
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

    let empty = Map::new();
    let answers = instance.answers().unwrap_or(&empty);
    let event_date = instance.created_date();

    let mut attributes = Vec::new();
    for (question, raw) in answers {
        for mapping in definition.mappings_for(question) {
            if let QuestionMapping::TrackedAttribute(element) = mapping {
                match format_answer(question, element, raw, org_units, &mut errors) {
                    Some(Value::Null) | None => {}
                    Some(value) => {
                        attributes.push(json!({"attribute": element.id, "value": value}))
                    }
                }
            }
        }
    }

    let mut events = Vec::new();
    for stage in definition.program_stages() {
        let mut data_values = Vec::new();
        for (question, raw) in answers {
            for mapping in definition.mappings_for(question) {
                let QuestionMapping::StageDataValue {
                    stage: mapped_stage,
                    element,
                } = mapping
                else {
                    continue;
                };
                if *mapped_stage != stage {
                    continue;
                }
                match format_answer(question, element, raw, org_units, &mut errors) {
                    Some(Value::Null) | None => {}
                    Some(value) => {
                        data_values.push(json!({"dataElement": element.id, "value": value}))
                    }
                }
            }
        }

        if data_values.is_empty() {
            tracing::warn!(
                instance_id = %instance.id,
                program_stage = %stage,
                "Program stage has no data values, skipping its event"
            );
            continue;
        }

        let status = answers
            .get(&format!("status_{stage}"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
            .unwrap_or_else(|| DEFAULT_EVENT_STATUS.to_string());

        events.push(json!({
            "program": definition.program_id,
            "programStage": stage,
            "orgUnit": org_unit,
            "eventDate": event_date,
            "status": status,
            "dataValues": data_values,
        }));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(json!({
        "trackedEntityType": definition.tracked_entity_type,
        "orgUnit": org_unit,
        "attributes": attributes,
        "enrollments": [{
            "program": definition.program_id,
            "orgUnit": org_unit,
            "enrollmentDate": event_date,
            "incidentDate": event_date,
            "events": events,
        }],
    }))
}

/// Creates or updates the tracked entity, returning its DHIS2 uid
///
/// - Unique number present: the entity carrying it under the submission's
///   country is updated with the new events. Its absence is an error.
/// - Unique number missing: one is generated for the org unit's code and a
///   new entity is created.
/// - No unique-number attribute configured: a new entity is created.
pub async fn export_record(
    api: &mut ApiLogger,
    instance: &Instance,
    definition: &MappingDefinition,
    mut entity: Value,
) -> Result<String> {
    let Some(identifier) = definition.tracked_entity_identifier.as_deref() else {
        return create_tracked_entity(api, &entity).await;
    };

    if let Some(unique_number) = attribute_value(&entity, identifier) {
        let country = instance
            .org_unit
            .as_ref()
            .and_then(|ou| ou.country_ref())
            .unwrap_or_default();
        let tracked_entity_type = definition.tracked_entity_type.as_deref().unwrap_or_default();
        let filter = format!("{identifier}:EQ:{unique_number}");

        let found = api
            .get(
                "trackedEntityInstances",
                &[
                    ("fields", "*"),
                    ("ou", country),
                    ("ouMode", "DESCENDANTS"),
                    ("trackedEntityType", tracked_entity_type),
                    ("filter", filter.as_str()),
                ],
            )
            .await
            .map_err(|e| rejection_to_export_error(e, SUBMISSION_ERROR_MESSAGE))?;

        let existing = found
            .get("trackedEntityInstances")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned();

        return match existing {
            Some(existing) => update_tracked_entity(api, existing, &entity).await,
            None => Err(IasoError::TrackedEntityNotFound {
                attribute: identifier.to_string(),
                value: unique_number,
            }),
        };
    }

    let org_unit = org_unit_ref(instance).unwrap_or_default();
    let unit = api
        .get(
            &format!("organisationUnits/{org_unit}"),
            &[("fields", "id,name,code")],
        )
        .await
        .map_err(|e| rejection_to_export_error(e, SUBMISSION_ERROR_MESSAGE))?;

    let code = unit.get("code").and_then(Value::as_str).map(str::to_string);
    let params: Vec<(&str, &str)> = code
        .as_deref()
        .map(|code| vec![("ORG_UNIT_CODE", code)])
        .unwrap_or_default();
    let generated = api
        .get(
            &format!("trackedEntityAttributes/{identifier}/generate"),
            &params,
        )
        .await
        .map_err(|e| rejection_to_export_error(e, SUBMISSION_ERROR_MESSAGE))?;

    let unique_number = match generated.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(Dhis2Error::InvalidResponse(format!(
                "no value generated for attribute {identifier}"
            ))
            .into())
        }
    };
    tracing::debug!(attribute = %identifier, value = %unique_number, "Generated unique number");

    set_attribute(&mut entity, identifier, &unique_number);
    create_tracked_entity(api, &entity).await
}

/// Exports a submission and the child entities of its repeat groups
///
/// # Errors
///
/// Mapping failures of the submission or of any repeat-group entry are
/// raised as one [`InstanceExportError`]. Entities created before a failure
/// stay in DHIS2.
pub async fn export_instance(
    api: &mut ApiLogger,
    instance: &Instance,
    definition: &MappingDefinition,
    org_units: &dyn OrgUnitResolver,
) -> Result<String> {
    let entity = map_to_values(instance, definition, org_units).map_err(field_errors)?;
    let parent = export_record(api, instance, definition, entity).await?;

    for group in definition.repeat_groups() {
        let Some(subform) = definition.subform(group) else {
            continue;
        };
        let entries = instance
            .answers()
            .and_then(|answers| answers.get(group))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in entries {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            let child = instance.with_answers(
                entry
                    .iter()
                    .map(|(key, value)| (leaf_key(key).to_string(), value.clone()))
                    .collect(),
            );

            let entity = map_to_values(&child, &subform, org_units).map_err(field_errors)?;
            let child_id = export_record(api, &child, &subform, entity).await?;

            if let Some(relationship_type) = &subform.relationship_type {
                submit_import(
                    api,
                    "relationships",
                    &json!({
                        "relationshipType": relationship_type,
                        "from": {"trackedEntityInstance": {"trackedEntityInstance": parent}},
                        "to": {"trackedEntityInstance": {"trackedEntityInstance": child_id}},
                    }),
                    SUBMISSION_ERROR_MESSAGE,
                )
                .await?;
            }
            tracing::debug!(
                instance_id = %instance.id,
                repeat_group = %group,
                parent = %parent,
                child = %child_id,
                "Exported repeat group entry"
            );
        }
    }

    Ok(parent)
}

fn field_errors(errors: Vec<FieldError>) -> IasoError {
    InstanceExportError::from_field_errors(SUBMISSION_ERROR_MESSAGE, &errors).into()
}

/// Last `/` segment of a repeat-group answer key
fn leaf_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn attribute_value(entity: &Value, attribute: &str) -> Option<String> {
    entity
        .get("attributes")?
        .as_array()?
        .iter()
        .find(|a| a.get("attribute").and_then(Value::as_str) == Some(attribute))
        .and_then(|a| match a.get("value")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn set_attribute(entity: &mut Value, attribute: &str, value: &str) {
    let Some(attributes) = entity.get_mut("attributes").and_then(Value::as_array_mut) else {
        entity["attributes"] = json!([{"attribute": attribute, "value": value}]);
        return;
    };
    match attributes
        .iter_mut()
        .find(|a| a.get("attribute").and_then(Value::as_str) == Some(attribute))
    {
        Some(existing) => existing["value"] = Value::String(value.to_string()),
        None => attributes.push(json!({"attribute": attribute, "value": value})),
    }
}

async fn create_tracked_entity(api: &mut ApiLogger, entity: &Value) -> Result<String> {
    let result =
        submit_import(api, "trackedEntityInstances", entity, SUBMISSION_ERROR_MESSAGE).await?;
    result
        .first_reference()
        .map(str::to_string)
        .ok_or_else(|| {
            Dhis2Error::InvalidResponse("tracked entity created without reference".to_string())
                .into()
        })
}

async fn update_tracked_entity(
    api: &mut ApiLogger,
    mut existing: Value,
    entity: &Value,
) -> Result<String> {
    let id = existing
        .get("trackedEntityInstance")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Dhis2Error::InvalidResponse("tracked entity without trackedEntityInstance".to_string())
        })?;

    let new_events: Vec<Value> = entity
        .pointer("/enrollments/0/events")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    match existing
        .get_mut("enrollments")
        .and_then(Value::as_array_mut)
        .and_then(|enrollments| enrollments.first_mut())
    {
        Some(enrollment) => match enrollment.get_mut("events").and_then(Value::as_array_mut) {
            Some(events) => events.extend(new_events),
            None => enrollment["events"] = Value::Array(new_events),
        },
        None => {
            existing["enrollments"] = entity.get("enrollments").cloned().unwrap_or(json!([]));
        }
    }

    let response = api
        .put(&format!("trackedEntityInstances/{id}"), &existing)
        .await
        .map_err(|e| rejection_to_export_error(e, SUBMISSION_ERROR_MESSAGE))?;
    check_import(&response, SUBMISSION_ERROR_MESSAGE)?;

    tracing::debug!(tracked_entity = %id, "Updated existing tracked entity");
    Ok(id)
}
