//! Aggregate data value export
//!
//! Each submission becomes a data value set for its period and org unit.
//! A page is sent as one `dataValueSets` import, followed by one
//! `completeDataSetRegistrations` import marking every touched
//! (period, data set, org unit) as complete.

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

/// Builds the data value set of one submission
///
/// Every answer whose question is mapped produces a data value commented
/// with `"<submission id> <raw answer> <question>"`.
///
/// # Errors
///
/// Returns every per-question failure; nothing is sent for a submission
/// with at least one.
pub fn map_to_values(
    instance: &Instance,
    definition: &MappingDefinition,
    org_units: &dyn OrgUnitResolver,
) -> std::result::Result<Value, Vec<FieldError>> {
    let mut errors = Vec::new();

    let org_unit = org_unit_ref(instance).map(str::to_string);
    if org_unit.is_none() {
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
    if instance.period.is_none() {
        errors.push(FieldError::new("period", FormatError::MissingPeriod));
    }

    let mut data_values = Vec::new();
    let empty = Map::new();
    for (question, raw) in instance.answers().unwrap_or(&empty) {
        for mapping in definition.mappings_for(question) {
            match mapping {
                QuestionMapping::SimpleDataElement(element) => {
                    let Some(value) =
                        format_answer(question, element, raw, org_units, &mut errors)
                    else {
                        continue;
                    };
                    let mut entry = data_value(&element.id, value);
                    entry["comment"] = Value::String(format!(
                        "{} {} {}",
                        instance.id,
                        raw_text(raw),
                        question
                    ));
                    if let Some(combo) = &element.category_option_combo {
                        entry["categoryOptionCombo"] = Value::String(combo.clone());
                    }
                    if let Some(combo) = &element.attribute_option_combo {
                        entry["attributeOptionCombo"] = Value::String(combo.clone());
                    }
                    data_values.push(entry);
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

    Ok(json!({
        "dataSet": definition.data_set_id,
        "completeDate": instance.created_date(),
        "period": instance.period,
        "orgUnit": org_unit,
        "dataValues": data_values,
    }))
}

fn raw_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sends a page of data value sets, then registers their completion
///
/// # Errors
///
/// Returns an [`crate::domain::InstanceExportError`] (wrapped) when DHIS2
/// rejects or partially ignores either import. Transport failures are
/// returned as is.
pub async fn export_page(payloads: &[Value], api: &mut ApiLogger) -> Result<()> {
    if payloads.is_empty() {
        return Ok(());
    }

    let mut data_values = Vec::new();
    let mut registrations: Vec<Value> = Vec::new();

    for payload in payloads {
        let org_unit = payload.get("orgUnit").cloned().unwrap_or(Value::Null);
        let period = payload.get("period").cloned().unwrap_or(Value::Null);

        if let Some(values) = payload.get("dataValues").and_then(Value::as_array) {
            for value in values {
                let mut value = value.clone();
                value["orgUnit"] = org_unit.clone();
                value["period"] = period.clone();
                data_values.push(value);
            }
        }

        let registration = json!({
            "period": period,
            "dataSet": payload.get("dataSet").cloned().unwrap_or(Value::Null),
            "organisationUnit": org_unit,
            "completed": true,
        });
        if !registrations.contains(&registration) {
            registrations.push(registration);
        }
    }

    let result = submit_import(
        api,
        "dataValueSets",
        &json!({ "dataValues": data_values }),
        PAGE_ERROR_MESSAGE,
    )
    .await?;
    tracing::debug!(
        data_values = data_values.len(),
        imported = result.counts.map(|c| c.imported).unwrap_or_default(),
        "Data value set imported"
    );

    submit_import(
        api,
        "completeDataSetRegistrations",
        &json!({ "completeDataSetRegistrations": registrations }),
        PAGE_ERROR_MESSAGE,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value_formatter::OrgUnitIndex;
    use crate::domain::{
        AccountId, FormId, InstanceBuilder, InstanceId, MappingType, OrgUnit, OrgUnitId,
    };
    use chrono::TimeZone;

    fn definition() -> MappingDefinition {
        MappingDefinition::parse(
            MappingType::Aggregate,
            &json!({
                "data_set_id": "dsMalaria",
                "question_mappings": {
                    "cases": {"id": "deCases", "valueType": "INTEGER", "categoryOptionCombo": "coc1"},
                    "tested": {"id": "deTested", "valueType": "BOOLEAN"},
                    "notes": {"type": "neverMapped"}
                }
            }),
            &[],
        )
        .unwrap()
    }

    fn instance(answers: Value) -> Instance {
        InstanceBuilder::new()
            .id(InstanceId::new(11))
            .account_id(AccountId::new(1))
            .form_id(FormId::new(1))
            .org_unit(OrgUnit::new(OrgUnitId::new(3), "Clinic", Some("ouClinic")))
            .period("202301")
            .created_at(chrono::Utc.with_ymd_and_hms(2023, 1, 20, 8, 0, 0).unwrap())
            .json(answers)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builds_data_value_set() {
        let payload = map_to_values(
            &instance(json!({"cases": "4", "tested": "yes", "notes": "x", "extra": 1})),
            &definition(),
            &OrgUnitIndex::default(),
        )
        .unwrap();

        assert_eq!(payload["dataSet"], "dsMalaria");
        assert_eq!(payload["completeDate"], "2023-01-20");
        assert_eq!(payload["period"], "202301");
        assert_eq!(payload["orgUnit"], "ouClinic");
        assert_eq!(
            payload["dataValues"],
            json!([
                {"dataElement": "deCases", "value": 4, "comment": "11 4 cases", "categoryOptionCombo": "coc1"},
                {"dataElement": "deTested", "value": true, "comment": "11 yes tested"}
            ])
        );
    }

    #[test]
    fn test_collects_every_field_error() {
        let errors = map_to_values(
            &instance(json!({"cases": "four", "tested": "maybe"})),
            &definition(),
            &OrgUnitIndex::default(),
        )
        .unwrap_err();

        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            vec![
                "cases invalid integer value 'four'".to_string(),
                "tested invalid boolean value 'maybe'".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_org_unit_reference_is_an_error() {
        let mut submission = instance(json!({"cases": "1"}));
        submission.org_unit = Some(OrgUnit::new(OrgUnitId::new(3), "Clinic", None));
        let errors =
            map_to_values(&submission, &definition(), &OrgUnitIndex::default()).unwrap_err();
        assert_eq!(errors[0].question, "orgUnit");
    }
}
