//! Versioned field mappings
//!
//! A [`MappingVersion`] tells the payload handlers how each question of a form
//! version translates to DHIS2 identifiers. The stored JSON is parsed once,
//! when the mapping version is loaded, into a [`MappingDefinition`] whose
//! question entries are [`QuestionMapping`] variants.

use super::ids::{FormId, MappingVersionId};
use super::errors::MappingError;
use crate::config::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Payload shape produced for a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    Aggregate,
    Event,
    EventTracker,
    Derived,
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingType::Aggregate => "AGGREGATE",
            MappingType::Event => "EVENT",
            MappingType::EventTracker => "EVENT_TRACKER",
            MappingType::Derived => "DERIVED",
        }
    }
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MappingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AGGREGATE" => Ok(MappingType::Aggregate),
            "EVENT" => Ok(MappingType::Event),
            "EVENT_TRACKER" => Ok(MappingType::EventTracker),
            "DERIVED" => Ok(MappingType::Derived),
            other => Err(format!("Unknown mapping type '{other}'")),
        }
    }
}

/// DHIS2 value type of a data element or tracked entity attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Text,
    LongText,
    Letter,
    Username,
    Email,
    PhoneNumber,
    Number,
    Integer,
    IntegerPositive,
    IntegerNegative,
    IntegerZeroOrPositive,
    Percentage,
    Boolean,
    OrganisationUnit,
    Coordinate,
    Time,
    Date,
    Age,
    Other(String),
}

impl From<String> for ValueType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "TEXT" => ValueType::Text,
            "LONG_TEXT" => ValueType::LongText,
            "LETTER" => ValueType::Letter,
            "USERNAME" => ValueType::Username,
            "EMAIL" => ValueType::Email,
            "PHONE_NUMBER" => ValueType::PhoneNumber,
            "NUMBER" => ValueType::Number,
            "INTEGER" => ValueType::Integer,
            "INTEGER_POSITIVE" => ValueType::IntegerPositive,
            "INTEGER_NEGATIVE" => ValueType::IntegerNegative,
            "INTEGER_ZERO_OR_POSITIVE" => ValueType::IntegerZeroOrPositive,
            "PERCENTAGE" => ValueType::Percentage,
            "BOOLEAN" => ValueType::Boolean,
            "ORGANISATION_UNIT" => ValueType::OrganisationUnit,
            "COORDINATE" => ValueType::Coordinate,
            "TIME" => ValueType::Time,
            "DATE" => ValueType::Date,
            "AGE" => ValueType::Age,
            _ => ValueType::Other(s),
        }
    }
}

impl From<ValueType> for String {
    fn from(value_type: ValueType) -> Self {
        value_type.to_string()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Text => "TEXT",
            ValueType::LongText => "LONG_TEXT",
            ValueType::Letter => "LETTER",
            ValueType::Username => "USERNAME",
            ValueType::Email => "EMAIL",
            ValueType::PhoneNumber => "PHONE_NUMBER",
            ValueType::Number => "NUMBER",
            ValueType::Integer => "INTEGER",
            ValueType::IntegerPositive => "INTEGER_POSITIVE",
            ValueType::IntegerNegative => "INTEGER_NEGATIVE",
            ValueType::IntegerZeroOrPositive => "INTEGER_ZERO_OR_POSITIVE",
            ValueType::Percentage => "PERCENTAGE",
            ValueType::Boolean => "BOOLEAN",
            ValueType::OrganisationUnit => "ORGANISATION_UNIT",
            ValueType::Coordinate => "COORDINATE",
            ValueType::Time => "TIME",
            ValueType::Date => "DATE",
            ValueType::Age => "AGE",
            ValueType::Other(other) => other,
        };
        f.write_str(s)
    }
}

/// One entry of a DHIS2 option set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionEntry {
    pub code: String,

    /// Value recorded by the collection device for this option
    #[serde(default, deserialize_with = "string_or_number")]
    pub odk: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSet {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionEntry>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// DHIS2 data element (or tracked entity attribute) descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataElement {
    pub id: String,

    #[serde(rename = "valueType")]
    pub value_type: ValueType,

    #[serde(rename = "optionSet", default, skip_serializing_if = "Option::is_none")]
    pub option_set: Option<OptionSet>,

    #[serde(rename = "categoryOptionCombo", default, skip_serializing_if = "Option::is_none")]
    pub category_option_combo: Option<String>,

    #[serde(rename = "attributeOptionCombo", default, skip_serializing_if = "Option::is_none")]
    pub attribute_option_combo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Repeat group the question belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl DataElement {
    /// Label used in error messages
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.id, name),
            None => self.id.clone(),
        }
    }
}

/// Option of a multiple-choice question
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceOption {
    pub code: String,
    pub element: DataElement,
}

/// Settings a repeat group overrides for its child tracked entities
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubformOverrides {
    #[serde(default)]
    pub program_id: Option<String>,
    #[serde(default)]
    pub tracked_entity_type: Option<String>,
    #[serde(default)]
    pub tracked_entity_identifier: Option<String>,
    #[serde(default)]
    pub relationship_type: Option<String>,
}

/// How one question key maps to DHIS2
#[derive(Debug, Clone, PartialEq)]
pub enum QuestionMapping {
    /// Explicitly ignored question
    NeverMapped,
    SimpleDataElement(DataElement),
    /// Space-separated answer fanned out into one boolean per option
    MultipleChoice(Vec<ChoiceOption>),
    /// Data value of one program stage event
    StageDataValue { stage: String, element: DataElement },
    TrackedAttribute(DataElement),
    /// Repeat group whose answer sets become related tracked entities
    RelatedEntityMarker(SubformOverrides),
}

impl QuestionMapping {
    fn parse(key: &str, raw: &Value, repeat_groups: &[String]) -> Result<Vec<Self>, String> {
        if repeat_groups.iter().any(|group| group == key) {
            let overrides = match raw {
                Value::Object(_) => SubformOverrides::deserialize(raw)
                    .map_err(|e| format!("question '{key}': {e}"))?,
                _ => SubformOverrides::default(),
            };
            return Ok(vec![QuestionMapping::RelatedEntityMarker(overrides)]);
        }

        match raw {
            Value::Array(items) => items
                .iter()
                .map(|item| Self::parse_one(key, item))
                .collect(),
            other => Ok(vec![Self::parse_one(key, other)?]),
        }
    }

    fn parse_one(key: &str, raw: &Value) -> Result<Self, String> {
        let object = raw
            .as_object()
            .ok_or_else(|| format!("question '{key}': expected an object"))?;

        match object.get("type").and_then(Value::as_str) {
            Some("neverMapped") => return Ok(QuestionMapping::NeverMapped),
            Some("multiple") => return Self::parse_multiple(key, object),
            _ => {}
        }

        let element = DataElement::deserialize(raw).map_err(|e| format!("question '{key}': {e}"))?;

        if let Some(stage) = object
            .get("programStage")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            return Ok(QuestionMapping::StageDataValue {
                stage: stage.to_string(),
                element,
            });
        }

        if is_truthy(object.get("trackedEntityAttribute")) {
            return Ok(QuestionMapping::TrackedAttribute(element));
        }

        Ok(QuestionMapping::SimpleDataElement(element))
    }

    fn parse_multiple(key: &str, object: &Map<String, Value>) -> Result<Self, String> {
        let mut options = Vec::new();
        for (code, raw) in object {
            if code == "type" || !raw.is_object() {
                continue;
            }
            let element = DataElement::deserialize(raw)
                .map_err(|e| format!("question '{key}' option '{code}': {e}"))?;
            options.push(ChoiceOption {
                code: code.clone(),
                element,
            });
        }
        Ok(QuestionMapping::MultipleChoice(options))
    }

    /// Repeat group of the question, when it belongs to one
    fn parent(&self) -> Option<&str> {
        match self {
            QuestionMapping::SimpleDataElement(element)
            | QuestionMapping::TrackedAttribute(element)
            | QuestionMapping::StageDataValue { element, .. } => element.parent.as_deref(),
            QuestionMapping::MultipleChoice(options) => options
                .iter()
                .find_map(|option| option.element.parent.as_deref()),
            QuestionMapping::NeverMapped | QuestionMapping::RelatedEntityMarker(_) => None,
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty() && s != "false",
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Object(_)) | Some(Value::Array(_)) => true,
        _ => false,
    }
}

/// Parsed body of a mapping version
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDefinition {
    pub question_mappings: BTreeMap<String, Vec<QuestionMapping>>,
    pub data_set_id: Option<String>,
    pub program_id: Option<String>,
    pub tracked_entity_type: Option<String>,

    /// Tracked entity attribute holding the unique number
    pub tracked_entity_identifier: Option<String>,

    pub relationship_type: Option<String>,
}

impl MappingDefinition {
    /// Parses the stored mapping JSON, checking the fields its type requires
    pub fn parse(
        mapping_type: MappingType,
        json: &Value,
        repeat_groups: &[String],
    ) -> Result<Self, String> {
        let object = json
            .as_object()
            .ok_or_else(|| "mapping body must be an object".to_string())?;

        let mut question_mappings = BTreeMap::new();
        if let Some(raw) = object.get("question_mappings") {
            let entries = raw
                .as_object()
                .ok_or_else(|| "question_mappings must be an object".to_string())?;
            for (key, value) in entries {
                question_mappings.insert(key.clone(), QuestionMapping::parse(key, value, repeat_groups)?);
            }
        }

        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let definition = MappingDefinition {
            question_mappings,
            data_set_id: field("data_set_id"),
            program_id: field("program_id"),
            tracked_entity_type: field("tracked_entity_type"),
            tracked_entity_identifier: field("tracked_entity_identifier"),
            relationship_type: field("relationship_type"),
        };

        let missing = match mapping_type {
            MappingType::Aggregate if definition.data_set_id.is_none() => Some("data_set_id"),
            MappingType::Event if definition.program_id.is_none() => Some("program_id"),
            MappingType::EventTracker if definition.program_id.is_none() => Some("program_id"),
            MappingType::EventTracker if definition.tracked_entity_type.is_none() => {
                Some("tracked_entity_type")
            }
            _ => None,
        };
        if let Some(name) = missing {
            return Err(format!("{mapping_type} mapping requires '{name}'"));
        }

        Ok(definition)
    }

    pub fn mappings_for(&self, question: &str) -> &[QuestionMapping] {
        self.question_mappings
            .get(question)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Program stages referenced by any question
    pub fn program_stages(&self) -> BTreeSet<String> {
        self.question_mappings
            .values()
            .flatten()
            .filter_map(|mapping| match mapping {
                QuestionMapping::StageDataValue { stage, .. } => Some(stage.clone()),
                _ => None,
            })
            .collect()
    }

    /// Repeat groups declared in this mapping
    pub fn repeat_groups(&self) -> Vec<&str> {
        self.question_mappings
            .iter()
            .filter(|(_, mappings)| {
                mappings
                    .iter()
                    .any(|m| matches!(m, QuestionMapping::RelatedEntityMarker(_)))
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Mapping used for the child tracked entities of a repeat group
    ///
    /// Inherits this mapping's settings, overlaid with the group's overrides,
    /// and keeps only the questions whose parent is the group.
    pub fn subform(&self, group: &str) -> Option<MappingDefinition> {
        let overrides = self.mappings_for(group).iter().find_map(|m| match m {
            QuestionMapping::RelatedEntityMarker(overrides) => Some(overrides),
            _ => None,
        })?;

        let question_mappings = self
            .question_mappings
            .iter()
            .filter_map(|(key, mappings)| {
                let kept: Vec<QuestionMapping> = mappings
                    .iter()
                    .filter(|m| m.parent() == Some(group))
                    .cloned()
                    .collect();
                (!kept.is_empty()).then(|| (key.clone(), kept))
            })
            .collect();

        Some(MappingDefinition {
            question_mappings,
            data_set_id: self.data_set_id.clone(),
            program_id: overrides.program_id.clone().or_else(|| self.program_id.clone()),
            tracked_entity_type: overrides
                .tracked_entity_type
                .clone()
                .or_else(|| self.tracked_entity_type.clone()),
            tracked_entity_identifier: overrides
                .tracked_entity_identifier
                .clone()
                .or_else(|| self.tracked_entity_identifier.clone()),
            relationship_type: overrides
                .relationship_type
                .clone()
                .or_else(|| self.relationship_type.clone()),
        })
    }
}

/// Names of the repeat groups declared in a form version descriptor
pub fn repeat_group_names(descriptor: &Value) -> Vec<String> {
    fn walk(node: &Value, names: &mut Vec<String>) {
        if let Some(object) = node.as_object() {
            if object.get("type").and_then(Value::as_str) == Some("repeat") {
                if let Some(name) = object.get("name").and_then(Value::as_str) {
                    names.push(name.to_string());
                }
            }
            if let Some(children) = object.get("children").and_then(Value::as_array) {
                for child in children {
                    walk(child, names);
                }
            }
        }
    }

    let mut names = Vec::new();
    walk(descriptor, &mut names);
    names
}

/// Credentials of the DHIS2 instance a mapping's data source exports to
#[derive(Debug, Clone)]
pub struct Dhis2Credentials {
    pub name: String,
    pub url: String,
    pub login: String,
    pub password: SecretString,
}

/// One version of a form mapping
#[derive(Debug, Clone)]
pub struct MappingVersion {
    pub id: MappingVersionId,
    pub name: String,
    pub mapping_type: MappingType,
    pub form_id: FormId,

    /// Version tag of the form version this mapping applies to
    pub form_version: String,

    pub repeat_groups: Vec<String>,
    pub definition: MappingDefinition,
    pub credentials: Option<Dhis2Credentials>,
}

impl MappingVersion {
    /// Parses a stored mapping body for this version
    pub fn parse_definition(
        id: MappingVersionId,
        mapping_type: MappingType,
        json: &Value,
        repeat_groups: &[String],
    ) -> Result<MappingDefinition, MappingError> {
        MappingDefinition::parse(mapping_type, json, repeat_groups).map_err(|reason| {
            MappingError::InvalidDefinition {
                mapping_version_id: id,
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker_json() -> Value {
        json!({
            "program_id": "prog1",
            "tracked_entity_type": "person",
            "tracked_entity_identifier": "uniq",
            "question_mappings": {
                "name": {"id": "attrName", "valueType": "TEXT", "trackedEntityAttribute": true},
                "weight": [
                    {"id": "deWeight", "valueType": "NUMBER", "programStage": "stageA"},
                    {"id": "deWeight2", "valueType": "NUMBER", "programStage": "stageB"}
                ],
                "skip": {"type": "neverMapped"},
                "household": {"relationship_type": "rel1", "tracked_entity_type": "member"},
                "member_name": {
                    "id": "attrMember", "valueType": "TEXT",
                    "trackedEntityAttribute": true, "parent": "household"
                }
            }
        })
    }

    #[test]
    fn test_parse_tracker_mapping_into_variants() {
        let groups = vec!["household".to_string()];
        let def = MappingDefinition::parse(MappingType::EventTracker, &tracker_json(), &groups)
            .unwrap();

        assert!(matches!(
            def.mappings_for("name"),
            [QuestionMapping::TrackedAttribute(_)]
        ));
        assert_eq!(def.mappings_for("weight").len(), 2);
        assert_eq!(def.mappings_for("skip"), &[QuestionMapping::NeverMapped]);
        assert!(def.mappings_for("unknown").is_empty());
        assert_eq!(
            def.program_stages().into_iter().collect::<Vec<_>>(),
            vec!["stageA".to_string(), "stageB".to_string()]
        );
        assert_eq!(def.repeat_groups(), vec!["household"]);
    }

    #[test]
    fn test_subform_inherits_and_overrides() {
        let groups = vec!["household".to_string()];
        let def = MappingDefinition::parse(MappingType::EventTracker, &tracker_json(), &groups)
            .unwrap();
        let sub = def.subform("household").unwrap();

        assert_eq!(sub.program_id.as_deref(), Some("prog1"));
        assert_eq!(sub.tracked_entity_type.as_deref(), Some("member"));
        assert_eq!(sub.relationship_type.as_deref(), Some("rel1"));
        assert_eq!(sub.question_mappings.len(), 1);
        assert!(sub.question_mappings.contains_key("member_name"));
        assert!(def.subform("name").is_none());
    }

    #[test]
    fn test_parse_multiple_choice() {
        let json = json!({
            "program_id": "p",
            "question_mappings": {
                "symptoms": {
                    "type": "multiple",
                    "fever": {"id": "deFever", "valueType": "BOOLEAN"},
                    "cough": {"id": "deCough", "valueType": "BOOLEAN"}
                }
            }
        });
        let def = MappingDefinition::parse(MappingType::Event, &json, &[]).unwrap();
        match def.mappings_for("symptoms") {
            [QuestionMapping::MultipleChoice(options)] => {
                let codes: Vec<&str> = options.iter().map(|o| o.code.as_str()).collect();
                assert_eq!(codes.len(), 2);
                assert!(codes.contains(&"fever"));
                assert!(codes.contains(&"cough"));
            }
            other => panic!("unexpected mapping {other:?}"),
        }
    }

    #[test]
    fn test_required_fields_per_type() {
        let json = json!({"question_mappings": {}});
        let err = MappingDefinition::parse(MappingType::Aggregate, &json, &[]).unwrap_err();
        assert!(err.contains("data_set_id"));
        assert!(MappingDefinition::parse(MappingType::Event, &json, &[]).is_err());

        let tracker = json!({"program_id": "p", "question_mappings": {}});
        let err = MappingDefinition::parse(MappingType::EventTracker, &tracker, &[]).unwrap_err();
        assert!(err.contains("tracked_entity_type"));
    }

    #[test]
    fn test_invalid_definition_carries_version_id() {
        let err = MappingVersion::parse_definition(
            MappingVersionId::new(12),
            MappingType::Aggregate,
            &json!({"data_set_id": "ds", "question_mappings": {"q": "oops"}}),
            &[],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MappingError::InvalidDefinition { mapping_version_id, .. } if mapping_version_id.value() == 12
        ));
    }

    #[test]
    fn test_option_odk_accepts_numbers() {
        let element: DataElement = serde_json::from_value(json!({
            "id": "de1",
            "valueType": "TEXT",
            "optionSet": {"options": [{"code": "A", "odk": 1}, {"code": "B", "odk": "2"}]}
        }))
        .unwrap();
        let options = element.option_set.unwrap().options;
        assert_eq!(options[0].odk.as_deref(), Some("1"));
        assert_eq!(options[1].odk.as_deref(), Some("2"));
    }

    #[test]
    fn test_value_type_round_trip() {
        assert_eq!(ValueType::from("INTEGER_POSITIVE".to_string()), ValueType::IntegerPositive);
        assert_eq!(
            ValueType::from("TRUE_ONLY".to_string()),
            ValueType::Other("TRUE_ONLY".to_string())
        );
        assert_eq!(ValueType::Coordinate.to_string(), "COORDINATE");
    }

    #[test]
    fn test_repeat_group_names_walks_descriptor() {
        let descriptor = json!({
            "name": "form",
            "children": [
                {"name": "age", "type": "integer"},
                {"name": "household", "type": "repeat", "children": [
                    {"name": "children", "type": "repeat", "children": []}
                ]}
            ]
        });
        assert_eq!(repeat_group_names(&descriptor), vec!["household", "children"]);
    }
}
