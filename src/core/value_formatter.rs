//! Type-directed coercion of submitted answers into DHIS2 values
//!
//! Collection devices record every answer as loosely typed JSON. DHIS2
//! expects each value to match the `valueType` of its data element, with
//! type-specific rules for empty answers. [`format_value`] centralizes those
//! rules so the payload handlers never inspect value types themselves.

use crate::domain::{DataElement, FormatError, OrgUnitId, ValueType};
use serde_json::{Number, Value};
use std::collections::HashMap;

/// Lookup of the DHIS2 reference of a local org unit
pub trait OrgUnitResolver {
    fn source_ref(&self, id: OrgUnitId) -> Option<&str>;
}

/// Org unit references prefetched for one page of submissions
#[derive(Debug, Clone, Default)]
pub struct OrgUnitIndex {
    refs: HashMap<OrgUnitId, String>,
}

impl OrgUnitIndex {
    pub fn new(refs: HashMap<OrgUnitId, String>) -> Self {
        Self { refs }
    }

    pub fn insert(&mut self, id: OrgUnitId, source_ref: impl Into<String>) {
        self.refs.insert(id, source_ref.into());
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

impl OrgUnitResolver for OrgUnitIndex {
    fn source_ref(&self, id: OrgUnitId) -> Option<&str> {
        self.refs.get(&id).map(String::as_str)
    }
}

/// Converts a raw answer to the value DHIS2 expects for `element`
///
/// Returns `Ok(None)` when the answer must be sent as an empty value.
///
/// # Errors
///
/// Returns a [`FormatError`] when the answer cannot be represented in the
/// element's value type, or when the value type itself is not supported.
///
/// # Examples
///
/// ```
/// use iaso_export::core::value_formatter::{format_value, OrgUnitIndex};
/// use iaso_export::domain::DataElement;
/// use serde_json::json;
///
/// let element: DataElement =
///     serde_json::from_value(json!({"id": "deAge", "valueType": "INTEGER"})).unwrap();
/// let value = format_value(&element, &json!(" 42 "), &OrgUnitIndex::default()).unwrap();
/// assert_eq!(value, Some(json!(42)));
/// ```
pub fn format_value(
    element: &DataElement,
    raw: &Value,
    org_units: &dyn OrgUnitResolver,
) -> Result<Option<Value>, FormatError> {
    if raw.is_null() {
        return Ok(None);
    }

    if let Some(option_set) = &element.option_set {
        let text = stringify(raw);
        if text.is_empty() {
            return Ok(None);
        }
        if let Some(option) = option_set
            .options
            .iter()
            .find(|option| option.odk.as_deref() == Some(text.as_str()))
        {
            return Ok(Some(Value::String(option.code.clone())));
        }
        if option_set.options.iter().any(|option| option.code == text) {
            return Ok(Some(raw.clone()));
        }
        return Err(FormatError::UnknownOptionValue {
            value: text,
            data_element: element.label(),
        });
    }

    match &element.value_type {
        ValueType::Text | ValueType::LongText | ValueType::Letter => {
            let text = stringify(raw);
            Ok((!text.is_empty()).then_some(Value::String(text)))
        }
        ValueType::Username | ValueType::Email | ValueType::PhoneNumber => {
            Ok(Some(Value::String(stringify(raw))))
        }
        ValueType::Number => format_number(raw),
        ValueType::Integer
        | ValueType::IntegerPositive
        | ValueType::IntegerNegative
        | ValueType::IntegerZeroOrPositive
        | ValueType::Percentage => format_integer(raw),
        ValueType::Boolean => format_boolean(raw),
        ValueType::OrganisationUnit => format_org_unit(raw, org_units),
        ValueType::Coordinate => format_coordinate(raw),
        ValueType::Time => {
            let text = stringify(raw);
            Ok((!text.is_empty()).then(|| Value::String(text.chars().take(5).collect())))
        }
        ValueType::Date | ValueType::Age => Ok((!is_empty_string(raw)).then(|| raw.clone())),
        ValueType::Other(_) => Err(FormatError::UnsupportedValueType {
            value_type: element.value_type.to_string(),
            data_element: element.label(),
        }),
    }
}

fn stringify(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_empty_string(raw: &Value) -> bool {
    raw.as_str().is_some_and(str::is_empty)
}

fn format_number(raw: &Value) -> Result<Option<Value>, FormatError> {
    match raw {
        Value::Number(_) => Ok(Some(raw.clone())),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => {
            let trimmed = s.trim();
            let parsed = if trimmed.contains('.') {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            } else {
                trimmed.parse::<i64>().ok().map(Value::from)
            };
            parsed
                .map(Some)
                .ok_or_else(|| FormatError::InvalidNumericValue(s.clone()))
        }
        other => Err(FormatError::InvalidNumericValue(stringify(other))),
    }
}

fn format_integer(raw: &Value) -> Result<Option<Value>, FormatError> {
    match raw {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Some(raw.clone())),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(Some(Value::from(f as i64)))
            }
            _ => Err(FormatError::InvalidIntegerValue(n.to_string())),
        },
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(|i| Some(Value::from(i)))
            .map_err(|_| FormatError::InvalidIntegerValue(s.clone())),
        other => Err(FormatError::InvalidIntegerValue(stringify(other))),
    }
}

fn format_boolean(raw: &Value) -> Result<Option<Value>, FormatError> {
    match raw {
        Value::Bool(b) => Ok(Some(Value::Bool(*b))),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(Some(Value::Bool(true))),
        Value::Number(n) if n.as_i64() == Some(0) => Ok(Some(Value::Bool(false))),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "yes" | "true" => Ok(Some(Value::Bool(true))),
            "0" | "no" | "false" => Ok(Some(Value::Bool(false))),
            _ => Err(FormatError::InvalidBooleanValue(s.clone())),
        },
        other => Err(FormatError::InvalidBooleanValue(stringify(other))),
    }
}

fn format_org_unit(
    raw: &Value,
    org_units: &dyn OrgUnitResolver,
) -> Result<Option<Value>, FormatError> {
    let local_id = match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse::<i64>().ok()
        }
        _ => None,
    };

    match local_id {
        Some(id) => org_units
            .source_ref(OrgUnitId::new(id))
            .map(|source_ref| Some(Value::String(source_ref.to_string())))
            .ok_or_else(|| FormatError::UnknownOrgUnit(id.to_string())),
        // Already a DHIS2 reference
        None => Ok(Some(raw.clone())),
    }
}

fn format_coordinate(raw: &Value) -> Result<Option<Value>, FormatError> {
    let Some(text) = raw.as_str() else {
        return Err(FormatError::InvalidCoordinateValue(stringify(raw)));
    };
    if text.trim().is_empty() {
        return Ok(None);
    }

    let mut tokens = text.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(latitude), Some(longitude)) => {
            Ok(Some(Value::String(format!("[{longitude},{latitude}]"))))
        }
        _ => Err(FormatError::InvalidCoordinateValue(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn element(value_type: &str) -> DataElement {
        serde_json::from_value(json!({"id": "de1", "valueType": value_type})).unwrap()
    }

    fn with_options() -> DataElement {
        serde_json::from_value(json!({
            "id": "deGender",
            "name": "Gender",
            "valueType": "TEXT",
            "optionSet": {
                "id": "os1",
                "options": [
                    {"code": "MALE", "odk": "1"},
                    {"code": "FEMALE", "odk": 2}
                ]
            }
        }))
        .unwrap()
    }

    fn index() -> OrgUnitIndex {
        let mut index = OrgUnitIndex::default();
        index.insert(OrgUnitId::new(42), "ImspTQPwCqd");
        index
    }

    fn format(value_type: &str, raw: Value) -> Result<Option<Value>, FormatError> {
        format_value(&element(value_type), &raw, &index())
    }

    #[test_case("NUMBER", json!("12.5"), Some(json!(12.5)) ; "number float string")]
    #[test_case("NUMBER", json!("12"), Some(json!(12)) ; "number int string")]
    #[test_case("NUMBER", json!(3.25), Some(json!(3.25)) ; "number passthrough")]
    #[test_case("NUMBER", json!(""), None ; "number empty")]
    #[test_case("INTEGER", json!(" 7 "), Some(json!(7)) ; "integer trimmed")]
    #[test_case("INTEGER_POSITIVE", json!(4.0), Some(json!(4)) ; "integer whole float")]
    #[test_case("PERCENTAGE", json!(""), None ; "percentage empty")]
    #[test_case("BOOLEAN", json!("yes"), Some(json!(true)) ; "boolean yes")]
    #[test_case("BOOLEAN", json!("0"), Some(json!(false)) ; "boolean zero string")]
    #[test_case("BOOLEAN", json!(1), Some(json!(true)) ; "boolean one")]
    #[test_case("BOOLEAN", json!(false), Some(json!(false)) ; "boolean json")]
    #[test_case("BOOLEAN", json!(""), None ; "boolean empty")]
    #[test_case("TEXT", json!(""), None ; "text empty")]
    #[test_case("TEXT", json!(3), Some(json!("3")) ; "text stringified")]
    #[test_case("LONG_TEXT", json!(true), Some(json!("true")) ; "long text bool")]
    #[test_case("EMAIL", json!(""), Some(json!("")) ; "email keeps empty")]
    #[test_case("PHONE_NUMBER", json!(""), Some(json!("")) ; "phone keeps empty")]
    #[test_case("TIME", json!("13:45:12.000+02:00"), Some(json!("13:45")) ; "time truncated")]
    #[test_case("TIME", json!(""), None ; "time empty")]
    #[test_case("DATE", json!("2023-01-15"), Some(json!("2023-01-15")) ; "date passthrough")]
    #[test_case("AGE", json!(""), None ; "age empty")]
    #[test_case("COORDINATE", json!("50.1 4.3 120 5"), Some(json!("[4.3,50.1]")) ; "coordinate swapped")]
    #[test_case("COORDINATE", json!(""), None ; "coordinate empty")]
    #[test_case("ORGANISATION_UNIT", json!("42"), Some(json!("ImspTQPwCqd")) ; "org unit local id")]
    #[test_case("ORGANISATION_UNIT", json!(42), Some(json!("ImspTQPwCqd")) ; "org unit json id")]
    #[test_case("ORGANISATION_UNIT", json!("O6uvpzGd5pu"), Some(json!("O6uvpzGd5pu")) ; "org unit dhis2 ref")]
    fn test_format_value(value_type: &str, raw: Value, expected: Option<Value>) {
        assert_eq!(format(value_type, raw).unwrap(), expected);
    }

    #[test_case("NUMBER", json!("abc") ; "number garbage")]
    #[test_case("INTEGER", json!("1.5") ; "integer decimal string")]
    #[test_case("INTEGER", json!(1.5) ; "integer fractional")]
    #[test_case("BOOLEAN", json!("maybe") ; "boolean garbage")]
    #[test_case("COORDINATE", json!("50.1") ; "coordinate single token")]
    #[test_case("ORGANISATION_UNIT", json!("7") ; "org unit unknown")]
    #[test_case("FILE_RESOURCE", json!("x") ; "unsupported type")]
    fn test_format_value_errors(value_type: &str, raw: Value) {
        assert!(format(value_type, raw).is_err());
    }

    #[test]
    fn test_null_is_none_for_every_type() {
        assert_eq!(format_value(&with_options(), &Value::Null, &index()), Ok(None));
        assert_eq!(format("FILE_RESOURCE", Value::Null), Ok(None));
        assert_eq!(format("ORGANISATION_UNIT", Value::Null), Ok(None));
    }

    #[test]
    fn test_option_set_translation() {
        let element = with_options();
        let org_units = index();
        assert_eq!(
            format_value(&element, &json!("1"), &org_units),
            Ok(Some(json!("MALE")))
        );
        assert_eq!(
            format_value(&element, &json!("2"), &org_units),
            Ok(Some(json!("FEMALE")))
        );
        assert_eq!(
            format_value(&element, &json!("FEMALE"), &org_units),
            Ok(Some(json!("FEMALE")))
        );
        assert_eq!(format_value(&element, &json!(""), &org_units), Ok(None));
    }

    #[test]
    fn test_unknown_option_names_element() {
        let err = format_value(&with_options(), &json!("3"), &index()).unwrap_err();
        assert_eq!(
            err,
            FormatError::UnknownOptionValue {
                value: "3".to_string(),
                data_element: "deGender (Gender)".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_org_unit_reports_id() {
        assert_eq!(
            format("ORGANISATION_UNIT", json!("7")),
            Err(FormatError::UnknownOrgUnit("7".to_string()))
        );
    }
}
