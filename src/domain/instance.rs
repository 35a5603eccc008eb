//! Submission ("instance") domain model

use super::ids::{AccountId, FormId, InstanceId, OrgUnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Local organisation unit, as far as the export needs it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgUnit {
    pub id: OrgUnitId,
    pub name: String,

    /// DHIS2 uid of this org unit
    pub source_ref: Option<String>,

    /// DHIS2 uid of the root of this org unit's hierarchy
    pub country_source_ref: Option<String>,
}

impl OrgUnit {
    pub fn new(id: OrgUnitId, name: impl Into<String>, source_ref: Option<&str>) -> Self {
        Self {
            id,
            name: name.into(),
            source_ref: source_ref.map(str::to_string),
            country_source_ref: None,
        }
    }

    /// Non-blank DHIS2 reference
    pub fn dhis2_ref(&self) -> Option<&str> {
        self.source_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Country-level reference used to scope tracked entity lookups
    pub fn country_ref(&self) -> Option<&str> {
        self.country_source_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.dhis2_ref())
    }
}

/// GPS point captured with a submission
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// One collected form submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub uuid: Option<Uuid>,

    /// DHIS2 event uid reserved for this submission
    pub export_id: Option<String>,

    pub account_id: AccountId,
    pub form_id: FormId,
    pub org_unit: Option<OrgUnit>,
    pub period: Option<String>,

    /// Answers keyed by question name
    pub json: Option<Map<String, Value>>,

    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub location: Option<Location>,
    pub deleted: bool,
    pub from_test_device: bool,
    pub last_export_success_at: Option<DateTime<Utc>>,
    pub to_export: bool,
}

impl Instance {
    /// Form version tag read from `_version`, falling back to `version`
    pub fn version_tag(&self) -> Option<String> {
        let answers = self.json.as_ref()?;
        ["_version", "version"]
            .iter()
            .filter_map(|key| answers.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn answers(&self) -> Option<&Map<String, Value>> {
        self.json.as_ref()
    }

    /// Creation date as sent to DHIS2 (YYYY-MM-DD)
    pub fn created_date(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }

    /// Copy of this submission carrying one repeat-group answer set
    pub fn with_answers(&self, answers: Map<String, Value>) -> Instance {
        Instance {
            json: Some(answers),
            export_id: None,
            ..self.clone()
        }
    }
}

/// Builder for [`Instance`]
///
/// # Examples
///
/// ```
/// use iaso_export::domain::{InstanceBuilder, AccountId, FormId, InstanceId};
/// use serde_json::json;
///
/// let instance = InstanceBuilder::new()
///     .id(InstanceId::new(1))
///     .account_id(AccountId::new(1))
///     .form_id(FormId::new(3))
///     .json(json!({"_version": "2023010101", "age": "12"}))
///     .build()
///     .unwrap();
/// assert_eq!(instance.version_tag().as_deref(), Some("2023010101"));
/// ```
#[derive(Debug, Default)]
pub struct InstanceBuilder {
    id: Option<InstanceId>,
    uuid: Option<Uuid>,
    export_id: Option<String>,
    account_id: Option<AccountId>,
    form_id: Option<FormId>,
    org_unit: Option<OrgUnit>,
    period: Option<String>,
    json: Option<Map<String, Value>>,
    file_name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    location: Option<Location>,
    deleted: bool,
    from_test_device: bool,
    last_export_success_at: Option<DateTime<Utc>>,
}

impl InstanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: InstanceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn export_id(mut self, export_id: impl Into<String>) -> Self {
        self.export_id = Some(export_id.into());
        self
    }

    pub fn account_id(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn form_id(mut self, form_id: FormId) -> Self {
        self.form_id = Some(form_id);
        self
    }

    pub fn org_unit(mut self, org_unit: OrgUnit) -> Self {
        self.org_unit = Some(org_unit);
        self
    }

    pub fn period(mut self, period: impl Into<String>) -> Self {
        self.period = Some(period.into());
        self
    }

    /// Sets the answers; anything but a JSON object leaves the submission without a body
    pub fn json(mut self, json: Value) -> Self {
        self.json = match json {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn from_test_device(mut self, from_test_device: bool) -> Self {
        self.from_test_device = from_test_device;
        self
    }

    pub fn last_export_success_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_export_success_at = Some(at);
        self
    }

    pub fn build(self) -> Result<Instance, String> {
        let id = self.id.ok_or("id is required")?;
        let account_id = self.account_id.ok_or("account_id is required")?;
        let form_id = self.form_id.ok_or("form_id is required")?;

        Ok(Instance {
            id,
            uuid: self.uuid,
            export_id: self.export_id,
            account_id,
            form_id,
            org_unit: self.org_unit,
            period: self.period,
            json: self.json,
            file_name: self
                .file_name
                .unwrap_or_else(|| format!("{}.xml", id.value())),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            location: self.location,
            deleted: self.deleted,
            from_test_device: self.from_test_device,
            last_export_success_at: self.last_export_success_at,
            to_export: self.last_export_success_at.is_none(),
        })
    }
}
