//! Submission selection for export requests

use super::ids::{AccountId, FormId, InstanceId, OrgUnitId};
use super::instance::Instance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied submission filters
///
/// Persisted as the export request's `params`, so it must stay JSON
/// round-trippable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form_ids: Vec<FormId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub org_unit_ids: Vec<OrgUnitId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub periods: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to: Option<DateTime<Utc>>,
}

impl InstanceFilters {
    pub fn matches(&self, instance: &Instance) -> bool {
        if !self.form_ids.is_empty() && !self.form_ids.contains(&instance.form_id) {
            return false;
        }

        if !self.org_unit_ids.is_empty() {
            let in_scope = instance
                .org_unit
                .as_ref()
                .is_some_and(|ou| self.org_unit_ids.contains(&ou.id));
            if !in_scope {
                return false;
            }
        }

        if !self.periods.is_empty() {
            let in_period = instance
                .period
                .as_ref()
                .is_some_and(|p| self.periods.contains(p));
            if !in_period {
                return false;
            }
        }

        if self.created_from.is_some_and(|from| instance.created_at < from) {
            return false;
        }

        if self.created_to.is_some_and(|to| instance.created_at > to) {
            return false;
        }

        true
    }
}

/// Explicit selection made by the launcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub selected_ids: Vec<InstanceId>,
    #[serde(default)]
    pub unselected_ids: Vec<InstanceId>,
}

impl Selection {
    /// An empty `selected_ids` list selects everything not unselected
    pub fn includes(&self, id: InstanceId) -> bool {
        (self.selected_ids.is_empty() || self.selected_ids.contains(&id))
            && !self.unselected_ids.contains(&id)
    }
}

/// Full eligibility query for one export request
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityQuery {
    pub account_id: AccountId,
    pub filters: InstanceFilters,
    pub selection: Option<Selection>,
    pub force_export: bool,
}
