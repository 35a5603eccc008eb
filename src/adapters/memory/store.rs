//! In-process store
//!
//! Implements every persistence trait over plain collections guarded by a
//! mutex. Used for embedding the pipeline, dry runs, and tests.

use crate::adapters::database::traits::{ExportLedger, InstanceRepository, MappingRepository};
use crate::domain::{
    AccountId, EligibilityQuery, ExportLog, ExportLogId, ExportRequest, ExportRequestId,
    ExportState, ExportStatus, ExportStatusId, ExportUnit, FormId, IasoError, Instance,
    InstanceId, MappingType, MappingVersion, MappingVersionId, NewExportLog, NewExportRequest,
    NewExportStatus, OrgUnit, OrgUnitId, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    instances: BTreeMap<InstanceId, Instance>,
    org_units: HashMap<OrgUnitId, OrgUnit>,
    single_per_period_forms: HashSet<FormId>,
    mapping_versions: BTreeMap<MappingVersionId, Arc<MappingVersion>>,
    requests: BTreeMap<ExportRequestId, ExportRequest>,
    statuses: BTreeMap<ExportStatusId, ExportStatus>,
    logs: BTreeMap<ExportLogId, ExportLog>,
    last_request_id: i64,
    last_status_id: i64,
    last_log_id: i64,
}

impl State {
    /// Submissions referenced by a QUEUED or RUNNING request
    fn claimed_instances(&self) -> HashSet<InstanceId> {
        let alive: HashSet<ExportRequestId> = self
            .requests
            .values()
            .filter(|r| r.status.is_alive())
            .map(|r| r.id)
            .collect();
        self.statuses
            .values()
            .filter(|s| alive.contains(&s.export_request_id))
            .map(|s| s.instance_id)
            .collect()
    }

    fn is_duplicated(&self, instance: &Instance) -> bool {
        if !self.single_per_period_forms.contains(&instance.form_id) {
            return false;
        }
        let org_unit = instance.org_unit.as_ref().map(|ou| ou.id);
        self.instances
            .values()
            .filter(|other| {
                !other.deleted
                    && other.form_id == instance.form_id
                    && other.period == instance.period
                    && other.org_unit.as_ref().map(|ou| ou.id) == org_unit
            })
            .count()
            > 1
    }

    fn eligible<'a>(
        &'a self,
        query: &'a EligibilityQuery,
        exclude: &'a HashSet<InstanceId>,
    ) -> impl Iterator<Item = &'a Instance> + 'a {
        let claimed = self.claimed_instances();
        self.instances.values().filter(move |instance| {
            instance.account_id == query.account_id
                && query.filters.matches(instance)
                && query
                    .selection
                    .as_ref()
                    .map_or(true, |selection| selection.includes(instance.id))
                && !instance.deleted
                && !instance.file_name.trim().is_empty()
                && !instance.from_test_device
                && (query.force_export || instance.last_export_success_at.is_none())
                && !claimed.contains(&instance.id)
                && !exclude.contains(&instance.id)
                && !self.is_duplicated(instance)
        })
    }
}

/// In-memory implementation of the persistence traits
///
/// # Example
///
/// ```
/// use iaso_export::adapters::memory::MemoryStore;
/// use iaso_export::domain::{AccountId, FormId, InstanceBuilder, InstanceId};
///
/// let store = MemoryStore::new();
/// store
///     .add_instance(
///         InstanceBuilder::new()
///             .id(InstanceId::new(1))
///             .account_id(AccountId::new(1))
///             .form_id(FormId::new(1))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
/// assert!(store.instance(InstanceId::new(1)).unwrap().is_some());
/// ```
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| IasoError::Database("memory store lock poisoned".to_string()))
    }

    /// Adds or replaces a submission, registering its org unit
    pub fn add_instance(&self, instance: Instance) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(org_unit) = &instance.org_unit {
            state.org_units.insert(org_unit.id, org_unit.clone());
        }
        state.instances.insert(instance.id, instance);
        Ok(())
    }

    pub fn add_org_unit(&self, org_unit: OrgUnit) -> Result<()> {
        self.lock()?.org_units.insert(org_unit.id, org_unit);
        Ok(())
    }

    /// Flags a form as allowing one submission per period and org unit
    pub fn set_single_per_period(&self, form_id: FormId) -> Result<()> {
        self.lock()?.single_per_period_forms.insert(form_id);
        Ok(())
    }

    pub fn add_mapping_version(&self, mapping_version: MappingVersion) -> Result<Arc<MappingVersion>> {
        let mapping_version = Arc::new(mapping_version);
        self.lock()?
            .mapping_versions
            .insert(mapping_version.id, mapping_version.clone());
        Ok(mapping_version)
    }

    pub fn instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        Ok(self.lock()?.instances.get(&id).cloned())
    }

    /// Statuses of a request ordered by id
    pub fn export_statuses(&self, request_id: ExportRequestId) -> Result<Vec<ExportStatus>> {
        Ok(self
            .lock()?
            .statuses
            .values()
            .filter(|s| s.export_request_id == request_id)
            .cloned()
            .collect())
    }

    pub fn export_logs(&self) -> Result<Vec<ExportLog>> {
        Ok(self.lock()?.logs.values().cloned().collect())
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn count_eligible(&self, query: &EligibilityQuery) -> Result<u64> {
        let state = self.lock()?;
        let none = HashSet::new();
        Ok(state.eligible(query, &none).count() as u64)
    }

    async fn eligible_instances(
        &self,
        query: &EligibilityQuery,
        exclude: &[InstanceId],
        limit: usize,
    ) -> Result<Vec<Instance>> {
        let state = self.lock()?;
        let exclude: HashSet<InstanceId> = exclude.iter().copied().collect();
        Ok(state
            .eligible(query, &exclude)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn org_unit_source_refs(&self, ids: &[OrgUnitId]) -> Result<HashMap<OrgUnitId, String>> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let reference = state.org_units.get(id)?.dhis2_ref()?;
                Some((*id, reference.to_string()))
            })
            .collect())
    }

    async fn mark_exported(&self, ids: &[InstanceId], at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.last_export_success_at = Some(at);
                instance.to_export = false;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MappingRepository for MemoryStore {
    async fn mapping_versions_for_form(&self, form_id: FormId) -> Result<Vec<Arc<MappingVersion>>> {
        Ok(self
            .lock()?
            .mapping_versions
            .values()
            .filter(|mv| mv.form_id == form_id && mv.mapping_type != MappingType::Derived)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExportLedger for MemoryStore {
    async fn create_export_request(
        &self,
        mut request: NewExportRequest,
        statuses: Vec<NewExportStatus>,
    ) -> Result<ExportRequest> {
        let mut state = self.lock()?;
        let statuses = request.release_claimed(statuses, &state.claimed_instances())?;

        state.last_request_id += 1;
        let created = ExportRequest {
            id: ExportRequestId::new(state.last_request_id),
            params: request.params,
            launcher: request.launcher,
            status: ExportState::Queued,
            instance_count: request.instance_count,
            exported_count: 0,
            errored_count: 0,
            continue_on_error: false,
            queued_at: request.queued_at,
            started_at: None,
            ended_at: None,
            finished: false,
            last_error_message: None,
        };
        state.requests.insert(created.id, created.clone());

        for new_status in statuses {
            state.last_status_id += 1;
            let status = ExportStatus {
                id: ExportStatusId::new(state.last_status_id),
                export_request_id: created.id,
                instance_id: new_status.instance_id,
                mapping_version_id: new_status.mapping_version_id,
                status: ExportState::Queued,
                last_error_message: None,
                export_log_ids: Vec::new(),
            };
            state.statuses.insert(status.id, status);
        }

        Ok(created)
    }

    async fn save_export_request(&self, request: &ExportRequest) -> Result<()> {
        let mut state = self.lock()?;
        if !state.requests.contains_key(&request.id) {
            return Err(IasoError::Database(format!(
                "export request {} does not exist",
                request.id
            )));
        }
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_export_request(&self, id: ExportRequestId) -> Result<Option<ExportRequest>> {
        Ok(self.lock()?.requests.get(&id).cloned())
    }

    async fn list_export_requests(
        &self,
        account_id: Option<AccountId>,
        state_filter: Option<ExportState>,
    ) -> Result<Vec<ExportRequest>> {
        Ok(self
            .lock()?
            .requests
            .values()
            .rev()
            .filter(|r| account_id.map_or(true, |a| r.launcher.account_id == a))
            .filter(|r| state_filter.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn count_export_statuses(&self, request_id: ExportRequestId) -> Result<u64> {
        Ok(self
            .lock()?
            .statuses
            .values()
            .filter(|s| s.export_request_id == request_id)
            .count() as u64)
    }

    async fn export_units(
        &self,
        request_id: ExportRequestId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ExportUnit>> {
        let state = self.lock()?;
        Ok(state
            .statuses
            .values()
            .filter(|s| s.export_request_id == request_id)
            .skip(offset)
            .take(limit)
            .map(|status| ExportUnit {
                instance: state.instances.get(&status.instance_id).cloned(),
                mapping_version: state.mapping_versions.get(&status.mapping_version_id).cloned(),
                status: status.clone(),
            })
            .collect())
    }

    async fn save_export_statuses(&self, statuses: &[ExportStatus]) -> Result<()> {
        let mut state = self.lock()?;
        for status in statuses {
            state.statuses.insert(status.id, status.clone());
        }
        Ok(())
    }

    async fn insert_export_logs(&self, logs: Vec<NewExportLog>) -> Result<Vec<ExportLog>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(logs.len());
        for log in logs {
            state.last_log_id += 1;
            let log = ExportLog {
                id: ExportLogId::new(state.last_log_id),
                sent: log.sent,
                received: log.received,
                url: log.url,
                http_status: log.http_status,
                created_at: now,
            };
            state.logs.insert(log.id, log.clone());
            inserted.push(log);
        }
        Ok(inserted)
    }

    async fn export_logs_for_status(&self, status_id: ExportStatusId) -> Result<Vec<ExportLog>> {
        let state = self.lock()?;
        let Some(status) = state.statuses.get(&status_id) else {
            return Ok(Vec::new());
        };
        Ok(status
            .export_log_ids
            .iter()
            .filter_map(|id| state.logs.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        InstanceBuilder, InstanceFilters, Launcher, MappingDefinition, Selection, UserId,
    };
    use serde_json::json;

    fn instance(id: i64) -> InstanceBuilder {
        InstanceBuilder::new()
            .id(InstanceId::new(id))
            .account_id(AccountId::new(1))
            .form_id(FormId::new(1))
            .org_unit(OrgUnit::new(OrgUnitId::new(10), "Clinic", Some("ou10")))
            .period("202301")
            .json(json!({"_version": "1"}))
    }

    fn query() -> EligibilityQuery {
        EligibilityQuery {
            account_id: AccountId::new(1),
            filters: InstanceFilters::default(),
            selection: None,
            force_export: false,
        }
    }

    fn new_request() -> NewExportRequest {
        NewExportRequest {
            params: json!({}),
            launcher: Launcher {
                user_id: UserId::new(1),
                account_id: AccountId::new(1),
            },
            instance_count: 1,
            queued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_eligibility_rules() {
        let store = MemoryStore::new();
        store.add_instance(instance(1).build().unwrap()).unwrap();
        store.add_instance(instance(2).deleted(true).build().unwrap()).unwrap();
        store.add_instance(instance(3).file_name("").build().unwrap()).unwrap();
        store
            .add_instance(instance(4).from_test_device(true).build().unwrap())
            .unwrap();
        store
            .add_instance(instance(5).last_export_success_at(Utc::now()).build().unwrap())
            .unwrap();
        store
            .add_instance(instance(6).account_id(AccountId::new(2)).build().unwrap())
            .unwrap();

        assert_eq!(store.count_eligible(&query()).await.unwrap(), 1);

        let mut forced = query();
        forced.force_export = true;
        let ids: Vec<i64> = store
            .eligible_instances(&forced, &[], 10)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id.value())
            .collect();
        assert_eq!(ids, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_duplicates_excluded_for_single_per_period_forms() {
        let store = MemoryStore::new();
        store.add_instance(instance(1).build().unwrap()).unwrap();
        store.add_instance(instance(2).build().unwrap()).unwrap();
        assert_eq!(store.count_eligible(&query()).await.unwrap(), 2);

        store.set_single_per_period(FormId::new(1)).unwrap();
        assert_eq!(store.count_eligible(&query()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_alive_request_claims_instances() {
        let store = MemoryStore::new();
        store.add_instance(instance(1).build().unwrap()).unwrap();
        store.add_instance(instance(2).build().unwrap()).unwrap();

        let mut request = store
            .create_export_request(
                new_request(),
                vec![NewExportStatus {
                    instance_id: InstanceId::new(1),
                    mapping_version_id: MappingVersionId::new(1),
                }],
            )
            .await
            .unwrap();

        let mut forced = query();
        forced.force_export = true;
        assert_eq!(store.count_eligible(&forced).await.unwrap(), 1);

        request.kill(Utc::now());
        store.save_export_request(&request).await.unwrap();
        assert_eq!(store.count_eligible(&forced).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_request_skips_submissions_claimed_by_alive_request() {
        let store = MemoryStore::new();
        let unit = |id: i64| NewExportStatus {
            instance_id: InstanceId::new(id),
            mapping_version_id: MappingVersionId::new(1),
        };

        let first = store
            .create_export_request(new_request(), vec![unit(1), unit(2)])
            .await
            .unwrap();
        let mut overlapping = new_request();
        overlapping.instance_count = 2;
        let second = store
            .create_export_request(overlapping, vec![unit(2), unit(3)])
            .await
            .unwrap();

        assert_eq!(second.instance_count, 1);
        let ids: Vec<i64> = store
            .export_statuses(second.id)
            .unwrap()
            .iter()
            .map(|s| s.instance_id.value())
            .collect();
        assert_eq!(ids, vec![3]);

        let err = store
            .create_export_request(new_request(), vec![unit(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, IasoError::NothingToExport));
        assert_eq!(store.export_statuses(first.id).unwrap().len(), 2);
        assert_eq!(store.list_export_requests(None, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_selection_and_exclusion() {
        let store = MemoryStore::new();
        for id in 1..=4 {
            store.add_instance(instance(id).build().unwrap()).unwrap();
        }
        let mut selected = query();
        selected.selection = Some(Selection {
            selected_ids: vec![],
            unselected_ids: vec![InstanceId::new(2)],
        });
        let ids: Vec<i64> = store
            .eligible_instances(&selected, &[InstanceId::new(3)], 10)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id.value())
            .collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_export_units_join_instance_and_mapping() {
        let store = MemoryStore::new();
        store.add_instance(instance(1).build().unwrap()).unwrap();
        store
            .add_mapping_version(MappingVersion {
                id: MappingVersionId::new(7),
                name: "agg".to_string(),
                mapping_type: MappingType::Aggregate,
                form_id: FormId::new(1),
                form_version: "1".to_string(),
                repeat_groups: vec![],
                definition: MappingDefinition::default(),
                credentials: None,
            })
            .unwrap();

        let request = store
            .create_export_request(
                new_request(),
                vec![
                    NewExportStatus {
                        instance_id: InstanceId::new(1),
                        mapping_version_id: MappingVersionId::new(7),
                    },
                    NewExportStatus {
                        instance_id: InstanceId::new(99),
                        mapping_version_id: MappingVersionId::new(8),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.count_export_statuses(request.id).await.unwrap(), 2);
        let units = store.export_units(request.id, 0, 10).await.unwrap();
        assert!(units[0].instance.is_some());
        assert!(units[0].mapping_version.is_some());
        assert!(units[1].instance.is_none());
        assert!(units[1].mapping_version.is_none());

        let second_page = store.export_units(request.id, 1, 10).await.unwrap();
        assert_eq!(second_page.len(), 1);
    }

    #[tokio::test]
    async fn test_logs_attached_to_status() {
        let store = MemoryStore::new();
        let request = store
            .create_export_request(
                new_request(),
                vec![NewExportStatus {
                    instance_id: InstanceId::new(1),
                    mapping_version_id: MappingVersionId::new(1),
                }],
            )
            .await
            .unwrap();

        let logs = store
            .insert_export_logs(vec![NewExportLog {
                sent: json!({}),
                received: json!({"status": "OK"}),
                url: "https://dhis2.test/api/events".to_string(),
                http_status: 200,
            }])
            .await
            .unwrap();

        let mut status = store.export_statuses(request.id).unwrap().remove(0);
        status.attach_logs(&logs);
        store.save_export_statuses(&[status.clone()]).await.unwrap();

        let attached = store.export_logs_for_status(status.id).await.unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].http_status, 200);
    }

    #[tokio::test]
    async fn test_mark_exported_and_refs() {
        let store = MemoryStore::new();
        store.add_instance(instance(1).build().unwrap()).unwrap();
        store
            .add_org_unit(OrgUnit::new(OrgUnitId::new(11), "No ref", None))
            .unwrap();

        let refs = store
            .org_unit_source_refs(&[OrgUnitId::new(10), OrgUnitId::new(11)])
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[&OrgUnitId::new(10)], "ou10");

        store.mark_exported(&[InstanceId::new(1)], Utc::now()).await.unwrap();
        let exported = store.instance(InstanceId::new(1)).unwrap().unwrap();
        assert!(exported.last_export_success_at.is_some());
        assert!(!exported.to_export);
    }
}
