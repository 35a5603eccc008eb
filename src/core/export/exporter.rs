//! Export request runner
//!
//! [`DataValueExporter`] walks the statuses of an export request page by
//! page, maps each submission with the handler of its mapping type, sends
//! the payloads to DHIS2 and records the outcome in the export ledger.
//!
//! Progress is persisted after every page, so pages exported before a
//! failure stay exported.

use crate::adapters::database::traits::{ExportLedger, InstanceRepository};
use crate::adapters::database::Repositories;
use crate::adapters::dhis2::{ApiLogger, Dhis2Api, Dhis2ApiFactory};
use crate::core::export::summary::{ExportError, ExportErrorType, ExportSummary};
use crate::core::handlers::{aggregate, event, event_tracker, PAGE_ERROR_MESSAGE};
use crate::core::value_formatter::OrgUnitIndex;
use crate::domain::{
    ExportRequest, ExportState, ExportUnit, FieldError, IasoError, InstanceExportError,
    InstanceId, MappingDefinition, MappingType, MappingVersion, MappingVersionId, OrgUnitId,
    QuestionMapping, Result, ValueType,
};
use crate::{log_page_failure, log_page_start};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Default number of export statuses per page
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// DHIS2 clients of one run, keyed by mapping version
type ApiCache = HashMap<MappingVersionId, Arc<dyn Dhis2Api>>;

/// Runs export requests against DHIS2
pub struct DataValueExporter {
    instances: Arc<dyn InstanceRepository>,
    ledger: Arc<dyn ExportLedger>,
    api_factory: Arc<dyn Dhis2ApiFactory>,
    shutdown: Option<watch::Receiver<bool>>,
}

/// Aggregate or event payloads sharing one mapping version
struct BatchGroup {
    mapping_version: Arc<MappingVersion>,
    units: Vec<usize>,
    payloads: Vec<Value>,
}

/// Failure of one page, with the category reported in the summary
struct PageFailure {
    error_type: ExportErrorType,
    error: IasoError,
}

impl From<IasoError> for PageFailure {
    fn from(error: IasoError) -> Self {
        Self {
            error_type: ExportErrorType::of(&error),
            error,
        }
    }
}

impl DataValueExporter {
    pub fn new(repositories: &Repositories, api_factory: Arc<dyn Dhis2ApiFactory>) -> Self {
        Self {
            instances: repositories.instances.clone(),
            ledger: repositories.ledger.clone(),
            api_factory,
            shutdown: None,
        }
    }

    /// Stops the run between pages once the flag turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Exports every status of `request`
    ///
    /// The request must be QUEUED: running a terminal request again would
    /// submit its payloads to DHIS2 a second time.
    ///
    /// # Errors
    ///
    /// - A page business error ([`IasoError::InstanceExport`]) when
    ///   `continue_on_error` is false
    /// - Any other error, whatever `continue_on_error` says
    /// - [`IasoError::Cancelled`] when the shutdown flag is raised
    ///
    /// The request is finalized and saved before any error is returned.
    pub async fn export_instances(
        &self,
        request: &mut ExportRequest,
        page_size: usize,
        continue_on_error: bool,
    ) -> Result<ExportSummary> {
        if page_size == 0 {
            return Err(IasoError::Validation(
                "page_size must be greater than 0".to_string(),
            ));
        }

        let started = Instant::now();
        request.start(continue_on_error, Utc::now());
        self.ledger.save_export_request(request).await?;

        let total = self.ledger.count_export_statuses(request.id).await? as usize;
        let mut summary = ExportSummary::new(request.id);
        summary.total_units = total;

        tracing::info!(
            export_request_id = %request.id,
            units = total,
            page_size,
            continue_on_error,
            "Export started"
        );

        let mut apis = ApiCache::new();
        let mut offset = 0;
        let mut page = 0;

        while offset < total {
            if self.shutdown_requested() {
                tracing::warn!(
                    export_request_id = %request.id,
                    pages_done = page,
                    "Shutdown requested, stopping export"
                );
                request.kill(Utc::now());
                self.ledger.save_export_request(request).await?;
                return Err(IasoError::Cancelled);
            }

            let mut units = self
                .ledger
                .export_units(request.id, offset, page_size)
                .await?;
            offset += page_size;
            if units.is_empty() {
                break;
            }
            page += 1;
            summary.pages = page;
            log_page_start!(request.id, page, units.len());

            let attempted = claim_units(&mut units, &mut summary);
            let outcome = self
                .export_page(request, &mut units, &attempted, &mut apis, &mut summary)
                .await;

            let failure = match outcome {
                Ok(()) => {
                    self.save_page(request, &units).await?;
                    continue;
                }
                Err(failure) => failure,
            };

            let PageFailure { error_type, error } = failure;
            let message = failure_message(&error);
            let errored = mark_errored(&mut units, &attempted, &message);
            request.record_errored(errored as u64, message.clone());
            summary.errored += errored;
            log_page_failure!(request.id, page, error);

            if error.is_business_error() && continue_on_error {
                summary.add_error(
                    ExportError::new(error_type, message).with_context(format!("page {page}")),
                );
                self.save_page(request, &units).await?;
                continue;
            }

            if let Err(save_error) = self.save_statuses(&units).await {
                tracing::error!(
                    export_request_id = %request.id,
                    error = %save_error,
                    "Failed to save statuses of the failed page"
                );
            }
            request.fail(message, Utc::now());
            if let Err(save_error) = self.ledger.save_export_request(request).await {
                tracing::error!(
                    export_request_id = %request.id,
                    error = %save_error,
                    "Failed to save the failed export request"
                );
            }
            return Err(error);
        }

        request.finish(Utc::now());
        self.ledger.save_export_request(request).await?;

        let summary = summary.with_duration(started.elapsed());
        summary.log_summary();
        Ok(summary)
    }

    async fn export_page(
        &self,
        request: &mut ExportRequest,
        units: &mut [ExportUnit],
        attempted: &[usize],
        apis: &mut ApiCache,
        summary: &mut ExportSummary,
    ) -> std::result::Result<(), PageFailure> {
        let org_units = self.prefetch_org_units(units, attempted).await?;

        let mut groups: BTreeMap<MappingVersionId, BatchGroup> = BTreeMap::new();
        let mut tracker = Vec::new();
        let mut field_errors: Vec<FieldError> = Vec::new();

        for &index in attempted {
            let unit = &units[index];
            let (Some(instance), Some(mapping_version)) = (&unit.instance, &unit.mapping_version)
            else {
                continue;
            };

            let mapped = match mapping_version.mapping_type {
                MappingType::Aggregate => {
                    aggregate::map_to_values(instance, &mapping_version.definition, &org_units)
                }
                MappingType::Event => {
                    event::map_to_values(instance, &mapping_version.definition, &org_units)
                }
                MappingType::EventTracker => {
                    tracker.push(index);
                    continue;
                }
                MappingType::Derived => continue,
            };

            match mapped {
                Ok(payload) => {
                    let group = groups
                        .entry(mapping_version.id)
                        .or_insert_with(|| BatchGroup {
                            mapping_version: mapping_version.clone(),
                            units: Vec::new(),
                            payloads: Vec::new(),
                        });
                    group.units.push(index);
                    group.payloads.push(payload);
                }
                Err(errors) => {
                    tracing::debug!(
                        instance_id = %instance.id,
                        mapping_version_id = %mapping_version.id,
                        errors = errors.len(),
                        "Submission could not be mapped"
                    );
                    field_errors.extend(errors);
                }
            }
        }

        if !field_errors.is_empty() {
            return Err(PageFailure {
                error_type: ExportErrorType::Mapping,
                error: InstanceExportError::from_field_errors(PAGE_ERROR_MESSAGE, &field_errors)
                    .into(),
            });
        }

        for group in groups.values() {
            let api = self.api_for(&group.mapping_version, apis)?;
            let mut logger = ApiLogger::new(api);
            let sent = match group.mapping_version.mapping_type {
                MappingType::Aggregate => aggregate::export_page(&group.payloads, &mut logger).await,
                _ => event::export_page(&group.payloads, &mut logger).await,
            };
            self.persist_logs(&mut logger, units, &group.units).await?;
            sent?;
        }

        let flagged: Vec<usize> = groups
            .values()
            .flat_map(|group| group.units.iter().copied())
            .collect();
        if !flagged.is_empty() {
            let mut exported_ids = BTreeSet::new();
            for &index in &flagged {
                units[index].status.mark_exported()?;
                if let Some(instance) = &units[index].instance {
                    exported_ids.insert(instance.id);
                }
            }
            let exported_ids: Vec<InstanceId> = exported_ids.into_iter().collect();
            self.instances.mark_exported(&exported_ids, Utc::now()).await?;
            request.record_exported(flagged.len() as u64);
            summary.exported += flagged.len();
        }

        for index in tracker {
            self.export_tracked_unit(request, &mut units[index], &org_units, apis, summary)
                .await?;
        }

        Ok(())
    }

    /// Exports one EVENT_TRACKER unit; DHIS2 and identity failures only error this unit
    async fn export_tracked_unit(
        &self,
        request: &mut ExportRequest,
        unit: &mut ExportUnit,
        org_units: &OrgUnitIndex,
        apis: &mut ApiCache,
        summary: &mut ExportSummary,
    ) -> Result<()> {
        let ExportUnit {
            status,
            instance,
            mapping_version,
        } = unit;
        let (Some(instance), Some(mapping_version)) = (instance.as_ref(), mapping_version.as_ref())
        else {
            return Ok(());
        };

        let api = self.api_for(mapping_version, apis)?;
        let mut logger = ApiLogger::new(api);
        let outcome = event_tracker::export_instance(
            &mut logger,
            instance,
            &mapping_version.definition,
            org_units,
        )
        .await;

        let logs = logger.pop_export_logs();
        if !logs.is_empty() {
            let logs = self.ledger.insert_export_logs(logs).await?;
            status.attach_logs(&logs);
        }

        match outcome {
            Ok(reference) => {
                status.mark_exported()?;
                self.instances
                    .mark_exported(&[instance.id], Utc::now())
                    .await?;
                request.record_exported(1);
                summary.exported += 1;
                tracing::debug!(
                    instance_id = %instance.id,
                    tracked_entity = %reference,
                    "Tracked entity exported"
                );
            }
            Err(err) if is_isolated(&err) => {
                let message = err.to_string();
                tracing::warn!(
                    instance_id = %instance.id,
                    mapping_version_id = %mapping_version.id,
                    error = %message,
                    "Tracked entity export failed"
                );
                status.mark_errored(message.clone())?;
                request.record_errored(1, message);
                summary.errored += 1;
                summary.add_error(
                    ExportError::from_error(&err).with_context(format!("instance {}", instance.id)),
                );
            }
            Err(err) => return Err(err),
        }

        self.ledger
            .save_export_statuses(std::slice::from_ref(&*status))
            .await
    }

    fn api_for(
        &self,
        mapping_version: &MappingVersion,
        apis: &mut ApiCache,
    ) -> Result<Arc<dyn Dhis2Api>> {
        if let Some(api) = apis.get(&mapping_version.id) {
            return Ok(api.clone());
        }
        let credentials = mapping_version.credentials.as_ref().ok_or_else(|| {
            IasoError::Configuration(format!(
                "mapping version {} ({}) has no DHIS2 data source credentials",
                mapping_version.id, mapping_version.name
            ))
        })?;
        let api = self.api_factory.create(credentials)?;
        apis.insert(mapping_version.id, api.clone());
        Ok(api)
    }

    /// Resolves the DHIS2 references of org units given as answers
    async fn prefetch_org_units(
        &self,
        units: &[ExportUnit],
        attempted: &[usize],
    ) -> Result<OrgUnitIndex> {
        let mut ids = BTreeSet::new();
        for &index in attempted {
            let unit = &units[index];
            let (Some(instance), Some(mapping_version)) = (&unit.instance, &unit.mapping_version)
            else {
                continue;
            };
            let questions = org_unit_questions(&mapping_version.definition);
            if questions.is_empty() {
                continue;
            }
            for (key, value) in instance.answers().into_iter().flatten() {
                collect_org_unit_ids(key, value, &questions, &mut ids);
            }
        }
        if ids.is_empty() {
            return Ok(OrgUnitIndex::default());
        }

        let ids: Vec<OrgUnitId> = ids.into_iter().collect();
        let refs = self.instances.org_unit_source_refs(&ids).await?;
        Ok(OrgUnitIndex::new(refs))
    }

    async fn persist_logs(
        &self,
        logger: &mut ApiLogger,
        units: &mut [ExportUnit],
        indices: &[usize],
    ) -> Result<()> {
        let logs = logger.pop_export_logs();
        if logs.is_empty() {
            return Ok(());
        }
        let logs = self.ledger.insert_export_logs(logs).await?;
        for &index in indices {
            units[index].status.attach_logs(&logs);
        }
        Ok(())
    }

    async fn save_statuses(&self, units: &[ExportUnit]) -> Result<()> {
        let statuses: Vec<_> = units.iter().map(|unit| unit.status.clone()).collect();
        self.ledger.save_export_statuses(&statuses).await
    }

    async fn save_page(&self, request: &ExportRequest, units: &[ExportUnit]) -> Result<()> {
        self.save_statuses(units).await?;
        self.ledger.save_export_request(request).await
    }
}

/// Picks the units of a page to export and moves them to RUNNING
///
/// Units without answers, without a mapping version, or with a DERIVED
/// mapping are skipped and stay QUEUED. Units already terminal are left
/// alone.
fn claim_units(units: &mut [ExportUnit], summary: &mut ExportSummary) -> Vec<usize> {
    let mut attempted = Vec::with_capacity(units.len());
    for (index, unit) in units.iter_mut().enumerate() {
        if unit.status.status.is_terminal() {
            continue;
        }

        let reason = match (&unit.instance, &unit.mapping_version) {
            (None, _) => Some("submission not found"),
            (Some(instance), _) if instance.json.is_none() => Some("submission has no answers"),
            (_, None) => Some("mapping version not found"),
            (_, Some(mapping_version)) if mapping_version.mapping_type == MappingType::Derived => {
                Some("DERIVED mapping")
            }
            _ => None,
        };
        if let Some(reason) = reason {
            tracing::warn!(
                export_status_id = %unit.status.id,
                instance_id = %unit.status.instance_id,
                mapping_version_id = %unit.status.mapping_version_id,
                reason,
                "Skipping export unit"
            );
            summary.skipped += 1;
            continue;
        }

        if unit.status.status == ExportState::Queued {
            unit.status.status = ExportState::Running;
        }
        attempted.push(index);
    }
    attempted
}

/// Marks the attempted units that did not reach a terminal state as ERRORED
fn mark_errored(units: &mut [ExportUnit], attempted: &[usize], message: &str) -> usize {
    let mut errored = 0;
    for &index in attempted {
        let status = &mut units[index].status;
        if status.status.is_alive() && status.mark_errored(message).is_ok() {
            errored += 1;
        }
    }
    errored
}

fn failure_message(error: &IasoError) -> String {
    match error {
        IasoError::InstanceExport(err) => err.to_string(),
        other => format!("{other:?}"),
    }
}

/// Errors that fail a single tracked entity submission instead of the page
fn is_isolated(error: &IasoError) -> bool {
    matches!(
        error,
        IasoError::InstanceExport(_)
            | IasoError::Dhis2(_)
            | IasoError::TrackedEntityNotFound { .. }
    )
}

/// Question keys holding org unit ids
fn org_unit_questions(definition: &MappingDefinition) -> HashSet<&str> {
    definition
        .question_mappings
        .iter()
        .filter(|(_, mappings)| {
            mappings.iter().any(|mapping| match mapping {
                QuestionMapping::SimpleDataElement(element)
                | QuestionMapping::TrackedAttribute(element)
                | QuestionMapping::StageDataValue { element, .. } => {
                    element.value_type == ValueType::OrganisationUnit
                }
                _ => false,
            })
        })
        .map(|(key, _)| key.as_str())
        .collect()
}

fn collect_org_unit_ids(
    key: &str,
    value: &Value,
    questions: &HashSet<&str>,
    ids: &mut BTreeSet<OrgUnitId>,
) {
    let leaf = key.rsplit('/').next().unwrap_or(key);
    match value {
        Value::String(s) if questions.contains(leaf) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(id) = s.parse::<i64>() {
                    ids.insert(OrgUnitId::new(id));
                }
            }
        }
        Value::Number(n) if questions.contains(leaf) => {
            if let Some(id) = n.as_i64() {
                ids.insert(OrgUnitId::new(id));
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_org_unit_ids(key, item, questions, ids);
            }
        }
        Value::Object(entries) => {
            for (key, value) in entries {
                collect_org_unit_ids(key, value, questions, ids);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::dhis2::api::{ApiResponse, Dhis2Result};
    use crate::adapters::memory::MemoryStore;
    use crate::config::secret_string;
    use crate::core::export::ExportRequestBuilder;
    use crate::domain::{
        AccountId, Dhis2Credentials, Dhis2Error, FormId, InstanceBuilder, InstanceFilters,
        Launcher, OrgUnit, UserId,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers every call from a script; falls back to a SUCCESS import
    #[derive(Default)]
    struct FakeApi {
        responses: Mutex<VecDeque<Dhis2Result<Value>>>,
        calls: Mutex<Vec<(String, String, Value)>>,
    }

    impl FakeApi {
        fn respond(&self, method: &str, path: &str, body: Value) -> Dhis2Result<ApiResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), path.to_string(), body));
            let next = self.responses.lock().unwrap().pop_front();
            let value = match next {
                Some(outcome) => outcome?,
                None => json!({"status": "SUCCESS", "importCount": {"imported": 1}}),
            };
            Ok(ApiResponse {
                url: format!("https://dhis2.test/api/{path}"),
                status: 200,
                body: value.to_string(),
            })
        }

        fn paths(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(method, path, _)| format!("{method} {path}"))
                .collect()
        }
    }

    #[async_trait]
    impl Dhis2Api for FakeApi {
        fn base_url(&self) -> &str {
            "https://dhis2.test"
        }

        async fn get(&self, path: &str, _query: &[(&str, &str)]) -> Dhis2Result<ApiResponse> {
            self.respond("GET", path, Value::Null)
        }

        async fn post(&self, path: &str, body: &Value) -> Dhis2Result<ApiResponse> {
            self.respond("POST", path, body.clone())
        }

        async fn put(&self, path: &str, body: &Value) -> Dhis2Result<ApiResponse> {
            self.respond("PUT", path, body.clone())
        }
    }

    struct FakeFactory(Arc<FakeApi>);

    impl Dhis2ApiFactory for FakeFactory {
        fn create(&self, _credentials: &Dhis2Credentials) -> Result<Arc<dyn Dhis2Api>> {
            Ok(self.0.clone())
        }
    }

    fn credentials() -> Dhis2Credentials {
        Dhis2Credentials {
            name: "play".to_string(),
            url: "https://dhis2.test".to_string(),
            login: "admin".to_string(),
            password: secret_string("district".to_string()),
        }
    }

    fn mapping_version(id: i64, mapping_type: MappingType, definition: Value) -> MappingVersion {
        MappingVersion {
            id: MappingVersionId::new(id),
            name: format!("mapping {id}"),
            mapping_type,
            form_id: FormId::new(1),
            form_version: "v1".to_string(),
            repeat_groups: vec![],
            definition: MappingDefinition::parse(mapping_type, &definition, &[]).unwrap(),
            credentials: Some(credentials()),
        }
    }

    fn add_instances(store: &MemoryStore, answers: &[Value]) {
        for (i, answer) in answers.iter().enumerate() {
            let id = i as i64 + 1;
            let mut json = answer.clone();
            json["_version"] = json!("v1");
            store
                .add_instance(
                    InstanceBuilder::new()
                        .id(InstanceId::new(id))
                        .account_id(AccountId::new(1))
                        .form_id(FormId::new(1))
                        .org_unit(OrgUnit::new(OrgUnitId::new(100 + id), "Clinic", Some("ouClinic")))
                        .period("202301")
                        .json(json)
                        .build()
                        .unwrap(),
                )
                .unwrap();
        }
    }

    async fn queued_request(repositories: &Repositories) -> ExportRequest {
        ExportRequestBuilder::new(repositories)
            .build_export_request(
                InstanceFilters::default(),
                Launcher {
                    user_id: UserId::new(1),
                    account_id: AccountId::new(1),
                },
                false,
                None,
            )
            .await
            .unwrap()
    }

    fn event_mapping() -> MappingVersion {
        mapping_version(
            1,
            MappingType::Event,
            json!({
                "program_id": "progVisit",
                "question_mappings": {"weight": {"id": "deWeight", "valueType": "NUMBER"}}
            }),
        )
    }

    #[tokio::test]
    async fn test_exports_event_pages() {
        let store = Arc::new(MemoryStore::new());
        add_instances(
            &store,
            &[json!({"weight": "1"}), json!({"weight": "2"}), json!({"weight": "3"})],
        );
        store.add_mapping_version(event_mapping()).unwrap();
        let repositories = Repositories::from_store(store.clone());
        let mut request = queued_request(&repositories).await;

        let api = Arc::new(FakeApi::default());
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())));
        let summary = exporter.export_instances(&mut request, 2, false).await.unwrap();

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.exported, 3);
        assert!(summary.is_successful());
        assert_eq!(request.status, ExportState::Exported);
        assert!(request.finished);
        assert_eq!(request.exported_count, 3);
        assert_eq!(api.paths(), vec!["POST events", "POST events"]);

        let statuses = store.export_statuses(request.id).unwrap();
        assert!(statuses.iter().all(|s| s.status == ExportState::Exported));
        assert!(statuses.iter().all(|s| s.export_log_ids.len() == 1));
        assert!(store
            .instance(InstanceId::new(2))
            .unwrap()
            .unwrap()
            .last_export_success_at
            .is_some());
    }

    #[tokio::test]
    async fn test_mapping_error_fails_page_before_any_call() {
        let store = Arc::new(MemoryStore::new());
        add_instances(&store, &[json!({"weight": "1"}), json!({"weight": "heavy"})]);
        store.add_mapping_version(event_mapping()).unwrap();
        let repositories = Repositories::from_store(store.clone());
        let mut request = queued_request(&repositories).await;

        let api = Arc::new(FakeApi::default());
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())));
        let err = exporter
            .export_instances(&mut request, 25, false)
            .await
            .unwrap_err();

        assert!(err.is_business_error());
        assert!(api.paths().is_empty());
        assert_eq!(request.status, ExportState::Errored);
        assert_eq!(request.errored_count, 2);
        assert_eq!(
            request.last_error_message.as_deref(),
            Some("ERROR while processing page: weight invalid numeric value 'heavy'")
        );

        let stored = repositories
            .ledger
            .get_export_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ExportState::Errored);
        assert!(store
            .export_statuses(request.id)
            .unwrap()
            .iter()
            .all(|s| s.status == ExportState::Errored));
    }

    #[tokio::test]
    async fn test_continue_on_error_moves_to_next_page() {
        let store = Arc::new(MemoryStore::new());
        add_instances(
            &store,
            &[json!({"weight": "heavy"}), json!({"weight": "2"}), json!({"weight": "3"})],
        );
        store.add_mapping_version(event_mapping()).unwrap();
        let repositories = Repositories::from_store(store.clone());
        let mut request = queued_request(&repositories).await;

        let api = Arc::new(FakeApi::default());
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())));
        let summary = exporter.export_instances(&mut request, 1, true).await.unwrap();

        assert_eq!(summary.exported, 2);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].error_type, ExportErrorType::Mapping);
        assert_eq!(request.status, ExportState::Errored);
        assert_eq!(request.exported_count, 2);
        assert_eq!(request.errored_count, 1);
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal_even_with_continue_on_error() {
        let store = Arc::new(MemoryStore::new());
        add_instances(&store, &[json!({"weight": "1"}), json!({"weight": "2"})]);
        store.add_mapping_version(event_mapping()).unwrap();
        let repositories = Repositories::from_store(store.clone());
        let mut request = queued_request(&repositories).await;

        let api = Arc::new(FakeApi::default());
        api.responses
            .lock()
            .unwrap()
            .push_back(Err(Dhis2Error::Connection("connection refused".to_string())));
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())));
        let err = exporter
            .export_instances(&mut request, 1, true)
            .await
            .unwrap_err();

        assert!(matches!(err, IasoError::Dhis2(Dhis2Error::Connection(_))));
        assert_eq!(api.paths().len(), 1);
        assert_eq!(request.status, ExportState::Errored);
        assert!(request
            .last_error_message
            .as_deref()
            .unwrap()
            .contains("Connection"));

        let statuses = store.export_statuses(request.id).unwrap();
        assert_eq!(statuses[0].status, ExportState::Errored);
        assert_eq!(statuses[1].status, ExportState::Queued);
    }

    #[tokio::test]
    async fn test_units_without_answers_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        add_instances(&store, &[json!({"weight": "1"})]);
        store.add_mapping_version(event_mapping()).unwrap();
        let repositories = Repositories::from_store(store.clone());
        let mut request = queued_request(&repositories).await;

        let mut instance = store.instance(InstanceId::new(1)).unwrap().unwrap();
        instance.json = None;
        store.add_instance(instance).unwrap();

        let api = Arc::new(FakeApi::default());
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())));
        let summary = exporter.export_instances(&mut request, 25, false).await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.exported, 0);
        assert!(api.paths().is_empty());
        assert_eq!(request.status, ExportState::Exported);
        assert_eq!(
            store.export_statuses(request.id).unwrap()[0].status,
            ExportState::Queued
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_abort_the_run() {
        let store = Arc::new(MemoryStore::new());
        add_instances(&store, &[json!({"weight": "1"})]);
        let mut mapping = event_mapping();
        mapping.credentials = None;
        store.add_mapping_version(mapping).unwrap();
        let repositories = Repositories::from_store(store);
        let mut request = queued_request(&repositories).await;

        let exporter = DataValueExporter::new(
            &repositories,
            Arc::new(FakeFactory(Arc::new(FakeApi::default()))),
        );
        let err = exporter
            .export_instances(&mut request, 25, true)
            .await
            .unwrap_err();
        assert!(matches!(err, IasoError::Configuration(_)));
        assert_eq!(request.status, ExportState::Errored);
    }

    #[tokio::test]
    async fn test_shutdown_kills_request_between_pages() {
        let store = Arc::new(MemoryStore::new());
        add_instances(&store, &[json!({"weight": "1"})]);
        store.add_mapping_version(event_mapping()).unwrap();
        let repositories = Repositories::from_store(store);
        let mut request = queued_request(&repositories).await;

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let api = Arc::new(FakeApi::default());
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())))
            .with_shutdown(rx);

        let err = exporter
            .export_instances(&mut request, 25, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IasoError::Cancelled));
        assert_eq!(request.status, ExportState::Killed);
        assert!(request.finished);
        assert!(api.paths().is_empty());
    }

    #[tokio::test]
    async fn test_tracker_failure_does_not_stop_siblings() {
        let store = Arc::new(MemoryStore::new());
        add_instances(&store, &[json!({"name": "Ada"}), json!({"name": "Bob"})]);
        store
            .add_mapping_version(mapping_version(
                1,
                MappingType::EventTracker,
                json!({
                    "program_id": "progCase",
                    "tracked_entity_type": "tetPerson",
                    "question_mappings": {
                        "name": {"id": "attrName", "valueType": "TEXT", "trackedEntityAttribute": true}
                    }
                }),
            ))
            .unwrap();
        let repositories = Repositories::from_store(store.clone());
        let mut request = queued_request(&repositories).await;

        let api = Arc::new(FakeApi::default());
        api.responses.lock().unwrap().extend([
            Ok(json!({
                "status": "ERROR",
                "response": {"importSummaries": [{"status": "ERROR", "description": "Program has no stage"}]}
            })),
            Ok(json!({
                "status": "OK",
                "response": {"importSummaries": [{"status": "SUCCESS", "reference": "tei00000002"}]}
            })),
        ]);
        let exporter = DataValueExporter::new(&repositories, Arc::new(FakeFactory(api.clone())));
        let summary = exporter.export_instances(&mut request, 25, false).await.unwrap();

        assert_eq!(summary.exported, 1);
        assert_eq!(summary.errored, 1);
        assert_eq!(request.status, ExportState::Errored);

        let statuses = store.export_statuses(request.id).unwrap();
        assert_eq!(statuses[0].status, ExportState::Errored);
        assert_eq!(
            statuses[0].last_error_message.as_deref(),
            Some("ERROR while processing submission: Program has no stage")
        );
        assert_eq!(statuses[1].status, ExportState::Exported);
        assert_eq!(statuses[1].export_log_ids.len(), 1);
    }

    #[test]
    fn test_collects_org_unit_ids_from_nested_answers() {
        let definition = MappingDefinition::parse(
            MappingType::Event,
            &json!({
                "program_id": "progVisit",
                "question_mappings": {
                    "facility": {"id": "deFacility", "valueType": "ORGANISATION_UNIT"},
                    "weight": {"id": "deWeight", "valueType": "NUMBER"}
                }
            }),
            &[],
        )
        .unwrap();
        let questions = org_unit_questions(&definition);
        let answers = json!({
            "facility": "12",
            "weight": "13",
            "group": [{"group/facility": 14}, {"group/facility": "ouRef"}]
        });

        let mut ids = BTreeSet::new();
        for (key, value) in answers.as_object().unwrap() {
            collect_org_unit_ids(key, value, &questions, &mut ids);
        }
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec![OrgUnitId::new(12), OrgUnitId::new(14)]
        );
    }
}
