//! Export request construction
//!
//! Selects the submissions eligible for export, resolves their mapping
//! versions, and persists the request with one QUEUED status per
//! (submission, mapping version) pair.

use crate::adapters::database::traits::{ExportLedger, InstanceRepository, MappingRepository};
use crate::adapters::database::Repositories;
use crate::core::mapping::MappingResolver;
use crate::domain::{
    EligibilityQuery, ExportRequest, IasoError, InstanceFilters, InstanceId, Launcher,
    MappingType, NewExportRequest, NewExportStatus, Result, Selection,
};
use chrono::Utc;
use serde_json::json;

/// Submissions fetched per eligibility query
pub const ELIGIBLE_PAGE_SIZE: usize = 200;

pub struct ExportRequestBuilder<'a> {
    instances: &'a dyn InstanceRepository,
    mappings: &'a dyn MappingRepository,
    ledger: &'a dyn ExportLedger,
}

impl<'a> ExportRequestBuilder<'a> {
    pub fn new(repositories: &'a Repositories) -> Self {
        Self {
            instances: repositories.instances.as_ref(),
            mappings: repositories.mappings.as_ref(),
            ledger: repositories.ledger.as_ref(),
        }
    }

    /// Builds and persists an export request
    ///
    /// Eligible submissions are fetched by always asking for the first page
    /// of the eligible set while excluding the submissions already claimed by
    /// this request, so the window advances without a cursor. Nothing is
    /// persisted until every submission has resolved its mapping versions;
    /// the request and its statuses are then written in one transaction.
    ///
    /// # Errors
    ///
    /// - [`IasoError::NothingToExport`] when no submission is eligible
    /// - [`IasoError::Mapping`] when a submission has no version tag or no mapping
    /// - [`IasoError::NotSupported`] when forcing the export of an EVENT_TRACKER mapping
    pub async fn build_export_request(
        &self,
        filters: InstanceFilters,
        launcher: Launcher,
        force_export: bool,
        selection: Option<Selection>,
    ) -> Result<ExportRequest> {
        let query = EligibilityQuery {
            account_id: launcher.account_id,
            filters,
            selection,
            force_export,
        };

        let eligible = self.instances.count_eligible(&query).await? as usize;
        if eligible == 0 {
            tracing::info!(account_id = %launcher.account_id, "Nothing to export");
            return Err(IasoError::NothingToExport);
        }
        tracing::info!(
            account_id = %launcher.account_id,
            eligible,
            force_export,
            "Building export request"
        );

        let mut resolver = MappingResolver::new(self.mappings);
        let mut claimed: Vec<InstanceId> = Vec::with_capacity(eligible);
        let mut statuses: Vec<NewExportStatus> = Vec::new();

        while claimed.len() < eligible {
            let limit = ELIGIBLE_PAGE_SIZE.min(eligible - claimed.len());
            let page = self
                .instances
                .eligible_instances(&query, &claimed, limit)
                .await?;
            if page.is_empty() {
                break;
            }

            for instance in page {
                for mapping_version in resolver.resolve(&instance).await? {
                    if force_export && mapping_version.mapping_type == MappingType::EventTracker {
                        return Err(IasoError::NotSupported(format!(
                            "force export of EVENT_TRACKER mapping '{}' (mapping version {})",
                            mapping_version.name, mapping_version.id
                        )));
                    }
                    statuses.push(NewExportStatus {
                        instance_id: instance.id,
                        mapping_version_id: mapping_version.id,
                    });
                }
                claimed.push(instance.id);
            }
        }

        let params = json!({
            "filters": query.filters,
            "selection": query.selection,
            "force_export": force_export,
        });

        let request = self
            .ledger
            .create_export_request(
                NewExportRequest {
                    params,
                    launcher,
                    instance_count: claimed.len() as u64,
                    queued_at: Utc::now(),
                },
                statuses,
            )
            .await?;

        tracing::info!(
            export_request_id = %request.id,
            instances = request.instance_count,
            "Export request queued"
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::domain::{
        AccountId, ExportState, FormId, InstanceBuilder, MappingDefinition, MappingVersion,
        MappingVersionId, OrgUnit, OrgUnitId, UserId,
    };
    use std::sync::Arc;

    fn launcher() -> Launcher {
        Launcher {
            user_id: UserId::new(9),
            account_id: AccountId::new(1),
        }
    }

    fn mapping_version(id: i64, mapping_type: MappingType) -> MappingVersion {
        MappingVersion {
            id: MappingVersionId::new(id),
            name: format!("mapping {id}"),
            mapping_type,
            form_id: FormId::new(1),
            form_version: "v1".to_string(),
            repeat_groups: vec![],
            definition: MappingDefinition::default(),
            credentials: None,
        }
    }

    fn store_with_instances(count: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=count {
            store
                .add_instance(
                    InstanceBuilder::new()
                        .id(InstanceId::new(id))
                        .account_id(AccountId::new(1))
                        .form_id(FormId::new(1))
                        .org_unit(OrgUnit::new(OrgUnitId::new(1), "Clinic", Some("ou1")))
                        .period(format!("2023{:02}", id % 12 + 1))
                        .json(json!({"_version": "v1"}))
                        .build()
                        .unwrap(),
                )
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_builds_one_status_per_instance_and_mapping() {
        let store = store_with_instances(450);
        store
            .add_mapping_version(mapping_version(1, MappingType::Aggregate))
            .unwrap();
        let repositories = Repositories::from_store(store.clone());

        let request = ExportRequestBuilder::new(&repositories)
            .build_export_request(InstanceFilters::default(), launcher(), false, None)
            .await
            .unwrap();

        assert_eq!(request.status, ExportState::Queued);
        assert_eq!(request.instance_count, 450);
        assert_eq!(request.exported_count, 0);
        assert_eq!(request.params["force_export"], json!(false));
        assert_eq!(store.export_statuses(request.id).unwrap().len(), 450);
    }

    #[tokio::test]
    async fn test_second_request_finds_nothing() {
        let store = store_with_instances(3);
        store
            .add_mapping_version(mapping_version(1, MappingType::Event))
            .unwrap();
        let repositories = Repositories::from_store(store);
        let builder = ExportRequestBuilder::new(&repositories);

        builder
            .build_export_request(InstanceFilters::default(), launcher(), false, None)
            .await
            .unwrap();
        let err = builder
            .build_export_request(InstanceFilters::default(), launcher(), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IasoError::NothingToExport));
    }

    #[tokio::test]
    async fn test_force_export_refuses_tracker_mappings() {
        let store = store_with_instances(2);
        store
            .add_mapping_version(mapping_version(1, MappingType::EventTracker))
            .unwrap();
        let repositories = Repositories::from_store(store.clone());

        let err = ExportRequestBuilder::new(&repositories)
            .build_export_request(InstanceFilters::default(), launcher(), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IasoError::NotSupported(_)));
        assert!(err.is_request_validation_error());

        let requests = repositories.ledger.list_export_requests(None, None).await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_missing_mapping_persists_nothing() {
        let store = store_with_instances(2);
        let repositories = Repositories::from_store(store);

        let err = ExportRequestBuilder::new(&repositories)
            .build_export_request(InstanceFilters::default(), launcher(), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IasoError::Mapping(_)));

        let requests = repositories.ledger.list_export_requests(None, None).await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_selection_limits_request() {
        let store = store_with_instances(5);
        store
            .add_mapping_version(mapping_version(1, MappingType::Aggregate))
            .unwrap();
        let repositories = Repositories::from_store(store.clone());

        let request = ExportRequestBuilder::new(&repositories)
            .build_export_request(
                InstanceFilters::default(),
                launcher(),
                false,
                Some(Selection {
                    selected_ids: vec![InstanceId::new(2), InstanceId::new(4)],
                    unselected_ids: vec![],
                }),
            )
            .await
            .unwrap();

        let instance_ids: Vec<i64> = store
            .export_statuses(request.id)
            .unwrap()
            .iter()
            .map(|s| s.instance_id.value())
            .collect();
        assert_eq!(instance_ids, vec![2, 4]);
    }
}
