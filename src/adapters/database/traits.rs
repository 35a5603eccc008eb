//! Persistence traits consumed by the export pipeline
//!
//! Three seams, each implemented by both the PostgreSQL and the in-memory
//! store: submissions, mapping versions, and the export ledger.

use crate::domain::{
    EligibilityQuery, ExportLog, ExportRequest, ExportRequestId, ExportState, ExportStatus,
    ExportStatusId, ExportUnit, FormId, InstanceId, MappingVersion, NewExportLog,
    NewExportRequest, NewExportStatus, OrgUnitId, Result,
};
use crate::domain::{AccountId, Instance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Submission queries
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Number of submissions eligible for a new export request
    async fn count_eligible(&self, query: &EligibilityQuery) -> Result<u64>;

    /// Eligible submissions ordered by id, skipping `exclude`
    ///
    /// # Arguments
    ///
    /// * `query` - Eligibility rules of the request being built
    /// * `exclude` - Submissions already claimed by the request being built
    /// * `limit` - Maximum number of submissions returned
    async fn eligible_instances(
        &self,
        query: &EligibilityQuery,
        exclude: &[InstanceId],
        limit: usize,
    ) -> Result<Vec<Instance>>;

    /// DHIS2 references of local org units; units without a reference are omitted
    async fn org_unit_source_refs(&self, ids: &[OrgUnitId]) -> Result<HashMap<OrgUnitId, String>>;

    /// Records a successful export of the given submissions
    async fn mark_exported(&self, ids: &[InstanceId], at: DateTime<Utc>) -> Result<()>;
}

/// Mapping version lookup
#[async_trait]
pub trait MappingRepository: Send + Sync {
    /// Non-DERIVED mapping versions attached to a form, with parsed definitions
    ///
    /// # Errors
    ///
    /// Returns [`crate::domain::MappingError::InvalidDefinition`] (wrapped) when a stored
    /// mapping body cannot be parsed.
    async fn mapping_versions_for_form(&self, form_id: FormId) -> Result<Vec<Arc<MappingVersion>>>;
}

/// Export requests, statuses and logs
#[async_trait]
pub trait ExportLedger: Send + Sync {
    /// Persists a request together with its statuses in one transaction
    ///
    /// Submissions already claimed by a QUEUED or RUNNING request when the
    /// transaction runs are left out and `instance_count` is recounted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::domain::IasoError::NothingToExport`] when every
    /// submission was claimed in the meantime.
    async fn create_export_request(
        &self,
        request: NewExportRequest,
        statuses: Vec<NewExportStatus>,
    ) -> Result<ExportRequest>;

    async fn save_export_request(&self, request: &ExportRequest) -> Result<()>;

    async fn get_export_request(&self, id: ExportRequestId) -> Result<Option<ExportRequest>>;

    /// Requests visible to operators, newest first
    async fn list_export_requests(
        &self,
        account_id: Option<AccountId>,
        state: Option<ExportState>,
    ) -> Result<Vec<ExportRequest>>;

    async fn count_export_statuses(&self, request_id: ExportRequestId) -> Result<u64>;

    /// Statuses of a request with their submission and mapping version, ordered by status id
    async fn export_units(
        &self,
        request_id: ExportRequestId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ExportUnit>>;

    async fn save_export_statuses(&self, statuses: &[ExportStatus]) -> Result<()>;

    /// Appends audit records and returns them with their ids
    async fn insert_export_logs(&self, logs: Vec<NewExportLog>) -> Result<Vec<ExportLog>>;

    async fn export_logs_for_status(&self, status_id: ExportStatusId) -> Result<Vec<ExportLog>>;
}
