//! PostgreSQL store over the IASO schema
//!
//! Reads submissions, org units and mapping versions from the tables owned by
//! the IASO application, and maintains the export ledger tables created by
//! `migrations/001_export_ledger.sql`.

use crate::adapters::database::traits::{ExportLedger, InstanceRepository, MappingRepository};
use crate::adapters::postgresql::client::PostgreSQLClient;
use crate::adapters::postgresql::models::{
    export_log_from_row, export_request_from_row, export_status_from_row, instance_from_row,
    mapping_version_from_row, EXPORT_REQUEST_COLUMNS, INSTANCE_SELECT, MAPPING_VERSION_SELECT,
};
use crate::domain::{
    AccountId, EligibilityQuery, ExportLog, ExportRequest, ExportRequestId, ExportState,
    ExportStatus, ExportStatusId, ExportUnit, FormId, IasoError, Instance, InstanceId,
    MappingVersion, MappingVersionId, NewExportLog, NewExportRequest, NewExportStatus, OrgUnitId,
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_postgres::types::ToSql;

const LEDGER_MIGRATION: &str = include_str!("../../../migrations/001_export_ledger.sql");

/// Eligibility rules shared by the count and the page queries
///
/// Parameters: `$1` account, `$2` form ids, `$3` org unit ids, `$4` periods,
/// `$5` created from, `$6` created to, `$7` selected ids, `$8` unselected ids,
/// `$9` force export, `$10` excluded ids.
const ELIGIBILITY_WHERE: &str = r#"
    WHERE p.account_id = $1::bigint
      AND (cardinality($2::bigint[]) = 0 OR i.form_id = ANY($2))
      AND (cardinality($3::bigint[]) = 0 OR i.org_unit_id = ANY($3))
      AND (cardinality($4::text[]) = 0 OR i.period = ANY($4))
      AND ($5::timestamptz IS NULL OR i.created_at >= $5)
      AND ($6::timestamptz IS NULL OR i.created_at <= $6)
      AND (cardinality($7::bigint[]) = 0 OR i.id = ANY($7))
      AND NOT (i.id = ANY($8::bigint[]))
      AND NOT i.deleted
      AND COALESCE(i.file, '') <> ''
      AND NOT COALESCE(d.test_device, FALSE)
      AND ($9::boolean OR i.last_export_success_at IS NULL)
      AND NOT (i.id = ANY($10::bigint[]))
      AND NOT EXISTS (
          SELECT 1 FROM iaso_exportstatus s
          JOIN iaso_exportrequest r ON r.id = s.export_request_id
          WHERE s.instance_id = i.id AND r.status IN ('QUEUED', 'RUNNING')
      )
      AND NOT (f.single_per_period AND EXISTS (
          SELECT 1 FROM iaso_instance o
          WHERE o.id <> i.id
            AND NOT o.deleted
            AND o.form_id = i.form_id
            AND o.period IS NOT DISTINCT FROM i.period
            AND o.org_unit_id IS NOT DISTINCT FROM i.org_unit_id
      ))
"#;

/// Transaction lock held per account while submissions are claimed (`$1` account)
const CLAIM_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtextextended('iaso_export_claim', $1::bigint))";

/// Candidate submissions (`$1`) already referenced by a QUEUED or RUNNING request
const CLAIMED_INSTANCES: &str = r#"
    SELECT DISTINCT s.instance_id
    FROM iaso_exportstatus s
    JOIN iaso_exportrequest r ON r.id = s.export_request_id
    WHERE s.instance_id = ANY($1::bigint[]) AND r.status IN ('QUEUED', 'RUNNING')
"#;

const STATUS_SELECT: &str = r#"
    SELECT s.id, s.export_request_id, s.instance_id, s.mapping_version_id, s.status,
           s.last_error_message,
           COALESCE(
               ARRAY(SELECT l.exportlog_id FROM iaso_exportstatus_export_logs l
                     WHERE l.exportstatus_id = s.id ORDER BY l.exportlog_id),
               '{}'
           ) AS export_log_ids
    FROM iaso_exportstatus s
"#;

/// Bound parameters of [`ELIGIBILITY_WHERE`]
struct EligibilityParams {
    account_id: i64,
    form_ids: Vec<i64>,
    org_unit_ids: Vec<i64>,
    periods: Vec<String>,
    created_from: Option<DateTime<Utc>>,
    created_to: Option<DateTime<Utc>>,
    selected_ids: Vec<i64>,
    unselected_ids: Vec<i64>,
    force_export: bool,
    exclude: Vec<i64>,
}

impl EligibilityParams {
    fn new(query: &EligibilityQuery, exclude: &[InstanceId]) -> Self {
        let ids = |ids: &[InstanceId]| ids.iter().map(InstanceId::value).collect::<Vec<_>>();
        let (selected_ids, unselected_ids) = query
            .selection
            .as_ref()
            .map(|s| (ids(&s.selected_ids), ids(&s.unselected_ids)))
            .unwrap_or_default();

        Self {
            account_id: query.account_id.value(),
            form_ids: query.filters.form_ids.iter().map(FormId::value).collect(),
            org_unit_ids: query.filters.org_unit_ids.iter().map(OrgUnitId::value).collect(),
            periods: query.filters.periods.clone(),
            created_from: query.filters.created_from,
            created_to: query.filters.created_to,
            selected_ids,
            unselected_ids,
            force_export: query.force_export,
            exclude: ids(exclude),
        }
    }

    fn as_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        vec![
            &self.account_id,
            &self.form_ids,
            &self.org_unit_ids,
            &self.periods,
            &self.created_from,
            &self.created_to,
            &self.selected_ids,
            &self.unselected_ids,
            &self.force_export,
            &self.exclude,
        ]
    }
}

/// PostgreSQL implementation of the persistence traits
pub struct PostgresStore {
    client: Arc<PostgreSQLClient>,
}

impl PostgresStore {
    pub fn new(client: Arc<PostgreSQLClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<PostgreSQLClient> {
        &self.client
    }

    /// Creates the ledger tables if they are missing
    pub async fn ensure_ledger_schema(&self) -> Result<()> {
        let conn = self.client.get_connection().await?;
        conn.batch_execute(LEDGER_MIGRATION)
            .await
            .map_err(|e| IasoError::Database(format!("Failed to apply ledger schema: {e}")))?;
        tracing::debug!("Export ledger schema ensured");
        Ok(())
    }

    async fn instances_by_ids(&self, ids: &[i64]) -> Result<HashMap<InstanceId, Instance>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.client.get_connection().await?;
        let sql = format!("{INSTANCE_SELECT} WHERE i.id = ANY($1::bigint[])");
        let rows = conn.query(sql.as_str(), &[&ids]).await?;
        rows.iter()
            .map(|row| instance_from_row(row).map(|i| (i.id, i)))
            .collect()
    }

    async fn mapping_versions_by_ids(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<MappingVersionId, Arc<MappingVersion>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.client.get_connection().await?;
        let sql = format!("{MAPPING_VERSION_SELECT} WHERE mv.id = ANY($1::bigint[])");
        let rows = conn.query(sql.as_str(), &[&ids]).await?;
        rows.iter()
            .map(|row| mapping_version_from_row(row).map(|mv| (mv.id, Arc::new(mv))))
            .collect()
    }
}

#[async_trait]
impl InstanceRepository for PostgresStore {
    async fn count_eligible(&self, query: &EligibilityQuery) -> Result<u64> {
        let params = EligibilityParams::new(query, &[]);
        let sql = format!(
            "SELECT COUNT(*) FROM iaso_instance i \
             JOIN iaso_project p ON p.id = i.project_id \
             JOIN iaso_form f ON f.id = i.form_id \
             LEFT JOIN iaso_device d ON d.id = i.device_id \
             {ELIGIBILITY_WHERE}"
        );
        let conn = self.client.get_connection().await?;
        let row = conn.query_one(sql.as_str(), &params.as_params()).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn eligible_instances(
        &self,
        query: &EligibilityQuery,
        exclude: &[InstanceId],
        limit: usize,
    ) -> Result<Vec<Instance>> {
        let params = EligibilityParams::new(query, exclude);
        let limit = limit as i64;
        let mut bound = params.as_params();
        bound.push(&limit);

        let sql = format!("{INSTANCE_SELECT} {ELIGIBILITY_WHERE} ORDER BY i.id LIMIT $11");
        let conn = self.client.get_connection().await?;
        let rows = conn.query(sql.as_str(), &bound).await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn org_unit_source_refs(&self, ids: &[OrgUnitId]) -> Result<HashMap<OrgUnitId, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<i64> = ids.iter().map(OrgUnitId::value).collect();
        let conn = self.client.get_connection().await?;
        let rows = conn
            .query(
                "SELECT id::int8 AS id, source_ref FROM iaso_orgunit \
                 WHERE id = ANY($1::bigint[]) AND NULLIF(TRIM(source_ref), '') IS NOT NULL",
                &[&ids],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let source_ref: String = row.try_get("source_ref")?;
                Ok((OrgUnitId::new(id), source_ref.trim().to_string()))
            })
            .collect()
    }

    async fn mark_exported(&self, ids: &[InstanceId], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(InstanceId::value).collect();
        let conn = self.client.get_connection().await?;
        conn.execute(
            "UPDATE iaso_instance SET last_export_success_at = $2, to_export = FALSE \
             WHERE id = ANY($1::bigint[])",
            &[&ids, &at],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MappingRepository for PostgresStore {
    async fn mapping_versions_for_form(&self, form_id: FormId) -> Result<Vec<Arc<MappingVersion>>> {
        let conn = self.client.get_connection().await?;
        let sql = format!(
            "{MAPPING_VERSION_SELECT} WHERE m.form_id = $1::bigint AND m.mapping_type <> 'DERIVED' \
             ORDER BY mv.id"
        );
        let rows = conn.query(sql.as_str(), &[&form_id.value()]).await?;
        rows.iter()
            .map(|row| mapping_version_from_row(row).map(Arc::new))
            .collect()
    }
}

#[async_trait]
impl ExportLedger for PostgresStore {
    async fn create_export_request(
        &self,
        mut request: NewExportRequest,
        statuses: Vec<NewExportStatus>,
    ) -> Result<ExportRequest> {
        let mut conn = self.client.get_connection().await?;
        let tx = conn.transaction().await?;

        // Builders of one account are serialized until commit, so the claim
        // check below sees every request queued before this one
        tx.execute(CLAIM_LOCK, &[&request.launcher.account_id.value()])
            .await?;

        let candidates: Vec<i64> = statuses.iter().map(|s| s.instance_id.value()).collect();
        let claimed: HashSet<InstanceId> = tx
            .query(CLAIMED_INSTANCES, &[&candidates])
            .await?
            .iter()
            .map(|row| row.try_get::<_, i64>(0).map(InstanceId::new))
            .collect::<std::result::Result<_, _>>()?;
        let wanted = statuses.len();
        let statuses = request.release_claimed(statuses, &claimed)?;
        if statuses.len() < wanted {
            tracing::warn!(
                account_id = %request.launcher.account_id,
                skipped = claimed.len(),
                "Submissions claimed by another export request were left out"
            );
        }

        let instance_ids: Vec<i64> = statuses.iter().map(|s| s.instance_id.value()).collect();
        let mapping_version_ids: Vec<i64> = statuses
            .iter()
            .map(|s| s.mapping_version_id.value())
            .collect();
        let instance_count = request.instance_count as i64;

        let sql = format!(
            "INSERT INTO iaso_exportrequest \
             (params, launcher_id, account_id, status, instance_count, queued_at) \
             VALUES ($1, $2, $3, 'QUEUED', $4, $5) \
             RETURNING {EXPORT_REQUEST_COLUMNS}"
        );
        let row = tx
            .query_one(
                sql.as_str(),
                &[
                    &request.params,
                    &request.launcher.user_id.value(),
                    &request.launcher.account_id.value(),
                    &instance_count,
                    &request.queued_at,
                ],
            )
            .await?;
        let created = export_request_from_row(&row)?;

        tx.execute(
            "INSERT INTO iaso_exportstatus (export_request_id, instance_id, mapping_version_id, status) \
             SELECT $1, u.instance_id, u.mapping_version_id, 'QUEUED' \
             FROM UNNEST($2::bigint[], $3::bigint[]) AS u(instance_id, mapping_version_id)",
            &[&created.id.value(), &instance_ids, &mapping_version_ids],
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(
            export_request_id = %created.id,
            statuses = statuses.len(),
            "Export request persisted"
        );
        Ok(created)
    }

    async fn save_export_request(&self, request: &ExportRequest) -> Result<()> {
        let conn = self.client.get_connection().await?;
        let updated = conn
            .execute(
                "UPDATE iaso_exportrequest SET \
                 status = $2, instance_count = $3, exported_count = $4, errored_count = $5, \
                 continue_on_error = $6, last_error_message = $7, finished = $8, \
                 started_at = $9, ended_at = $10 \
                 WHERE id = $1",
                &[
                    &request.id.value(),
                    &request.status.as_str(),
                    &(request.instance_count as i64),
                    &(request.exported_count as i64),
                    &(request.errored_count as i64),
                    &request.continue_on_error,
                    &request.last_error_message,
                    &request.finished,
                    &request.started_at,
                    &request.ended_at,
                ],
            )
            .await?;

        if updated == 0 {
            return Err(IasoError::Database(format!(
                "export request {} does not exist",
                request.id
            )));
        }
        Ok(())
    }

    async fn get_export_request(&self, id: ExportRequestId) -> Result<Option<ExportRequest>> {
        let conn = self.client.get_connection().await?;
        let sql = format!("SELECT {EXPORT_REQUEST_COLUMNS} FROM iaso_exportrequest WHERE id = $1");
        conn.query_opt(sql.as_str(), &[&id.value()])
            .await?
            .as_ref()
            .map(export_request_from_row)
            .transpose()
    }

    async fn list_export_requests(
        &self,
        account_id: Option<AccountId>,
        state: Option<ExportState>,
    ) -> Result<Vec<ExportRequest>> {
        let account_id = account_id.map(|a| a.value());
        let state = state.map(|s| s.as_str().to_string());
        let conn = self.client.get_connection().await?;
        let sql = format!(
            "SELECT {EXPORT_REQUEST_COLUMNS} FROM iaso_exportrequest \
             WHERE ($1::bigint IS NULL OR account_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY id DESC"
        );
        let rows = conn.query(sql.as_str(), &[&account_id, &state]).await?;
        rows.iter().map(export_request_from_row).collect()
    }

    async fn count_export_statuses(&self, request_id: ExportRequestId) -> Result<u64> {
        let conn = self.client.get_connection().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM iaso_exportstatus WHERE export_request_id = $1",
                &[&request_id.value()],
            )
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn export_units(
        &self,
        request_id: ExportRequestId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ExportUnit>> {
        let statuses: Vec<ExportStatus> = {
            let conn = self.client.get_connection().await?;
            let sql = format!(
                "{STATUS_SELECT} WHERE s.export_request_id = $1 ORDER BY s.id OFFSET $2 LIMIT $3"
            );
            let rows = conn
                .query(
                    sql.as_str(),
                    &[&request_id.value(), &(offset as i64), &(limit as i64)],
                )
                .await?;
            rows.iter().map(export_status_from_row).collect::<Result<_>>()?
        };

        let instance_ids: Vec<i64> = statuses.iter().map(|s| s.instance_id.value()).collect();
        let mut mapping_ids: Vec<i64> = statuses
            .iter()
            .map(|s| s.mapping_version_id.value())
            .collect();
        mapping_ids.sort_unstable();
        mapping_ids.dedup();

        let instances = self.instances_by_ids(&instance_ids).await?;
        let mapping_versions = self.mapping_versions_by_ids(&mapping_ids).await?;

        Ok(statuses
            .into_iter()
            .map(|status| ExportUnit {
                instance: instances.get(&status.instance_id).cloned(),
                mapping_version: mapping_versions.get(&status.mapping_version_id).cloned(),
                status,
            })
            .collect())
    }

    async fn save_export_statuses(&self, statuses: &[ExportStatus]) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_connection().await?;
        let tx = conn.transaction().await?;

        for status in statuses {
            tx.execute(
                "UPDATE iaso_exportstatus SET status = $2, last_error_message = $3 WHERE id = $1",
                &[
                    &status.id.value(),
                    &status.status.as_str(),
                    &status.last_error_message,
                ],
            )
            .await?;

            if !status.export_log_ids.is_empty() {
                let log_ids: Vec<i64> = status.export_log_ids.iter().map(|id| id.value()).collect();
                tx.execute(
                    "INSERT INTO iaso_exportstatus_export_logs (exportstatus_id, exportlog_id) \
                     SELECT $1, UNNEST($2::bigint[]) \
                     ON CONFLICT (exportstatus_id, exportlog_id) DO NOTHING",
                    &[&status.id.value(), &log_ids],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_export_logs(&self, logs: Vec<NewExportLog>) -> Result<Vec<ExportLog>> {
        if logs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.client.get_connection().await?;
        let tx = conn.transaction().await?;

        let mut inserted = Vec::with_capacity(logs.len());
        for log in logs {
            let http_status = i32::from(log.http_status);
            let row = tx
                .query_one(
                    "INSERT INTO iaso_exportlog (sent, received, url, http_status) \
                     VALUES ($1, $2, $3, $4) \
                     RETURNING id, sent, received, url, http_status, created_at",
                    &[&log.sent, &log.received, &log.url, &http_status],
                )
                .await?;
            inserted.push(export_log_from_row(&row)?);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn export_logs_for_status(&self, status_id: ExportStatusId) -> Result<Vec<ExportLog>> {
        let conn = self.client.get_connection().await?;
        let rows = conn
            .query(
                "SELECT l.id, l.sent, l.received, l.url, l.http_status, l.created_at \
                 FROM iaso_exportlog l \
                 JOIN iaso_exportstatus_export_logs sl ON sl.exportlog_id = l.id \
                 WHERE sl.exportstatus_id = $1 \
                 ORDER BY l.id",
                &[&status_id.value()],
            )
            .await?;
        rows.iter().map(export_log_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parameters_are_bound_as_bigint() {
        for parameter in ["$1::bigint", "$2::bigint[]", "$7::bigint[]", "$8::bigint[]", "$10::bigint[]"] {
            assert!(ELIGIBILITY_WHERE.contains(parameter), "{parameter}");
        }
        assert!(CLAIMED_INSTANCES.contains("ANY($1::bigint[])"));
    }

    #[test]
    fn test_claim_check_only_counts_alive_requests() {
        assert!(CLAIMED_INSTANCES.contains("r.status IN ('QUEUED', 'RUNNING')"));
        assert!(CLAIM_LOCK.contains("pg_advisory_xact_lock"));
    }
}
