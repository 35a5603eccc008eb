//! Row conversions for the IASO tables
//!
//! Every column is read with `try_get`, so a schema drift surfaces as a
//! database error instead of a panic.

use crate::config::secret_string;
use crate::domain::{
    AccountId, Dhis2Credentials, ExportLog, ExportLogId, ExportRequest, ExportRequestId,
    ExportState, ExportStatus, ExportStatusId, FormId, IasoError, Instance, InstanceId, Launcher,
    Location, MappingType, MappingVersion, MappingVersionId, OrgUnit, OrgUnitId, Result, UserId,
};
use crate::domain::repeat_group_names;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

/// Columns selected by [`instance_from_row`]
///
/// IASO keys are `serial` columns; they are widened to `int8` here so every
/// id is read as `i64`.
///
/// The country reference is the `source_ref` of the root of the org unit's
/// ancestor chain.
pub const INSTANCE_SELECT: &str = r#"
    SELECT
        i.id::int8 AS id, i.uuid::text AS uuid, i.export_id, p.account_id::int8 AS account_id,
        i.form_id::int8 AS form_id, i.period,
        i.json, COALESCE(i.file, '') AS file_name,
        COALESCE(i.created_at, NOW()) AS created_at,
        ST_X(i.location::geometry) AS longitude,
        ST_Y(i.location::geometry) AS latitude,
        ST_Z(i.location::geometry) AS altitude,
        i.deleted, COALESCE(d.test_device, FALSE) AS from_test_device,
        i.last_export_success_at,
        ou.id::int8 AS org_unit_id, ou.name AS org_unit_name, ou.source_ref AS org_unit_ref,
        country.source_ref AS country_ref
    FROM iaso_instance i
    JOIN iaso_project p ON p.id = i.project_id
    JOIN iaso_form f ON f.id = i.form_id
    LEFT JOIN iaso_device d ON d.id = i.device_id
    LEFT JOIN iaso_orgunit ou ON ou.id = i.org_unit_id
    LEFT JOIN LATERAL (
        WITH RECURSIVE chain (id, parent_id, source_ref) AS (
            SELECT o.id, o.parent_id, o.source_ref FROM iaso_orgunit o WHERE o.id = i.org_unit_id
            UNION ALL
            SELECT o.id, o.parent_id, o.source_ref
            FROM iaso_orgunit o JOIN chain c ON o.id = c.parent_id
        )
        SELECT source_ref FROM chain WHERE parent_id IS NULL LIMIT 1
    ) country ON TRUE
"#;

/// Columns selected by [`mapping_version_from_row`]
pub const MAPPING_VERSION_SELECT: &str = r#"
    SELECT
        mv.id::int8 AS id, mv.name, mv.json, m.mapping_type, m.form_id::int8 AS form_id,
        fv.version_id AS form_version, fv.form_descriptor,
        c.name AS credentials_name, c.url AS credentials_url,
        c.login AS credentials_login, c.password AS credentials_password
    FROM iaso_mappingversion mv
    JOIN iaso_mapping m ON m.id = mv.mapping_id
    JOIN iaso_formversion fv ON fv.id = mv.form_version_id
    LEFT JOIN iaso_datasource ds ON ds.id = m.data_source_id
    LEFT JOIN iaso_externalcredentials c ON c.id = ds.credentials_id
"#;

pub const EXPORT_REQUEST_COLUMNS: &str = "id, params, launcher_id, account_id, status, \
    instance_count, exported_count, errored_count, continue_on_error, last_error_message, \
    finished, queued_at, started_at, ended_at";

pub fn instance_from_row(row: &Row) -> Result<Instance> {
    let org_unit = row
        .try_get::<_, Option<i64>>("org_unit_id")?
        .map(|id| -> Result<OrgUnit> {
            let name: Option<String> = row.try_get("org_unit_name")?;
            let source_ref: Option<String> = row.try_get("org_unit_ref")?;
            let mut org_unit =
                OrgUnit::new(OrgUnitId::new(id), name.unwrap_or_default(), source_ref.as_deref());
            org_unit.country_source_ref = row.try_get("country_ref")?;
            Ok(org_unit)
        })
        .transpose()?;

    let longitude: Option<f64> = row.try_get("longitude")?;
    let latitude: Option<f64> = row.try_get("latitude")?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
            altitude: row.try_get("altitude")?,
        }),
        _ => None,
    };

    let json = match row.try_get::<_, Option<Value>>("json")? {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    };
    let uuid = row
        .try_get::<_, Option<String>>("uuid")?
        .and_then(|raw| Uuid::parse_str(&raw).ok());
    let last_export_success_at: Option<DateTime<Utc>> = row.try_get("last_export_success_at")?;

    Ok(Instance {
        id: InstanceId::new(row.try_get("id")?),
        uuid,
        export_id: row.try_get("export_id")?,
        account_id: AccountId::new(row.try_get("account_id")?),
        form_id: FormId::new(row.try_get("form_id")?),
        org_unit,
        period: row.try_get("period")?,
        json,
        file_name: row.try_get("file_name")?,
        created_at: row.try_get("created_at")?,
        location,
        deleted: row.try_get("deleted")?,
        from_test_device: row.try_get("from_test_device")?,
        last_export_success_at,
        to_export: last_export_success_at.is_none(),
    })
}

pub fn mapping_version_from_row(row: &Row) -> Result<MappingVersion> {
    let id = MappingVersionId::new(row.try_get("id")?);
    let mapping_type: MappingType = row
        .try_get::<_, String>("mapping_type")?
        .parse()
        .map_err(IasoError::Database)?;

    let repeat_groups = row
        .try_get::<_, Option<Value>>("form_descriptor")?
        .map(|descriptor| repeat_group_names(&descriptor))
        .unwrap_or_default();

    let json: Value = row.try_get::<_, Option<Value>>("json")?.unwrap_or(Value::Null);
    let definition = MappingVersion::parse_definition(id, mapping_type, &json, &repeat_groups)?;

    let credentials = match row.try_get::<_, Option<String>>("credentials_url")? {
        Some(url) => Some(Dhis2Credentials {
            name: row
                .try_get::<_, Option<String>>("credentials_name")?
                .unwrap_or_default(),
            url,
            login: row
                .try_get::<_, Option<String>>("credentials_login")?
                .unwrap_or_default(),
            password: secret_string(
                row.try_get::<_, Option<String>>("credentials_password")?
                    .unwrap_or_default(),
            ),
        }),
        None => None,
    };

    Ok(MappingVersion {
        id,
        name: row.try_get("name")?,
        mapping_type,
        form_id: FormId::new(row.try_get("form_id")?),
        form_version: row
            .try_get::<_, Option<String>>("form_version")?
            .unwrap_or_default(),
        repeat_groups,
        definition,
        credentials,
    })
}

fn parse_state(row: &Row) -> Result<ExportState> {
    row.try_get::<_, String>("status")?
        .parse()
        .map_err(IasoError::Database)
}

fn count(row: &Row, column: &str) -> Result<u64> {
    Ok(row.try_get::<_, i64>(column)?.max(0) as u64)
}

pub fn export_request_from_row(row: &Row) -> Result<ExportRequest> {
    Ok(ExportRequest {
        id: ExportRequestId::new(row.try_get("id")?),
        params: row.try_get("params")?,
        launcher: Launcher {
            user_id: UserId::new(row.try_get("launcher_id")?),
            account_id: AccountId::new(row.try_get("account_id")?),
        },
        status: parse_state(row)?,
        instance_count: count(row, "instance_count")?,
        exported_count: count(row, "exported_count")?,
        errored_count: count(row, "errored_count")?,
        continue_on_error: row.try_get("continue_on_error")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        finished: row.try_get("finished")?,
        last_error_message: row.try_get("last_error_message")?,
    })
}

/// Expects an `export_log_ids BIGINT[]` column next to the status columns
pub fn export_status_from_row(row: &Row) -> Result<ExportStatus> {
    let log_ids: Vec<i64> = row.try_get("export_log_ids")?;
    Ok(ExportStatus {
        id: ExportStatusId::new(row.try_get("id")?),
        export_request_id: ExportRequestId::new(row.try_get("export_request_id")?),
        instance_id: InstanceId::new(row.try_get("instance_id")?),
        mapping_version_id: MappingVersionId::new(row.try_get("mapping_version_id")?),
        status: parse_state(row)?,
        last_error_message: row.try_get("last_error_message")?,
        export_log_ids: log_ids.into_iter().map(ExportLogId::new).collect(),
    })
}

pub fn export_log_from_row(row: &Row) -> Result<ExportLog> {
    let http_status: i32 = row.try_get("http_status")?;
    Ok(ExportLog {
        id: ExportLogId::new(row.try_get("id")?),
        sent: row.try_get::<_, Option<Value>>("sent")?.unwrap_or(Value::Null),
        received: row.try_get::<_, Option<Value>>("received")?.unwrap_or(Value::Null),
        url: row.try_get("url")?,
        http_status: u16::try_from(http_status).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iaso_ids_are_widened_to_int8() {
        for column in [
            "i.id::int8 AS id",
            "p.account_id::int8 AS account_id",
            "i.form_id::int8 AS form_id",
            "ou.id::int8 AS org_unit_id",
        ] {
            assert!(INSTANCE_SELECT.contains(column), "{column}");
        }
        assert!(MAPPING_VERSION_SELECT.contains("mv.id::int8 AS id"));
        assert!(MAPPING_VERSION_SELECT.contains("m.form_id::int8 AS form_id"));
    }
}
