//! Export ledger entities
//!
//! An [`ExportRequest`] owns one [`ExportStatus`] per (submission, mapping
//! version) pair. Every HTTP exchange with DHIS2 is recorded as an
//! [`ExportLog`] and attached to the statuses it applies to.

use super::errors::IasoError;
use super::ids::{
    AccountId, ExportLogId, ExportRequestId, ExportStatusId, InstanceId, MappingVersionId, UserId,
};
use super::instance::Instance;
use super::mapping::MappingVersion;
use super::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Status shared by export requests and export statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportState {
    Queued,
    Running,
    Exported,
    Errored,
    Skipped,
    Killed,
    Success,
}

impl ExportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportState::Queued => "QUEUED",
            ExportState::Running => "RUNNING",
            ExportState::Exported => "EXPORTED",
            ExportState::Errored => "ERRORED",
            ExportState::Skipped => "SKIPPED",
            ExportState::Killed => "KILLED",
            ExportState::Success => "SUCCESS",
        }
    }

    /// QUEUED and RUNNING requests still claim their submissions
    pub fn is_alive(&self) -> bool {
        matches!(self, ExportState::Queued | ExportState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_alive()
    }

    fn rank(&self) -> u8 {
        match self {
            ExportState::Queued => 0,
            ExportState::Running => 1,
            _ => 2,
        }
    }

    /// Statuses only move forward; a terminal state never changes again
    pub fn can_transition_to(&self, next: ExportState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(ExportState::Queued),
            "RUNNING" => Ok(ExportState::Running),
            "EXPORTED" => Ok(ExportState::Exported),
            "ERRORED" => Ok(ExportState::Errored),
            "SKIPPED" => Ok(ExportState::Skipped),
            "KILLED" => Ok(ExportState::Killed),
            "SUCCESS" => Ok(ExportState::Success),
            other => Err(format!("Unknown export status '{other}'")),
        }
    }
}

/// Import counters reported by DHIS2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCount {
    #[serde(default)]
    pub imported: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub ignored: u64,
    #[serde(default)]
    pub deleted: u64,
}

impl ImportCount {
    pub fn add(&mut self, other: &ImportCount) {
        self.imported += other.imported;
        self.updated += other.updated;
        self.ignored += other.ignored;
        self.deleted += other.deleted;
    }
}

/// Identity of the user launching an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launcher {
    pub user_id: UserId,
    pub account_id: AccountId,
}

/// One bulk export operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub id: ExportRequestId,

    /// Serialized instance filters
    pub params: Value,

    pub launcher: Launcher,
    pub status: ExportState,
    pub instance_count: u64,
    pub exported_count: u64,
    pub errored_count: u64,
    pub continue_on_error: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub finished: bool,
    pub last_error_message: Option<String>,
}

impl ExportRequest {
    /// Moves the request to RUNNING
    ///
    /// Callers must not start a request that is already terminal; re-running an
    /// EXPORTED request would submit its payloads to DHIS2 a second time.
    pub fn start(&mut self, continue_on_error: bool, now: DateTime<Utc>) {
        self.status = ExportState::Running;
        self.started_at = Some(now);
        self.continue_on_error = continue_on_error;
    }

    pub fn record_exported(&mut self, count: u64) {
        self.exported_count += count;
    }

    pub fn record_errored(&mut self, count: u64, message: impl Into<String>) {
        self.errored_count += count;
        self.last_error_message = Some(message.into());
    }

    /// Final status after all pages: EXPORTED when nothing errored
    pub fn finish(&mut self, now: DateTime<Utc>) {
        let status = if self.errored_count == 0 {
            ExportState::Exported
        } else {
            ExportState::Errored
        };
        self.close(status, now);
    }

    /// Aborts the request after a fatal error
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.last_error_message = Some(message.into());
        self.close(ExportState::Errored, now);
    }

    /// Stops the request after a cancellation signal
    pub fn kill(&mut self, now: DateTime<Utc>) {
        self.close(ExportState::Killed, now);
    }

    fn close(&mut self, status: ExportState, now: DateTime<Utc>) {
        self.status = status;
        self.finished = true;
        self.ended_at = Some(now);
    }
}

/// Export request about to be persisted
#[derive(Debug, Clone)]
pub struct NewExportRequest {
    pub params: Value,
    pub launcher: Launcher,
    pub instance_count: u64,
    pub queued_at: DateTime<Utc>,
}

impl NewExportRequest {
    /// Drops the statuses of submissions claimed by another alive request
    ///
    /// `instance_count` is recounted over the submissions left.
    ///
    /// # Errors
    ///
    /// Returns [`IasoError::NothingToExport`] when every submission was claimed.
    pub fn release_claimed(
        &mut self,
        statuses: Vec<NewExportStatus>,
        claimed: &HashSet<InstanceId>,
    ) -> Result<Vec<NewExportStatus>> {
        let kept: Vec<NewExportStatus> = statuses
            .into_iter()
            .filter(|status| !claimed.contains(&status.instance_id))
            .collect();
        let instances: HashSet<InstanceId> = kept.iter().map(|s| s.instance_id).collect();
        if instances.is_empty() {
            return Err(IasoError::NothingToExport);
        }
        self.instance_count = instances.len() as u64;
        Ok(kept)
    }
}

/// One (submission, mapping version) unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStatus {
    pub id: ExportStatusId,
    pub export_request_id: ExportRequestId,
    pub instance_id: InstanceId,
    pub mapping_version_id: MappingVersionId,
    pub status: ExportState,
    pub last_error_message: Option<String>,
    pub export_log_ids: Vec<ExportLogId>,
}

impl ExportStatus {
    pub fn transition(&mut self, next: ExportState) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(IasoError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_exported(&mut self) -> Result<()> {
        self.transition(ExportState::Exported)
    }

    pub fn mark_errored(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(ExportState::Errored)?;
        self.last_error_message = Some(message.into());
        Ok(())
    }

    pub fn attach_logs(&mut self, logs: &[ExportLog]) {
        for log in logs {
            if !self.export_log_ids.contains(&log.id) {
                self.export_log_ids.push(log.id);
            }
        }
    }
}

/// Export status about to be persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewExportStatus {
    pub instance_id: InstanceId,
    pub mapping_version_id: MappingVersionId,
}

/// Immutable audit record of one HTTP exchange with DHIS2
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportLog {
    pub id: ExportLogId,
    pub sent: Value,
    pub received: Value,
    pub url: String,
    pub http_status: u16,
    pub created_at: DateTime<Utc>,
}

/// Export log captured by the API logger, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewExportLog {
    pub sent: Value,
    pub received: Value,
    pub url: String,
    pub http_status: u16,
}

/// An export status together with the submission and mapping version it targets
#[derive(Debug, Clone)]
pub struct ExportUnit {
    pub status: ExportStatus,
    pub instance: Option<Instance>,
    pub mapping_version: Option<Arc<MappingVersion>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: ExportState) -> ExportStatus {
        ExportStatus {
            id: ExportStatusId::new(1),
            export_request_id: ExportRequestId::new(1),
            instance_id: InstanceId::new(1),
            mapping_version_id: MappingVersionId::new(1),
            status: state,
            last_error_message: None,
            export_log_ids: vec![],
        }
    }

    fn request() -> ExportRequest {
        ExportRequest {
            id: ExportRequestId::new(1),
            params: Value::Null,
            launcher: Launcher {
                user_id: UserId::new(1),
                account_id: AccountId::new(1),
            },
            status: ExportState::Queued,
            instance_count: 3,
            exported_count: 0,
            errored_count: 0,
            continue_on_error: false,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            finished: false,
            last_error_message: None,
        }
    }

    #[test]
    fn test_release_claimed_recounts_instances() {
        let unit = |instance: i64, mapping: i64| NewExportStatus {
            instance_id: InstanceId::new(instance),
            mapping_version_id: MappingVersionId::new(mapping),
        };
        let mut new_request = NewExportRequest {
            params: Value::Null,
            launcher: Launcher {
                user_id: UserId::new(1),
                account_id: AccountId::new(1),
            },
            instance_count: 3,
            queued_at: Utc::now(),
        };
        let claimed: HashSet<InstanceId> = [InstanceId::new(2)].into_iter().collect();

        let kept = new_request
            .release_claimed(vec![unit(1, 1), unit(1, 2), unit(2, 1), unit(3, 1)], &claimed)
            .unwrap();
        assert_eq!(kept, vec![unit(1, 1), unit(1, 2), unit(3, 1)]);
        assert_eq!(new_request.instance_count, 2);

        let everything: HashSet<InstanceId> =
            [InstanceId::new(1), InstanceId::new(3)].into_iter().collect();
        let err = new_request
            .release_claimed(kept, &everything)
            .unwrap_err();
        assert!(matches!(err, IasoError::NothingToExport));
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut s = status(ExportState::Queued);
        assert!(s.transition(ExportState::Running).is_ok());
        assert!(s.mark_exported().is_ok());
        assert!(s.mark_errored("late").is_err());
        assert!(s.transition(ExportState::Running).is_err());
        assert_eq!(s.status, ExportState::Exported);
        assert!(s.last_error_message.is_none());
    }

    #[test]
    fn test_queued_can_be_errored_directly() {
        let mut s = status(ExportState::Queued);
        s.mark_errored("bad value").unwrap();
        assert_eq!(s.status, ExportState::Errored);
        assert_eq!(s.last_error_message.as_deref(), Some("bad value"));
    }

    #[test]
    fn test_alive_states() {
        assert!(ExportState::Queued.is_alive());
        assert!(ExportState::Running.is_alive());
        assert!(ExportState::Killed.is_terminal());
        assert!(ExportState::Errored.is_terminal());
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            ExportState::Queued,
            ExportState::Running,
            ExportState::Exported,
            ExportState::Errored,
            ExportState::Skipped,
            ExportState::Killed,
            ExportState::Success,
        ] {
            assert_eq!(state.as_str().parse::<ExportState>().unwrap(), state);
        }
        assert_eq!("queued".parse::<ExportState>().unwrap(), ExportState::Queued);
        assert!("paused".parse::<ExportState>().is_err());
    }

    #[test]
    fn test_request_finish_depends_on_errors() {
        let mut ok = request();
        ok.start(true, Utc::now());
        assert!(ok.continue_on_error);
        ok.record_exported(3);
        ok.finish(Utc::now());
        assert_eq!(ok.status, ExportState::Exported);
        assert!(ok.finished);
        assert!(ok.ended_at.is_some());

        let mut ko = request();
        ko.start(false, Utc::now());
        ko.record_errored(1, "page failed");
        ko.finish(Utc::now());
        assert_eq!(ko.status, ExportState::Errored);
        assert_eq!(ko.last_error_message.as_deref(), Some("page failed"));
    }

    #[test]
    fn test_attach_logs_deduplicates() {
        let log = ExportLog {
            id: ExportLogId::new(9),
            sent: Value::Null,
            received: Value::Null,
            url: "u".to_string(),
            http_status: 200,
            created_at: Utc::now(),
        };
        let mut s = status(ExportState::Queued);
        s.attach_logs(&[log.clone(), log]);
        assert_eq!(s.export_log_ids, vec![ExportLogId::new(9)]);
    }
}
