//! Status command implementation
//!
//! This module implements the `status` command: a listing of export
//! requests, or the per-unit statuses and DHIS2 exchanges of one request.

use super::exit_code_for;
use crate::adapters::database::Repositories;
use crate::cli::{EXIT_CONFIG, EXIT_FATAL, EXIT_OK};
use crate::config::load_config;
use crate::domain::{AccountId, ExportRequestId, ExportState};
use clap::Args;

/// Arguments for the status command
#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Filter by account
    #[arg(long)]
    pub account: Option<i64>,

    /// Filter by state (queued, running, exported, errored, killed, ...)
    #[arg(long)]
    pub state: Option<ExportState>,

    /// Show the statuses of one export request
    #[arg(long, conflicts_with_all = ["account", "state"])]
    pub request_id: Option<i64>,

    /// Also list the DHIS2 exchanges of each status
    #[arg(long, requires = "request_id")]
    pub logs: bool,
}

/// Label shown for a request or unit state
pub fn state_label(state: ExportState) -> &'static str {
    match state {
        ExportState::Queued => "⏸️  Queued",
        ExportState::Running => "🔄 Running",
        ExportState::Exported | ExportState::Success => "✅ Exported",
        ExportState::Errored => "❌ Errored",
        ExportState::Skipped => "⏭️  Skipped",
        ExportState::Killed => "🛑 Killed",
    }
}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!("Checking export status");

        println!("📊 Export Status");
        println!();

        let config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                println!("❌ Failed to load configuration file");
                println!("   Error: {e}");
                return Ok(EXIT_CONFIG);
            }
        };

        let repositories = match Repositories::connect(&config).await {
            Ok(r) => r,
            Err(e) => {
                println!("❌ Failed to connect to database");
                println!("   Error: {e}");
                return Ok(exit_code_for(&e));
            }
        };

        let outcome = match self.request_id {
            Some(id) => self.show_request(&repositories, ExportRequestId::new(id)).await,
            None => self.list_requests(&repositories).await,
        };
        match outcome {
            Ok(code) => Ok(code),
            Err(e) => {
                println!("❌ Failed to load export status");
                println!("   Error: {e}");
                Ok(EXIT_FATAL)
            }
        }
    }

    async fn list_requests(&self, repositories: &Repositories) -> crate::domain::Result<i32> {
        let requests = repositories
            .ledger
            .list_export_requests(self.account.map(AccountId::new), self.state)
            .await?;

        if requests.is_empty() {
            println!("No export requests found.");
            println!("Run 'iaso-export export' to queue one.");
            return Ok(EXIT_OK);
        }

        println!("Found {} export request(s):", requests.len());
        println!();
        println!(
            "{:<8} {:<10} {:<15} {:<10} {:<10} {:<10} {:<20}",
            "ID", "Account", "Status", "Units", "Exported", "Errored", "Queued at"
        );
        println!("{}", "-".repeat(90));

        for request in &requests {
            println!(
                "{:<8} {:<10} {:<15} {:<10} {:<10} {:<10} {:<20}",
                request.id,
                request.launcher.account_id,
                state_label(request.status),
                request.instance_count,
                request.exported_count,
                request.errored_count,
                request.queued_at.format("%Y-%m-%d %H:%M:%S")
            );
        }

        println!();
        Ok(EXIT_OK)
    }

    async fn show_request(
        &self,
        repositories: &Repositories,
        id: ExportRequestId,
    ) -> crate::domain::Result<i32> {
        let Some(request) = repositories.ledger.get_export_request(id).await? else {
            println!("Export request {id} not found.");
            return Ok(EXIT_CONFIG);
        };

        println!("Request {}: {}", request.id, state_label(request.status));
        println!("  Account: {}", request.launcher.account_id);
        println!("  Launched by: {}", request.launcher.user_id);
        println!("  Submissions: {}", request.instance_count);
        println!("  Exported: {}", request.exported_count);
        println!("  Errored: {}", request.errored_count);
        println!("  Continue on error: {}", request.continue_on_error);
        if let Some(started_at) = request.started_at {
            println!("  Started: {}", started_at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(ended_at) = request.ended_at {
            println!("  Ended: {}", ended_at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(message) = &request.last_error_message {
            println!("  Last error: {message}");
        }
        println!();

        let total = repositories.ledger.count_export_statuses(id).await? as usize;
        let units = repositories.ledger.export_units(id, 0, total).await?;

        println!(
            "{:<10} {:<12} {:<10} {:<15} {}",
            "Status ID", "Submission", "Mapping", "Status", "Error"
        );
        println!("{}", "-".repeat(90));
        for unit in &units {
            let status = &unit.status;
            println!(
                "{:<10} {:<12} {:<10} {:<15} {}",
                status.id,
                status.instance_id,
                status.mapping_version_id,
                state_label(status.status),
                status.last_error_message.as_deref().unwrap_or("")
            );

            if self.logs {
                for log in repositories.ledger.export_logs_for_status(status.id).await? {
                    println!(
                        "{:<10} {} {} ({})",
                        "",
                        log.http_status,
                        log.url,
                        log.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        println!();
        Ok(EXIT_OK)
    }
}
