//! Export command implementation
//!
//! This module implements the `export` command: it queues an export request
//! for the selected submissions (or picks up an existing QUEUED one) and
//! runs it against DHIS2.

use super::exit_code_for;
use crate::adapters::database::Repositories;
use crate::adapters::dhis2::HttpApiFactory;
use crate::cli::{EXIT_CONFIG, EXIT_INTERRUPTED, EXIT_OK, EXIT_PARTIAL};
use crate::config::load_config;
use crate::core::export::{DataValueExporter, ExportRequestBuilder};
use crate::domain::{
    AccountId, ExportRequest, ExportRequestId, ExportState, FormId, IasoError, InstanceFilters,
    InstanceId, Launcher, OrgUnitId, Selection, UserId,
};
use chrono::{DateTime, Utc};
use clap::Args;
use std::sync::Arc;
use tokio::sync::watch;

/// Arguments for the export command
#[derive(Args, Debug, Default)]
pub struct ExportArgs {
    /// Run an existing QUEUED export request instead of building a new one
    #[arg(long, conflicts_with_all = ["account", "user"])]
    pub request_id: Option<i64>,

    /// Account whose submissions are exported
    #[arg(long, required_unless_present = "request_id")]
    pub account: Option<i64>,

    /// User launching the export
    #[arg(long, required_unless_present = "request_id")]
    pub user: Option<i64>,

    /// Form ids (comma-separated)
    #[arg(long = "form", value_delimiter = ',')]
    pub forms: Vec<i64>,

    /// Org unit ids (comma-separated)
    #[arg(long = "org-unit", value_delimiter = ',')]
    pub org_units: Vec<i64>,

    /// Periods (comma-separated)
    #[arg(long = "period", value_delimiter = ',')]
    pub periods: Vec<String>,

    /// Only submissions created at or after this RFC 3339 timestamp
    #[arg(long)]
    pub created_from: Option<DateTime<Utc>>,

    /// Only submissions created at or before this RFC 3339 timestamp
    #[arg(long)]
    pub created_to: Option<DateTime<Utc>>,

    /// Restrict the export to these submission ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub selected: Vec<i64>,

    /// Leave these submission ids out (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub unselected: Vec<i64>,

    /// Export submissions again even if they were already exported
    #[arg(long)]
    pub force: bool,

    /// Keep going after a page is rejected
    #[arg(long)]
    pub continue_on_error: bool,

    /// Export statuses per page
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

impl ExportArgs {
    pub fn filters(&self) -> InstanceFilters {
        InstanceFilters {
            form_ids: self.forms.iter().copied().map(FormId::new).collect(),
            org_unit_ids: self.org_units.iter().copied().map(OrgUnitId::new).collect(),
            periods: self.periods.clone(),
            created_from: self.created_from,
            created_to: self.created_to,
        }
    }

    pub fn selection(&self) -> Option<Selection> {
        if self.selected.is_empty() && self.unselected.is_empty() {
            return None;
        }
        Some(Selection {
            selected_ids: self.selected.iter().copied().map(InstanceId::new).collect(),
            unselected_ids: self.unselected.iter().copied().map(InstanceId::new).collect(),
        })
    }

    /// Execute the export command
    pub async fn execute(
        &self,
        config_path: &str,
        shutdown_signal: watch::Receiver<bool>,
    ) -> anyhow::Result<i32> {
        tracing::info!("Starting export command");

        let mut config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                eprintln!("Failed to load configuration: {e}");
                return Ok(EXIT_CONFIG);
            }
        };

        if let Some(page_size) = self.page_size {
            tracing::info!(page_size, "Overriding page size from CLI");
            config.export.page_size = page_size;
        }
        if self.continue_on_error {
            config.export.continue_on_error = true;
        }
        if self.force {
            config.export.force_export = true;
        }

        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "Configuration validation failed");
            eprintln!("Configuration validation failed: {e}");
            return Ok(EXIT_CONFIG);
        }

        let repositories = match Repositories::connect(&config).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to database");
                eprintln!("Failed to connect to database: {e}");
                return Ok(exit_code_for(&e));
            }
        };

        let mut request = match self.request_id {
            Some(id) => match self.queued_request(&repositories, ExportRequestId::new(id)).await? {
                Some(request) => request,
                None => return Ok(EXIT_CONFIG),
            },
            None => {
                let (Some(account), Some(user)) = (self.account, self.user) else {
                    eprintln!("--account and --user are required to build an export request");
                    return Ok(EXIT_CONFIG);
                };
                let launcher = Launcher {
                    user_id: UserId::new(user),
                    account_id: AccountId::new(account),
                };

                if !self.yes && !self.confirm(&launcher, config.export.force_export)? {
                    println!("Export cancelled.");
                    return Ok(EXIT_OK);
                }

                let built = ExportRequestBuilder::new(&repositories)
                    .build_export_request(
                        self.filters(),
                        launcher,
                        config.export.force_export,
                        self.selection(),
                    )
                    .await;
                match built {
                    Ok(request) => request,
                    Err(IasoError::NothingToExport) => {
                        println!("Nothing to export.");
                        return Ok(EXIT_CONFIG);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to build export request");
                        eprintln!("Failed to build export request: {e}");
                        return Ok(exit_code_for(&e));
                    }
                }
            }
        };

        println!(
            "🚀 Exporting request {} ({} submissions)...",
            request.id, request.instance_count
        );
        println!();

        let exporter = DataValueExporter::new(
            &repositories,
            Arc::new(HttpApiFactory::new(config.dhis2.clone())),
        )
        .with_shutdown(shutdown_signal);

        let summary = match exporter
            .export_instances(
                &mut request,
                config.export.page_size,
                config.export.continue_on_error,
            )
            .await
        {
            Ok(s) => s,
            Err(IasoError::Cancelled) => {
                println!();
                println!("⚠️  Export interrupted. Request {} is KILLED.", request.id);
                println!(
                    "   Exported: {}, errored: {}",
                    request.exported_count, request.errored_count
                );
                tracing::info!(export_request_id = %request.id, "Export interrupted by user signal");
                return Ok(EXIT_INTERRUPTED);
            }
            Err(e) => {
                tracing::error!(export_request_id = %request.id, error = %e, "Export failed");
                eprintln!("Export failed: {e}");
                eprintln!(
                    "Request {} is {} (exported: {}, errored: {})",
                    request.id, request.status, request.exported_count, request.errored_count
                );
                return Ok(exit_code_for(&e));
            }
        };

        println!();
        println!("📊 Export Summary:");
        println!("  Request: {}", request.id);
        println!("  Status: {}", request.status);
        println!("  Pages: {}", summary.pages);
        println!("  Units: {}", summary.total_units);
        println!("  Exported: {}", summary.exported);
        println!("  Errored: {}", summary.errored);
        println!("  Skipped: {}", summary.skipped);
        println!("  Duration: {:.2}s", summary.duration.as_secs_f64());
        println!("  Success Rate: {:.2}%", summary.success_rate());
        println!();

        if !summary.errors.is_empty() {
            println!("⚠️  Errors encountered:");
            for error in &summary.errors {
                println!("  - {:?}: {}", error.error_type, error.message);
                if let Some(context) = &error.context {
                    println!("    Context: {context}");
                }
            }
            println!();
        }

        if summary.is_successful() {
            println!("✅ Export completed successfully!");
            Ok(EXIT_OK)
        } else {
            println!("⚠️  Export completed with errors");
            Ok(EXIT_PARTIAL)
        }
    }

    /// Loads a request that may be run; prints why it may not otherwise
    async fn queued_request(
        &self,
        repositories: &Repositories,
        id: ExportRequestId,
    ) -> anyhow::Result<Option<ExportRequest>> {
        let Some(request) = repositories.ledger.get_export_request(id).await? else {
            eprintln!("Export request {id} not found");
            return Ok(None);
        };
        if request.status != ExportState::Queued {
            eprintln!(
                "Export request {id} is {}; only QUEUED requests can be run",
                request.status
            );
            return Ok(None);
        }
        Ok(Some(request))
    }

    fn confirm(&self, launcher: &Launcher, force_export: bool) -> anyhow::Result<bool> {
        use std::io::{self, Write};

        let filters = self.filters();
        println!("Export Configuration:");
        println!("  Account: {}", launcher.account_id);
        println!("  Launched by: {}", launcher.user_id);
        println!("  Forms: {}", list_or_all(&filters.form_ids));
        println!("  Org units: {}", list_or_all(&filters.org_unit_ids));
        println!("  Periods: {}", list_or_all(&filters.periods));
        println!("  Force export: {force_export}");
        println!();
        print!("Proceed with export? [y/N]: ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().eq_ignore_ascii_case("y"))
    }
}

fn list_or_all<T: std::fmt::Debug>(items: &[T]) -> String {
    if items.is_empty() {
        "All".to_string()
    } else {
        format!("{items:?}")
    }
}
