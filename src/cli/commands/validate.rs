//! Validate config command implementation
//!
//! Loads the configuration the same way `export` does (substitution,
//! overrides, validation) and prints what an export run would use.

use crate::cli::{EXIT_CONFIG, EXIT_OK};
use crate::config::{load_config, IasoConfig};
use clap::Args;
use secrecy::ExposeSecret;

/// Arguments for the validate-config command
#[derive(Args, Debug)]
pub struct ValidateArgs {}

impl ValidateArgs {
    /// Execute the validate-config command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!(config_path = %config_path, "Validating configuration");

        println!("🔍 Validating configuration file: {config_path}");
        println!();

        let config = match load_config(config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Configuration rejected");
                println!("❌ Configuration is invalid");
                println!("   Error: {e}");
                println!();
                return Ok(EXIT_CONFIG);
            }
        };

        println!("✅ Configuration is valid");
        println!();
        println!("Export run settings:");
        for line in settings_summary(&config) {
            println!("  {line}");
        }
        println!();
        Ok(EXIT_OK)
    }
}

/// Settings an export run would use, with credentials left out
fn settings_summary(config: &IasoConfig) -> Vec<String> {
    let mut lines = vec![
        format!("Environment: {:?}", config.environment),
        format!("Log Level: {}", config.application.log_level),
    ];

    if let Some(pg) = &config.postgresql {
        lines.push(format!(
            "PostgreSQL: {} (pool {}, ssl {})",
            database_host(pg.connection_string.expose_secret().as_ref()),
            pg.max_connections,
            pg.ssl_mode
        ));
    }

    lines.push(format!("Page Size: {}", config.export.page_size));
    lines.push(format!("Continue On Error: {}", config.export.continue_on_error));
    lines.push(format!("Force Export: {}", config.export.force_export));
    lines.push(format!(
        "DHIS2 Requests: timeout {}s, {} retries, TLS verify {}",
        config.dhis2.timeout_seconds, config.dhis2.retry.max_retries, config.dhis2.tls_verify
    ));
    lines.push(if config.logging.local_enabled {
        format!(
            "Log File: {}/{} ({})",
            config.logging.local_path,
            crate::logging::LOG_FILE_NAME,
            config.logging.local_rotation
        )
    } else {
        "Log File: disabled".to_string()
    });
    lines
}

/// `host:port/db` part of a connection string
fn database_host(connection_string: &str) -> &str {
    connection_string
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or("***")
}
