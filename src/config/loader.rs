//! Configuration loader with TOML parsing and environment variable overrides

use super::schema::IasoConfig;
use super::secret::secret_string;
use crate::domain::errors::IasoError;
use crate::domain::result::Result;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Loads configuration from a TOML file
///
/// This function:
/// 1. Reads the TOML file
/// 2. Performs environment variable substitution (${VAR} syntax)
/// 3. Parses the TOML into IasoConfig
/// 4. Applies environment variable overrides (IASO_* prefix)
/// 5. Validates the configuration
///
/// # Errors
///
/// Returns [`IasoError::Configuration`] if the file is missing or unreadable,
/// a referenced variable is unset, the TOML is malformed, or validation fails.
///
/// # Examples
///
/// ```no_run
/// use iaso_export::config::load_config;
///
/// let config = load_config("iaso-export.toml").expect("Failed to load config");
/// println!("page size: {}", config.export.page_size);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<IasoConfig> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(IasoError::Configuration(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        IasoError::Configuration(format!(
            "Failed to read configuration file {}: {}",
            path.display(),
            e
        ))
    })?;

    parse_config(&contents)
}

/// Parses configuration text, applying substitution, overrides and validation
pub fn parse_config(contents: &str) -> Result<IasoConfig> {
    let contents = substitute_env_vars(contents)?;

    let mut config: IasoConfig = toml::from_str(&contents)
        .map_err(|e| IasoError::Configuration(format!("Failed to parse TOML: {e}")))?;

    apply_env_overrides(&mut config)?;

    config.validate().map_err(|e| {
        IasoError::Configuration(format!("Configuration validation failed: {e}"))
    })?;

    Ok(config)
}

/// Substitutes environment variables in the format ${VAR_NAME}
///
/// Comment lines are copied untouched.
///
/// # Errors
///
/// Returns an error listing every referenced variable that is not set
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| IasoError::Configuration(format!("Invalid substitution pattern: {e}")))?;
    let mut lines = Vec::new();
    let mut missing_vars: Vec<String> = Vec::new();

    for line in input.lines() {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut processed_line = line.to_string();
        for cap in re.captures_iter(line) {
            let var_name = &cap[1];
            match std::env::var(var_name) {
                Ok(value) => {
                    processed_line = processed_line.replace(&format!("${{{var_name}}}"), &value);
                }
                Err(_) => {
                    if !missing_vars.iter().any(|v| v == var_name) {
                        missing_vars.push(var_name.to_string());
                    }
                }
            }
        }
        lines.push(processed_line);
    }

    if !missing_vars.is_empty() {
        return Err(IasoError::Configuration(format!(
            "Missing required environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(lines.join("\n"))
}

fn env_override<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IasoError::Configuration(format!("Invalid value '{raw}' for {name}"))),
        Err(_) => Ok(None),
    }
}

/// Applies environment variable overrides using the IASO_* prefix
///
/// Variables follow the pattern IASO_<SECTION>_<KEY>, for example
/// IASO_EXPORT_PAGE_SIZE or IASO_DHIS2_TLS_VERIFY.
fn apply_env_overrides(config: &mut IasoConfig) -> Result<()> {
    if let Some(val) = env_override("IASO_APPLICATION_LOG_LEVEL")? {
        config.application.log_level = val;
    }

    if let Some(val) = env_override("IASO_EXPORT_PAGE_SIZE")? {
        config.export.page_size = val;
    }
    if let Some(val) = env_override("IASO_EXPORT_CONTINUE_ON_ERROR")? {
        config.export.continue_on_error = val;
    }
    if let Some(val) = env_override("IASO_EXPORT_FORCE_EXPORT")? {
        config.export.force_export = val;
    }

    if let Some(val) = env_override("IASO_DHIS2_TIMEOUT_SECONDS")? {
        config.dhis2.timeout_seconds = val;
    }
    if let Some(val) = env_override("IASO_DHIS2_TLS_VERIFY")? {
        config.dhis2.tls_verify = val;
    }

    if let Some(ref mut pg) = config.postgresql {
        if let Some(val) = env_override::<String>("IASO_POSTGRESQL_CONNECTION_STRING")? {
            pg.connection_string = secret_string(val);
        }
        if let Some(val) = env_override("IASO_POSTGRESQL_MAX_CONNECTIONS")? {
            pg.max_connections = val;
        }
    }

    if let Some(val) = env_override("IASO_LOGGING_LOCAL_ENABLED")? {
        config.logging.local_enabled = val;
    }
    if let Some(val) = env_override("IASO_LOGGING_LOCAL_PATH")? {
        config.logging.local_path = val;
    }

    Ok(())
}
