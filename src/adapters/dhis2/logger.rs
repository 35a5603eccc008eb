//! Audit-logging decorator over a DHIS2 client

use super::api::{ApiResponse, Dhis2Api};
use crate::domain::{Dhis2Error, IasoError, NewExportLog, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Description recorded when DHIS2 answers an error with a non JSON body
pub const NON_JSON_DESCRIPTION: &str = "non json response return by server";

/// Records every DHIS2 exchange as an export log
///
/// Successful calls and DHIS2-reported request errors are buffered; the
/// caller drains the buffer with [`ApiLogger::pop_export_logs`] and attaches
/// the logs to the statuses they belong to. Connection failures never reach
/// DHIS2 and are not logged.
pub struct ApiLogger {
    api: Arc<dyn Dhis2Api>,
    logs: Vec<NewExportLog>,
}

impl ApiLogger {
    pub fn new(api: Arc<dyn Dhis2Api>) -> Self {
        Self {
            api,
            logs: Vec::new(),
        }
    }

    pub async fn get(&mut self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let sent = Value::Object(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect::<Map<String, Value>>(),
        );
        let outcome = self.api.get(path, params).await;
        self.record(sent, outcome)
    }

    pub async fn post(&mut self, path: &str, body: &Value) -> Result<Value> {
        let outcome = self.api.post(path, body).await;
        self.record(body.clone(), outcome)
    }

    pub async fn put(&mut self, path: &str, body: &Value) -> Result<Value> {
        let outcome = self.api.put(path, body).await;
        self.record(body.clone(), outcome)
    }

    /// Drains the buffered logs
    pub fn pop_export_logs(&mut self) -> Vec<NewExportLog> {
        std::mem::take(&mut self.logs)
    }

    pub fn pending_logs(&self) -> usize {
        self.logs.len()
    }

    fn record(
        &mut self,
        sent: Value,
        outcome: std::result::Result<ApiResponse, Dhis2Error>,
    ) -> Result<Value> {
        match outcome {
            Ok(response) => {
                let received = response.json_or_text();
                tracing::debug!(url = %response.url, status = response.status, "DHIS2 call succeeded");
                self.logs.push(NewExportLog {
                    sent,
                    received: received.clone(),
                    url: response.url,
                    http_status: response.status,
                });
                Ok(received)
            }
            Err(Dhis2Error::Request {
                code,
                url,
                description,
            }) => {
                let description = decode_error_body(description);
                tracing::warn!(url = %url, status = code, "DHIS2 rejected request");
                self.logs.push(NewExportLog {
                    sent,
                    received: description.clone(),
                    url: url.clone(),
                    http_status: code,
                });
                Err(IasoError::Dhis2(Dhis2Error::Request {
                    code,
                    url,
                    description,
                }))
            }
            Err(other) => Err(IasoError::Dhis2(other)),
        }
    }
}

/// Decodes a raw error body, degrading to a synthetic ERROR description
fn decode_error_body(description: Value) -> Value {
    match description {
        Value::String(raw) => serde_json::from_str::<Value>(&raw)
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or_else(|| json!({"status": "ERROR", "description": NON_JSON_DESCRIPTION})),
        other => other,
    }
}
