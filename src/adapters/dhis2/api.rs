//! DHIS2 HTTP API seam

use crate::domain::{Dhis2Credentials, Dhis2Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub type Dhis2Result<T> = std::result::Result<T, Dhis2Error>;

/// Successful (2xx) DHIS2 response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// Final request URL, query string included
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn json(&self) -> Dhis2Result<Value> {
        serde_json::from_str(&self.body).map_err(|e| {
            Dhis2Error::InvalidResponse(format!("{} returned a non JSON body: {e}", self.url))
        })
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    /// Body as JSON, falling back to a JSON string (or null when empty)
    pub fn json_or_text(&self) -> Value {
        if self.body.trim().is_empty() {
            return Value::Null;
        }
        self.json()
            .unwrap_or_else(|_| Value::String(self.body.clone()))
    }
}

/// Minimal DHIS2 Web API client
///
/// Paths are relative to `<server>/api/`. Non-2xx responses are returned as
/// [`Dhis2Error::Request`] carrying the raw body as a JSON string.
#[async_trait]
pub trait Dhis2Api: Send + Sync {
    fn base_url(&self) -> &str;

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Dhis2Result<ApiResponse>;

    async fn post(&self, path: &str, body: &Value) -> Dhis2Result<ApiResponse>;

    async fn put(&self, path: &str, body: &Value) -> Dhis2Result<ApiResponse>;
}

/// Builds API clients for the data source credentials of a mapping version
pub trait Dhis2ApiFactory: Send + Sync {
    fn create(&self, credentials: &Dhis2Credentials) -> Result<Arc<dyn Dhis2Api>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> ApiResponse {
        ApiResponse {
            url: "https://play.dhis2.org/api/events".to_string(),
            status: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_json_or_text() {
        assert_eq!(response("").json_or_text(), Value::Null);
        assert_eq!(
            response(r#"{"status":"OK"}"#).json_or_text(),
            serde_json::json!({"status": "OK"})
        );
        assert_eq!(
            response("<html>ok</html>").json_or_text(),
            Value::String("<html>ok</html>".to_string())
        );
    }

    #[test]
    fn test_json_error_names_url() {
        let err = response("nope").json().unwrap_err();
        assert!(err.to_string().contains("api/events"));
    }
}
