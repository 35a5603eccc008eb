//! reqwest-backed DHIS2 client

use super::api::{ApiResponse, Dhis2Api, Dhis2ApiFactory, Dhis2Result};
use crate::config::{secret_string, Dhis2Config, RetryConfig, SecretString};
use crate::domain::{Dhis2Credentials, Dhis2Error, IasoError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, ClientBuilder, Method};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Failed attempt, remembering whether the request left the client
struct AttemptError {
    error: Dhis2Error,
    sent: bool,
}

impl AttemptError {
    fn sent(error: Dhis2Error) -> Self {
        Self { error, sent: true }
    }
}

/// HTTP client for one DHIS2 server
///
/// Sends Basic authentication on every request. GET requests are retried
/// on connection failures and 5xx responses with exponential backoff. POST
/// and PUT are retried only when the connection could not be opened, since
/// DHIS2 may have committed a write before answering with a gateway error.
pub struct Dhis2Client {
    base_url: String,
    client: Client,
    auth_header: SecretString,
    retry: RetryConfig,
}

impl Dhis2Client {
    /// # Errors
    ///
    /// Returns a configuration error if the server URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(credentials: &Dhis2Credentials, config: &Dhis2Config) -> Result<Self> {
        let base_url = credentials.url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| {
            IasoError::Configuration(format!(
                "Invalid DHIS2 url '{}' for data source {}: {e}",
                credentials.url, credentials.name
            ))
        })?;

        let mut client_builder = ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(30));

        if !config.tls_verify {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .map_err(|e| IasoError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        let raw = format!(
            "{}:{}",
            credentials.login,
            credentials.password.expose_secret().as_ref()
        );
        let auth_header = secret_string(format!(
            "Basic {}",
            general_purpose::STANDARD.encode(raw.as_bytes())
        ));

        Ok(Self {
            base_url,
            client,
            auth_header,
            retry: config.retry.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> std::result::Result<ApiResponse, AttemptError> {
        let mut request = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, self.auth_header.expose_secret().as_ref());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(|e| AttemptError {
            sent: !e.is_connect(),
            error: Dhis2Error::Connection(e.to_string()),
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| {
                AttemptError::sent(Dhis2Error::Connection(format!(
                    "Failed to read response body: {e}"
                )))
            })?;

        if !status.is_success() {
            return Err(AttemptError::sent(Dhis2Error::Request {
                code: status.as_u16(),
                url: final_url,
                description: Value::String(body),
            }));
        }

        Ok(ApiResponse {
            url: final_url,
            status: status.as_u16(),
            body,
        })
    }

    /// Retry a request with exponential backoff
    async fn retry_request<F, Fut>(&self, method: &Method, operation: F) -> Dhis2Result<ApiResponse>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<ApiResponse, AttemptError>>,
    {
        let max_retries = self.retry.max_retries;
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(response) => return Ok(response),
                Err(failure) => {
                    if !is_retryable(method, &failure) || attempt >= max_retries {
                        return Err(failure.error);
                    }
                    attempt += 1;

                    let delay_ms = (self.retry.initial_delay_ms as f64
                        * self.retry.backoff_multiplier.powf((attempt - 1) as f64))
                        as u64;
                    let delay_ms = delay_ms.min(self.retry.max_delay_ms);

                    crate::log_retry_attempt!(attempt, max_retries, failure.error);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Dhis2Result<ApiResponse> {
        let url = self.endpoint(path);
        tracing::debug!(method = %method, url = %url, "Calling DHIS2");
        self.retry_request(&method, || {
            self.send_once(method.clone(), &url, query, body)
        })
        .await
    }
}

/// Writes are not idempotent: once a POST or PUT reached the server it is never resent
fn is_retryable(method: &Method, failure: &AttemptError) -> bool {
    if *method != Method::GET && failure.sent {
        return false;
    }
    match &failure.error {
        Dhis2Error::Connection(_) => true,
        Dhis2Error::Request { code, .. } => *code >= 500,
        Dhis2Error::InvalidResponse(_) => false,
    }
}

#[async_trait]
impl Dhis2Api for Dhis2Client {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Dhis2Result<ApiResponse> {
        self.send(Method::GET, path, query, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Dhis2Result<ApiResponse> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> Dhis2Result<ApiResponse> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }
}

/// Builds [`Dhis2Client`]s from the `[dhis2]` settings
#[derive(Debug, Clone, Default)]
pub struct HttpApiFactory {
    config: Dhis2Config,
}

impl HttpApiFactory {
    pub fn new(config: Dhis2Config) -> Self {
        Self { config }
    }
}

impl Dhis2ApiFactory for HttpApiFactory {
    fn create(&self, credentials: &Dhis2Credentials) -> Result<Arc<dyn Dhis2Api>> {
        tracing::debug!(data_source = %credentials.name, url = %credentials.url, "Creating DHIS2 client");
        Ok(Arc::new(Dhis2Client::new(credentials, &self.config)?))
    }
}
