//! `reqwest`-backed [`HttpClient`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tracing::debug;

use crate::traits::{HttpClient, HttpRequest, HttpResponse};
use crate::NodeError;

/// Default bound on a single request when the task does not set one.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Build a client with the given default timeout.
    ///
    /// # Errors
    /// Fails when the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, NodeError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| NodeError::Fatal(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.uri)
            .timeout(request.timeout)
            .header(CONTENT_TYPE, &request.content_type);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                NodeError::Fatal(format!("failed to create HTTP request: {e}"))
            } else {
                NodeError::Retryable(format!("HTTP request failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        debug!(uri = %request.uri, status, "HTTP request finished");
        Ok(HttpResponse { status })
    }
}
