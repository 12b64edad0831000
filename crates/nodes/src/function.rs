//! [`FunctionInvoker`] that calls a function gateway over HTTP.
//!
//! The gateway exposes `POST {endpoint}/functions/{name}/invocations`, takes
//! the payload as the JSON body and answers with the function's JSON result.
//! A function that ran but failed is signalled by the `X-Function-Error`
//! response header, the message being the response body.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::traits::{FunctionInvoker, FunctionOutput};
use crate::NodeError;

pub const FUNCTION_ERROR_HEADER: &str = "x-function-error";

#[derive(Debug, Clone)]
pub struct HttpFunctionInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFunctionInvoker {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
        }
    }

    fn invocation_url(&self, function: &str) -> String {
        format!("{}/functions/{}/invocations", self.endpoint, function)
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(&self, function: &str, payload: &Value) -> Result<FunctionOutput, NodeError> {
        let response = self
            .client
            .post(self.invocation_url(function))
            .json(payload)
            .send()
            .await
            .map_err(|e| NodeError::Retryable(format!("function invocation failed: {e}")))?;

        // Any gateway rejection is treated as transient, 4xx included.
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::Retryable(format!(
                "function gateway returned status {status}"
            )));
        }

        let function_error = response
            .headers()
            .get(FUNCTION_ERROR_HEADER)
            .map(|v| v.to_str().unwrap_or("unhandled").to_owned());

        let body = response
            .bytes()
            .await
            .map_err(|e| NodeError::Retryable(format!("failed to read function result: {e}")))?;

        if let Some(kind) = function_error {
            let detail = String::from_utf8_lossy(&body).into_owned();
            debug!(function, kind = %kind, "function reported an error");
            return Ok(FunctionOutput {
                payload: Value::Null,
                function_error: Some(if detail.is_empty() { kind } else { detail }),
            });
        }

        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&body).into_owned())
            })
        };

        Ok(FunctionOutput {
            payload,
            function_error: None,
        })
    }
}
