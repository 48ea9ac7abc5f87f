//! Task runner backed by an HTTP worker
//!
//! Each unit is a `POST {base_url}/units/{unit}` with the payload as the JSON
//! body. The worker answers `{"ok": true, "output": ...}` or
//! `{"ok": false, "error": "..."}`. This runner makes a single attempt; wrap it
//! in [`RetryingTaskRunner`](crate::task_runner::RetryingTaskRunner) for retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TaskRunnerError;
use crate::task_runner::{TaskOutcome, TaskRunner};

/// Body returned by the worker for one unit
#[derive(Debug, Deserialize)]
struct UnitResponse {
    ok: bool,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Submits units to a remote worker over HTTP
#[derive(Debug, Clone)]
pub struct HttpTaskRunner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskRunner {
    /// Create a runner for the worker at `base_url`
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TaskRunnerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TaskRunnerError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Worker base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unit_url(&self, unit: &str) -> String {
        format!("{}/units/{}", self.base_url, unit)
    }
}

#[async_trait]
impl TaskRunner for HttpTaskRunner {
    async fn submit(&self, unit: &str, payload: Value) -> Result<TaskOutcome, TaskRunnerError> {
        let url = self.unit_url(unit);
        log::debug!("HttpTaskRunner: POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    TaskRunnerError::Unreachable(format!("{}: {}", self.base_url, e))
                } else {
                    TaskRunnerError::Transport(format!("Request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TaskRunnerError::Transport(format!("Failed to read response: {}", e)))?;

        match serde_json::from_str::<UnitResponse>(&body) {
            Ok(UnitResponse { ok: true, output, .. }) => {
                Ok(TaskOutcome::Completed(output.unwrap_or(Value::Null)))
            }
            Ok(UnitResponse { ok: false, error, .. }) => Ok(TaskOutcome::Failed(
                error.unwrap_or_else(|| format!("Unit '{}' failed without a message", unit)),
            )),
            // A server error without a unit body is a failed attempt, not a protocol error
            Err(_) if status.is_server_error() => Ok(TaskOutcome::Failed(format!(
                "Worker returned HTTP {} for unit '{}'",
                status, unit
            ))),
            Err(e) => Err(TaskRunnerError::InvalidResponse(format!(
                "HTTP {} from {}: {}",
                status, url, e
            ))),
        }
    }
}
