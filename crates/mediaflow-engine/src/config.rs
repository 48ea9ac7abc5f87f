//! Engine configuration
//!
//! Loaded from a JSON file with every field defaulted, then overlaid with
//! `MEDIAFLOW_*` environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatcher::{NodeDefaults, NodeDispatcher};
use crate::error::{EngineError, Result};
use crate::task_runner::{RetryPolicy, RetryingTaskRunner, TaskRunner};

/// Environment variable overriding the worker base URL
pub const ENV_WORKER_URL: &str = "MEDIAFLOW_WORKER_URL";
/// Environment variable overriding the recorder database path
pub const ENV_DATABASE: &str = "MEDIAFLOW_DATABASE";
/// Environment variable overriding the default max attempts
pub const ENV_MAX_ATTEMPTS: &str = "MEDIAFLOW_MAX_ATTEMPTS";

/// Where delegate units are sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            request_timeout_secs: 300,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub node_defaults: NodeDefaults,
    /// Retry policy for units without an override
    pub retry: RetryPolicy,
    /// Per-unit retry overrides keyed by unit name
    pub unit_retry: HashMap<String, RetryPolicy>,
    pub worker: WorkerConfig,
    /// SQLite database for run records; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Read a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        log::debug!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Overlay `MEDIAFLOW_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(ENV_WORKER_URL) {
            self.worker.base_url = url;
        }
        if let Some(path) = var(ENV_DATABASE) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = var(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = raw.trim().parse().map_err(|_| {
                EngineError::config(format!("{} must be a positive integer, got '{}'", ENV_MAX_ATTEMPTS, raw))
            })?;
        }
        Ok(())
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        self.retry
            .validate()
            .map_err(|e| EngineError::config(format!("retry: {}", e)))?;
        for (unit, policy) in &self.unit_retry {
            policy
                .validate()
                .map_err(|e| EngineError::config(format!("unitRetry.{}: {}", unit, e)))?;
        }
        if self.worker.base_url.trim().is_empty() {
            return Err(EngineError::config("worker.baseUrl is empty"));
        }
        Ok(())
    }

    /// Wrap a single-attempt runner with the configured retry policies
    pub fn retrying<R: TaskRunner>(&self, runner: R) -> RetryingTaskRunner<R> {
        self.unit_retry.iter().fold(
            RetryingTaskRunner::new(runner).with_default_policy(self.retry.clone()),
            |retrying, (unit, policy)| retrying.with_unit_policy(unit.clone(), policy.clone()),
        )
    }

    /// Build a dispatcher around `runner` using the configured node defaults
    pub fn dispatcher(&self, runner: Arc<dyn TaskRunner>) -> NodeDispatcher {
        NodeDispatcher::new(runner).with_defaults(self.node_defaults.clone())
    }

    /// Dispatcher backed by the configured HTTP worker, with retries
    #[cfg(feature = "http-runner")]
    pub fn http_dispatcher(&self) -> Result<NodeDispatcher> {
        let http = crate::http_runner::HttpTaskRunner::new(
            self.worker.base_url.clone(),
            std::time::Duration::from_secs(self.worker.request_timeout_secs),
        )?;
        Ok(self.dispatcher(Arc::new(self.retrying(http))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.node_defaults.default_model, "gemini-2.0-flash");
        assert_eq!(config.node_defaults.default_prompt, "Describe this image");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.worker.request_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "nodeDefaults": {{"defaultModel": "gemini-1.5-pro"}},
                "retry": {{"maxAttempts": 5, "randomize": false}},
                "unitRetry": {{"llm-generate": {{"maxAttempts": 2}}}},
                "worker": {{"baseUrl": "http://worker:9000"}}
            }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.node_defaults.default_model, "gemini-1.5-pro");
        assert_eq!(config.node_defaults.default_prompt, "Describe this image");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.min_timeout_ms, 1000);
        assert_eq!(config.unit_retry["llm-generate"].max_attempts, 2);
        assert_eq!(config.worker.base_url, "http://worker:9000");
        assert_eq!(config.worker.request_timeout_secs, 300);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = EngineConfig::default();
        config
            .apply_vars(|key| match key {
                ENV_WORKER_URL => Some("http://env-worker".to_string()),
                ENV_DATABASE => Some("/tmp/runs.db".to_string()),
                ENV_MAX_ATTEMPTS => Some("7".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.worker.base_url, "http://env-worker");
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/runs.db")));
        assert_eq!(config.retry.max_attempts, 7);

        let bad = config.apply_vars(|key| (key == ENV_MAX_ATTEMPTS).then(|| "many".to_string()));
        assert!(matches!(bad, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config
            .unit_retry
            .insert("crop".into(), RetryPolicy { factor: 0.5, ..RetryPolicy::default() });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unitRetry.crop"), "got: {}", err);
    }

    #[test]
    fn test_retrying_runner_uses_overrides() {
        struct Noop;

        #[async_trait::async_trait]
        impl TaskRunner for Noop {
            async fn submit(
                &self,
                _unit: &str,
                _payload: serde_json::Value,
            ) -> std::result::Result<crate::task_runner::TaskOutcome, crate::error::TaskRunnerError> {
                Ok(crate::task_runner::TaskOutcome::Completed(serde_json::Value::Null))
            }
        }

        let mut config = EngineConfig::default();
        config.unit_retry.insert("crop".into(), RetryPolicy::no_retry());
        let runner = config.retrying(Noop);
        assert_eq!(runner.policy_for("crop").max_attempts, 1);
        assert_eq!(runner.policy_for("llm-generate").max_attempts, 3);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::load("/definitely/not/here.json"),
            Err(EngineError::Io(_))
        ));
    }
}
