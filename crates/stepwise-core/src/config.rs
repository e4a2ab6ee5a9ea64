use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StepwiseError;

/// Top-level configuration loaded from `.stepwise.toml`.
///
/// Every clustering/context threshold the pipeline uses is tunable here;
/// the defaults are starting points, not fixed law.
///
/// # Examples
///
/// ```
/// use stepwise_core::StepwiseConfig;
///
/// let config = StepwiseConfig::default();
/// assert_eq!(config.cluster.proximity_lines, 10);
/// assert_eq!(config.queue.max_attempts, 5);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwiseConfig {
    /// Reasoning-model provider settings.
    #[serde(default)]
    pub model: ModelConfig,
    /// Repository host settings.
    #[serde(default)]
    pub host: HostConfig,
    /// Change-unit clustering thresholds.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Context index and pack limits.
    #[serde(default)]
    pub context: ContextConfig,
    /// Dispatcher retry and worker settings.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl StepwiseConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Io`] if the file cannot be read, or
    /// [`StepwiseError::Toml`] if the content is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self, StepwiseError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use stepwise_core::StepwiseConfig;
    ///
    /// let toml = r#"
    /// [cluster]
    /// max_step_lines = 200
    /// "#;
    /// let config = StepwiseConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.cluster.max_step_lines, 200);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, StepwiseError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }
}

/// Reasoning-model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name (e.g. `"openai"`, `"ollama"`, anything
    /// OpenAI-compatible).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Request timeout in seconds (default: 120). Expiry is treated as a
    /// retryable failure by the dispatcher.
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_model_timeout() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            timeout_secs: default_model_timeout(),
        }
    }
}

/// Repository host (GitHub) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Access token; falls back to the `GITHUB_TOKEN` env var when absent.
    pub token: Option<String>,
    /// API base URL override (GitHub Enterprise).
    pub base_url: Option<String>,
    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_host_timeout")]
    pub timeout_secs: u64,
}

fn default_host_timeout() -> u64 {
    30
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: None,
            timeout_secs: default_host_timeout(),
        }
    }
}

/// Clustering thresholds.
///
/// # Examples
///
/// ```
/// use stepwise_core::ClusterConfig;
///
/// let config = ClusterConfig::default();
/// assert_eq!(config.proximity_lines, 10);
/// assert_eq!(config.max_step_lines, 400);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Maximum gap (in lines) between same-file hunks merged into one
    /// candidate (default: 10).
    #[serde(default = "default_proximity_lines")]
    pub proximity_lines: u32,
    /// Changed-line cap per step; larger groups are split back into
    /// file-level candidates (default: 400).
    #[serde(default = "default_max_step_lines")]
    pub max_step_lines: u32,
}

fn default_proximity_lines() -> u32 {
    10
}

fn default_max_step_lines() -> u32 {
    400
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            proximity_lines: default_proximity_lines(),
            max_step_lines: default_max_step_lines(),
        }
    }
}

/// Context index and pack limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum symbols per context pack (default: 50).
    #[serde(default = "default_max_symbols")]
    pub max_symbols: usize,
    /// Maximum files indexed per (repo, commit); beyond this the index is
    /// marked truncated (default: 2000).
    #[serde(default = "default_max_indexed_files")]
    pub max_indexed_files: usize,
}

fn default_max_symbols() -> usize {
    50
}

fn default_max_indexed_files() -> usize {
    2000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_symbols: default_max_symbols(),
            max_indexed_files: default_max_indexed_files(),
        }
    }
}

/// Dispatcher retry and worker-pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempt cap before a job is marked failed (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds (default: 200).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay, in milliseconds
    /// (default: 30000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Worker tasks pulling from the queue (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_workers() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            workers: default_workers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = StepwiseConfig::default();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.model, "gpt-4o");
        assert_eq!(config.model.timeout_secs, 120);
        assert_eq!(config.host.timeout_secs, 30);
        assert_eq!(config.cluster.proximity_lines, 10);
        assert_eq!(config.cluster.max_step_lines, 400);
        assert_eq!(config.context.max_symbols, 50);
        assert_eq!(config.context.max_indexed_files, 2000);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.workers, 4);
    }

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
[cluster]
proximity_lines = 4
"#;
        let config = StepwiseConfig::from_toml(toml).unwrap();
        assert_eq!(config.cluster.proximity_lines, 4);
        assert_eq!(config.cluster.max_step_lines, 400);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[model]
provider = "ollama"
model = "qwen2.5-coder"
base_url = "http://localhost:11434"
timeout_secs = 60

[host]
base_url = "https://github.example.com/api/v3"
timeout_secs = 10

[cluster]
proximity_lines = 6
max_step_lines = 250

[context]
max_symbols = 25
max_indexed_files = 500

[queue]
max_attempts = 3
backoff_base_ms = 50
workers = 8
"#;
        let config = StepwiseConfig::from_toml(toml).unwrap();
        assert_eq!(config.model.provider, "ollama");
        assert_eq!(config.model.timeout_secs, 60);
        assert_eq!(config.host.timeout_secs, 10);
        assert_eq!(config.cluster.max_step_lines, 250);
        assert_eq!(config.context.max_symbols, 25);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.workers, 8);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = StepwiseConfig::from_toml("").unwrap();
        assert_eq!(config.context.max_symbols, 50);
        assert_eq!(config.queue.backoff_cap_ms, 30_000);
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result = StepwiseConfig::from_toml("{{invalid}}");
        assert!(result.is_err());
    }
}
