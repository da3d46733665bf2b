//! Configuration for the agent runtime.
//!
//! Values come from three layers, later layers winning:
//! 1. Built-in defaults
//! 2. An optional TOML file (`[agent]`, `[kernel]`, `[memory]`, `[tools]`)
//! 3. `PULSE_*` environment variables (a `.env` file is loaded first)
//!
//! Durations are expressed in milliseconds in both the file and the
//! environment.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentType, RetryPolicy};
use crate::error::ConfigError;

/// Main configuration for the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub kernel: KernelConfig,
    pub memory: MemoryConfig,
    pub tools: ToolsConfig,
}

/// Scheduler and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Human-readable agent name.
    pub name: String,
    /// Informational agent type.
    pub agent_type: AgentType,
    /// Upper bound on tasks executing at the same time.
    pub max_concurrent_tasks: usize,
    pub heartbeat_interval_ms: u64,
    /// Default timeout applied to tasks created without one.
    pub task_timeout_ms: u64,
    /// How long the dispatch loop waits on an empty queue before re-checking
    /// for shutdown.
    pub poll_interval_ms: u64,
    /// Retry limit for kernel tasks that do not set their own.
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Finished task records kept for lookup, most recently finished first.
    pub task_history: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "pulse-agent".to_string(),
            agent_type: AgentType::Hybrid,
            max_concurrent_tasks: 1,
            heartbeat_interval_ms: 30_000,
            task_timeout_ms: 300_000,
            poll_interval_ms: 1_000,
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            task_history: 1_000,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Build the backoff policy described by this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Kernel endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// WebSocket URL for the push-event feed.
    pub ws_url: String,
    /// Base HTTP URL; requests are posted to `{http_url}/rpc`.
    pub http_url: String,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:9876".to_string(),
            http_url: "http://localhost:8080".to_string(),
            connect_timeout_ms: 10_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl KernelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Memory store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Dimension of the embedding vectors.
    pub embedding_dim: usize,
    /// Working tier size that triggers eviction.
    pub max_short_term: usize,
    /// Advisory long-term capacity; exceeding it is logged, not enforced.
    pub max_long_term: usize,
    /// Directory for persisted long-term entries (one JSON file per key).
    pub storage_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            max_short_term: 100,
            max_long_term: 10_000,
            storage_path: None,
        }
    }
}

/// Tool gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Working directory used when a call does not specify one.
    pub working_dir: Option<PathBuf>,
    pub default_timeout_ms: u64,
    /// Upper bound on tool processes running at the same time.
    pub max_concurrent: usize,
    /// Environment overrides applied to every tool process.
    pub env: HashMap<String, String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            default_timeout_ms: 300_000,
            max_concurrent: 4,
            env: HashMap::new(),
        }
    }
}

impl ToolsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PULSE_*` overrides using the given variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("PULSE_AGENT_NAME") {
            self.agent.name = name;
        }
        parse_var(&lookup, "PULSE_AGENT_TYPE", &mut self.agent.agent_type)?;
        parse_var(
            &lookup,
            "PULSE_MAX_CONCURRENT_TASKS",
            &mut self.agent.max_concurrent_tasks,
        )?;
        parse_var(
            &lookup,
            "PULSE_HEARTBEAT_INTERVAL_MS",
            &mut self.agent.heartbeat_interval_ms,
        )?;
        parse_var(&lookup, "PULSE_TASK_TIMEOUT_MS", &mut self.agent.task_timeout_ms)?;
        parse_var(&lookup, "PULSE_POLL_INTERVAL_MS", &mut self.agent.poll_interval_ms)?;
        parse_var(&lookup, "PULSE_MAX_RETRIES", &mut self.agent.max_retries)?;
        parse_var(&lookup, "PULSE_TASK_HISTORY", &mut self.agent.task_history)?;

        if let Some(url) = lookup("PULSE_KERNEL_WS_URL") {
            self.kernel.ws_url = url;
        }
        if let Some(url) = lookup("PULSE_KERNEL_HTTP_URL") {
            self.kernel.http_url = url;
        }
        parse_var(
            &lookup,
            "PULSE_KERNEL_CALL_TIMEOUT_MS",
            &mut self.kernel.call_timeout_ms,
        )?;

        parse_var(&lookup, "PULSE_EMBEDDING_DIM", &mut self.memory.embedding_dim)?;
        parse_var(&lookup, "PULSE_MAX_SHORT_TERM", &mut self.memory.max_short_term)?;
        parse_var(&lookup, "PULSE_MAX_LONG_TERM", &mut self.memory.max_long_term)?;
        if let Some(path) = lookup("PULSE_MEMORY_STORAGE_PATH") {
            self.memory.storage_path = Some(PathBuf::from(path));
        }

        if let Some(dir) = lookup("PULSE_TOOLS_WORKING_DIR") {
            self.tools.working_dir = Some(PathBuf::from(dir));
        }
        parse_var(
            &lookup,
            "PULSE_TOOL_TIMEOUT_MS",
            &mut self.tools.default_timeout_ms,
        )?;
        parse_var(
            &lookup,
            "PULSE_MAX_CONCURRENT_TOOLS",
            &mut self.tools.max_concurrent,
        )?;

        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_concurrent_tasks == 0 {
            return Err(invalid("agent.max_concurrent_tasks", "must be at least 1"));
        }
        let durations = [
            ("agent.heartbeat_interval_ms", self.agent.heartbeat_interval_ms),
            ("agent.task_timeout_ms", self.agent.task_timeout_ms),
            ("agent.poll_interval_ms", self.agent.poll_interval_ms),
            ("kernel.connect_timeout_ms", self.kernel.connect_timeout_ms),
            ("kernel.call_timeout_ms", self.kernel.call_timeout_ms),
            ("tools.default_timeout_ms", self.tools.default_timeout_ms),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(invalid(key, "must be positive"));
        }
        if self.agent.task_history == 0 {
            return Err(invalid("agent.task_history", "must be at least 1"));
        }
        if self.agent.backoff_multiplier < 1.0 {
            return Err(invalid("agent.backoff_multiplier", "must be >= 1.0"));
        }
        if self.memory.embedding_dim == 0 {
            return Err(invalid("memory.embedding_dim", "must be positive"));
        }
        if self.tools.max_concurrent == 0 {
            return Err(invalid("tools.max_concurrent", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|e: T::Err| invalid(key, e))?;
    }
    Ok(())
}

fn invalid(key: &str, message: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_baseline() {
        let config = Config::default();
        assert_eq!(config.agent.max_concurrent_tasks, 1);
        assert_eq!(config.agent.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.agent.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.memory.max_short_term, 100);
        assert_eq!(config.kernel.ws_url, "ws://localhost:9876");
    }

    #[test]
    fn test_toml_sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [agent]
            name = "builder"
            agent_type = "reactive"
            max_concurrent_tasks = 4

            [memory]
            max_short_term = 10
            storage_path = "/tmp/pulse-memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.name, "builder");
        assert_eq!(config.agent.agent_type, AgentType::Reactive);
        assert_eq!(config.agent.max_concurrent_tasks, 4);
        assert_eq!(config.agent.task_timeout_ms, 300_000);
        assert_eq!(config.memory.max_short_term, 10);
        assert_eq!(
            config.memory.storage_path,
            Some(PathBuf::from("/tmp/pulse-memory"))
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PULSE_AGENT_NAME", "env-agent"),
            ("PULSE_MAX_CONCURRENT_TASKS", "3"),
            ("PULSE_KERNEL_HTTP_URL", "http://kernel:9000"),
            ("PULSE_MAX_SHORT_TERM", "42"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.agent.name, "env-agent");
        assert_eq!(config.agent.max_concurrent_tasks, 3);
        assert_eq!(config.kernel.http_url, "http://kernel:9000");
        assert_eq!(config.memory.max_short_term, 42);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "PULSE_MAX_RETRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PULSE_MAX_RETRIES"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::from_toml_str("[agent]\nmax_concurrent_tasks = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_zero_durations_rejected() {
        for (section, field) in [
            ("agent", "heartbeat_interval_ms"),
            ("agent", "poll_interval_ms"),
            ("agent", "task_timeout_ms"),
            ("kernel", "call_timeout_ms"),
            ("kernel", "connect_timeout_ms"),
            ("tools", "default_timeout_ms"),
        ] {
            let err = Config::from_toml_str(&format!("[{section}]\n{field} = 0\n")).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if *key == format!("{section}.{field}")),
                "{section}.{field} = 0 was accepted"
            );
        }
    }

    #[test]
    fn test_zero_heartbeat_from_env_rejected() {
        let mut config = Config::default();
        config
            .apply_env(|key| (key == "PULSE_HEARTBEAT_INTERVAL_MS").then(|| "0".to_string()))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = AgentConfig::default().retry_policy();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_retries, 3);
    }
}
