//! Configuration for the runner
//!
//! Loop bounds, retry budgets, deadlines and handoff policy. Values can be
//! built in code, read from the environment, or loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigurationError;

/// Runtime configuration shared by every invocation of a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of loop iterations (decisions) per invocation.
    pub max_turns: usize,

    /// Maximum number of handoffs per invocation.
    pub max_handoff_chain: usize,

    /// Re-prompts allowed per turn after an unusable decision.
    pub decision_retry_budget: usize,

    /// Deadline for one model decision call. `None` disables the deadline.
    pub decision_timeout_ms: Option<u64>,

    /// Deadline applied to tools that do not declare their own.
    pub tool_timeout_ms: u64,

    /// Upper bound on how long a trace flush may delay the caller.
    pub export_timeout_ms: u64,

    /// Whether an agent may regain ownership after delegating away.
    pub allow_handoff_cycles: bool,

    /// Agents that can never receive a handoff.
    pub handoff_disallow: Vec<String>,

    /// Only the most recent turns are shown to the model when set.
    pub history_window: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_handoff_chain: 5,
            decision_retry_budget: 2,
            decision_timeout_ms: Some(60_000),
            tool_timeout_ms: 30_000,
            export_timeout_ms: 2_000,
            allow_handoff_cycles: true,
            handoff_disallow: Vec::new(),
            history_window: None,
        }
    }
}

impl RuntimeConfig {
    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_ms.map(Duration::from_millis)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    /// Rejects configurations the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_turns == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "max_turns must be at least 1".to_string(),
            ));
        }
        if self.max_handoff_chain == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "max_handoff_chain must be at least 1".to_string(),
            ));
        }
        if self.tool_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "tool_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: RuntimeConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn max_turns(mut self, turns: usize) -> Self {
        self.config.max_turns = turns;
        self
    }

    pub fn max_handoff_chain(mut self, chain: usize) -> Self {
        self.config.max_handoff_chain = chain;
        self
    }

    pub fn decision_retry_budget(mut self, retries: usize) -> Self {
        self.config.decision_retry_budget = retries;
        self
    }

    pub fn decision_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.decision_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn export_timeout(mut self, timeout: Duration) -> Self {
        self.config.export_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn allow_handoff_cycles(mut self, allow: bool) -> Self {
        self.config.allow_handoff_cycles = allow;
        self
    }

    pub fn disallow_handoff_to(mut self, agent: impl Into<String>) -> Self {
        self.config.handoff_disallow.push(agent.into());
        self
    }

    pub fn history_window(mut self, turns: usize) -> Self {
        self.config.history_window = Some(turns);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load configuration from environment variables, falling back to defaults.
pub fn from_env() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();

    if let Some(turns) = env_parse("AGENT_MAX_TURNS") {
        config.max_turns = turns;
    }
    if let Some(chain) = env_parse("AGENT_MAX_HANDOFF_CHAIN") {
        config.max_handoff_chain = chain;
    }
    if let Some(retries) = env_parse("AGENT_DECISION_RETRIES") {
        config.decision_retry_budget = retries;
    }
    if let Ok(raw) = std::env::var("AGENT_DECISION_TIMEOUT_MS") {
        config.decision_timeout_ms = match raw.trim() {
            "" | "0" | "none" => None,
            other => other.parse().ok().or(config.decision_timeout_ms),
        };
    }
    if let Some(ms) = env_parse("AGENT_TOOL_TIMEOUT_MS") {
        config.tool_timeout_ms = ms;
    }
    if let Ok(cycles) = std::env::var("AGENT_ALLOW_HANDOFF_CYCLES") {
        config.allow_handoff_cycles = cycles.to_lowercase() == "true" || cycles == "1";
    }

    config
}

/// Load configuration from a TOML file.
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<RuntimeConfig, ConfigurationError> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        ConfigurationError::InvalidConfig(format!(
            "cannot read {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;
    from_toml_str(&contents)
}

/// Parse and validate configuration from TOML text.
pub fn from_toml_str(contents: &str) -> Result<RuntimeConfig, ConfigurationError> {
    let config: RuntimeConfig = toml::from_str(contents)
        .map_err(|e| ConfigurationError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
