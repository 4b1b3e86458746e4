//! # Token Usage Accounting
//!
//! Model clients may report token counts with each response. The runner sums
//! them per invocation and per agent so callers can see which agent in a
//! handoff chain consumed what.
//!
//! ```rust
//! use agent_orchestrator::usage::{Usage, UsageStats};
//!
//! let mut stats = UsageStats::new();
//! stats.record("triage", &Usage::new(120, 30));
//! stats.record("billing", &Usage::new(500, 150));
//!
//! assert_eq!(stats.total.total_tokens, 800);
//! assert_eq!(stats.by_agent["billing"].request_count, 1);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Add;

/// Token usage for one or more model calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    /// Prompt plus completion.
    pub total_tokens: usize,
    /// Number of model requests folded into this value.
    pub request_count: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            request_count: 1,
        }
    }

    pub fn add_usage(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.request_count += other.request_count;
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(mut self, other: Usage) -> Usage {
        self.add_usage(&other);
        self
    }
}

/// Usage aggregated over an invocation, with a per-agent breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub total: Usage,
    pub by_agent: BTreeMap<String, Usage>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, agent: &str, usage: &Usage) {
        self.total.add_usage(usage);
        self.by_agent
            .entry(agent.to_string())
            .or_default()
            .add_usage(usage);
    }
}
