//! # Agent Handoffs
//!
//! The [`HandoffController`] tracks which agent owns a conversation during
//! one runner invocation and validates every transfer of ownership.
//!
//! ```text
//!   Active(a) ──request──▶ Transferring ──ok──▶ Active(b)
//!       ▲                       │
//!       └──────rejected─────────┤
//!                               └──chain full──▶ ChainLimitExceeded
//!
//!   Active(_) ──final answer / fatal error──▶ Terminated
//! ```
//!
//! A rejected request leaves ownership unchanged so the agent can be asked
//! again. Exceeding the chain limit is terminal. Accepted transfers are
//! written to the session as a visible turn and a [`HandoffRecord`], and are
//! never undone.
//!
//! Whether an agent may regain ownership after handing it away is a policy
//! choice ([`HandoffPolicy::allow_cycles`]); it is permitted by default.
//!
//! The chain limit and the cycle policy apply to the session's whole handoff
//! chain. A controller built with [`HandoffController::for_session`] starts
//! from the handoffs earlier invocations already recorded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::config::RuntimeConfig;
use crate::items::HandoffRecord;
use crate::session::Session;

/// Ownership state of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "agent", rename_all = "snake_case")]
pub enum HandoffState {
    Active(String),
    Transferring,
    Terminated,
    ChainLimitExceeded,
}

/// Rules a transfer must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffPolicy {
    /// Maximum accepted transfers on a session's chain.
    pub max_chain: usize,
    pub allow_cycles: bool,
    /// Agents that can never receive ownership.
    pub disallow: HashSet<String>,
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for HandoffPolicy {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_chain: config.max_handoff_chain,
            allow_cycles: config.allow_handoff_cycles,
            disallow: config.handoff_disallow.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// The request was invalid; ownership is unchanged.
    #[error("handoff from '{from}' to '{target}' rejected: {reason}")]
    Rejected {
        from: String,
        target: String,
        reason: String,
    },

    /// Accepting the request would exceed the chain limit.
    #[error("handoff chain limit of {max_chain} reached (requested '{target}')")]
    ChainLimitExceeded { max_chain: usize, target: String },
}

/// Handoff counters for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffStats {
    pub requested: usize,
    pub accepted: usize,
    /// Invalid requests plus the one that hit the chain limit, if any.
    pub rejected: usize,
    /// Length of the session's handoff chain.
    pub chain_length: usize,
}

impl HandoffStats {
    pub fn success_rate(&self) -> f64 {
        if self.requested == 0 {
            0.0
        } else {
            self.accepted as f64 / self.requested as f64
        }
    }
}

/// State machine over agent ownership for a single invocation.
#[derive(Debug, Clone)]
pub struct HandoffController {
    state: HandoffState,
    policy: HandoffPolicy,
    visited: Vec<String>,
    records: Vec<HandoffRecord>,
    stats: HandoffStats,
}

impl HandoffController {
    pub fn new(starting_agent: impl Into<String>, policy: HandoffPolicy) -> Self {
        let start = starting_agent.into();
        Self {
            state: HandoffState::Active(start.clone()),
            policy,
            visited: vec![start],
            records: Vec::new(),
            stats: HandoffStats::default(),
        }
    }

    /// Controller owned by `starting_agent` that counts the handoffs already
    /// in `session` against the chain limit and the cycle policy.
    pub fn for_session(
        session: &Session,
        starting_agent: impl Into<String>,
        policy: HandoffPolicy,
    ) -> Self {
        let mut controller = Self::new(starting_agent, policy);
        let chain = session.handoff_chain();
        let mut visited: Vec<String> = Vec::with_capacity(chain.len() * 2 + 1);
        for record in chain {
            for agent in [&record.from_agent, &record.to_agent] {
                if !visited.contains(agent) {
                    visited.push(agent.clone());
                }
            }
        }
        for agent in controller.visited.drain(..) {
            if !visited.contains(&agent) {
                visited.push(agent);
            }
        }
        controller.visited = visited;
        controller.records = chain.to_vec();
        controller.stats.chain_length = chain.len();
        controller
    }

    pub fn state(&self) -> &HandoffState {
        &self.state
    }

    /// The owning agent, while active.
    pub fn current(&self) -> Option<&str> {
        match &self.state {
            HandoffState::Active(agent) => Some(agent),
            _ => None,
        }
    }

    /// Every transfer on the session's chain, earlier invocations included.
    pub fn records(&self) -> &[HandoffRecord] {
        &self.records
    }

    /// Agents that have owned the conversation, in order.
    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    pub fn stats(&self) -> HandoffStats {
        self.stats
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            HandoffState::Terminated | HandoffState::ChainLimitExceeded
        )
    }

    fn rejection(&self, from: &str, target: &str) -> Option<String> {
        if target == from {
            return Some("an agent cannot hand off to itself".to_string());
        }
        if self.policy.disallow.contains(target) {
            return Some("target is on the disallow list".to_string());
        }
        if !self.policy.allow_cycles && self.visited.iter().any(|v| v == target) {
            return Some("target already owned this conversation".to_string());
        }
        None
    }

    /// Validates and applies a handoff request.
    ///
    /// On success the session gains a handoff turn and record, and `target`
    /// becomes the owner. A rejection restores `Active(current)`.
    pub fn transfer(
        &mut self,
        session: &mut Session,
        agents: &AgentRegistry,
        target: &str,
        reason: &str,
    ) -> Result<HandoffRecord, HandoffError> {
        self.stats.requested += 1;
        let result = self.try_transfer(session, agents, target, reason);
        match &result {
            Ok(_) => self.stats.accepted += 1,
            Err(_) => self.stats.rejected += 1,
        }
        self.stats.chain_length = self.records.len();
        result
    }

    fn try_transfer(
        &mut self,
        session: &mut Session,
        agents: &AgentRegistry,
        target: &str,
        reason: &str,
    ) -> Result<HandoffRecord, HandoffError> {
        let from = match &self.state {
            HandoffState::Active(agent) => agent.clone(),
            other => {
                return Err(HandoffError::Rejected {
                    from: String::new(),
                    target: target.to_string(),
                    reason: format!("controller is not active ({:?})", other),
                })
            }
        };
        self.state = HandoffState::Transferring;

        let rejection = match agents.get(&from) {
            _ if !agents.contains(target) => Some("unknown agent".to_string()),
            Some(agent) if !agent.can_hand_off_to(target) => {
                Some(format!("'{}' is not a handoff target of '{}'", target, from))
            }
            _ => self.rejection(&from, target),
        };
        if let Some(reason) = rejection {
            warn!(from = %from, target = %target, "handoff rejected: {}", reason);
            self.state = HandoffState::Active(from.clone());
            return Err(HandoffError::Rejected {
                from,
                target: target.to_string(),
                reason,
            });
        }

        if self.records.len() >= self.policy.max_chain {
            warn!(from = %from, target = %target, max_chain = self.policy.max_chain, "handoff chain limit exceeded");
            self.state = HandoffState::ChainLimitExceeded;
            return Err(HandoffError::ChainLimitExceeded {
                max_chain: self.policy.max_chain,
                target: target.to_string(),
            });
        }

        let record = session.push_handoff(&from, target, reason);
        info!(from = %from, to = %target, turn = record.turn_index, "handoff");
        self.records.push(record.clone());
        self.visited.push(target.to_string());
        self.state = HandoffState::Active(target.to_string());
        Ok(record)
    }

    /// Ends the invocation. Absorbing.
    pub fn terminate(&mut self) {
        if self.state != HandoffState::ChainLimitExceeded {
            debug!(state = ?self.state, "handoff controller terminated");
            self.state = HandoffState::Terminated;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::tool_registry::ToolRegistry;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn agents() -> AgentRegistry {
        AgentRegistry::build(
            Arc::new(ToolRegistry::new()),
            vec![
                Agent::builder("a", "A").handoff("b").handoff("c"),
                Agent::builder("b", "B").handoff("a").handoff("c"),
                Agent::builder("c", "C").handoff("a"),
            ],
        )
        .unwrap()
    }

    fn policy(max_chain: usize, allow_cycles: bool) -> HandoffPolicy {
        HandoffPolicy {
            max_chain,
            allow_cycles,
            disallow: HashSet::new(),
        }
    }

    #[test]
    fn test_transfer_updates_owner_and_session() {
        let agents = agents();
        let mut session = Session::new("s");
        session.push_user("hi");
        let mut ctl = HandoffController::new("a", policy(5, true));

        let record = ctl.transfer(&mut session, &agents, "b", "needs b").unwrap();

        assert_eq!(ctl.current(), Some("b"));
        assert_eq!(record.from_agent, "a");
        assert_eq!(record.turn_index, 1);
        assert_eq!(session.handoff_chain(), ctl.records());
        assert_eq!(session.owner(), Some("b"));
        assert_eq!(ctl.visited(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_rejections_keep_owner() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut ctl = HandoffController::new("c", policy(5, true));

        for target in ["ghost", "c", "b"] {
            let err = ctl.transfer(&mut session, &agents, target, "").unwrap_err();
            assert!(matches!(err, HandoffError::Rejected { .. }), "{}", target);
            assert_eq!(ctl.state(), &HandoffState::Active("c".to_string()));
        }
        assert!(session.handoff_chain().is_empty());
        assert_eq!(session.turn_counter(), 0);
    }

    #[test]
    fn test_chain_limit_is_terminal() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut ctl = HandoffController::new("a", policy(2, true));

        ctl.transfer(&mut session, &agents, "b", "1").unwrap();
        ctl.transfer(&mut session, &agents, "c", "2").unwrap();
        let err = ctl.transfer(&mut session, &agents, "a", "3").unwrap_err();

        assert_eq!(
            err,
            HandoffError::ChainLimitExceeded {
                max_chain: 2,
                target: "a".to_string()
            }
        );
        assert_eq!(ctl.state(), &HandoffState::ChainLimitExceeded);
        assert_eq!(session.handoff_chain().len(), 2);

        ctl.terminate();
        assert_eq!(ctl.state(), &HandoffState::ChainLimitExceeded);
        assert!(ctl.transfer(&mut session, &agents, "b", "4").is_err());
    }

    #[test]
    fn test_cycle_policy() {
        let agents = agents();

        let mut session = Session::new("s");
        let mut strict = HandoffController::new("a", policy(5, false));
        strict.transfer(&mut session, &agents, "b", "").unwrap();
        assert!(matches!(
            strict.transfer(&mut session, &agents, "a", ""),
            Err(HandoffError::Rejected { .. })
        ));

        let mut session = Session::new("s");
        let mut permissive = HandoffController::new("a", policy(5, true));
        permissive.transfer(&mut session, &agents, "b", "").unwrap();
        permissive.transfer(&mut session, &agents, "a", "").unwrap();
        assert_eq!(permissive.current(), Some("a"));
    }

    #[test]
    fn test_disallow_list() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut p = policy(5, true);
        p.disallow.insert("c".to_string());
        let mut ctl = HandoffController::new("a", p);

        assert!(ctl.transfer(&mut session, &agents, "c", "").is_err());
        assert!(ctl.transfer(&mut session, &agents, "b", "").is_ok());
    }

    #[test]
    fn test_session_chain_counts_against_limit() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut first = HandoffController::for_session(&session, "a", policy(2, true));
        first.transfer(&mut session, &agents, "b", "1").unwrap();
        first.terminate();

        let mut second = HandoffController::for_session(&session, "b", policy(2, true));
        assert_eq!(second.records(), session.handoff_chain());
        assert_eq!(second.stats().chain_length, 1);
        second.transfer(&mut session, &agents, "c", "2").unwrap();

        let err = second.transfer(&mut session, &agents, "a", "3").unwrap_err();
        assert!(matches!(err, HandoffError::ChainLimitExceeded { max_chain: 2, .. }));
        assert_eq!(session.handoff_chain().len(), 2);
    }

    #[test]
    fn test_session_chain_seeds_cycle_check() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut first = HandoffController::for_session(&session, "a", policy(5, false));
        first.transfer(&mut session, &agents, "b", "").unwrap();

        // "a" only appears as the sender of the earlier handoff.
        let mut second = HandoffController::for_session(&session, "b", policy(5, false));
        assert_eq!(second.visited(), &["a".to_string(), "b".to_string()]);
        assert!(matches!(
            second.transfer(&mut session, &agents, "a", ""),
            Err(HandoffError::Rejected { .. })
        ));
        assert!(second.transfer(&mut session, &agents, "c", "").is_ok());
    }

    #[test]
    fn test_stats_count_requests() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut ctl = HandoffController::new("a", policy(1, true));
        assert_eq!(ctl.stats().success_rate(), 0.0);

        assert!(ctl.transfer(&mut session, &agents, "ghost", "").is_err());
        ctl.transfer(&mut session, &agents, "b", "").unwrap();
        assert!(ctl.transfer(&mut session, &agents, "c", "").is_err());

        let stats = ctl.stats();
        assert_eq!(
            stats,
            HandoffStats {
                requested: 3,
                accepted: 1,
                rejected: 2,
                chain_length: 1,
            }
        );
        assert!((stats.success_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_terminate_is_absorbing() {
        let agents = agents();
        let mut session = Session::new("s");
        let mut ctl = HandoffController::new("a", policy(5, true));
        ctl.terminate();
        assert!(ctl.is_terminal());
        assert_eq!(ctl.current(), None);
        assert!(ctl.transfer(&mut session, &agents, "b", "").is_err());
        assert_eq!(ctl.state(), &HandoffState::Terminated);
    }
}
