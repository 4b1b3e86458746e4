//! # Agents
//!
//! An [`Agent`] is an immutable reasoning unit: a name, instructions, model
//! settings, the tools it may call and the agents it may hand off to. It does
//! no reasoning of its own. [`Agent::decide`] shapes a request for the model
//! client and parses the answer into a [`Decision`].
//!
//! Agents are validated as a set by [`AgentRegistry::build`], because handoff
//! targets can only be checked once every agent is known.
//!
//! ```rust
//! use agent_orchestrator::agent::{Agent, AgentRegistry};
//! use agent_orchestrator::tool_registry::ToolRegistry;
//! use std::sync::Arc;
//!
//! let triage = Agent::builder("triage", "Route the customer.").handoff("billing");
//! let billing = Agent::builder("billing", "Answer invoice questions.")
//!     .handoff_description("Handles invoices and refunds");
//!
//! let agents = AgentRegistry::build(Arc::new(ToolRegistry::new()), vec![triage, billing]).unwrap();
//! assert_eq!(agents.get("triage").unwrap().handoffs(), &["billing".to_string()]);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decision::{handoff_tool_name, parse_response, Decision};
use crate::error::{ConfigurationError, DecisionError};
use crate::model::{ModelClient, ModelRequest, ModelSettings, ToolSchema};
use crate::session::Session;
use crate::tool_registry::ToolRegistry;
use crate::usage::Usage;

/// Unvalidated agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub instructions: String,
    /// Shown to other agents that may hand off to this one.
    #[serde(default)]
    pub handoff_description: String,
    #[serde(default)]
    pub settings: ModelSettings,
    /// Authorized tool names, in the order they are offered to the model.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Agents this one may hand off to.
    #[serde(default)]
    pub handoffs: Vec<String>,
}

/// Fluent constructor for [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.settings.model = model.into();
        self
    }

    pub fn settings(mut self, settings: ModelSettings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.settings.temperature = Some(temperature);
        self
    }

    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.config.tools.push(name.into());
        self
    }

    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tools.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn handoff(mut self, target: impl Into<String>) -> Self {
        self.config.handoffs.push(target.into());
        self
    }

    pub fn handoff_description(mut self, description: impl Into<String>) -> Self {
        self.config.handoff_description = description.into();
        self
    }

    pub fn config(self) -> AgentConfig {
        self.config
    }
}

impl From<AgentBuilder> for AgentConfig {
    fn from(builder: AgentBuilder) -> Self {
        builder.config
    }
}

/// A validated, immutable agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn builder(name: impl Into<String>, instructions: impl Into<String>) -> AgentBuilder {
        AgentBuilder {
            config: AgentConfig {
                name: name.into(),
                instructions: instructions.into(),
                handoff_description: String::new(),
                settings: ModelSettings::default(),
                tools: Vec::new(),
                handoffs: Vec::new(),
            },
        }
    }

    /// Checks everything that does not depend on other agents.
    pub fn new(config: AgentConfig, tools: &ToolRegistry) -> Result<Self, ConfigurationError> {
        if config.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyAgentName);
        }
        let agent = config.name.clone();
        if config.instructions.trim().is_empty() {
            return Err(ConfigurationError::EmptyInstructions { agent });
        }

        let mut seen = HashSet::new();
        for tool in &config.tools {
            if !tools.contains(tool) {
                return Err(ConfigurationError::UnknownTool {
                    agent,
                    tool: tool.clone(),
                });
            }
            if !seen.insert(tool.as_str()) {
                return Err(ConfigurationError::DuplicateAgentTool {
                    agent,
                    tool: tool.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for target in &config.handoffs {
            if target == &config.name {
                return Err(ConfigurationError::SelfHandoff { agent });
            }
            if !seen.insert(target.as_str()) {
                return Err(ConfigurationError::DuplicateHandoffTarget {
                    agent,
                    target: target.clone(),
                });
            }
        }

        Ok(Self { config })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn instructions(&self) -> &str {
        &self.config.instructions
    }

    pub fn handoff_description(&self) -> &str {
        &self.config.handoff_description
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.config.settings
    }

    pub fn tools(&self) -> &[String] {
        &self.config.tools
    }

    pub fn handoffs(&self) -> &[String] {
        &self.config.handoffs
    }

    pub fn can_use_tool(&self, name: &str) -> bool {
        self.config.tools.iter().any(|t| t == name)
    }

    pub fn can_hand_off_to(&self, target: &str) -> bool {
        self.config.handoffs.iter().any(|t| t == target)
    }

    /// System prompt: instructions followed by the tools and handoff targets.
    pub fn build_system_message(&self, tools: &ToolRegistry, agents: &AgentRegistry) -> String {
        let mut content = self.config.instructions.clone();

        if !self.config.tools.is_empty() {
            content.push_str("\n\nYou have access to the following tools:\n");
            for name in &self.config.tools {
                let description = tools
                    .descriptor(name)
                    .map(|d| d.description.as_str())
                    .unwrap_or_default();
                content.push_str(&format!("- {}: {}\n", name, description));
            }
        }

        if !self.config.handoffs.is_empty() {
            content.push_str("\n\nYou can hand off to the following agents:\n");
            for target in &self.config.handoffs {
                let description = agents
                    .get(target)
                    .map(|a| a.handoff_description())
                    .unwrap_or_default();
                content.push_str(&format!("- {}: {}\n", target, description));
            }
        }

        content
    }

    /// Authorized tool schemas followed by one pseudo-tool per handoff target.
    pub fn tool_schemas(&self, tools: &ToolRegistry, agents: &AgentRegistry) -> Vec<ToolSchema> {
        let mut schemas = tools.schemas_for(self.config.tools.iter().map(String::as_str));
        for target in &self.config.handoffs {
            let description = agents
                .get(target)
                .map(|a| a.handoff_description())
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Hand the conversation off to {}", target));
            schemas.push(ToolSchema {
                name: handoff_tool_name(target),
                description,
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "reason": { "type": "string", "description": "Why the handoff is needed" }
                    }
                }),
            });
        }
        schemas
    }

    pub fn build_request(
        &self,
        session: &Session,
        agents: &AgentRegistry,
        history_window: Option<usize>,
        correction: Option<String>,
    ) -> ModelRequest {
        let tools = agents.tools();
        ModelRequest {
            agent: self.config.name.clone(),
            system_instructions: self.build_system_message(tools, agents),
            tool_schemas: self.tool_schemas(tools, agents),
            history: session.recent_turns(history_window).to_vec(),
            settings: self.config.settings.clone(),
            correction,
        }
    }

    /// One reasoning step: ask the model client, parse what it said.
    pub async fn decide(
        &self,
        session: &Session,
        client: &dyn ModelClient,
        agents: &AgentRegistry,
        history_window: Option<usize>,
        correction: Option<String>,
    ) -> Result<(Decision, Option<Usage>), DecisionError> {
        let request = self.build_request(session, agents, history_window, correction);
        debug!(
            agent = %self.config.name,
            history = request.history.len(),
            tools = request.tool_schemas.len(),
            corrected = request.correction.is_some(),
            "requesting decision"
        );
        let response = client.complete(request).await?;
        let decision = parse_response(&response)?;
        Ok((decision, response.usage))
    }
}

/// The validated set of agents a runner can route between.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<Agent>>,
    order: Vec<String>,
    tools: Arc<ToolRegistry>,
}

impl AgentRegistry {
    /// Validates every agent against `tools` and against each other.
    pub fn build<I, C>(tools: Arc<ToolRegistry>, configs: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = C>,
        C: Into<AgentConfig>,
    {
        let mut agents = HashMap::new();
        let mut order = Vec::new();
        for config in configs {
            let agent = Agent::new(config.into(), &tools)?;
            let name = agent.name().to_string();
            if agents.contains_key(&name) {
                return Err(ConfigurationError::DuplicateAgent { name });
            }
            order.push(name.clone());
            agents.insert(name, Arc::new(agent));
        }

        for name in &order {
            let agent = &agents[name];
            if let Some(target) = agent.handoffs().iter().find(|t| !agents.contains_key(*t)) {
                return Err(ConfigurationError::UnknownHandoffTarget {
                    agent: name.clone(),
                    target: target.clone(),
                });
            }
        }

        Ok(Self {
            agents,
            order,
            tools,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Agent names in definition order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }
}
