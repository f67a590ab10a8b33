//! Skill-keyed agent registry.
//!
//! Maps a skill name (`reverse`, `uppercase`, `news`, ...) to the agent that
//! provides it and the pipe address it listens on. Keys are case-insensitive.
//! A registry is filled during start-up and then sealed; after that it is
//! read-only and can be shared freely.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AgentError, AgentResult};

/// A capability advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilityInfo {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AgentCapabilityInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Registration record for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    /// Identifier used in envelope `to`/`from` metadata (e.g. `Agent2`).
    pub agent_id: String,
    pub name: String,
    /// Skill the agent serves; the registry key.
    pub skill: String,
    pub description: String,
    /// Logical pipe address the agent accepts on.
    pub address: String,
    #[serde(default)]
    pub capabilities: Vec<AgentCapabilityInfo>,
}

impl AgentRegistration {
    /// Create a registration whose name matches its skill.
    pub fn new(
        agent_id: impl Into<String>,
        skill: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let skill = skill.into();
        Self {
            agent_id: agent_id.into(),
            name: skill.clone(),
            skill,
            description: String::new(),
            address: address.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: AgentCapabilityInfo) -> Self {
        self.capabilities.push(capability);
        self
    }
}

/// Registry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// Registrations are accepted.
    Init,
    /// Read-only.
    Ready,
}

/// Skill-keyed lookup of agent registrations.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    state: RegistryState,
    agents: BTreeMap<String, AgentRegistration>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Create an empty, unsealed registry.
    pub fn new() -> Self {
        Self {
            state: RegistryState::Init,
            agents: BTreeMap::new(),
        }
    }

    /// The stock agents: reverse, uppercase and news. Returned sealed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for registration in default_registrations() {
            // A fresh registry is never sealed
            let _ = registry.register(registration);
        }
        registry.seal();
        registry
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    /// Freeze the registry; later `register` calls fail.
    pub fn seal(&mut self) {
        self.state = RegistryState::Ready;
    }

    /// Add or replace the registration for its skill.
    ///
    /// Returns the registration previously held for that skill, if any.
    pub fn register(
        &mut self,
        registration: AgentRegistration,
    ) -> AgentResult<Option<AgentRegistration>> {
        if self.state == RegistryState::Ready {
            return Err(AgentError::RegistrySealed(registration.skill));
        }
        let key = registration.skill.to_lowercase();
        Ok(self.agents.insert(key, registration))
    }

    /// Registration serving `skill`, case-insensitively.
    pub fn resolve(&self, skill: &str) -> Option<&AgentRegistration> {
        self.agents.get(&skill.to_lowercase())
    }

    /// Registration with the given agent id, case-insensitively.
    pub fn by_agent_id(&self, agent_id: &str) -> Option<&AgentRegistration> {
        self.agents
            .values()
            .find(|a| a.agent_id.eq_ignore_ascii_case(agent_id))
    }

    pub fn contains(&self, skill: &str) -> bool {
        self.agents.contains_key(&skill.to_lowercase())
    }

    /// Registered skill names, sorted.
    pub fn skills(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// All registrations, sorted by skill.
    pub fn all(&self) -> Vec<&AgentRegistration> {
        self.agents.values().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn default_registrations() -> Vec<AgentRegistration> {
    vec![
        AgentRegistration::new("Agent2", "reverse", "a2a-reverse")
            .with_description("Text reversal agent that reverses any input string")
            .with_capability(
                AgentCapabilityInfo::new(
                    "reverse",
                    "Reverses the input text character by character",
                )
                .with_tag("text-processing")
                .with_tag("string-manipulation"),
            ),
        AgentRegistration::new("Agent3", "uppercase", "a2a-uppercase")
            .with_description("Text uppercase conversion agent")
            .with_capability(
                AgentCapabilityInfo::new("uppercase", "Converts the input text to uppercase letters")
                    .with_tag("text-processing")
                    .with_tag("case-conversion"),
            ),
        AgentRegistration::new("Agent4", "news", "a2a-news")
            .with_description("News search agent")
            .with_capability(
                AgentCapabilityInfo::new(
                    "search_news",
                    "Searches for and summarizes news articles",
                )
                .with_tag("news")
                .with_tag("search"),
            ),
    ]
}
