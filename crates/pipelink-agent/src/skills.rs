//! Text-processing skills executed by responders.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AgentError, AgentResult};
use crate::router::{SKILL_REVERSE, SKILL_UPPERCASE};

/// A named operation on request content.
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, content: &str) -> AgentResult<String>;
}

/// Reverses the input character by character.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseSkill;

#[async_trait]
impl Skill for ReverseSkill {
    fn name(&self) -> &str {
        SKILL_REVERSE
    }

    async fn invoke(&self, content: &str) -> AgentResult<String> {
        Ok(content.chars().rev().collect())
    }
}

/// Converts the input to uppercase.
#[derive(Debug, Clone, Copy, Default)]
pub struct UppercaseSkill;

#[async_trait]
impl Skill for UppercaseSkill {
    fn name(&self) -> &str {
        SKILL_UPPERCASE
    }

    async fn invoke(&self, content: &str) -> AgentResult<String> {
        Ok(content.to_uppercase())
    }
}

/// Skills available to one responder, keyed by name.
#[derive(Clone, Default)]
pub struct SkillSet {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a skill, replacing any with the same name.
    pub fn with(mut self, skill: impl Skill + 'static) -> Self {
        self.insert(Arc::new(skill));
        self
    }

    pub fn insert(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Skill>> {
        self.skills.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    /// Skill names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the named skill on `content`.
    pub async fn invoke(&self, name: &str, content: &str) -> AgentResult<String> {
        let skill = self
            .get(name)
            .ok_or_else(|| AgentError::skill(name, "not available on this agent"))?;
        skill.invoke(content).await
    }
}

impl std::fmt::Debug for SkillSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillSet")
            .field("skills", &self.names())
            .finish()
    }
}
