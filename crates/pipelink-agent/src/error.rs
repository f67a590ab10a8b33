//! Error types for routing, skills and dispatch.

use pipelink_mesh::MeshError;
use thiserror::Error;

/// Errors that can occur while routing or dispatching a task.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No agent is registered for the requested skill.
    #[error("No agent registered for skill '{0}'")]
    UnresolvedAddress(String),

    /// The request text did not map to any known skill.
    #[error("Unable to determine action for request: {0}")]
    UnresolvedSkill(String),

    /// A skill failed while processing its input.
    #[error("Skill '{skill}' failed: {reason}")]
    Skill { skill: String, reason: String },

    /// The registry no longer accepts registrations.
    #[error("Agent registry is sealed; cannot register skill '{0}'")]
    RegistrySealed(String),

    /// Channel, pool or correlator failure.
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

impl AgentError {
    /// Build a skill failure.
    pub fn skill(skill: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::Skill {
            skill: skill.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Mesh(MeshError::ConnectionFailed { .. } | MeshError::Timeout(_))
        )
    }

    /// Get the error code suitable for logging or reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            AgentError::UnresolvedAddress(_) => "UNRESOLVED_ADDRESS",
            AgentError::UnresolvedSkill(_) => "UNRESOLVED_SKILL",
            AgentError::Skill { .. } => "SKILL_FAILED",
            AgentError::RegistrySealed(_) => "REGISTRY_SEALED",
            AgentError::Mesh(e) => e.error_code(),
        }
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
