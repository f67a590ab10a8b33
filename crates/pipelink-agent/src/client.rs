//! Caller side of a task exchange.

use pipelink_mesh::{ChannelPool, build_task};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{AgentError, AgentResult};
use crate::registry::AgentRegistry;
use crate::router::{SKILL_NEWS, determine_target_skill};

/// Sender name stamped on outgoing tasks
pub const DEFAULT_SENDER: &str = "Agent1";

/// Deadline for news requests, which take longer than text skills
pub const NEWS_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one dispatched request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub request: String,
    pub skill: String,
    pub agent_id: String,
    pub address: String,
    pub response: String,
}

/// Sends free-form requests to whichever agent serves the matching skill.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    registry: Arc<AgentRegistry>,
    pool: Arc<ChannelPool>,
    sender: String,
}

impl DispatchClient {
    pub fn new(registry: Arc<AgentRegistry>, pool: Arc<ChannelPool>) -> Self {
        Self {
            registry,
            pool,
            sender: DEFAULT_SENDER.to_string(),
        }
    }

    /// Override the sender name stamped on outgoing tasks.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Route `text` to an agent and wait for its reply.
    pub async fn dispatch(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> AgentResult<DispatchOutcome> {
        let skill = determine_target_skill(text);
        let registration = self
            .registry
            .resolve(skill)
            .ok_or_else(|| AgentError::UnresolvedAddress(skill.to_string()))?;

        let correlator = self
            .pool
            .correlator_or_create(&registration.address, cancel)
            .await?;

        let request = build_task(text, self.sender.as_str(), registration.agent_id.as_str());
        let timeout = self.timeout_for(skill, text);
        info!(
            skill,
            agent = %registration.agent_id,
            address = %registration.address,
            timeout = ?timeout,
            "Dispatching request"
        );

        let response = correlator
            .send_and_receive(&request, Some(timeout), cancel)
            .await?;

        Ok(DispatchOutcome {
            request: text.to_string(),
            skill: skill.to_string(),
            agent_id: registration.agent_id.clone(),
            address: registration.address.clone(),
            response,
        })
    }

    fn timeout_for(&self, skill: &str, text: &str) -> Duration {
        if skill == SKILL_NEWS || text.to_ascii_lowercase().contains(SKILL_NEWS) {
            NEWS_TIMEOUT
        } else {
            self.pool.config().request_timeout
        }
    }
}
