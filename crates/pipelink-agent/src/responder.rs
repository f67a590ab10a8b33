//! Accepting side of a task exchange.
//!
//! A [`TaskResponder`] waits on an address for one peer, decodes each
//! incoming task, routes it to a skill, and writes the result back as a
//! reply correlated with the request.

use async_trait::async_trait;
use pipelink_mesh::{
    ChannelRole, Envelope, LineChannel, MeshConfig, MeshResult, MessageHandler, Transport,
    build_reply, parse_task,
};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentResult;
use crate::router::SkillRouter;
use crate::skills::SkillSet;

/// Serves tasks addressed to one agent.
pub struct TaskResponder {
    agent_name: String,
    router: Arc<dyn SkillRouter>,
    skills: SkillSet,
}

impl TaskResponder {
    pub fn new(
        agent_name: impl Into<String>,
        router: impl SkillRouter + 'static,
        skills: SkillSet,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            router: Arc::new(router),
            skills,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn skills(&self) -> &SkillSet {
        &self.skills
    }

    /// Route `text` and run the chosen skill.
    pub async fn execute(&self, text: &str) -> AgentResult<String> {
        let decision = self.router.route(text).await?;
        debug!(skill = %decision.skill, content = %decision.content, "Routed request");
        self.skills.invoke(&decision.skill, &decision.content).await
    }

    /// Produce the reply for `request`.
    ///
    /// Returns `None` for envelopes that are not tasks or are addressed to a
    /// different agent. Skill failures become an `[error] ...` reply.
    pub async fn handle(&self, request: &Envelope) -> Option<Envelope> {
        let task = parse_task(request)?;
        if task.to.as_deref() != Some(self.agent_name.as_str()) {
            warn!(agent = %self.agent_name, to = ?task.to, "Ignored message for another agent");
            return None;
        }

        info!(
            agent = %self.agent_name,
            from = ?task.from,
            text = %task.text,
            "Received task"
        );

        let result = match self.execute(&task.text).await {
            Ok(result) => result,
            Err(e) => {
                error!(agent = %self.agent_name, error = %e, "Error processing request");
                format!("[error] {e}")
            }
        };

        info!(agent = %self.agent_name, result = %result, "Responding");
        Some(build_reply(request, result, self.agent_name.as_str()))
    }

    /// Accept one peer on `address` and answer its tasks in the background.
    ///
    /// Returns the channel once the peer has connected.
    pub async fn serve(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        address: &str,
        config: &MeshConfig,
        cancel: &CancellationToken,
    ) -> MeshResult<Arc<LineChannel>> {
        self.serve_session(transport, address, config, cancel, Arc::new(Notify::new()))
            .await
    }

    /// Serve peers one after another until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        address: &str,
        config: &MeshConfig,
        cancel: &CancellationToken,
    ) -> MeshResult<()> {
        loop {
            let closed = Arc::new(Notify::new());
            let channel = match self
                .clone()
                .serve_session(transport.clone(), address, config, cancel, closed.clone())
                .await
            {
                Ok(channel) => channel,
                Err(e) if e.is_cancellation() => return Ok(()),
                Err(e) => return Err(e),
            };

            tokio::select! {
                _ = closed.notified() => {
                    info!(agent = %self.agent_name, address = %address, "Peer disconnected, waiting for the next one");
                    channel.stop().await;
                }
                _ = cancel.cancelled() => {
                    channel.stop().await;
                    return Ok(());
                }
            }
        }
    }

    async fn serve_session(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        address: &str,
        config: &MeshConfig,
        cancel: &CancellationToken,
        closed: Arc<Notify>,
    ) -> MeshResult<Arc<LineChannel>> {
        let channel = Arc::new(LineChannel::new(
            address,
            ChannelRole::Accepting,
            transport,
            config.max_line_bytes,
        ));
        let handler = Arc::new(ResponderHandler {
            responder: self.clone(),
            channel: Arc::downgrade(&channel),
            closed,
        });

        info!(agent = %self.agent_name, address = %address, "Waiting for tasks");
        channel.start(handler, cancel).await?;
        Ok(channel)
    }
}

impl std::fmt::Debug for TaskResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResponder")
            .field("agent_name", &self.agent_name)
            .field("skills", &self.skills)
            .finish()
    }
}

struct ResponderHandler {
    responder: Arc<TaskResponder>,
    channel: Weak<LineChannel>,
    closed: Arc<Notify>,
}

#[async_trait]
impl MessageHandler for ResponderHandler {
    async fn on_message(&self, json: String) {
        let request = match Envelope::from_json(&json) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable message");
                return;
            }
        };

        let Some(reply) = self.responder.handle(&request).await else {
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if let Err(e) = channel.send_envelope(&reply).await {
            error!(address = %channel.address(), error = %e, "Failed to send reply");
        }
    }

    async fn on_closed(&self) {
        self.closed.notify_one();
    }
}
