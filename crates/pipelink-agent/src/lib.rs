//! # Pipelink Agent
//!
//! Agent-level building blocks on top of [`pipelink_mesh`].
//!
//! ## Features
//!
//! - **Registry**: Skill-keyed lookup of agents and their pipe addresses
//! - **Routing**: Keyword routing with an optional smarter router in front
//! - **Responders**: Accept tasks on an address and reply with a skill's result
//! - **Dispatch**: Pick an agent for a free-form request and await its answer
//!
//! ## Example
//!
//! ```rust,no_run
//! use pipelink_agent::{
//!     AgentRegistry, DispatchClient, KeywordRouter, ReverseSkill, SkillSet, TaskResponder,
//! };
//! use pipelink_mesh::{ChannelPool, MemoryTransport, MeshConfig, Transport};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::default();
//!     let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
//!     let cancel = CancellationToken::new();
//!
//!     let responder = Arc::new(TaskResponder::new(
//!         "Agent2",
//!         KeywordRouter::new(),
//!         SkillSet::new().with(ReverseSkill),
//!     ));
//!     let server = {
//!         let (transport, config, cancel) = (transport.clone(), config.clone(), cancel.clone());
//!         tokio::spawn(async move { responder.run(transport, "a2a-reverse", &config, &cancel).await })
//!     };
//!
//!     let pool = Arc::new(ChannelPool::new(transport, config));
//!     let client = DispatchClient::new(Arc::new(AgentRegistry::with_defaults()), pool);
//!     let outcome = client.dispatch("reverse: hello", &cancel).await?;
//!     assert_eq!(outcome.response, "olleh");
//!
//!     cancel.cancel();
//!     server.await??;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod registry;
pub mod responder;
pub mod router;
pub mod skills;

pub use client::{DispatchClient, DispatchOutcome};
pub use error::{AgentError, AgentResult};
pub use registry::{AgentCapabilityInfo, AgentRegistration, AgentRegistry, RegistryState};
pub use responder::TaskResponder;
pub use router::{
    FallbackRouter, KeywordRouter, RouteDecision, SKILL_NEWS, SKILL_REVERSE, SKILL_UPPERCASE,
    SkillRouter, determine_target_skill,
};
pub use skills::{ReverseSkill, Skill, SkillSet, UppercaseSkill};
