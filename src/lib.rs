//! # Pipelink
//!
//! Local agent-to-agent task messaging. This package re-exports the two
//! library crates:
//!
//! - [`mesh`]: envelopes, line-framed channels, transports, the channel pool
//!   and the request correlator
//! - [`agent`]: agent registry, skill routing, task responders and the
//!   dispatch client

pub use pipelink_agent as agent;
pub use pipelink_mesh as mesh;

pub use pipelink_agent::{AgentError, AgentRegistry, DispatchClient, DispatchOutcome, TaskResponder};
pub use pipelink_mesh::{
    ChannelPool, Correlator, Envelope, LineChannel, LocalTransport, MemoryTransport, MeshConfig,
    MeshError, Transport,
};
