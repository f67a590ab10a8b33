//! # Pipelink Mesh
//!
//! Private, host-local messaging between agent processes.
//!
//! This crate moves short JSON task envelopes over duplex streams and turns
//! the asynchronous exchange into an awaitable request/response call.
//!
//! ## Features
//!
//! - **Line Framing**: One JSON document per `\n`-terminated line; malformed lines are skipped
//! - **Transports**: Unix domain sockets / Windows named pipes, plus an in-memory transport for tests
//! - **Channel Pool**: Exactly one live channel per logical address, even under concurrent first use
//! - **Correlation**: Replies matched to requests by message id, with timeouts and cancellation
//!
//! ## Example
//!
//! ```rust,no_run
//! use pipelink_mesh::{ChannelPool, LocalTransport, MeshConfig, build_task};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::from_env()?;
//!     let transport = Arc::new(LocalTransport::new(config.socket_dir.clone()));
//!     let pool = ChannelPool::new(transport, config);
//!     let cancel = CancellationToken::new();
//!
//!     let correlator = pool.correlator_or_create("a2a-reverse", &cancel).await?;
//!     let request = build_task("hello", "Agent1", "Agent2");
//!     let reply = correlator.send_and_receive(&request, None, &cancel).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

pub(crate) mod cancel;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod transport;

pub use channel::{
    ChannelRole, ChannelState, ChannelStatsSnapshot, LineChannel, MessageHandler, handler_fn,
};
pub use config::{ConfigError, MeshConfig, MeshConfigBuilder};
pub use correlator::{Correlator, CorrelatorConfig, CorrelatorState};
pub use envelope::{
    Envelope, META_CORRELATION_ID, META_FROM, META_TO, Part, Role, TaskRequest, TextPart,
    build_reply, build_task, parse_task,
};
pub use error::{MeshError, MeshResult};
pub use pool::ChannelPool;
pub use transport::{BoxedStream, DuplexStream, LocalTransport, MemoryTransport, Transport};
