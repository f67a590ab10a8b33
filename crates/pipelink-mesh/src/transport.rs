//! Stream establishment for channels.
//!
//! A [`Transport`] turns a logical address into a connected duplex byte
//! stream, either by waiting for one peer (`accept`) or by reaching out to a
//! named peer (`connect`). Framing is not its concern; see
//! [`crate::channel`].

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MeshError, MeshResult};

/// Any bidirectional async byte stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Boxed duplex stream handed from a transport to a channel
pub type BoxedStream = Box<dyn DuplexStream>;

/// Establishes duplex streams for a logical address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for exactly one peer to connect on `address`
    async fn accept(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream>;

    /// Connect to the peer accepting on `address`
    async fn connect(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream>;
}

/// Buffer size of each in-memory pipe direction
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Rendezvous {
    acceptors: VecDeque<oneshot::Sender<BoxedStream>>,
    connectors: VecDeque<oneshot::Sender<BoxedStream>>,
}

/// In-process transport pairing acceptors and connectors by address.
///
/// Accept and connect may happen in either order; whichever side arrives
/// second completes the pair.
#[derive(Default)]
pub struct MemoryTransport {
    rendezvous: Mutex<HashMap<String, Rendezvous>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Either hand a fresh pipe to a waiting peer or queue ourselves
    fn pair_or_wait(
        &self,
        address: &str,
        accepting: bool,
    ) -> Result<BoxedStream, oneshot::Receiver<BoxedStream>> {
        let mut table = self
            .rendezvous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = table.entry(address.to_string()).or_default();
        let (peers, waiters) = if accepting {
            (&mut slot.connectors, &mut slot.acceptors)
        } else {
            (&mut slot.acceptors, &mut slot.connectors)
        };

        while let Some(peer) = peers.pop_front() {
            let (ours, theirs) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
            // A peer that gave up has dropped its receiver; try the next one.
            if peer.send(Box::new(theirs)).is_ok() {
                return Ok(Box::new(ours));
            }
        }

        let (tx, rx) = oneshot::channel();
        waiters.push_back(tx);
        Err(rx)
    }

    async fn rendezvous(
        &self,
        address: &str,
        accepting: bool,
        cancel: &CancellationToken,
    ) -> MeshResult<BoxedStream> {
        let rx = match self.pair_or_wait(address, accepting) {
            Ok(stream) => return Ok(stream),
            Err(rx) => rx,
        };

        tokio::select! {
            stream = rx => stream.map_err(|_| MeshError::connection_failed(address, "transport dropped")),
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream> {
        self.rendezvous(address, true, cancel).await
    }

    async fn connect(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream> {
        self.rendezvous(address, false, cancel).await
    }
}

/// Host-local transport: Unix domain sockets on Unix, named pipes on Windows.
///
/// On Unix an address `a2a-reverse` maps to `<socket_dir>/a2a-reverse.sock`.
/// On Windows it maps to `\\.\pipe\a2a-reverse`.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    socket_dir: PathBuf,
}

impl LocalTransport {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Filesystem path of the socket backing `address`
    pub fn socket_path(&self, address: &str) -> PathBuf {
        self.socket_dir.join(format!("{address}.sock"))
    }
}

#[cfg(unix)]
#[async_trait]
impl Transport for LocalTransport {
    async fn accept(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream> {
        use tokio::net::UnixListener;

        let path = self.socket_path(address);
        // A leftover file from a crashed process would make bind fail.
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| MeshError::connection_failed(address, e))?;
        }
        let listener =
            UnixListener::bind(&path).map_err(|e| MeshError::connection_failed(address, e))?;
        debug!(address = %address, path = %path.display(), "Waiting for peer");

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => {
                let _ = std::fs::remove_file(&path);
                return Err(MeshError::Cancelled);
            }
        };
        // Exactly one peer per accepting channel; nobody else may dial in.
        let _ = std::fs::remove_file(&path);

        let (stream, _) = accepted.map_err(|e| MeshError::connection_failed(address, e))?;
        Ok(Box::new(stream))
    }

    async fn connect(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream> {
        use tokio::net::UnixStream;

        let path = self.socket_path(address);
        let stream = tokio::select! {
            stream = UnixStream::connect(&path) => stream,
            _ = cancel.cancelled() => return Err(MeshError::Cancelled),
        };
        let stream = stream.map_err(|e| MeshError::connection_failed(address, e))?;
        Ok(Box::new(stream))
    }
}

#[cfg(windows)]
#[async_trait]
impl Transport for LocalTransport {
    async fn accept(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let name = pipe_name(address);
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| MeshError::connection_failed(address, e))?;
        debug!(address = %address, pipe = %name, "Waiting for peer");

        tokio::select! {
            connected = server.connect() => {
                connected.map_err(|e| MeshError::connection_failed(address, e))?;
            }
            _ = cancel.cancelled() => return Err(MeshError::Cancelled),
        }
        Ok(Box::new(server))
    }

    async fn connect(&self, address: &str, cancel: &CancellationToken) -> MeshResult<BoxedStream> {
        use std::time::Duration;
        use tokio::net::windows::named_pipe::ClientOptions;

        // ERROR_PIPE_BUSY
        const PIPE_BUSY: i32 = 231;

        let name = pipe_name(address);
        loop {
            match ClientOptions::new().open(&name) {
                Ok(client) => return Ok(Box::new(client)),
                Err(e) if e.raw_os_error() == Some(PIPE_BUSY) => {}
                Err(e) => return Err(MeshError::connection_failed(address, e)),
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
            }
        }
    }
}

#[cfg(windows)]
fn pipe_name(address: &str) -> String {
    format!(r"\\.\pipe\{address}")
}
