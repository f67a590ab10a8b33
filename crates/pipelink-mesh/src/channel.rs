//! Line-framed JSON channel.
//!
//! A [`LineChannel`] owns one duplex stream to a single peer. Outgoing
//! payloads are written as one JSON document per `\n`-terminated line;
//! incoming lines are validated as JSON and handed to a [`MessageHandler`]
//! from a background read loop. The channel is agnostic to message shape.
//!
//! ```text
//! Unconnected ──establish──▶ Connecting ──▶ Connected ──stop / stream end──▶ Closed
//!      ▲                          │
//!      └──────── failure ─────────┘
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::LinkedToken;
use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use crate::transport::{BoxedStream, Transport};

/// How the channel obtains its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Wait for exactly one peer to connect
    Accepting,
    /// Initiate a connection to a named peer
    Connecting,
}

/// Connection lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

/// Receives every valid JSON line read from a channel
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once per non-blank, syntactically valid JSON line, in stream order
    async fn on_message(&self, json: String);

    /// Called once after the read loop has exited
    async fn on_closed(&self) {}
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn on_message(&self, json: String) {
        (self.0)(json).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Traffic counters for one channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    lines_sent: AtomicU64,
    lines_received: AtomicU64,
    malformed_lines: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub lines_sent: u64,
    pub lines_received: u64,
    pub malformed_lines: u64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            lines_sent: self.lines_sent.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
        }
    }
}

type SharedState = Arc<Mutex<ChannelState>>;

/// Write half of the stream plus framing recovery state
struct LineWriter {
    half: WriteHalf<BoxedStream>,
    /// A previous frame may have been cut off mid-write
    torn: bool,
}

/// Duplex channel framing JSON payloads one per line
pub struct LineChannel {
    address: String,
    role: ChannelRole,
    transport: Arc<dyn Transport>,
    max_line_bytes: usize,
    state: SharedState,
    stats: Arc<ChannelStats>,
    /// Cancelled by `stop`; parent of every token the channel hands out
    shutdown: CancellationToken,
    establish_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<LineWriter>>,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    reading: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl LineChannel {
    pub fn new(
        address: impl Into<String>,
        role: ChannelRole,
        transport: Arc<dyn Transport>,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            address: address.into(),
            role,
            transport,
            max_line_bytes,
            state: Arc::new(Mutex::new(ChannelState::Unconnected)),
            stats: Arc::new(ChannelStats::default()),
            shutdown: CancellationToken::new(),
            establish_lock: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            reading: AtomicBool::new(false),
            read_task: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the read loop has been launched
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }

    /// Establish the underlying stream without starting the read loop.
    ///
    /// No-op once connected. On failure the channel returns to
    /// `Unconnected` so a later call can retry from scratch.
    pub async fn establish(&self, cancel: &CancellationToken) -> MeshResult<()> {
        let _guard = self.establish_lock.lock().await;
        match self.state() {
            ChannelState::Connected => return Ok(()),
            ChannelState::Closed => return Err(self.closed()),
            ChannelState::Unconnected | ChannelState::Connecting => {}
        }

        self.set_state(ChannelState::Connecting);
        let linked = LinkedToken::new(&self.shutdown, cancel);
        let result = match self.role {
            ChannelRole::Accepting => self.transport.accept(&self.address, linked.token()).await,
            ChannelRole::Connecting => self.transport.connect(&self.address, linked.token()).await,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                // A concurrent stop wins over the failed attempt.
                if !self.shutdown.is_cancelled() {
                    self.set_state(ChannelState::Unconnected);
                }
                warn!(address = %self.address, error = %e, "Channel connection failed");
                return Err(e);
            }
        };

        if self.shutdown.is_cancelled() {
            return Err(self.closed());
        }

        let (read_half, write_half) = tokio::io::split(stream);
        *lock(&self.reader) = Some(read_half);
        *self.writer.lock().await = Some(LineWriter {
            half: write_half,
            torn: false,
        });
        self.set_state(ChannelState::Connected);
        info!(address = %self.address, role = ?self.role, "Channel connected");
        Ok(())
    }

    /// Establish the stream (if needed) and launch the background read loop.
    ///
    /// Returns once connected; lines are delivered to `handler` until `cancel`
    /// fires, `stop` is called, or the stream ends. A second call fails with
    /// `AlreadyStarted`.
    pub async fn start(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
    ) -> MeshResult<()> {
        self.establish(cancel).await?;

        if self.reading.swap(true, Ordering::AcqRel) {
            return Err(MeshError::AlreadyStarted {
                address: self.address.clone(),
            });
        }

        let Some(reader) = lock(&self.reader).take() else {
            self.reading.store(false, Ordering::Release);
            return Err(MeshError::NotConnected {
                address: self.address.clone(),
            });
        };

        let loop_token = LinkedToken::new(&self.shutdown, cancel);
        let task = tokio::spawn(read_loop(
            self.address.clone(),
            BufReader::new(reader),
            handler,
            loop_token,
            self.max_line_bytes,
            self.state.clone(),
            self.stats.clone(),
        ));
        *lock(&self.read_task) = Some(task);
        debug!(address = %self.address, "Read loop started");
        Ok(())
    }

    /// Write one JSON payload as a single newline-terminated line.
    ///
    /// Concurrent senders are serialized so lines never interleave. A write
    /// blocked on a peer that stopped reading ends with `ChannelClosed` once
    /// `stop` is called. If a send is abandoned part way through a line, the
    /// next send terminates the fragment first so the peer skips it as
    /// malformed.
    pub async fn send(&self, json: &str) -> MeshResult<()> {
        if json.contains('\n') {
            return Err(MeshError::MalformedPayload(
                "payload contains a raw newline".to_string(),
            ));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| MeshError::NotConnected {
            address: self.address.clone(),
        })?;
        if self.shutdown.is_cancelled() {
            return Err(self.closed());
        }

        let mut frame = Vec::with_capacity(json.len() + 2);
        if writer.torn {
            frame.push(b'\n');
        }
        frame.extend_from_slice(json.as_bytes());
        frame.push(b'\n');

        // Cleared only when the whole frame is out.
        writer.torn = true;
        let written = tokio::select! {
            result = write_frame(&mut writer.half, &frame) => result,
            _ = self.shutdown.cancelled() => {
                debug!(address = %self.address, "Send interrupted by stop");
                return Err(self.closed());
            }
        };
        written?;
        writer.torn = false;

        self.stats.lines_sent.fetch_add(1, Ordering::Relaxed);
        debug!(address = %self.address, json = %json, "Sent JSON");
        Ok(())
    }

    fn closed(&self) -> MeshError {
        MeshError::ChannelClosed {
            address: self.address.clone(),
        }
    }

    /// Serialize and send an envelope
    pub async fn send_envelope(&self, envelope: &Envelope) -> MeshResult<()> {
        self.send(&envelope.to_json()?).await
    }

    /// Cancel the read loop and release the stream. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        // Cancelling first makes a blocked sender give up the writer.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.half.shutdown().await;
        }
        lock(&self.reader).take();
        // The loop observes the token and exits on its own; it may be the caller.
        lock(&self.read_task).take();

        let previous = std::mem::replace(&mut *lock(&self.state), ChannelState::Closed);
        if previous != ChannelState::Closed {
            info!(address = %self.address, "Channel stopped");
        }
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("address", &self.address)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxedStream>, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of reading one frame
enum Frame {
    Line,
    Oversized,
}

/// Read up to the next `\n`, keeping at most `max` bytes in `buf`.
///
/// Returns `None` at end of stream. A partial last line without a trailing
/// newline still counts as a frame.
async fn next_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Option<Frame>> {
    buf.clear();
    let mut read_any = false;
    let mut oversized = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (read_any, oversized) {
                (false, _) => None,
                (true, true) => Some(Frame::Oversized),
                (true, false) => Some(Frame::Line),
            });
        }
        read_any = true;

        let (chunk, used, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        if !oversized {
            if buf.len() + chunk.len() > max {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if complete {
            return Ok(Some(if oversized { Frame::Oversized } else { Frame::Line }));
        }
    }
}

async fn read_loop<R: AsyncBufRead + Unpin>(
    address: String,
    mut reader: R,
    handler: Arc<dyn MessageHandler>,
    cancel: LinkedToken,
    max_line_bytes: usize,
    state: SharedState,
    stats: Arc<ChannelStats>,
) {
    let mut buf = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = next_frame(&mut reader, &mut buf, max_line_bytes) => frame,
            _ = cancel.token().cancelled() => {
                debug!(address = %address, "Read loop cancelled");
                break;
            }
        };

        match frame {
            Ok(None) => {
                debug!(address = %address, "Stream closed, exiting read loop");
                break;
            }
            Ok(Some(Frame::Oversized)) => {
                stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                warn!(address = %address, limit = max_line_bytes, "Skipping oversized line");
            }
            Ok(Some(Frame::Line)) => {
                let Some(line) = decode_line(&buf) else {
                    stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    warn!(address = %address, "Skipping line that is not valid UTF-8");
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                // Validate so garbage never reaches the handler.
                if let Err(e) = serde_json::from_str::<serde_json::Value>(line) {
                    stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    warn!(address = %address, error = %e, "Received malformed JSON");
                    continue;
                }
                stats.lines_received.fetch_add(1, Ordering::Relaxed);
                debug!(address = %address, json = %line, "Received JSON");
                handler.on_message(line.to_string()).await;
            }
            Err(e) => {
                error!(address = %address, error = %e, "Error in read loop");
                break;
            }
        }
    }

    *lock(&state) = ChannelState::Closed;
    handler.on_closed().await;
}

fn decode_line(buf: &[u8]) -> Option<&str> {
    let line = std::str::from_utf8(buf).ok()?;
    Some(line.strip_suffix('\r').unwrap_or(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collecting_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |json| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(json);
            }
        });
        (handler, rx)
    }

    async fn connected_pair(max_line_bytes: usize) -> (Arc<LineChannel>, Arc<LineChannel>) {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let server = Arc::new(LineChannel::new(
            "test-pipe",
            ChannelRole::Accepting,
            transport.clone(),
            max_line_bytes,
        ));
        let client = Arc::new(LineChannel::new(
            "test-pipe",
            ChannelRole::Connecting,
            transport,
            max_line_bytes,
        ));

        let accepting = {
            let server = server.clone();
            tokio::spawn(async move { server.establish(&CancellationToken::new()).await })
        };
        client.establish(&CancellationToken::new()).await.unwrap();
        accepting.await.unwrap().unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let channel = LineChannel::new(
            "nowhere",
            ChannelRole::Connecting,
            Arc::new(MemoryTransport::new()),
            1024,
        );
        let err = channel.send("{}").await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected { .. }));
        assert_eq!(channel.state(), ChannelState::Unconnected);
    }

    #[tokio::test]
    async fn test_lines_delivered_in_order() {
        let (server, client) = connected_pair(1024).await;
        let (handler, mut rx) = collecting_handler();
        server.start(handler, &CancellationToken::new()).await.unwrap();

        client.send(r#"{"n":1}"#).await.unwrap();
        client.send(r#"{"n":2}"#).await.unwrap();
        client.send(r#"{"n":3}"#).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"n":1}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"n":2}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"n":3}"#);
        assert_eq!(client.stats().lines_sent, 3);
    }

    #[tokio::test]
    async fn test_malformed_and_blank_lines_are_skipped() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let channel = Arc::new(LineChannel::new(
            "raw",
            ChannelRole::Accepting,
            transport.clone(),
            1024,
        ));
        let (handler, mut rx) = collecting_handler();

        let starting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.start(handler, &CancellationToken::new()).await })
        };
        let mut raw = transport
            .connect("raw", &CancellationToken::new())
            .await
            .unwrap();
        starting.await.unwrap().unwrap();

        raw.write_all(b"{not json\n\n   \n{\"ok\":true}\r\n").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"ok":true}"#);
        assert_eq!(channel.stats().malformed_lines, 1);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_oversized_line_skipped_loop_continues() {
        let (server, client) = connected_pair(16).await;
        let (handler, mut rx) = collecting_handler();
        server.start(handler, &CancellationToken::new()).await.unwrap();

        client
            .send(r#"{"payload":"this line is far too long"}"#)
            .await
            .unwrap();
        client.send(r#"{"a":1}"#).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"a":1}"#);
        assert_eq!(server.stats().malformed_lines, 1);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let (server, _client) = connected_pair(1024).await;
        let (handler, _rx) = collecting_handler();
        server
            .start(handler.clone(), &CancellationToken::new())
            .await
            .unwrap();
        let err = server
            .start(handler, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_unstarted() {
        let channel = LineChannel::new(
            "idle",
            ChannelRole::Connecting,
            Arc::new(MemoryTransport::new()),
            1024,
        );
        channel.stop().await;
        channel.stop().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_peer_stop_closes_reader() {
        let (server, client) = connected_pair(1024).await;
        let (handler, _rx) = collecting_handler();
        server.start(handler, &CancellationToken::new()).await.unwrap();

        client.stop().await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while server.state() != ChannelState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let err = client.send("{}").await.unwrap_err();
        assert!(matches!(err, MeshError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (server, client) = connected_pair(64 * 1024).await;
        let (handler, mut rx) = collecting_handler();
        server.start(handler, &CancellationToken::new()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let body = "x".repeat(4096);
                client
                    .send(&format!(r#"{{"i":{i},"body":"{body}"}}"#))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..20 {
            let line = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["body"].as_str().unwrap().len(), 4096);
        }
        assert_eq!(server.stats().malformed_lines, 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocked_send() {
        // The server never reads, so a line larger than the pipe blocks
        let (_server, client) = connected_pair(1024 * 1024).await;
        let sending = {
            let client = client.clone();
            let line = format!(r#"{{"body":"{}"}}"#, "x".repeat(200 * 1024));
            tokio::spawn(async move { client.send(&line).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sending.is_finished());

        tokio::time::timeout(Duration::from_secs(1), client.stop())
            .await
            .expect("stop waited on a blocked send");
        let err = sending.await.unwrap().unwrap_err();
        assert!(matches!(err, MeshError::ChannelClosed { .. }));
        assert_eq!(client.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_send_does_not_corrupt_next_line() {
        let (server, client) = connected_pair(1024 * 1024).await;

        let line = format!(r#"{{"body":"{}"}}"#, "x".repeat(200 * 1024));
        let abandoned = tokio::time::timeout(Duration::from_millis(50), client.send(&line)).await;
        assert!(abandoned.is_err());

        let (handler, mut rx) = collecting_handler();
        server.start(handler, &CancellationToken::new()).await.unwrap();
        client.send(r#"{"a":1}"#).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"a":1}"#);
        assert_eq!(server.stats().malformed_lines, 1);
        assert_eq!(client.stats().lines_sent, 1);
    }

    #[tokio::test]
    async fn test_failed_establish_can_retry() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let channel = LineChannel::new("late", ChannelRole::Connecting, transport.clone(), 1024);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(channel.establish(&cancel).await.is_err());
        assert_eq!(channel.state(), ChannelState::Unconnected);

        let accepting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.accept("late", &CancellationToken::new()).await })
        };
        channel.establish(&CancellationToken::new()).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        accepting.await.unwrap().unwrap();
    }
}
