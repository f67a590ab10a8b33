//! Request/Reply correlation over a line channel
//!
//! Turns a channel's asynchronous delivery into an awaitable, cancellable
//! round trip. Each outgoing envelope registers a pending slot keyed by its
//! `messageId`; the channel's read loop resolves the slot whose id matches the
//! reply's `correlationId`.
//!
//! Replies from peers that do not echo a `correlationId` are still accepted
//! when exactly one request is outstanding. With several outstanding they are
//! dropped with a warning rather than handed to the wrong caller.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelState, LineChannel, MessageHandler};
use crate::config::MeshConfig;
use crate::envelope::{Envelope, parse_task};
use crate::error::{MeshError, MeshResult};

/// Initialization progress of a correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Configuration for a correlator
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Pause after starting the read loop before the first request
    pub warmup: Duration,
    /// Deadline used when a request supplies none
    pub default_timeout: Duration,
    /// Maximum number of outstanding requests
    pub max_pending: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for CorrelatorConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            warmup: config.warmup,
            default_timeout: config.request_timeout,
            max_pending: config.max_pending,
        }
    }
}

type ReplySender = oneshot::Sender<MeshResult<String>>;

/// Outstanding requests of one channel; also the channel's message handler
struct PendingTable {
    address: String,
    slots: Mutex<HashMap<String, ReplySender>>,
}

impl PendingTable {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, ReplySender>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(
        &self,
        message_id: &str,
        max_pending: usize,
    ) -> MeshResult<oneshot::Receiver<MeshResult<String>>> {
        let mut slots = self.slots();
        if slots.contains_key(message_id) {
            return Err(MeshError::DuplicateRequest(message_id.to_string()));
        }
        if slots.len() >= max_pending {
            return Err(MeshError::QueueFull {
                capacity: max_pending,
                current: slots.len(),
            });
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(message_id.to_string(), tx);
        Ok(rx)
    }

    fn remove(&self, message_id: &str) {
        self.slots().remove(message_id);
    }

    fn len(&self) -> usize {
        self.slots().len()
    }

    /// Pick the slot a reply belongs to
    fn take_for(&self, reply: &Envelope) -> Option<(String, ReplySender)> {
        let mut slots = self.slots();
        match reply.correlation_id() {
            Some(id) => slots.remove_entry(id),
            None if slots.len() == 1 => {
                let id = slots.keys().next().cloned()?;
                slots.remove_entry(&id)
            }
            None => None,
        }
    }

    fn fail_all(&self, make_error: impl Fn() -> MeshError) -> usize {
        let drained: Vec<_> = self.slots().drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(make_error()));
        }
        count
    }
}

#[async_trait]
impl MessageHandler for PendingTable {
    async fn on_message(&self, json: String) {
        let reply = match Envelope::from_json(&json) {
            Ok(reply) => reply,
            Err(e) => {
                let reason = e.to_string();
                error!(address = %self.address, error = %reason, "Error processing received message");
                self.fail_all(|| MeshError::MalformedPayload(reason.clone()));
                return;
            }
        };

        let Some(task) = parse_task(&reply) else {
            debug!(address = %self.address, message_id = %reply.message_id(), "Ignoring non-task message");
            return;
        };

        match self.take_for(&reply) {
            Some((request_id, sender)) => {
                info!(
                    address = %self.address,
                    request_id = %request_id,
                    "Received response from another agent"
                );
                if sender.send(Ok(task.text)).is_err() {
                    debug!(request_id = %request_id, "Caller stopped waiting before reply arrived");
                }
            }
            None => warn!(
                address = %self.address,
                message_id = %reply.message_id(),
                correlation_id = ?reply.correlation_id(),
                outstanding = self.len(),
                "Dropping reply that matches no outstanding request"
            ),
        }
    }

    async fn on_closed(&self) {
        let address = self.address.clone();
        let failed = self.fail_all(|| MeshError::ChannelClosed {
            address: address.clone(),
        });
        if failed > 0 {
            warn!(address = %self.address, failed, "Channel closed with requests outstanding");
        }
    }
}

/// Removes a pending slot when the request finishes, whatever the outcome
struct SlotGuard<'a> {
    table: &'a PendingTable,
    message_id: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.message_id);
    }
}

/// Synchronous-style request/response on top of one [`LineChannel`]
pub struct Correlator {
    channel: Arc<LineChannel>,
    config: CorrelatorConfig,
    init_lock: tokio::sync::Mutex<()>,
    state: Mutex<CorrelatorState>,
    pending: Arc<PendingTable>,
}

impl Correlator {
    pub fn new(channel: Arc<LineChannel>, config: CorrelatorConfig) -> Self {
        let pending = Arc::new(PendingTable {
            address: channel.address().to_string(),
            slots: Mutex::new(HashMap::new()),
        });
        Self {
            channel,
            config,
            init_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(CorrelatorState::Uninitialized),
            pending,
        }
    }

    /// Create with default configuration
    pub fn with_defaults(channel: Arc<LineChannel>) -> Self {
        Self::new(channel, CorrelatorConfig::default())
    }

    pub fn channel(&self) -> &Arc<LineChannel> {
        &self.channel
    }

    pub fn state(&self) -> CorrelatorState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: CorrelatorState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start the channel's read loop exactly once, then pause for the warm-up.
    ///
    /// Idempotent; concurrent callers wait for the first one to finish. A
    /// cancelled warm-up still leaves the correlator `Ready`.
    pub async fn ensure_initialized(&self, cancel: &CancellationToken) -> MeshResult<()> {
        if self.state() == CorrelatorState::Ready {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.state() == CorrelatorState::Ready {
            return Ok(());
        }

        self.set_state(CorrelatorState::Initializing);
        info!(address = %self.channel.address(), "Initializing transport");

        let handler: Arc<dyn MessageHandler> = self.pending.clone();
        let started = match self.channel.establish(cancel).await {
            // The read loop outlives this call, so it gets its own token.
            Ok(()) => self.channel.start(handler, &CancellationToken::new()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.set_state(CorrelatorState::Uninitialized);
            error!(address = %self.channel.address(), error = %e, "Failed to initialize transport");
            return Err(e);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.config.warmup) => {}
            _ = cancel.cancelled() => {
                warn!(
                    address = %self.channel.address(),
                    "Initialization delay cancelled, but transport is initialized"
                );
            }
        }

        self.set_state(CorrelatorState::Ready);
        info!(address = %self.channel.address(), "Transport initialized successfully");
        Ok(())
    }

    /// Send `envelope` and wait for its reply text.
    ///
    /// Sending and waiting together take at most `timeout` (or the configured
    /// default). Fails with `Cancelled` if `cancel` fires first and `Timeout`
    /// if the deadline passes; in both cases the channel stays open for later
    /// requests.
    pub async fn send_and_receive(
        &self,
        envelope: &Envelope,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> MeshResult<String> {
        self.ensure_initialized(cancel).await?;

        let message_id = envelope.message_id().to_string();
        let rx = self
            .pending
            .register(&message_id, self.config.max_pending)?;
        let _slot = SlotGuard {
            table: self.pending.as_ref(),
            message_id: message_id.clone(),
        };

        if self.channel.state() == ChannelState::Closed {
            return Err(MeshError::ChannelClosed {
                address: self.channel.address().to_string(),
            });
        }

        info!(
            address = %self.channel.address(),
            message_id = %message_id,
            "Sending task"
        );

        // The deadline and the token cover the write as well as the wait: a
        // peer that stops reading can leave the send blocked on a full pipe.
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let exchange = async {
            self.channel.send_envelope(envelope).await?;
            rx.await.unwrap_or_else(|_| {
                Err(MeshError::ChannelClosed {
                    address: self.channel.address().to_string(),
                })
            })
        };
        let wait = async {
            tokio::select! {
                outcome = exchange => outcome,
                _ = cancel.cancelled() => Err(MeshError::Cancelled),
            }
        };

        let outcome = match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MeshError::Timeout(timeout)),
        };

        match &outcome {
            Ok(text) => debug!(message_id = %message_id, response = %text, "Received response"),
            Err(e) if e.is_cancellation() => {
                warn!(message_id = %message_id, error = %e, "Request was cancelled")
            }
            Err(e) => error!(message_id = %message_id, error = %e, "Error during send and receive"),
        }
        outcome
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("address", &self.channel.address())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRole, handler_fn};
    use crate::envelope::{build_reply, build_task};
    use crate::transport::{MemoryTransport, Transport};

    fn fast_config() -> CorrelatorConfig {
        CorrelatorConfig {
            warmup: Duration::from_millis(1),
            default_timeout: Duration::from_secs(5),
            max_pending: 8,
        }
    }

    /// Accepting channel plus a correlator on the connecting side
    async fn pair() -> (Arc<LineChannel>, Correlator) {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let server = Arc::new(LineChannel::new(
            "corr",
            ChannelRole::Accepting,
            transport.clone(),
            1024 * 1024,
        ));
        let client = Arc::new(LineChannel::new(
            "corr",
            ChannelRole::Connecting,
            transport,
            1024 * 1024,
        ));
        let accepting = {
            let server = server.clone();
            tokio::spawn(async move { server.establish(&CancellationToken::new()).await })
        };
        client.establish(&CancellationToken::new()).await.unwrap();
        accepting.await.unwrap().unwrap();
        (server, Correlator::new(client, fast_config()))
    }

    /// Serve on `server` with `respond` producing the raw reply line
    async fn serve<F>(server: &Arc<LineChannel>, respond: F)
    where
        F: Fn(Envelope) -> Option<String> + Send + Sync + 'static,
    {
        let responder = server.clone();
        let respond = Arc::new(respond);
        let handler = handler_fn(move |json| {
            let responder = responder.clone();
            let respond = respond.clone();
            async move {
                let request = Envelope::from_json(&json).unwrap();
                if let Some(line) = respond(request) {
                    responder.send(&line).await.unwrap();
                }
            }
        });
        server
            .start(handler, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initialization_is_idempotent() {
        let (_server, correlator) = pair().await;
        assert_eq!(correlator.state(), CorrelatorState::Uninitialized);

        correlator
            .ensure_initialized(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(correlator.state(), CorrelatorState::Ready);
        assert!(correlator.channel().is_reading());

        // Would fail with AlreadyStarted if it touched the channel again
        correlator
            .ensure_initialized(&CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_warmup_still_ready() {
        let (_server, fast) = pair().await;
        let correlator = Correlator::new(
            fast.channel().clone(),
            CorrelatorConfig {
                warmup: Duration::from_secs(60),
                ..fast_config()
            },
        );

        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        correlator.ensure_initialized(&cancel).await.unwrap();
        waiter.await.unwrap();
        assert_eq!(correlator.state(), CorrelatorState::Ready);
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_request() {
        let (server, correlator) = pair().await;
        serve(&server, |request| {
            let text = parse_task(&request).unwrap().text;
            let reply = build_reply(&request, text.chars().rev().collect::<String>(), "Y");
            Some(reply.to_json().unwrap())
        })
        .await;

        let response = correlator
            .send_and_receive(&build_task("hello", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "olleh");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_accepted_when_single_outstanding() {
        let (server, correlator) = pair().await;
        serve(&server, |_| Some(build_task("legacy", "Y", "X").to_json().unwrap())).await;

        let response = correlator
            .send_and_receive(&build_task("hi", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "legacy");
    }

    #[tokio::test]
    async fn test_reply_with_unfamiliar_role_resolves() {
        let (server, correlator) = pair().await;
        serve(&server, |request| {
            Some(format!(
                r#"{{"messageId":"r-1","role":"assistant","parts":[{{"text":"hey"}}],"metadata":{{"correlationId":"{}"}}}}"#,
                request.message_id()
            ))
        })
        .await;

        let response = correlator
            .send_and_receive(&build_task("hi", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "hey");
    }

    #[tokio::test]
    async fn test_cancel_leaves_channel_usable() {
        let (server, correlator) = pair().await;
        // Only answer the second request
        serve(&server, |request| {
            let text = parse_task(&request).unwrap().text;
            (text == "second").then(|| build_reply(&request, "ok", "Y").to_json().unwrap())
        })
        .await;

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };
        let err = correlator
            .send_and_receive(&build_task("first", "X", "Y"), None, &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, MeshError::Cancelled));
        assert_eq!(correlator.pending_count(), 0);

        let response = correlator
            .send_and_receive(&build_task("second", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "ok");
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let (server, correlator) = pair().await;
        serve(&server, |_| None).await;

        let err = correlator
            .send_and_receive(
                &build_task("ignored", "X", "Y"),
                Some(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout(_)));
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_undecodable_reply_fails_request() {
        let (server, correlator) = pair().await;
        serve(&server, |_| Some(r#"{"unexpected":true}"#.to_string())).await;

        let err = correlator
            .send_and_receive(&build_task("x", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn test_duplicate_message_id_rejected() {
        let (server, correlator) = pair().await;
        serve(&server, |_| None).await;
        let correlator = Arc::new(correlator);
        let envelope = build_task("same", "X", "Y");

        let first = {
            let correlator = correlator.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                correlator
                    .send_and_receive(
                        &envelope,
                        Some(Duration::from_millis(200)),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        while correlator.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = correlator
            .send_and_receive(&envelope, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::DuplicateRequest(_)));
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_requests_get_their_own_replies() {
        let (server, correlator) = pair().await;
        serve(&server, |request| {
            let text = parse_task(&request).unwrap().text;
            Some(build_reply(&request, text.to_uppercase(), "Y").to_json().unwrap())
        })
        .await;
        let correlator = Arc::new(correlator);
        correlator
            .ensure_initialized(&CancellationToken::new())
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for word in ["alpha", "beta", "gamma", "delta"] {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                let reply = correlator
                    .send_and_receive(&build_task(word, "X", "Y"), None, &CancellationToken::new())
                    .await
                    .unwrap();
                (word, reply)
            }));
        }
        for task in tasks {
            let (word, reply) = task.await.unwrap();
            assert_eq!(reply, word.to_uppercase());
        }
    }

    /// Text larger than the in-memory pipe so a send to a non-reading peer blocks
    fn oversized_text() -> String {
        "x".repeat(200 * 1024)
    }

    #[tokio::test]
    async fn test_timeout_covers_blocked_send() {
        let (server, correlator) = pair().await;

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            correlator.send_and_receive(
                &build_task(oversized_text(), "X", "Y"),
                Some(Duration::from_millis(100)),
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("send_and_receive ignored its deadline")
        .unwrap_err();
        assert!(matches!(err, MeshError::Timeout(_)));
        assert_eq!(correlator.pending_count(), 0);

        // Once the peer reads again the torn line is skipped and the channel still works
        serve(&server, |request| {
            Some(build_reply(&request, "after", "Y").to_json().unwrap())
        })
        .await;
        let response = correlator
            .send_and_receive(&build_task("next", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "after");
        assert_eq!(server.stats().malformed_lines, 1);
    }

    #[tokio::test]
    async fn test_cancel_covers_blocked_send() {
        let (_server, correlator) = pair().await;

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            correlator.send_and_receive(&build_task(oversized_text(), "X", "Y"), None, &cancel),
        )
        .await
        .expect("send_and_receive ignored its token")
        .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, MeshError::Cancelled));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_outstanding_request() {
        let (server, correlator) = pair().await;
        let closer = server.clone();
        serve(&server, move |_| {
            let closer = closer.clone();
            tokio::spawn(async move { closer.stop().await });
            None
        })
        .await;

        let err = correlator
            .send_and_receive(&build_task("bye", "X", "Y"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ChannelClosed { .. }));
    }
}
