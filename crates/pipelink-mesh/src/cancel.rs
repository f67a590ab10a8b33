//! Token linking for merged cancellation.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A child of `parent` that is also cancelled when `other` fires.
///
/// Cancelling the linked token never propagates back to either source. The
/// watcher task is torn down when the value is dropped.
pub(crate) struct LinkedToken {
    token: CancellationToken,
    watcher: JoinHandle<()>,
}

impl LinkedToken {
    pub(crate) fn new(parent: &CancellationToken, other: &CancellationToken) -> Self {
        let token = parent.child_token();
        let linked = token.clone();
        let other = other.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = other.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        Self { token, watcher }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for LinkedToken {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
