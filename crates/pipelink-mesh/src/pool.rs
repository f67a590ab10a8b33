//! Address-keyed channel cache
//!
//! The pool guarantees one live [`LineChannel`] (and one [`Correlator`]) per
//! logical address. Lookups of an existing entry never block; creation is
//! serialized so that a burst of first callers results in a single
//! connection attempt.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelRole, LineChannel};
use crate::config::MeshConfig;
use crate::correlator::{Correlator, CorrelatorConfig};
use crate::error::MeshResult;
use crate::transport::Transport;

#[derive(Clone)]
struct PoolEntry {
    channel: Arc<LineChannel>,
    correlator: Arc<Correlator>,
}

/// Pool of connecting channels, one per address
pub struct ChannelPool {
    transport: Arc<dyn Transport>,
    config: MeshConfig,
    entries: DashMap<String, PoolEntry>,
    create_lock: Mutex<()>,
}

impl ChannelPool {
    pub fn new(transport: Arc<dyn Transport>, config: MeshConfig) -> Self {
        Self {
            transport,
            config,
            entries: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Return the channel for `address`, connecting it on first use.
    ///
    /// A failed connection is not cached; the next call tries again.
    pub async fn get_or_create(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> MeshResult<Arc<LineChannel>> {
        Ok(self.entry(address, cancel).await?.channel)
    }

    /// Return the correlator bound to `address`, connecting it on first use
    pub async fn correlator_or_create(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> MeshResult<Arc<Correlator>> {
        Ok(self.entry(address, cancel).await?.correlator)
    }

    async fn entry(&self, address: &str, cancel: &CancellationToken) -> MeshResult<PoolEntry> {
        if let Some(entry) = self.entries.get(address) {
            return Ok(entry.value().clone());
        }

        let _guard = self.create_lock.lock().await;
        if let Some(entry) = self.entries.get(address) {
            debug!(address = %address, "Channel created by a concurrent caller");
            return Ok(entry.value().clone());
        }

        let channel = Arc::new(LineChannel::new(
            address,
            ChannelRole::Connecting,
            self.transport.clone(),
            self.config.max_line_bytes,
        ));
        if let Err(e) = channel.establish(cancel).await {
            warn!(address = %address, error = %e, "Failed to connect channel");
            return Err(e);
        }

        let correlator = Arc::new(Correlator::new(
            channel.clone(),
            CorrelatorConfig::from(&self.config),
        ));
        let entry = PoolEntry {
            channel,
            correlator,
        };
        self.entries.insert(address.to_string(), entry.clone());
        info!(address = %address, "Created pooled channel");
        Ok(entry)
    }

    /// Existing channel for `address`, without connecting
    pub fn get(&self, address: &str) -> Option<Arc<LineChannel>> {
        self.entries
            .get(address)
            .map(|entry| entry.value().channel.clone())
    }

    /// Existing correlator for `address`, without connecting
    pub fn correlator(&self, address: &str) -> Option<Arc<Correlator>> {
        self.entries
            .get(address)
            .map(|entry| entry.value().correlator.clone())
    }

    /// Remove and stop the channel for `address`. Returns whether one existed.
    pub async fn stop(&self, address: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(address) else {
            return false;
        };
        entry.channel.stop().await;
        info!(address = %address, "Removed pooled channel");
        true
    }

    /// Stop every pooled channel
    pub async fn stop_all(&self) {
        for address in self.addresses() {
            self.stop(&address).await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Addresses with a pooled channel
    pub fn addresses(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("addresses", &self.addresses())
            .finish()
    }
}
