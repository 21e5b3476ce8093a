//! The discovery event bridge.
//!
//! External sources (static config, container runtimes, cluster endpoint
//! slices) publish add/remove intents onto one bounded channel; a single
//! applier task reconciles them into the pool. Events are idempotent intent,
//! not transactions: re-adding a known backend or removing an unknown one is
//! a silent no-op, so a source can re-sync after reconnecting without
//! damage.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::ResolvedBackend;
use crate::metrics::{DISCOVERY_EVENTS, HEALTHY_BACKENDS, TOTAL_BACKENDS};
use crate::pool::Pool;

/// Bounded capacity of the discovery channel. A slow applier blocks
/// producers instead of dropping events.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery event channel closed")]
    ChannelClosed,
    #[error("discovery source failed: {0}")]
    Source(String),
}

/// An add/remove intent for one backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Add { address: String, weight: i64 },
    Remove { address: String },
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Add { .. } => "add",
            Event::Remove { .. } => "remove",
        }
    }
}

/// A producer of discovery events.
///
/// Implementations emit one `Add` per currently-present backend at startup
/// (the initial sync), then watch for changes until the shutdown signal. A
/// full channel blocks the source; events are never dropped silently. Errors
/// terminate the source's run and leave the pool as it stands.
#[async_trait]
pub trait Discover: Send + Sync {
    async fn run(
        &self,
        events: mpsc::Sender<Event>,
        shutdown: watch::Receiver<()>,
    ) -> Result<(), DiscoveryError>;
}

/// The trivial source: the configured backend list is the whole world. It
/// emits the initial sync and then parks until cancellation.
pub struct StaticDiscovery {
    backends: Vec<ResolvedBackend>,
}

impl StaticDiscovery {
    pub fn new(backends: Vec<ResolvedBackend>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl Discover for StaticDiscovery {
    async fn run(
        &self,
        events: mpsc::Sender<Event>,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<(), DiscoveryError> {
        for b in &self.backends {
            let event = Event::Add { address: b.address.clone(), weight: b.weight };
            events.send(event).await.map_err(|_| DiscoveryError::ChannelClosed)?;
        }
        info!(backends = self.backends.len(), "Static discovery synced");

        let _ = shutdown.changed().await;
        Ok(())
    }
}

/// A stateless applier of discovery events onto the pool.
pub struct Registry {
    pool: Arc<Pool>,
}

impl Registry {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    /// Applies one event. Pool rejections (duplicate add, missing remove)
    /// are swallowed.
    pub fn apply(&self, event: Event) {
        DISCOVERY_EVENTS.with_label_values(&[event.kind()]).inc();
        match event {
            Event::Add { address, weight } => {
                if self.pool.add(&address, weight).is_ok() {
                    info!(address = %address, weight = weight, "Backend added by discovery");
                } else {
                    debug!(address = %address, "Discovery re-added a known backend");
                }
            }
            Event::Remove { address } => {
                if self.pool.remove(&address) {
                    info!(address = %address, "Backend removed by discovery");
                } else {
                    debug!(address = %address, "Discovery removed an unknown backend");
                }
            }
        }
        TOTAL_BACKENDS.set(self.pool.len() as i64);
        HEALTHY_BACKENDS.set(self.pool.alive_count() as i64);
    }

    /// Consumes the channel until it closes or the shutdown signal fires.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("Discovery applier received shutdown signal, exiting.");
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => {
                        info!("Discovery event channel closed, applier exiting.");
                        return;
                    }
                },
            }
        }
    }
}
