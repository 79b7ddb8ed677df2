//! Sensor relay orchestrator
//!
//! Wires the snapshot store, the broker and the connection registry together:
//! - ingress updates are published to the broker and nothing else
//! - every process, the publisher included, persists and broadcasts what it
//!   receives from its subscription
//! - new viewer connections get the latest snapshot as catch-up

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use cavisense_core::config::RelayConfig;
use cavisense_core::metrics::RELAY_UPDATES;
use cavisense_core::{SensorEnvelope, SensorPayload};

use super::broker::{Broker, MessageHandler, Subscription};
use super::connection_registry::{BroadcastReport, Connection, ConnectionRegistry};
use super::snapshot_store::SnapshotStore;
use crate::error::{Error, Result};

/// Store key and broker channel of the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub snapshot_key: String,
    pub channel: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            snapshot_key: config.snapshot_key.clone(),
            channel: config.channel.clone(),
        }
    }
}

/// Whether a snapshot is known to exist for the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Nothing persisted yet; new connections get no catch-up
    Uninitialized,
    /// New connections get the latest snapshot on attach
    Warm,
}

impl FeedState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Warm => "warm",
        }
    }
}

/// Subscription callback: decode, persist, remember, broadcast
struct UpdatePipeline {
    snapshot_key: String,
    store: Arc<dyn SnapshotStore>,
    registry: ConnectionRegistry,
    latest: Arc<RwLock<Option<SensorPayload>>>,
}

impl UpdatePipeline {
    async fn process(&self, raw: &str) -> Option<BroadcastReport> {
        let payload = match SensorEnvelope::from_json(raw) {
            Ok(envelope) => envelope.into_payload(),
            Err(e) => {
                RELAY_UPDATES.with_label_values(&["discarded"]).inc();
                warn!(error = %e, "Discarding undecodable broker message");
                return None;
            }
        };
        RELAY_UPDATES.with_label_values(&["received"]).inc();

        match self.store.set(&self.snapshot_key, &payload).await {
            Ok(()) => {
                RELAY_UPDATES.with_label_values(&["persisted"]).inc();
                *self.latest.write() = Some(payload.clone());
            }
            Err(e) => {
                // Viewers still get the live update
                RELAY_UPDATES.with_label_values(&["persist_failed"]).inc();
                error!(key = %self.snapshot_key, error = %e, "Failed to persist sensor payload");
            }
        }

        match self.registry.broadcast(&payload) {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Failed to broadcast sensor payload");
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler for UpdatePipeline {
    async fn handle(&self, channel: &str, payload: String) {
        debug!(channel = %channel, "Sensor update received from broker");
        self.process(&payload).await;
    }
}

/// Relay for one sensor feed
///
/// Constructed explicitly with its collaborators so independent instances
/// can share a store and broker, which is how a multi-node deployment looks
/// from the inside.
pub struct SensorRelay {
    node_id: String,
    settings: RelaySettings,
    store: Arc<dyn SnapshotStore>,
    broker: Arc<dyn Broker>,
    registry: ConnectionRegistry,
    pipeline: Arc<UpdatePipeline>,
    latest: Arc<RwLock<Option<SensorPayload>>>,
    subscription: Mutex<Option<Subscription>>,
    stopped: AtomicBool,
}

impl SensorRelay {
    pub fn new(
        node_id: impl Into<String>,
        settings: RelaySettings,
        store: Arc<dyn SnapshotStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let latest = Arc::new(RwLock::new(None));
        let pipeline = Arc::new(UpdatePipeline {
            snapshot_key: settings.snapshot_key.clone(),
            store: store.clone(),
            registry: registry.clone(),
            latest: latest.clone(),
        });

        Self {
            node_id: node_id.into(),
            settings,
            store,
            broker,
            registry,
            pipeline,
            latest,
            subscription: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Subscribe to the feed channel. Calling it again is a no-op.
    pub fn start(&self) {
        if self.stopped.load(Ordering::Acquire) {
            warn!(node_id = %self.node_id, "Relay already stopped, not starting");
            return;
        }

        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            debug!(node_id = %self.node_id, "Relay already started");
            return;
        }

        let handler: Arc<dyn MessageHandler> = self.pipeline.clone();
        *subscription = Some(self.broker.subscribe(&self.settings.channel, handler));

        info!(
            node_id = %self.node_id,
            channel = %self.settings.channel,
            key = %self.settings.snapshot_key,
            "Sensor relay started"
        );
    }

    /// Stop the subscription and close every viewer connection. Idempotent.
    ///
    /// The store and broker may be shared with other relays, so they stay
    /// open; whoever built them closes them.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(node_id = %self.node_id, "Stopping sensor relay");

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.shutdown().await;
        }

        let closed = self.registry.close_all();

        info!(node_id = %self.node_id, closed_connections = closed, "Sensor relay stopped");
    }

    /// Whether the feed subscription is live. Turns false once the relay is
    /// stopped or the broker behind it is closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self
                .subscription
                .lock()
                .as_ref()
                .is_some_and(Subscription::is_active)
    }

    /// Hand an update to the broker.
    ///
    /// Persistence and broadcast happen when the update comes back through
    /// the subscription, on this process and every other one.
    pub async fn publish_update(&self, payload: &SensorPayload) -> Result<usize> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::BrokerUnavailable("relay stopped".to_string()));
        }

        let raw = SensorEnvelope::encode_update(payload)?;
        let receivers = self.broker.publish(&self.settings.channel, raw).await?;

        RELAY_UPDATES.with_label_values(&["published"]).inc();
        debug!(
            node_id = %self.node_id,
            channel = %self.settings.channel,
            receivers = receivers,
            "Sensor update published"
        );

        Ok(receivers)
    }

    /// Process one raw broker message as if it arrived on the subscription
    pub async fn on_message(&self, raw: &str) -> Option<BroadcastReport> {
        self.pipeline.process(raw).await
    }

    /// Register a viewer connection and send it the catch-up snapshot.
    ///
    /// Returns whether a catch-up frame was queued. No frame is queued when a
    /// newer update was persisted after the connection was registered, since
    /// that update is broadcast to it anyway.
    pub async fn attach(&self, connection: Connection) -> bool {
        let seen = self.latest.read().as_ref().map(SensorPayload::received_at);
        self.registry.register(connection.clone());

        let stored = self.store.get(&self.settings.snapshot_key).await;
        let snapshot = {
            let mut latest = self.latest.write();
            let memo_at = latest.as_ref().map(SensorPayload::received_at);
            let memo_is_newer = match (&stored, memo_at) {
                (Some(stored), Some(at)) => at > stored.received_at(),
                (None, Some(_)) => true,
                (_, None) => false,
            };

            if memo_is_newer && memo_at != seen {
                debug!(connection_id = %connection.id(), "Newer update already on its way, skipping catch-up");
                return false;
            }

            if memo_is_newer {
                latest.clone()
            } else {
                if latest.is_none() {
                    latest.clone_from(&stored);
                }
                stored
            }
        };

        let Some(snapshot) = snapshot else {
            debug!(connection_id = %connection.id(), "No snapshot yet, skipping catch-up");
            return false;
        };

        match self.registry.send_one(&connection, &snapshot) {
            Ok(()) => {
                debug!(connection_id = %connection.id(), "Catch-up snapshot sent");
                true
            }
            Err(e) => {
                warn!(connection_id = %connection.id(), error = %e, "Failed to send catch-up snapshot");
                false
            }
        }
    }

    /// Unregister a viewer connection. Unknown ids are ignored.
    pub fn detach(&self, connection_id: &str) {
        self.registry.unregister(connection_id);
    }

    /// Latest snapshot: the store first, this process's last persisted
    /// payload when the store has nothing or cannot be read.
    pub async fn latest_snapshot(&self) -> Option<SensorPayload> {
        if let Some(stored) = self.store.get(&self.settings.snapshot_key).await {
            let mut latest = self.latest.write();
            if latest.is_none() {
                *latest = Some(stored.clone());
            }
            return Some(stored);
        }

        self.latest.read().clone()
    }

    #[must_use]
    pub fn feed_state(&self) -> FeedState {
        if self.latest.read().is_some() {
            FeedState::Warm
        } else {
            FeedState::Uninitialized
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}
