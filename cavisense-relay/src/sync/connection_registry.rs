use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cavisense_core::metrics::{BROADCAST_DELIVERIES, PRUNED_CONNECTIONS, WS_ACTIVE_CONNECTIONS};
use cavisense_core::{SensorEnvelope, SensorPayload};

use crate::error::{Error, Result};

/// Handle for a viewer connection
pub type ConnectionId = String;

/// One serialized envelope, shared by every connection it is sent to
pub type Frame = Arc<str>;

/// Registry side of a viewer connection.
///
/// Frames are queued on a bounded channel that the transport writer drains.
/// Closing the connection cancels `closed`, which the writer watches to end
/// the session.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryFailure {
    Closed,
    Overflow,
}

impl DeliveryFailure {
    const fn reason(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Overflow => "overflow",
        }
    }
}

impl Connection {
    /// Create a connection with a fresh id and an outbound queue of
    /// `capacity` frames. The receiver belongs to the transport writer.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        Self::with_id(format!("ws_{}", nanoid::nanoid!(12)), capacity)
    }

    #[must_use]
    pub fn with_id(id: impl Into<ConnectionId>, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: id.into(),
                sender,
                closed: CancellationToken::new(),
            },
            receiver,
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// False once the connection was closed or its writer went away
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.sender.is_closed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token cancelled when the connection is closed from the registry side
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Queue a frame without waiting
    pub fn try_deliver(&self, frame: Frame) -> Result<()> {
        self.deliver(frame).map_err(|failure| {
            Error::TransportSendFailure(format!("connection {} {}", self.id, failure.reason()))
        })
    }

    fn deliver(&self, frame: Frame) -> std::result::Result<(), DeliveryFailure> {
        if !self.is_open() {
            return Err(DeliveryFailure::Closed);
        }

        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::Overflow,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

/// Set of live viewer connections owned by this process
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Connection) {
        let id = connection.id.clone();
        if self.connections.insert(id.clone(), connection).is_none() {
            WS_ACTIVE_CONNECTIONS.inc();
        }

        info!(
            connection_id = %id,
            connections = self.connections.len(),
            "Viewer connection registered"
        );
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    ///
    /// Returns whether the connection was present.
    pub fn unregister(&self, connection_id: &str) -> bool {
        if self.connections.remove(connection_id).is_some() {
            WS_ACTIVE_CONNECTIONS.dec();
            info!(
                connection_id = %connection_id,
                connections = self.connections.len(),
                "Viewer connection unregistered"
            );
            true
        } else {
            debug!(connection_id = %connection_id, "Connection already unregistered");
            false
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Send an update envelope to every registered connection.
    ///
    /// The envelope is serialized once. Connections that are closed or whose
    /// queue is full are pruned; the rest still receive the frame.
    pub fn broadcast(&self, payload: &SensorPayload) -> Result<BroadcastReport> {
        if self.connections.is_empty() {
            return Ok(BroadcastReport::default());
        }

        let frame: Frame = Arc::from(SensorEnvelope::encode_update(payload)?);
        Ok(self.broadcast_frame(&frame))
    }

    /// Send an already-serialized frame to every registered connection
    pub fn broadcast_frame(&self, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed_connections = Vec::new();

        for entry in self.connections.iter() {
            match entry.value().deliver(Arc::clone(frame)) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    warn!(
                        connection_id = %entry.key(),
                        reason = failure.reason(),
                        "Failed to queue frame for viewer, marking for cleanup"
                    );
                    failed_connections.push((entry.key().clone(), failure));
                }
            }
        }

        // Removal happens after iteration so no shard guard is held
        for (connection_id, failure) in failed_connections {
            if self.prune(&connection_id, failure) {
                report.pruned += 1;
            }
        }

        BROADCAST_DELIVERIES.inc_by(report.delivered as u64);
        debug!(
            delivered = report.delivered,
            pruned = report.pruned,
            "Broadcast complete"
        );

        report
    }

    /// Send one update envelope to a single connection
    ///
    /// A failed send prunes the connection just like a failed broadcast.
    pub fn send_one(&self, connection: &Connection, payload: &SensorPayload) -> Result<()> {
        let frame: Frame = Arc::from(SensorEnvelope::encode_update(payload)?);

        match connection.deliver(frame) {
            Ok(()) => {
                BROADCAST_DELIVERIES.inc();
                Ok(())
            }
            Err(failure) => {
                self.prune(&connection.id, failure);
                Err(Error::TransportSendFailure(format!(
                    "connection {} {}",
                    connection.id,
                    failure.reason()
                )))
            }
        }
    }

    /// Close and drop every connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;

        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.close();
                WS_ACTIVE_CONNECTIONS.dec();
                closed += 1;
            }
        }

        if closed > 0 {
            info!(closed = closed, "Closed all viewer connections");
        }
        closed
    }

    fn prune(&self, connection_id: &str, failure: DeliveryFailure) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };

        connection.close();
        WS_ACTIVE_CONNECTIONS.dec();
        PRUNED_CONNECTIONS.with_label_values(&[failure.reason()]).inc();
        info!(
            connection_id = %connection_id,
            reason = failure.reason(),
            "Pruned viewer connection"
        );
        true
    }
}
