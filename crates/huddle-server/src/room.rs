use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use huddle_core::{ChatEvent, ClientIdentity, ConnectionId, InboundMessage};
use huddle_telemetry::MetricsRecorder;
use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::config::DuplicatePolicy;
use crate::registry::{ConnectionRegistry, Removal};
use crate::transport::{CloseNotice, Connection};

const CONNECTIONS_OPENED: &str = "connections_opened";
const CONNECTIONS_ACTIVE: &str = "connections_active";
const CONNECTIONS_REJECTED: &str = "connections_rejected";
const CONNECTIONS_EVICTED: &str = "connections_evicted";
const FRAMES_RECEIVED: &str = "frames_received";
const MALFORMED_FRAMES: &str = "malformed_frames";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Identity already live and the room rejects duplicates, or the room
    /// is shutting down.
    Rejected,
}

/// The single chat room: registry, broadcaster and the duplicate-identity
/// policy, shared by every session.
pub struct ChatRoom {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    metrics: Arc<MetricsRecorder>,
    policy: DuplicatePolicy,
    /// Set by `close_all`; departures are no longer announced.
    closing: AtomicBool,
}

impl ChatRoom {
    pub fn new(policy: DuplicatePolicy, metrics: Arc<MetricsRecorder>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Arc::clone(&metrics));
        Self {
            registry,
            broadcaster,
            metrics,
            policy,
            closing: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn roster(&self) -> Vec<ClientIdentity> {
        self.registry.snapshot()
    }

    /// Register `connection` under `identity` and announce it.
    ///
    /// The join roster is read after registration, so it always contains the
    /// newcomer.
    pub async fn join(&self, identity: &ClientIdentity, connection: Connection) -> JoinOutcome {
        let conn_id = connection.id().clone();
        if self.is_closing() {
            debug!(identity = %identity, conn_id = %conn_id, "room closing, refusing connection");
            connection.close(CloseNotice::GOING_AWAY).await;
            return JoinOutcome::Rejected;
        }
        match self.policy {
            DuplicatePolicy::Reject => {
                if let Err(connection) = self.registry.register_if_absent(identity.clone(), connection) {
                    self.metrics.increment(CONNECTIONS_REJECTED, 1);
                    info!(identity = %identity, conn_id = %conn_id, "identity in use, rejecting connection");
                    connection.close(CloseNotice::IDENTITY_IN_USE).await;
                    return JoinOutcome::Rejected;
                }
            }
            DuplicatePolicy::Evict => {
                if let Some(previous) = self.registry.register(identity.clone(), connection) {
                    self.metrics.increment(CONNECTIONS_EVICTED, 1);
                    info!(
                        identity = %identity,
                        conn_id = %conn_id,
                        evicted = %previous.id(),
                        "identity reconnected, closing previous connection"
                    );
                    previous.close(CloseNotice::SUPERSEDED).await;
                }
            }
        }

        self.metrics.increment(CONNECTIONS_OPENED, 1);
        self.refresh_active_gauge();

        let event = ChatEvent::join(identity.clone(), self.roster());
        self.broadcaster.broadcast(&event).await;
        JoinOutcome::Joined
    }

    /// Turn one inbound frame into a `message` broadcast. Never rejects:
    /// anything unparseable becomes empty content.
    pub async fn relay(&self, identity: &ClientIdentity, frame: &[u8]) {
        self.metrics.increment(FRAMES_RECEIVED, 1);
        let message = match InboundMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.increment(MALFORMED_FRAMES, 1);
                debug!(identity = %identity, error = %e, len = frame.len(), "malformed frame, relaying empty content");
                InboundMessage::default()
            }
        };
        let event = ChatEvent::message(identity.clone(), message.content, self.roster());
        self.broadcaster.broadcast(&event).await;
    }

    /// Remove `conn_id`'s entry and announce the departure.
    ///
    /// Skips the announcement when a newer connection claimed the identity,
    /// and once the room is closing.
    pub async fn leave(&self, identity: &ClientIdentity, conn_id: &ConnectionId) -> Removal {
        let removal = self.registry.unregister_connection(identity, conn_id);
        self.refresh_active_gauge();
        if removal == Removal::Superseded {
            debug!(identity = %identity, conn_id = %conn_id, "connection superseded, no leave event");
            return removal;
        }
        if self.is_closing() {
            debug!(identity = %identity, conn_id = %conn_id, "room closing, no leave event");
            return removal;
        }
        let event = ChatEvent::leave(identity.clone(), self.roster());
        self.broadcaster.broadcast(&event).await;
        removal
    }

    /// Ask every registered connection to close. Used on shutdown; the room
    /// stops announcing departures and refuses new joins.
    pub async fn close_all(&self, notice: CloseNotice) {
        self.closing.store(true, Ordering::SeqCst);
        let targets = self.registry.targets();
        info!(connections = targets.len(), "closing all connections");
        for (_, conn) in targets {
            conn.close(notice.clone()).await;
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn refresh_active_gauge(&self) {
        self.metrics
            .gauge_set(CONNECTIONS_ACTIVE, self.registry.len() as i64);
    }
}
