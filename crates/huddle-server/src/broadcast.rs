//! Event fan-out to every registered connection.

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use futures::future::join_all;
use huddle_core::{ChatEvent, ClientIdentity, DeliveryError};
use huddle_telemetry::MetricsRecorder;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;
use crate::transport::{CloseNotice, Connection};

const BROADCASTS: &str = "broadcasts";
const FRAMES_DELIVERED: &str = "frames_delivered";
const DELIVERY_FAILURES: &str = "delivery_failures";

/// Close sent to a connection the broadcaster gave up on.
pub const DELIVERY_FAILED: CloseNotice = CloseNotice {
    code: 4002,
    reason: "delivery failed",
};

/// Best-effort delivery over a [`ConnectionRegistry`].
///
/// A failed send is final: the connection is unregistered after the delivery
/// pass and asked to close. Nothing is reported back to the caller.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsRecorder>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<MetricsRecorder>) -> Self {
        Self { registry, metrics }
    }

    /// Deliver `event` to every connection registered at call time.
    pub async fn broadcast(&self, event: &ChatEvent) {
        let Some(frame) = self.encode(event) else {
            return;
        };

        let targets = self.registry.targets();
        let recipients = targets.len();

        let results = join_all(targets.into_iter().map(|(identity, conn)| {
            let frame = frame.clone();
            async move {
                let result = conn.send(frame).await;
                (identity, conn, result)
            }
        }))
        .await;

        let mut failed = Vec::new();
        for (identity, conn, result) in results {
            if let Err(e) = result {
                failed.push((identity, conn, e));
            }
        }

        let delivered = recipients - failed.len();
        self.metrics.increment(BROADCASTS, 1);
        self.metrics.increment(FRAMES_DELIVERED, delivered as u64);

        debug!(
            kind = event.kind().as_str(),
            sender = %event.sender(),
            recipients,
            failed = failed.len(),
            "broadcast event"
        );

        for (identity, conn, error) in failed {
            self.drop_connection(&identity, &conn, &error).await;
        }
    }

    /// Deliver `event` to a single identity. Returns whether the frame was
    /// accepted; a failure drops the connection like a broadcast failure.
    pub async fn send_to(&self, identity: &ClientIdentity, event: &ChatEvent) -> bool {
        let Some(conn) = self.registry.get(identity) else {
            return false;
        };
        let Some(frame) = self.encode(event) else {
            return false;
        };
        match conn.send(frame).await {
            Ok(()) => {
                self.metrics.increment(FRAMES_DELIVERED, 1);
                true
            }
            Err(e) => {
                self.drop_connection(identity, &conn, &e).await;
                false
            }
        }
    }

    fn encode(&self, event: &ChatEvent) -> Option<Utf8Bytes> {
        match event.to_frame() {
            Ok(json) => Some(Utf8Bytes::from(json)),
            Err(e) => {
                warn!(kind = event.kind().as_str(), error = %e, "failed to serialize event");
                None
            }
        }
    }

    async fn drop_connection(&self, identity: &ClientIdentity, conn: &Connection, error: &DeliveryError) {
        self.metrics.increment(DELIVERY_FAILURES, 1);
        let removed = self.registry.detach_connection(identity, conn.id());
        warn!(
            identity = %identity,
            conn_id = %conn.id(),
            error = error.error_kind(),
            removed,
            "dropping connection after failed send"
        );
        conn.close(DELIVERY_FAILED).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingSink;

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster, Arc<MetricsRecorder>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), Arc::clone(&metrics));
        (registry, broadcaster, metrics)
    }

    fn event() -> ChatEvent {
        ChatEvent::message("alice".into(), "hi", vec!["alice".into(), "bob".into()])
    }

    #[tokio::test]
    async fn delivers_to_every_connection() {
        let (registry, broadcaster, metrics) = setup();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        registry.register("alice".into(), Connection::new(a.clone()));
        registry.register("bob".into(), Connection::new(b.clone()));

        broadcaster.broadcast(&event()).await;

        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames(), a.frames());
        assert_eq!(a.events()[0]["content"], "hi");
        assert_eq!(metrics.counter("frames_delivered"), 2);
        assert_eq!(metrics.counter("broadcasts"), 1);
    }

    #[tokio::test]
    async fn failed_recipient_removed_others_still_delivered() {
        let (registry, broadcaster, metrics) = setup();
        let healthy: Vec<_> = (0..4).map(|_| RecordingSink::new()).collect();
        for (i, sink) in healthy.iter().enumerate() {
            registry.register(format!("user{i}").into(), Connection::new(sink.clone()));
        }
        let dead = RecordingSink::failing();
        registry.register("dead".into(), Connection::new(dead.clone()));

        broadcaster.broadcast(&event()).await;

        assert!(!registry.contains(&"dead".into()));
        assert_eq!(registry.len(), 4);
        for sink in &healthy {
            assert_eq!(sink.frames().len(), 1);
        }
        assert_eq!(dead.close_notice(), Some(DELIVERY_FAILED));
        assert_eq!(metrics.counter("delivery_failures"), 1);
        assert_eq!(metrics.counter("frames_delivered"), 4);
    }

    #[tokio::test]
    async fn cleanup_spares_newer_connection_under_same_identity() {
        let (registry, broadcaster, _) = setup();
        let dead = Connection::new(RecordingSink::failing());
        let dead_id = dead.id().clone();
        registry.register("alice".into(), dead.clone());

        // Replace the entry between the target snapshot and the cleanup.
        let fresh = Connection::new(RecordingSink::new());
        let fresh_id = fresh.id().clone();
        registry.register("alice".into(), fresh);

        broadcaster
            .drop_connection(&"alice".into(), &dead, &DeliveryError::Closed)
            .await;

        assert_ne!(dead_id, fresh_id);
        assert_eq!(registry.get(&"alice".into()).unwrap().id(), &fresh_id);
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry_is_noop() {
        let (_, broadcaster, metrics) = setup();
        broadcaster.broadcast(&event()).await;
        assert_eq!(metrics.counter("broadcasts"), 1);
        assert_eq!(metrics.counter("frames_delivered"), 0);
    }

    #[tokio::test]
    async fn send_to_single_identity() {
        let (registry, broadcaster, _) = setup();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        registry.register("alice".into(), Connection::new(a.clone()));
        registry.register("bob".into(), Connection::new(b.clone()));

        assert!(broadcaster.send_to(&"bob".into(), &event()).await);
        assert!(a.frames().is_empty());
        assert_eq!(b.frames().len(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_or_dead_identity() {
        let (registry, broadcaster, _) = setup();
        assert!(!broadcaster.send_to(&"ghost".into(), &event()).await);

        registry.register("dead".into(), Connection::new(RecordingSink::failing()));
        assert!(!broadcaster.send_to(&"dead".into(), &event()).await);
        assert!(registry.is_empty());
    }
}
