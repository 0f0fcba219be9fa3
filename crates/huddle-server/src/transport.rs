//! Transport seam between the chat core and whatever carries the frames.
//!
//! The axum websocket adapter in [`crate::ws`] is the production
//! implementation; tests drive sessions with in-memory channels.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Utf8Bytes;
use bytes::Bytes;
use huddle_core::{ConnectionId, DeliveryError};

/// What a read from the client produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Frame(Bytes),
    /// Graceful close, read error, or idle timeout. Terminal.
    Disconnected,
}

/// Close code and reason sent to a client the server is dropping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseNotice {
    /// Another connection took over this identity.
    pub const SUPERSEDED: CloseNotice = CloseNotice {
        code: 4000,
        reason: "replaced by a newer connection",
    };

    /// The identity is already connected and the room rejects duplicates.
    pub const IDENTITY_IN_USE: CloseNotice = CloseNotice {
        code: 4001,
        reason: "username already connected",
    };

    /// Server is shutting down.
    pub const GOING_AWAY: CloseNotice = CloseNotice {
        code: 1001,
        reason: "server shutting down",
    };
}

/// Outbound half of one client connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Hand one serialized frame to the connection. Frames are shared
    /// between recipients, so cloning one never copies the payload.
    async fn send_frame(&self, frame: Utf8Bytes) -> Result<(), DeliveryError>;

    /// Ask the transport to close the connection. Best effort.
    async fn close(&self, notice: CloseNotice);
}

/// Inbound half of one client connection. Owned by exactly one session.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv_frame(&mut self) -> Inbound;
}

/// Registry entry for one accepted connection.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    sink: Arc<dyn FrameSink>,
}

impl Connection {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            id: ConnectionId::new(),
            sink,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub async fn send(&self, frame: Utf8Bytes) -> Result<(), DeliveryError> {
        self.sink.send_frame(frame).await
    }

    pub async fn close(&self, notice: CloseNotice) {
        self.sink.close(notice).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport used by unit tests.

    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Records every frame; can be switched to fail on demand.
    #[derive(Default)]
    pub struct RecordingSink {
        frames: Mutex<Vec<String>>,
        closed: Mutex<Option<CloseNotice>>,
        failing: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let sink = Self::default();
            sink.failing
                .store(true, std::sync::atomic::Ordering::Relaxed);
            Arc::new(sink)
        }

        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().clone()
        }

        pub fn events(&self) -> Vec<serde_json::Value> {
            self.frames()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }

        pub fn close_notice(&self) -> Option<CloseNotice> {
            self.closed.lock().clone()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: Utf8Bytes) -> Result<(), DeliveryError> {
            if self.failing.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(DeliveryError::Closed);
            }
            self.frames.lock().push(frame.to_string());
            Ok(())
        }

        async fn close(&self, notice: CloseNotice) {
            *self.closed.lock() = Some(notice);
        }
    }

    /// Frames pushed through the sender come out of `recv_frame`; dropping
    /// the sender is a disconnect.
    pub struct ChannelSource {
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl ChannelSource {
        pub fn new() -> (mpsc::UnboundedSender<Bytes>, Self) {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, Self { rx })
        }
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn recv_frame(&mut self) -> Inbound {
            match self.rx.recv().await {
                Some(bytes) => Inbound::Frame(bytes),
                None => Inbound::Disconnected,
            }
        }
    }
}
