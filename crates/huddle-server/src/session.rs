//! Per-connection control loop: `Connecting -> Active -> Closed`.

use std::sync::Arc;

use huddle_core::{ClientIdentity, ConnectionId};
use tracing::{debug, info, instrument};

use crate::registry::Removal;
use crate::room::{ChatRoom, JoinOutcome};
use crate::transport::{Connection, FrameSink, FrameSource, Inbound};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// How a session reached `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed, read failed, idle timeout, or the broadcaster dropped it.
    Disconnected,
    /// A newer connection took over the identity.
    Superseded,
    /// Never joined: identity already live under the reject policy.
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub identity: ClientIdentity,
    pub connection_id: ConnectionId,
    pub frames_relayed: u64,
    pub end: SessionEnd,
}

/// One client's session. Sole reader of its [`FrameSource`].
pub struct Session<S> {
    identity: ClientIdentity,
    connection: Connection,
    source: S,
    state: SessionState,
    frames_relayed: u64,
}

impl<S: FrameSource> Session<S> {
    pub fn new(identity: ClientIdentity, sink: Arc<dyn FrameSink>, source: S) -> Self {
        Self {
            identity,
            connection: Connection::new(sink),
            source,
            state: SessionState::Connecting,
            frames_relayed: 0,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    /// Drive the session until the transport disconnects.
    #[instrument(skip_all, fields(identity = %self.identity, conn_id = %self.connection.id()))]
    pub async fn run(mut self, room: &ChatRoom) -> SessionSummary {
        if room.join(&self.identity, self.connection.clone()).await == JoinOutcome::Rejected {
            self.transition(SessionState::Closed);
            return self.summary(SessionEnd::Rejected);
        }
        self.transition(SessionState::Active);
        info!("session active");

        let mut end = SessionEnd::Disconnected;
        loop {
            let frame = match self.source.recv_frame().await {
                Inbound::Frame(frame) => frame,
                Inbound::Disconnected => break,
            };
            match room.registry().owner_of(&self.identity) {
                Some(owner) if &owner == self.connection.id() => {}
                Some(_) => {
                    end = SessionEnd::Superseded;
                    break;
                }
                None => break,
            }
            room.relay(&self.identity, &frame).await;
            self.frames_relayed += 1;
        }

        self.transition(SessionState::Closed);
        if room.leave(&self.identity, self.connection.id()).await == Removal::Superseded {
            end = SessionEnd::Superseded;
        }
        info!(frames = self.frames_relayed, end = ?end, "session closed");
        self.summary(end)
    }

    fn summary(&self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            identity: self.identity.clone(),
            connection_id: self.connection.id().clone(),
            frames_relayed: self.frames_relayed,
            end,
        }
    }
}
