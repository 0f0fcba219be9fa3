use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeliveryError;
use crate::ids::ClientIdentity;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Join,
    Leave,
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Message => "message",
        }
    }
}

/// One room event as it goes out on the wire.
///
/// Immutable once built: the roster is captured by the caller at emission
/// time and the timestamp is stamped by the constructor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(rename = "username")]
    sender: ClientIdentity,
    content: String,
    timestamp: String,
    #[serde(rename = "users")]
    roster: Vec<ClientIdentity>,
}

impl ChatEvent {
    pub fn join(sender: ClientIdentity, roster: Vec<ClientIdentity>) -> Self {
        let content = format!("{sender} joined the chat");
        Self::stamped(EventKind::Join, sender, content, roster)
    }

    pub fn leave(sender: ClientIdentity, roster: Vec<ClientIdentity>) -> Self {
        let content = format!("{sender} left the chat");
        Self::stamped(EventKind::Leave, sender, content, roster)
    }

    pub fn message(
        sender: ClientIdentity,
        content: impl Into<String>,
        roster: Vec<ClientIdentity>,
    ) -> Self {
        Self::stamped(EventKind::Message, sender, content.into(), roster)
    }

    fn stamped(
        kind: EventKind,
        sender: ClientIdentity,
        content: String,
        roster: Vec<ClientIdentity>,
    ) -> Self {
        Self {
            kind,
            sender,
            content,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            roster,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn sender(&self) -> &ClientIdentity {
        &self.sender
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn roster(&self) -> &[ClientIdentity] {
        &self.roster
    }

    /// Serialize to the JSON text frame sent to clients.
    pub fn to_frame(&self) -> Result<String, DeliveryError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload a client sends. Unknown fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub content: String,
}

impl InboundMessage {
    /// Strict parse. Callers that must never reject a frame fall back to
    /// `InboundMessage::default()` on error.
    pub fn parse(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}
