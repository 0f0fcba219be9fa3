/// Why a frame could not be handed to a connection.
/// Every variant is treated as a permanent disconnect by the broadcaster.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("send queue full")]
    Backpressure,
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl DeliveryError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Backpressure => "backpressure",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
