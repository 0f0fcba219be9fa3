pub mod errors;
pub mod events;
pub mod ids;

pub use errors::DeliveryError;
pub use events::{ChatEvent, EventKind, InboundMessage};
pub use ids::{ClientIdentity, ConnectionId};
