pub mod broadcast;
pub mod config;
pub mod error;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod transport;
pub mod ws;

pub use broadcast::Broadcaster;
pub use config::{ConfigError, DuplicatePolicy, ServerConfig};
pub use error::ServerError;
pub use registry::{ConnectionRegistry, Removal};
pub use room::{ChatRoom, JoinOutcome};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{Session, SessionEnd, SessionState, SessionSummary};
pub use transport::{CloseNotice, Connection, FrameSink, FrameSource, Inbound};
