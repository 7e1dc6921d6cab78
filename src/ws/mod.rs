pub mod registry;
pub mod session;

pub use registry::{BroadcastOutcome, Connection, ConnectionId, ConnectionRegistry, DeliveryError, RegistryStats};
pub use session::{ClientId, Session, SessionError, SessionState};
