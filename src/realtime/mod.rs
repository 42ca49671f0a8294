pub mod envelope;
pub mod registry;
pub mod socket;

pub use envelope::{Envelope, EventType, MessagePayload};
pub use registry::{SocketRegistry, SocketSink};
pub use socket::{REQUIRED_SUBPROTOCOL, RealtimeServer};
