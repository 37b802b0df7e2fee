pub mod messaging;
pub mod shared;

// Re-export commonly used types
pub use messaging::codec::{Codec, JsonCodec};
pub use messaging::domain::{
    listener_fn, ConnectionState, Envelope, Listener, Message, MessageKind, MessengerStats,
    ALL_RECEIVERS,
};
pub use messaging::memory::MemoryTransport;
pub use messaging::messenger::RedisMessenger;
pub use messaging::redis::RedisTransport;
pub use messaging::registry::{SubscriptionHandle, SubscriptionRegistry};
pub use messaging::transport::{Frame, Transport, TransportSink, TransportStream};
pub use shared::config::MessengerConfig;

// Re-export result type
pub use shared::error::{MessengerError, Result};
