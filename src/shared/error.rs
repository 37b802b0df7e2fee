use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the messenger.
///
/// Connection drops and ping timeouts are not part of this taxonomy: the
/// connection manager recovers them internally and they only show up as
/// state transitions and log events.
#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[source] serde_json::Error),

    #[error("not connected to the messaging backend")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish buffer full ({capacity} messages queued)")]
    BufferFull { capacity: usize },

    #[error("messenger is closed")]
    Closed,

    #[error("timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, MessengerError>;

impl From<config::ConfigError> for MessengerError {
    fn from(err: config::ConfigError) -> Self {
        MessengerError::Config(err.to_string())
    }
}
