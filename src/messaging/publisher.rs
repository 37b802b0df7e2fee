use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use crate::messaging::codec::Codec;
use crate::messaging::connection::ConnectionManager;
use crate::messaging::domain::{Envelope, MessengerStats};
use crate::shared::error::{MessengerError, Result};

/// Encodes outbound envelopes and submits them through the connection
/// manager.
///
/// Never retries: delivery is at-most-once, and a retry after a late
/// failure could duplicate a send that actually went through. Retry policy
/// belongs to the caller.
pub(crate) struct Publisher {
    codec: Arc<dyn Codec>,
    manager: ConnectionManager,
    stats: Arc<RwLock<MessengerStats>>,
    publish_limit: Duration,
}

impl Publisher {
    pub fn new(
        codec: Arc<dyn Codec>,
        manager: ConnectionManager,
        stats: Arc<RwLock<MessengerStats>>,
        publish_limit: Duration,
    ) -> Self {
        Self {
            codec,
            manager,
            stats,
            publish_limit,
        }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        // An encode failure surfaces immediately; the transport is never
        // touched.
        let bytes = self.codec.encode(&envelope)?;

        match self
            .manager
            .publish_frame(envelope.channel.clone(), bytes, self.publish_limit)
            .await
        {
            Ok(()) => {
                self.stats.write().await.increment_published();
                debug!(
                    "Published message {} on channel '{}'",
                    envelope.id, envelope.channel
                );
                Ok(())
            }
            Err(err) => {
                self.stats.write().await.increment_publish_errors();
                Err(classify(err))
            }
        }
    }
}

/// Keep the taxonomy stable for callers: transport-level causes become
/// `Publish`, the policy errors pass through untouched.
fn classify(err: MessengerError) -> MessengerError {
    match err {
        MessengerError::NotConnected => MessengerError::NotConnected,
        MessengerError::Closed => MessengerError::Closed,
        MessengerError::BufferFull { capacity } => MessengerError::BufferFull { capacity },
        MessengerError::Publish(cause) => MessengerError::Publish(cause),
        other => MessengerError::Publish(other.to_string()),
    }
}
