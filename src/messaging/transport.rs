use async_trait::async_trait;

use crate::shared::error::Result;

/// One raw inbound notification from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Factory for transport connections.
///
/// Implementations carry their own address and credentials; the connection
/// manager only asks for fresh connections and never sees the wire details.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection, split into an outbound sink and an inbound
    /// stream so sends and receives can proceed independently.
    async fn connect(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;
}

/// Outbound half of a connection. Exclusively owned by the connection
/// manager's driver task.
#[async_trait]
pub trait TransportSink: Send {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&mut self, channel: &str) -> Result<()>;
    async fn unsubscribe(&mut self, channel: &str) -> Result<()>;
    /// Lightweight liveness probe for the health check loop.
    async fn ping(&mut self) -> Result<()>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait TransportStream: Send {
    /// Next notification, or `None` once the connection is lost.
    async fn next_frame(&mut self) -> Option<Frame>;
}
