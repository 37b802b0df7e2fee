use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::shared::error::{MessengerError, Result};

/// Receiver wildcard: the envelope is addressed to every instance.
pub const ALL_RECEIVERS: &str = "*";

/// Wire-level message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// An application message dispatched to channel listeners.
    Event,
    /// Automatic delivery acknowledgement for an event flagged `requires_ack`.
    Ack,
    /// An application reply correlated to an earlier event.
    Reply,
}

/// The wire envelope: everything that crosses the transport.
///
/// Payloads are kept as JSON values so one envelope shape serves arbitrary
/// application schemas; typed access happens at the receiving end via
/// [`Message::payload_as`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub channel: String,
    pub sender: String,
    pub receivers: Vec<String>,
    pub kind: MessageKind,
    /// For acks and replies, the id of the envelope being answered.
    pub correlation: Option<Uuid>,
    pub requires_ack: bool,
    pub expects_reply: bool,
    pub sent_at_ms: u64,
    pub payload: Value,
}

impl Envelope {
    /// Build an event addressed to every instance.
    pub fn broadcast(sender: &str, channel: &str, payload: Value) -> Self {
        Self::event(sender, channel, vec![ALL_RECEIVERS.to_string()], payload)
    }

    /// Build an event addressed to the given receivers.
    pub fn event(sender: &str, channel: &str, receivers: Vec<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            sender: sender.to_string(),
            receivers,
            kind: MessageKind::Event,
            correlation: None,
            requires_ack: false,
            expects_reply: false,
            sent_at_ms: now_millis(),
            payload,
        }
    }

    /// Build the automatic acknowledgement for `origin`, addressed back to
    /// its sender.
    pub fn ack(origin: &Envelope, sender: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: origin.channel.clone(),
            sender: sender.to_string(),
            receivers: vec![origin.sender.clone()],
            kind: MessageKind::Ack,
            correlation: Some(origin.id),
            requires_ack: false,
            expects_reply: false,
            sent_at_ms: now_millis(),
            payload: Value::Null,
        }
    }

    /// Build a reply to `origin`, addressed back to its sender.
    pub fn reply(origin: &Envelope, sender: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: origin.channel.clone(),
            sender: sender.to_string(),
            receivers: vec![origin.sender.clone()],
            kind: MessageKind::Reply,
            correlation: Some(origin.id),
            requires_ack: false,
            expects_reply: false,
            sent_at_ms: now_millis(),
            payload,
        }
    }

    /// Whether this envelope is addressed to `instance_id`.
    pub fn addressed_to(&self, instance_id: &str) -> bool {
        self.receivers
            .iter()
            .any(|receiver| receiver == ALL_RECEIVERS || receiver == instance_id)
    }
}

/// A received message: the decoded envelope plus the local receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub envelope: Envelope,
    pub received_at_ms: u64,
}

impl Message {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            received_at_ms: now_millis(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.envelope.channel
    }

    pub fn sender(&self) -> &str {
        &self.envelope.sender
    }

    /// Whether the publisher asked for an application reply via `request`.
    pub fn expects_reply(&self) -> bool {
        self.envelope.expects_reply
    }

    /// Decode the payload into an application type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.envelope.payload.clone()).map_err(MessengerError::Codec)
    }
}

/// Callback capability registered against one or more channels.
///
/// A listener returning an error is logged and counted; it never affects
/// other listeners or subsequent messages.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

struct FnListener<F>(F);

#[async_trait]
impl<F> Listener for FnListener<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// Wrap a plain closure as a [`Listener`].
pub fn listener_fn<F>(f: F) -> Arc<dyn Listener>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

/// Connection lifecycle as observed through [`RedisMessenger::state`].
///
/// [`RedisMessenger::state`]: crate::messaging::messenger::RedisMessenger::state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Messenger counters, exposed via [`RedisMessenger::stats`].
///
/// [`RedisMessenger::stats`]: crate::messaging::messenger::RedisMessenger::stats
#[derive(Debug, Clone, Default)]
pub struct MessengerStats {
    pub messages_published: u64,
    pub messages_received: u64,
    pub messages_dispatched: u64,
    pub decode_failures: u64,
    pub listener_errors: u64,
    pub acks_sent: u64,
    pub reconnects: u64,
    pub publish_errors: u64,
    pub last_activity: Option<u64>,
}

impl MessengerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_published(&mut self) {
        self.messages_published += 1;
        self.update_last_activity();
    }

    pub fn increment_received(&mut self) {
        self.messages_received += 1;
        self.update_last_activity();
    }

    pub fn increment_dispatched(&mut self) {
        self.messages_dispatched += 1;
    }

    pub fn increment_decode_failures(&mut self) {
        self.decode_failures += 1;
    }

    pub fn increment_listener_errors(&mut self) {
        self.listener_errors += 1;
    }

    pub fn increment_acks_sent(&mut self) {
        self.acks_sent += 1;
    }

    pub fn increment_reconnects(&mut self) {
        self.reconnects += 1;
    }

    pub fn increment_publish_errors(&mut self) {
        self.publish_errors += 1;
    }

    fn update_last_activity(&mut self) {
        self.last_activity = Some(now_millis());
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
