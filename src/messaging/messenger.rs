use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::info;

use crate::messaging::callback::PendingReplies;
use crate::messaging::codec::{Codec, JsonCodec};
use crate::messaging::connection::ConnectionManager;
use crate::messaging::dispatcher::Dispatcher;
use crate::messaging::domain::{
    ConnectionState, Envelope, Listener, Message, MessengerStats,
};
use crate::messaging::publisher::Publisher;
use crate::messaging::redis::RedisTransport;
use crate::messaging::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::messaging::transport::Transport;
use crate::shared::config::MessengerConfig;
use crate::shared::error::{MessengerError, Result};

/// Channel-based messaging over a pub/sub backend.
///
/// One messenger owns one connection manager, one subscription registry and
/// one dispatch loop. Instances are independent: several messengers in a
/// process, each with its own configuration, do not interfere. The handle
/// is cheap to clone and all methods take `&self`.
#[derive(Clone)]
pub struct RedisMessenger {
    inner: Arc<Inner>,
}

struct Inner {
    config: MessengerConfig,
    registry: Arc<SubscriptionRegistry>,
    manager: ConnectionManager,
    publisher: Publisher,
    pending: Arc<PendingReplies>,
    stats: Arc<RwLock<MessengerStats>>,
    closed: AtomicBool,
}

impl RedisMessenger {
    /// Connect to Redis with the given configuration.
    ///
    /// The initial connection attempt is made eagerly and its failure is
    /// returned here; once connected, drops are recovered internally with
    /// backoff and resubscription.
    pub async fn connect(config: MessengerConfig) -> Result<Self> {
        let transport = Arc::new(RedisTransport::new(config.redis.clone()));
        Self::with_transport(config, transport).await
    }

    /// Same lifecycle as [`connect`], but over any transport. This is the
    /// seam for running against the in-memory broker.
    ///
    /// [`connect`]: RedisMessenger::connect
    pub async fn with_transport(
        config: MessengerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate().map_err(MessengerError::Config)?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(RwLock::new(MessengerStats::new()));
        let pending = Arc::new(PendingReplies::new());
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::new());

        let (manager, inbound_rx, ready) = ConnectionManager::start(
            transport,
            Arc::clone(&registry),
            config.clone(),
            Arc::clone(&stats),
        );
        ready.await.map_err(|_| MessengerError::Closed)??;

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&codec),
            Arc::clone(&pending),
            manager.clone(),
            config.instance_id.clone(),
            Arc::clone(&stats),
        );
        tokio::spawn(dispatcher.run(inbound_rx));

        let publisher = Publisher::new(
            codec,
            manager.clone(),
            Arc::clone(&stats),
            Duration::from_millis(config.publish.timeout_ms.max(1)),
        );

        info!("Messenger '{}' started", config.instance_id);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                manager,
                publisher,
                pending,
                stats,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// Wait until the connection reaches `target`, bounded by `limit`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> Result<()> {
        let mut state_rx = self.inner.manager.state_receiver();
        let outcome = timeout(limit, state_rx.wait_for(|state| *state == target)).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MessengerError::Closed),
            Err(_) => Err(MessengerError::Timeout(limit)),
        }
    }

    /// Publish `payload` to every instance listening on `channel`.
    pub async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> Result<()> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let envelope = Envelope::broadcast(self.instance_id(), channel, to_value(payload)?);
        self.inner.publisher.send(envelope).await
    }

    /// Publish `payload` on `channel`, addressed to specific instances only.
    pub async fn publish_to<T: Serialize>(
        &self,
        channel: &str,
        receivers: &[&str],
        payload: &T,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let receivers = receivers.iter().map(|r| r.to_string()).collect();
        let envelope = Envelope::event(self.instance_id(), channel, receivers, to_value(payload)?);
        self.inner.publisher.send(envelope).await
    }

    /// Publish and wait for the first delivery acknowledgement from another
    /// instance, bounded by `limit`.
    ///
    /// Acks travel on the same channel, so the caller must itself hold a
    /// subscription to `channel` to receive them. Loopback delivery of the
    /// published message never counts as an ack.
    pub async fn publish_acked<T: Serialize>(
        &self,
        channel: &str,
        payload: &T,
        limit: Duration,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let mut envelope = Envelope::broadcast(self.instance_id(), channel, to_value(payload)?);
        envelope.requires_ack = true;
        let id = envelope.id;

        let ack_rx = self.inner.pending.register_ack(id);
        if let Err(err) = self.inner.publisher.send(envelope).await {
            self.inner.pending.remove(id);
            return Err(err);
        }

        match timeout(limit, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MessengerError::Closed),
            Err(_) => {
                self.inner.pending.remove(id);
                Err(MessengerError::Timeout(limit))
            }
        }
    }

    /// Publish a request and wait for a correlated reply from a listener on
    /// another instance, bounded by `limit`.
    ///
    /// Replies travel on the same channel, so the caller must itself hold a
    /// subscription to `channel` to receive them.
    pub async fn request<T: Serialize>(
        &self,
        channel: &str,
        payload: &T,
        limit: Duration,
    ) -> Result<Message> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let mut envelope = Envelope::broadcast(self.instance_id(), channel, to_value(payload)?);
        envelope.expects_reply = true;
        let id = envelope.id;

        let reply_rx = self.inner.pending.register_reply(id);
        if let Err(err) = self.inner.publisher.send(envelope).await {
            self.inner.pending.remove(id);
            return Err(err);
        }

        match timeout(limit, reply_rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(MessengerError::Closed),
            Err(_) => {
                self.inner.pending.remove(id);
                Err(MessengerError::Timeout(limit))
            }
        }
    }

    /// Answer a received message; the reply is addressed to its sender and
    /// correlated to its id.
    pub async fn reply<T: Serialize>(&self, origin: &Message, payload: &T) -> Result<()> {
        self.ensure_open()?;

        let envelope = Envelope::reply(&origin.envelope, self.instance_id(), to_value(payload)?);
        self.inner.publisher.send(envelope).await
    }

    /// Register a listener. The first listener on a channel triggers the
    /// transport subscribe; while disconnected the registration is recorded
    /// immediately and replayed on reconnect.
    pub async fn subscribe(
        &self,
        channel: &str,
        listener: Arc<dyn Listener>,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let (handle, first) = self.inner.registry.register(channel, listener);
        if first {
            self.inner.manager.subscribe(channel.to_string()).await?;
        }
        Ok(handle)
    }

    /// Remove a registration. Dropping the last listener of a channel
    /// triggers the transport unsubscribe.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.ensure_open()?;

        if self.inner.registry.unregister(handle) {
            self.inner.manager.unsubscribe(handle.channel.clone()).await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> MessengerStats {
        self.inner.stats.read().await.clone()
    }

    /// Shut down: stops the health check and the receive loop, releases the
    /// transport, drops pending waiters. Terminal and idempotent; every
    /// later operation fails with `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.manager.close().await;
        self.inner.pending.clear();
        info!("Messenger '{}' closed", self.instance_id());
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(MessengerError::Closed)
        } else {
            Ok(())
        }
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        Err(MessengerError::InvalidChannel(channel.to_string()))
    } else {
        Ok(())
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<serde_json::Value> {
    serde_json::to_value(payload).map_err(MessengerError::Codec)
}
