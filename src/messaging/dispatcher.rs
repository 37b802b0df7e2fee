use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::messaging::callback::PendingReplies;
use crate::messaging::codec::Codec;
use crate::messaging::connection::ConnectionManager;
use crate::messaging::domain::{ConnectionState, Envelope, Message, MessageKind, MessengerStats};
use crate::messaging::registry::SubscriptionRegistry;
use crate::messaging::transport::Frame;

/// Consumes raw inbound frames and delivers them to local listeners.
///
/// One dispatcher task per messenger: frames are handled strictly in
/// arrival order, and the listeners for one message run sequentially, so
/// per-channel delivery order matches transport order. Failures are
/// contained per listener and per frame.
pub(crate) struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    codec: Arc<dyn Codec>,
    pending: Arc<PendingReplies>,
    manager: ConnectionManager,
    instance_id: String,
    stats: Arc<RwLock<MessengerStats>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        codec: Arc<dyn Codec>,
        pending: Arc<PendingReplies>,
        manager: ConnectionManager,
        instance_id: String,
        stats: Arc<RwLock<MessengerStats>>,
    ) -> Self {
        Self {
            registry,
            codec,
            pending,
            manager,
            instance_id,
            stats,
        }
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Frame>) {
        info!("Dispatch loop started");
        let mut state_rx = self.manager.state_receiver();
        loop {
            tokio::select! {
                // Checked first so close() stops delivery even when frames
                // are still queued.
                biased;
                _ = async { let _ = state_rx.wait_for(|state| *state == ConnectionState::Closed).await; } => break,
                maybe_frame = inbound.recv() => match maybe_frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
            }
        }
        debug!("Dispatch loop stopped");
    }

    async fn handle_frame(&self, frame: Frame) {
        let envelope = match self.codec.decode(&frame.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    "Dropping undecodable frame on channel '{}': {}",
                    frame.channel, err
                );
                self.stats.write().await.increment_decode_failures();
                return;
            }
        };

        self.stats.write().await.increment_received();

        if !envelope.addressed_to(&self.instance_id) {
            debug!(
                "Ignoring message {} addressed to {:?}",
                envelope.id, envelope.receivers
            );
            return;
        }

        match envelope.kind {
            MessageKind::Ack => {
                if let Some(correlation) = envelope.correlation {
                    self.pending.complete_ack(correlation);
                }
            }
            MessageKind::Reply => {
                if let Some(correlation) = envelope.correlation {
                    self.pending.complete_reply(correlation, Message::new(envelope));
                }
            }
            MessageKind::Event => {
                // Loopback deliveries are dispatched like any other, but an
                // instance never acknowledges its own publishes; acks attest
                // receipt somewhere else.
                if envelope.requires_ack && envelope.sender != self.instance_id {
                    self.send_ack(&envelope).await;
                }
                self.dispatch(Message::new(envelope)).await;
            }
        }
    }

    /// Acks are best-effort and submitted without waiting, so a slow or
    /// saturated driver can never stall the dispatch loop.
    async fn send_ack(&self, origin: &Envelope) {
        let ack = Envelope::ack(origin, &self.instance_id);
        match self.codec.encode(&ack) {
            Ok(bytes) => match self.manager.try_publish_frame(ack.channel.clone(), bytes) {
                Ok(()) => self.stats.write().await.increment_acks_sent(),
                Err(err) => warn!("Ack for message {} not sent: {}", origin.id, err),
            },
            Err(err) => warn!("Ack for message {} not encoded: {}", origin.id, err),
        }
    }

    async fn dispatch(&self, message: Message) {
        let listeners = self.registry.listeners_for(message.channel());
        if listeners.is_empty() {
            debug!("No listeners for channel '{}'", message.channel());
            return;
        }

        for listener in listeners {
            match listener.on_message(&message).await {
                Ok(()) => self.stats.write().await.increment_dispatched(),
                Err(error) => {
                    warn!(
                        "Listener failed on channel '{}': {:#}",
                        message.channel(),
                        error
                    );
                    self.stats.write().await.increment_listener_errors();
                }
            }
        }
    }
}
