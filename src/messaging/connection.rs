use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::messaging::domain::{ConnectionState, MessengerStats};
use crate::messaging::registry::SubscriptionRegistry;
use crate::messaging::transport::{Frame, Transport, TransportSink, TransportStream};
use crate::shared::config::MessengerConfig;
use crate::shared::error::{MessengerError, Result};

const COMMAND_QUEUE: usize = 256;
const INBOUND_QUEUE: usize = 1024;
/// Consecutive missed pings that force a reconnect.
const MAX_MISSED_PINGS: u32 = 2;

pub(crate) enum Command {
    Publish {
        channel: String,
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the driver task that exclusively owns the transport connection.
///
/// Cloneable; all interaction goes through the command queue, so callers
/// never touch the connection itself.
#[derive(Clone)]
pub(crate) struct ConnectionManager {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawn the driver task. The returned receiver carries raw inbound
    /// frames for the dispatcher; the oneshot resolves with the outcome of
    /// the initial connect attempt.
    pub fn start(
        transport: Arc<dyn Transport>,
        registry: Arc<SubscriptionRegistry>,
        config: MessengerConfig,
        stats: Arc<RwLock<MessengerStats>>,
    ) -> (
        ConnectionManager,
        mpsc::Receiver<Frame>,
        oneshot::Receiver<Result<()>>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = Driver {
            transport,
            registry,
            config,
            stats,
            cmd_rx,
            state_tx,
            inbound_tx,
            buffered: VecDeque::new(),
        };
        tokio::spawn(driver.run(ready_tx));

        let manager = ConnectionManager { cmd_tx, state_rx };
        (manager, inbound_rx, ready_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Submit an encoded envelope and wait for the outcome. The whole round
    /// trip is bounded by `limit`.
    pub async fn publish_frame(
        &self,
        channel: String,
        bytes: Vec<u8>,
        limit: Duration,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let command = Command::Publish {
            channel,
            bytes,
            done: done_tx,
        };

        let round_trip = async {
            self.cmd_tx
                .send(command)
                .await
                .map_err(|_| MessengerError::Closed)?;
            done_rx.await.map_err(|_| MessengerError::Closed)?
        };

        match timeout(limit, round_trip).await {
            Ok(outcome) => outcome,
            Err(_) => Err(MessengerError::Publish(format!(
                "timed out after {:?}",
                limit
            ))),
        }
    }

    /// Non-blocking submit for sends that must never stall the dispatch
    /// loop (acks). The outcome is not reported back.
    pub fn try_publish_frame(&self, channel: String, bytes: Vec<u8>) -> Result<()> {
        let (done_tx, _done_rx) = oneshot::channel();
        self.cmd_tx
            .try_send(Command::Publish {
                channel,
                bytes,
                done: done_tx,
            })
            .map_err(|_| MessengerError::Publish("command queue full".to_string()))
    }

    pub async fn subscribe(&self, channel: String) -> Result<()> {
        self.cmd_tx
            .send(Command::Subscribe { channel })
            .await
            .map_err(|_| MessengerError::Closed)
    }

    pub async fn unsubscribe(&self, channel: String) -> Result<()> {
        self.cmd_tx
            .send(Command::Unsubscribe { channel })
            .await
            .map_err(|_| MessengerError::Closed)
    }

    /// Stop the driver. Unblocks any backoff sleep; idempotent.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Close { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

#[derive(PartialEq)]
enum LoopExit {
    ConnectionLost,
    Closed,
}

struct Driver {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    config: MessengerConfig,
    stats: Arc<RwLock<MessengerStats>>,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::Sender<Frame>,
    /// Publishes queued while disconnected, flushed in order on reconnect.
    buffered: VecDeque<(String, Vec<u8>)>,
}

impl Driver {
    async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        self.set_state(ConnectionState::Connecting);

        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            match self.transport.connect().await {
                Ok((sink, stream)) => {
                    attempt = 0;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    } else {
                        self.stats.write().await.increment_reconnects();
                    }

                    match self.connected(sink, stream).await {
                        LoopExit::Closed => break,
                        LoopExit::ConnectionLost => {
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(err) => {
                    // The initial attempt is surfaced to the caller; only
                    // drops after a successful connect are retried.
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(err));
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }

                    attempt += 1;
                    let delay = backoff_delay(
                        attempt,
                        self.config.reconnect.initial_delay_ms,
                        self.config.reconnect.max_delay_ms,
                    );
                    warn!(
                        "Reconnect attempt {} failed: {}; next attempt in {:?}",
                        attempt, err, delay
                    );
                    if self.wait_before_retry(delay).await == LoopExit::Closed {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        if !self.buffered.is_empty() {
            debug!(
                "Dropping {} buffered publishes on close",
                self.buffered.len()
            );
            self.buffered.clear();
        }
    }

    async fn connected(
        &mut self,
        mut sink: Box<dyn TransportSink>,
        stream: Box<dyn TransportStream>,
    ) -> LoopExit {
        // Replay the channel set derived live from the registry.
        for channel in self.registry.channels() {
            if let Err(err) = sink.subscribe(&channel).await {
                warn!("Resubscribe of channel '{}' failed: {}", channel, err);
                return LoopExit::ConnectionLost;
            }
        }

        // Flush publishes queued while disconnected, oldest first. Delivery
        // stays at-most-once: a failed flush drops the message.
        while let Some((channel, bytes)) = self.buffered.pop_front() {
            if let Err(err) = sink.publish(&channel, &bytes).await {
                warn!("Flush of buffered publish on '{}' failed: {}", channel, err);
                self.stats.write().await.increment_publish_errors();
                return LoopExit::ConnectionLost;
            }
        }

        self.set_state(ConnectionState::Connected);
        info!("Transport connected");

        let (lost_tx, mut lost_rx) = oneshot::channel::<()>();
        let reader = tokio::spawn(pump(stream, self.inbound_tx.clone(), lost_tx));

        let ping_every = Duration::from_millis(self.config.health.interval_ms.max(1));
        let ping_limit = Duration::from_millis(self.config.health.ping_timeout_ms.max(1));
        let publish_limit = Duration::from_millis(self.config.publish.timeout_ms.max(1));
        let mut ping_timer = interval_at(Instant::now() + ping_every, ping_every);
        let mut missed = 0u32;

        let exit = loop {
            tokio::select! {
                _ = &mut lost_rx => {
                    warn!("Transport connection lost");
                    break LoopExit::ConnectionLost;
                }
                command = self.cmd_rx.recv() => match command {
                    None => break LoopExit::Closed,
                    Some(Command::Publish { channel, bytes, done }) => {
                        let outcome = match timeout(publish_limit, sink.publish(&channel, &bytes)).await {
                            Ok(result) => result,
                            Err(_) => Err(MessengerError::Publish(format!(
                                "transport send timed out after {:?}",
                                publish_limit
                            ))),
                        };
                        let _ = done.send(outcome);
                    }
                    Some(Command::Subscribe { channel }) => {
                        if let Err(err) = sink.subscribe(&channel).await {
                            warn!("Subscribe to channel '{}' failed: {}", channel, err);
                            break LoopExit::ConnectionLost;
                        }
                        debug!("Subscribed to channel '{}'", channel);
                    }
                    Some(Command::Unsubscribe { channel }) => {
                        if let Err(err) = sink.unsubscribe(&channel).await {
                            warn!("Unsubscribe from channel '{}' failed: {}", channel, err);
                            break LoopExit::ConnectionLost;
                        }
                        debug!("Unsubscribed from channel '{}'", channel);
                    }
                    Some(Command::Close { done }) => {
                        // Publish the terminal state before acknowledging so
                        // a caller returning from close() observes Closed.
                        self.set_state(ConnectionState::Closed);
                        let _ = done.send(());
                        break LoopExit::Closed;
                    }
                },
                _ = ping_timer.tick() => {
                    match timeout(ping_limit, sink.ping()).await {
                        Ok(Ok(())) => missed = 0,
                        _ => {
                            missed += 1;
                            warn!("Health check ping missed ({}/{})", missed, MAX_MISSED_PINGS);
                            if missed >= MAX_MISSED_PINGS {
                                break LoopExit::ConnectionLost;
                            }
                        }
                    }
                }
            }
        };

        reader.abort();
        exit
    }

    /// Sleep out the backoff while still serving commands: publishes fail
    /// fast or get buffered, close cancels the wait.
    async fn wait_before_retry(&mut self, delay: Duration) -> LoopExit {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return LoopExit::ConnectionLost,
                command = self.cmd_rx.recv() => match command {
                    None => return LoopExit::Closed,
                    Some(command) => {
                        if !self.handle_command_disconnected(command) {
                            return LoopExit::Closed;
                        }
                    }
                }
            }
        }
    }

    /// Serve one command while disconnected. Returns false when the command
    /// was a close and the driver must stop.
    fn handle_command_disconnected(&mut self, command: Command) -> bool {
        match command {
            Command::Publish { channel, bytes, done } => {
                let capacity = self.config.publish.buffer_size;
                if capacity == 0 {
                    let _ = done.send(Err(MessengerError::NotConnected));
                } else if self.buffered.len() >= capacity {
                    let _ = done.send(Err(MessengerError::BufferFull { capacity }));
                } else {
                    self.buffered.push_back((channel, bytes));
                    let _ = done.send(Ok(()));
                }
                true
            }
            // The registry is the source of truth; the channel set is
            // replayed from it once reconnected.
            Command::Subscribe { .. } | Command::Unsubscribe { .. } => true,
            Command::Close { done } => {
                self.set_state(ConnectionState::Closed);
                let _ = done.send(());
                false
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

async fn pump(
    mut stream: Box<dyn TransportStream>,
    inbound: mpsc::Sender<Frame>,
    _lost: oneshot::Sender<()>,
) {
    while let Some(frame) = stream.next_frame().await {
        if inbound.send(frame).await.is_err() {
            break;
        }
    }
    // Dropping `_lost` here tells the driver the connection is gone.
}

/// Exponential backoff, capped at `max_ms`, with jitter drawn uniformly
/// from the upper half of the window.
fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let initial = initial_ms.max(1);
    let max = max_ms.max(initial);
    let shift = attempt.clamp(1, 16) - 1;
    let capped = initial.saturating_mul(1u64 << shift).min(max);
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
    Duration::from_millis(jittered)
}
