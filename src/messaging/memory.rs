use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messaging::transport::{Frame, Transport, TransportSink, TransportStream};
use crate::shared::error::{MessengerError, Result};

/// In-process pub/sub broker implementing the transport seam.
///
/// Every connection made through a clone of the same `MemoryTransport`
/// shares one broker, so independent messenger instances can talk to each
/// other without a network. Fault injection (failed connects, failed pings,
/// dropped connections) drives the connection manager's recovery paths in
/// tests.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    peers: HashMap<u64, Peer>,
    fail_connects: usize,
    fail_pings: usize,
}

struct Peer {
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, count: usize) {
        self.broker.state.lock().unwrap().fail_connects = count;
    }

    /// Make the next `count` pings fail.
    pub fn fail_pings(&self, count: usize) {
        self.broker.state.lock().unwrap().fail_pings = count;
    }

    /// Sever every live connection; their streams end as a real connection
    /// drop would.
    pub fn drop_connections(&self) {
        self.broker.state.lock().unwrap().peers.clear();
    }

    /// Sever only the `count` oldest connections, leaving later ones alive.
    pub fn drop_oldest(&self, count: usize) {
        let mut state = self.broker.state.lock().unwrap();
        let mut ids: Vec<u64> = state.peers.keys().copied().collect();
        ids.sort_unstable();
        for id in ids.into_iter().take(count) {
            state.peers.remove(&id);
        }
    }

    /// Number of live connections subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.broker
            .state
            .lock()
            .unwrap()
            .peers
            .values()
            .filter(|peer| peer.subscriptions.contains(channel))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.broker.state.lock().unwrap().peers.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let mut state = self.broker.state.lock().unwrap();

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(MessengerError::Transport(
                "injected connect failure".to_string(),
            ));
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.peers.insert(
            id,
            Peer {
                subscriptions: HashSet::new(),
                tx,
            },
        );

        Ok((
            Box::new(MemorySink {
                id,
                broker: Arc::clone(&self.broker),
            }),
            Box::new(MemoryStream { rx }),
        ))
    }
}

struct MemorySink {
    id: u64,
    broker: Arc<Broker>,
}

impl MemorySink {
    fn with_own_peer<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> Result<R> {
        let mut state = self.broker.state.lock().unwrap();
        match state.peers.get_mut(&self.id) {
            Some(peer) => Ok(f(peer)),
            None => Err(MessengerError::Transport("connection closed".to_string())),
        }
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.broker.state.lock().unwrap();
        if !state.peers.contains_key(&self.id) {
            return Err(MessengerError::Transport("connection closed".to_string()));
        }

        // Fan out under the lock so every subscriber observes publishes in
        // the same order; dead receivers are pruned as they are found.
        let frame = Frame {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        state.peers.retain(|_, peer| {
            if peer.subscriptions.contains(channel) {
                peer.tx.send(frame.clone()).is_ok()
            } else {
                true
            }
        });
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.with_own_peer(|peer| {
            peer.subscriptions.insert(channel);
        })
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.with_own_peer(|peer| {
            peer.subscriptions.remove(channel);
        })
    }

    async fn ping(&mut self) -> Result<()> {
        {
            let mut state = self.broker.state.lock().unwrap();
            if state.fail_pings > 0 {
                state.fail_pings -= 1;
                return Err(MessengerError::Transport("injected ping failure".to_string()));
            }
        }
        self.with_own_peer(|_peer| ())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        // A discarded sink means the connection is gone; release its peer so
        // subscriber counts only reflect live connections.
        self.broker.state.lock().unwrap().peers.remove(&self.id);
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}
