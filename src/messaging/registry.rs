use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::messaging::domain::Listener;

/// Proof of registration; required to unregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) channel: String,
    pub(crate) id: u64,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct ListenerEntry {
    id: u64,
    listener: Arc<dyn Listener>,
}

#[derive(Default)]
struct ChannelListeners {
    entries: RwLock<Vec<ListenerEntry>>,
}

/// Thread-safe mapping from channel name to registered listeners.
///
/// Invariant: a channel key exists iff at least one listener is registered
/// to it. Dispatch reads a snapshot of the listener set; the outer map lock
/// is only held to locate, insert or remove a channel entry, so mutation on
/// one channel never serializes dispatch on another.
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Arc<ChannelListeners>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener. The boolean is true when this is the first
    /// listener on the channel, i.e. a transport subscribe is due.
    pub fn register(
        &self,
        channel: &str,
        listener: Arc<dyn Listener>,
    ) -> (SubscriptionHandle, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.channels.write().unwrap();
        let slot = channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelListeners::default()));

        let mut entries = slot.entries.write().unwrap();
        let first = entries.is_empty();
        entries.push(ListenerEntry { id, listener });

        (
            SubscriptionHandle {
                channel: channel.to_string(),
                id,
            },
            first,
        )
    }

    /// Remove a registration. The boolean is true when the channel has no
    /// listeners left and was dropped from the registry, i.e. a transport
    /// unsubscribe is due. Unknown handles are a no-op.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        let mut channels = self.channels.write().unwrap();
        let Some(slot) = channels.get(&handle.channel) else {
            return false;
        };

        let emptied = {
            let mut entries = slot.entries.write().unwrap();
            entries.retain(|entry| entry.id != handle.id);
            entries.is_empty()
        };

        if emptied {
            channels.remove(&handle.channel);
        }
        emptied
    }

    /// Snapshot of the listeners currently registered on `channel`.
    ///
    /// The snapshot is independent of later mutation: a dispatch walking it
    /// never observes a half-mutated set and never blocks registration.
    pub fn listeners_for(&self, channel: &str) -> Vec<Arc<dyn Listener>> {
        let slot = {
            let channels = self.channels.read().unwrap();
            match channels.get(channel) {
                Some(slot) => Arc::clone(slot),
                None => return Vec::new(),
            }
        };

        let entries = slot.entries.read().unwrap();
        entries
            .iter()
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    /// Channels with at least one registered listener. This is the set the
    /// connection manager replays after a reconnect.
    pub fn channels(&self) -> Vec<String> {
        self.channels.read().unwrap().keys().cloned().collect()
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        let channels = self.channels.read().unwrap();
        channels
            .get(channel)
            .map(|slot| slot.entries.read().unwrap().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().unwrap().is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
