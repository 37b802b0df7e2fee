use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::messaging::domain::Message;

enum Waiter {
    Ack(oneshot::Sender<()>),
    Reply(oneshot::Sender<Message>),
}

/// Correlation map for in-flight acks and replies.
///
/// Publishing an envelope that expects an ack or a reply registers a waiter
/// under the envelope id; the dispatcher completes it when the correlated
/// envelope arrives. Callers own the timeout: on expiry they remove the
/// waiter, so a late answer finds nothing and is dropped.
pub(crate) struct PendingReplies {
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_ack(&self, id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, Waiter::Ack(tx));
        rx
    }

    pub fn register_reply(&self, id: Uuid) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, Waiter::Reply(tx));
        rx
    }

    /// Complete an ack waiter. Unknown correlations are ignored: the waiter
    /// may already have timed out. An ack arriving for a reply waiter leaves
    /// it in place; the reply is still expected.
    pub fn complete_ack(&self, correlation: Uuid) {
        let mut waiters = self.waiters.lock().unwrap();
        if matches!(waiters.get(&correlation), Some(Waiter::Ack(_))) {
            if let Some(Waiter::Ack(tx)) = waiters.remove(&correlation) {
                let _ = tx.send(());
            }
        }
    }

    /// Complete a reply waiter with the received message.
    pub fn complete_reply(&self, correlation: Uuid, message: Message) {
        let waiter = self.waiters.lock().unwrap().remove(&correlation);
        if let Some(Waiter::Reply(tx)) = waiter {
            let _ = tx.send(message);
        }
    }

    /// Drop a waiter after its caller-side timeout expired.
    pub fn remove(&self, id: Uuid) {
        self.waiters.lock().unwrap().remove(&id);
    }

    /// Drop every waiter; their receivers resolve with a closed-channel
    /// error. Called on messenger close.
    pub fn clear(&self) {
        self.waiters.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}
