use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use holt_world::ObjectId;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Maps a live object id to its interactive session.
///
/// An explicit instance passed by reference to whoever needs it; absence of a
/// connection is never an error, so `send_line` reports delivery without
/// failing.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ObjectId, UnboundedSender<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ObjectId, UnboundedSender<String>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a session to `id`, replacing any previous one, and return the
    /// receiving end of its output stream.
    pub fn attach(&self, id: &ObjectId) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        self.connections().insert(id.clone(), tx);
        rx
    }

    pub fn detach(&self, id: &ObjectId) {
        self.connections().remove(id);
    }

    pub fn is_attached(&self, id: &ObjectId) -> bool {
        self.connections().contains_key(id)
    }

    /// Best-effort write; returns whether a live session took the line.
    pub fn send_line(&self, id: &ObjectId, line: impl Into<String>) -> bool {
        let mut connections = self.connections();
        match connections.get(id) {
            Some(tx) => {
                if tx.send(line.into()).is_err() {
                    // Receiver dropped without detaching.
                    connections.remove(id);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_line_without_connection_is_a_noop() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_line(&ObjectId::new("ghost"), "boo"));
    }

    #[test]
    fn attach_send_detach_round_trip() {
        let registry = ConnectionRegistry::new();
        let id = ObjectId::new("avatar");
        let mut rx = registry.attach(&id);
        assert!(registry.send_line(&id, "hello"));
        assert_eq!(rx.try_recv().ok().as_deref(), Some("hello"));

        registry.detach(&id);
        assert!(!registry.send_line(&id, "gone"));
    }

    #[test]
    fn dropped_receiver_clears_the_entry() {
        let registry = ConnectionRegistry::new();
        let id = ObjectId::new("avatar");
        let rx = registry.attach(&id);
        drop(rx);
        assert!(!registry.send_line(&id, "anyone home"));
        assert!(!registry.is_attached(&id));
    }
}
