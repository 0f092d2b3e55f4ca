use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use ttyhub_protocol::ServerMessage;

/// Handle identifying one authenticated viewer connection.
pub type ConnectionId = u64;

/// Outbound queue depth per connection. A viewer that falls this far behind
/// starts losing messages rather than stalling the producers.
pub const OUTBOUND_QUEUE: usize = 256;

/// Fan-out registry of authenticated viewer connections.
///
/// One subscription list for all broadcast sources; per-connection delivery
/// is FIFO through that connection's mpsc channel. Sends never block: a full
/// or closed channel is logged and skipped, so one slow viewer cannot affect
/// the others.
pub struct ConnectionHub {
    senders: Mutex<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an authenticated connection; returns its handle.
    pub fn register(&self, sender: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, sender);
        debug!(connection_id = id, "connection registered");
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
        debug!(connection_id = id, "connection unregistered");
    }

    /// Deliver to one connection. Failures are logged, never propagated.
    pub fn send(&self, id: ConnectionId, msg: ServerMessage) {
        let sender = {
            let senders = self.senders.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            senders.get(&id).cloned()
        };
        let Some(sender) = sender else {
            return;
        };
        if let Err(e) = sender.try_send(msg) {
            warn!(connection_id = id, error = %e, "dropping message for viewer");
        }
    }

    /// Deliver to every registered connection.
    pub fn broadcast(&self, msg: ServerMessage) {
        let senders: Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> = {
            let map = self.senders.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            map.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        for (id, sender) in senders {
            if let Err(e) = sender.try_send(msg.clone()) {
                warn!(connection_id = id, error = %e, "dropping broadcast for viewer");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.senders.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_send_unregister_cycle() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.register(tx);
        assert_eq!(hub.connection_count(), 1);

        hub.send(id, ServerMessage::SessionListChanged);
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::SessionListChanged)
        ));

        hub.unregister(id);
        assert_eq!(hub.connection_count(), 0);
        // Send to a gone connection is a no-op.
        hub.send(id, ServerMessage::SessionListChanged);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let hub = ConnectionHub::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.register(tx1);
        hub.register(tx2);

        hub.broadcast(ServerMessage::SessionListChanged);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_queue_does_not_block_others() {
        let hub = ConnectionHub::new();
        let (tx_full, _rx_full) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(8);
        let full_id = hub.register(tx_full);
        hub.register(tx_ok);

        // Saturate the first connection's queue.
        hub.send(full_id, ServerMessage::SessionListChanged);

        hub.broadcast(ServerMessage::SessionListChanged);
        assert!(rx_ok.recv().await.is_some());
    }
}
