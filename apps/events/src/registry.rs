use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::ws::Message;
use tokio::sync::{Mutex, mpsc};

use crate::types::ServerFrame;

/// One authenticated socket tracked by the registry. The outbound half of the
/// connection is an unbounded channel pumped by the socket task; the registry
/// never touches the socket directly.
pub struct ConnectionEntry {
    id: u64,
    recipient_id: String,
    sender: mpsc::UnboundedSender<Message>,
    is_alive: AtomicBool,
}

impl ConnectionEntry {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    /// Called by the socket task when the peer answers a heartbeat.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    fn push(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Exclusive owner of the `recipient_id -> connections` mapping.
///
/// Sockets are registered only after authentication; unauthenticated sockets
/// exist transiently in their handler task and are never tracked here. A
/// recipient's entry is deleted as soon as its last connection goes away.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Vec<Arc<ConnectionEntry>>>>,
    next_connection_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub async fn register(
        &self,
        recipient_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Arc<ConnectionEntry> {
        let recipient_id = recipient_id.trim().to_ascii_lowercase();
        let entry = Arc::new(ConnectionEntry {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            recipient_id: recipient_id.clone(),
            sender,
            is_alive: AtomicBool::new(true),
        });
        let mut connections = self.connections.lock().await;
        connections
            .entry(recipient_id)
            .or_default()
            .push(entry.clone());
        entry
    }

    pub async fn deregister(&self, entry: &ConnectionEntry) {
        let mut connections = self.connections.lock().await;
        if let Some(set) = connections.get_mut(&entry.recipient_id) {
            set.retain(|tracked| tracked.id != entry.id);
            if set.is_empty() {
                connections.remove(&entry.recipient_id);
            }
        }
    }

    /// Deliver a frame to every live connection of one recipient. A recipient
    /// with no connections is a silent no-op; there is no offline queue.
    pub async fn send_to_recipient(&self, recipient_id: &str, frame: &ServerFrame) -> usize {
        let Ok(payload) = serde_json::to_string(frame) else {
            return 0;
        };
        let key = recipient_id.trim().to_ascii_lowercase();
        let connections = self.connections.lock().await;
        let Some(set) = connections.get(&key) else {
            return 0;
        };
        set.iter()
            .filter(|entry| entry.push(Message::Text(payload.clone())))
            .count()
    }

    /// Deliver a frame to every tracked connection.
    pub async fn broadcast(&self, frame: &ServerFrame) -> usize {
        let Ok(payload) = serde_json::to_string(frame) else {
            return 0;
        };
        let connections = self.connections.lock().await;
        connections
            .values()
            .flatten()
            .filter(|entry| entry.push(Message::Text(payload.clone())))
            .count()
    }

    /// Two-cycle liveness probe. A connection that never answered the ping
    /// sent by the previous sweep is terminated; every survivor is re-armed
    /// and pinged again. Returns the number of evicted connections.
    pub async fn sweep_heartbeats(&self) -> usize {
        let mut evicted = 0usize;
        let mut connections = self.connections.lock().await;
        connections.retain(|recipient_id, set| {
            set.retain(|entry| {
                if entry.is_alive.swap(false, Ordering::Relaxed) {
                    let _ = entry.push(Message::Ping(Vec::new()));
                    true
                } else {
                    tracing::info!(
                        recipient = %recipient_id,
                        connection = entry.id,
                        "terminating connection after two missed heartbeats"
                    );
                    let _ = entry.push(Message::Close(None));
                    evicted += 1;
                    false
                }
            });
            !set.is_empty()
        });
        evicted
    }

    /// (distinct recipients, total connections) for readiness reporting.
    pub async fn connection_counts(&self) -> (usize, usize) {
        let connections = self.connections.lock().await;
        let total = connections.values().map(Vec::len).sum();
        (connections.len(), total)
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::Message;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::ConnectionRegistry;
    use crate::types::{Notification, ServerFrame};

    fn notification_frame(recipient: &str) -> ServerFrame {
        ServerFrame::Notification(Notification::new(
            recipient,
            "reward",
            "Tokens earned",
            "You earned 25 tokens.",
            json!({"amount": 25.0}),
        ))
    }

    #[tokio::test]
    async fn delivery_targets_only_the_recipient_case_insensitively() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register("Customer-A", tx_a).await;
        registry.register("customer-b", tx_b).await;

        let delivered = registry
            .send_to_recipient("CUSTOMER-A", &notification_frame("customer-a"))
            .await;
        assert_eq!(delivered, 1);
        assert!(matches!(rx_a.try_recv(), Ok(Message::Text(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn sending_to_an_unknown_recipient_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let delivered = registry
            .send_to_recipient("ghost", &notification_frame("ghost"))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register("customer-a", tx_a).await;
        registry.register("customer-a", tx_b).await;

        let delivered = registry.broadcast(&ServerFrame::Connected).await;
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn deregistering_the_last_connection_drops_the_recipient() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let entry = registry.register("customer-a", tx).await;
        assert_eq!(registry.connection_counts().await, (1, 1));

        registry.deregister(&entry).await;
        assert_eq!(registry.connection_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn two_missed_heartbeat_cycles_evict_a_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("customer-a", tx).await;

        // First sweep arms the probe and pings the peer.
        assert_eq!(registry.sweep_heartbeats().await, 0);
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
        assert_eq!(registry.connection_counts().await, (1, 1));

        // No pong before the second sweep: terminated and removed.
        assert_eq!(registry.sweep_heartbeats().await, 1);
        assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
        assert_eq!(registry.connection_counts().await, (0, 0));

        let delivered = registry
            .send_to_recipient("customer-a", &notification_frame("customer-a"))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn a_pong_between_sweeps_keeps_the_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let entry = registry.register("customer-a", tx).await;

        assert_eq!(registry.sweep_heartbeats().await, 0);
        entry.mark_alive();
        assert_eq!(registry.sweep_heartbeats().await, 0);
        assert_eq!(registry.connection_counts().await, (1, 1));

        // Drain the two pings sent by the sweeps.
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
    }
}
