//! Cross-tab relay: same-process fan-out between sibling clients.
//!
//! Clients of the same endpoint + room in one process (think browser tabs on
//! one page) exchange frames directly instead of taking the server round
//! trip. Every relayed frame is tagged with the publishing client instance so
//! receivers can suppress their own echo.
//!
//! The bus is an explicit dependency: callers construct one and hand it to
//! each client. There is no process-global registry.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Default per-channel buffer (messages per lagging subscriber).
pub const DEFAULT_RELAY_CAPACITY: usize = 64;

/// One relayed wire frame.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    /// Client instance that published the frame.
    pub origin: Uuid,
    /// Encoded wire frame, shared across subscribers.
    pub bytes: Arc<Vec<u8>>,
}

struct RelayBusInner {
    channels: RwLock<HashMap<String, broadcast::Sender<RelayFrame>>>,
    capacity: usize,
}

/// Registry of relay channels, keyed by `endpoint/room`.
#[derive(Clone)]
pub struct RelayBus {
    inner: Arc<RelayBusInner>,
}

impl RelayBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RelayBusInner {
                channels: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Get or create the channel for one endpoint + room scope.
    pub async fn channel(&self, endpoint: &str, room_id: &str) -> RelayChannel {
        let key = format!("{endpoint}/{room_id}");

        // Fast path: read lock
        {
            let channels = self.inner.channels.read().await;
            if let Some(sender) = channels.get(&key) {
                return RelayChannel {
                    key,
                    sender: sender.clone(),
                };
            }
        }

        // Slow path: write lock to create
        let mut channels = self.inner.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(sender) = channels.get(&key) {
            return RelayChannel {
                key,
                sender: sender.clone(),
            };
        }

        let (sender, _) = broadcast::channel(self.inner.capacity);
        channels.insert(key.clone(), sender.clone());
        RelayChannel { key, sender }
    }

    /// Drop channels nobody subscribes to anymore.
    pub async fn prune_idle(&self) {
        let mut channels = self.inner.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }
}

impl Default for RelayBus {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}

/// Handle on one relay scope.
#[derive(Clone)]
pub struct RelayChannel {
    key: String,
    sender: broadcast::Sender<RelayFrame>,
}

impl RelayChannel {
    /// The `endpoint/room` key this channel serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish a frame to every subscriber (including the publisher's own
    /// receiver; echo suppression is the receiver's job via `origin`).
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        self.sender
            .send(RelayFrame { origin, bytes })
            .unwrap_or(0)
    }

    /// Subscribe to this scope.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayFrame> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_scope_shares_channel() {
        let bus = RelayBus::default();
        let a = bus.channel("wss://host", "room-1").await;
        let b = bus.channel("wss://host", "room-1").await;

        let mut rx = b.subscribe();
        let origin = Uuid::new_v4();
        let reached = a.publish(origin, Arc::new(vec![1, 2, 3]));
        assert_eq!(reached, 1);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, origin);
        assert_eq!(*frame.bytes, vec![1, 2, 3]);
        assert_eq!(bus.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let bus = RelayBus::default();
        let room1 = bus.channel("wss://host", "room-1").await;
        let room2 = bus.channel("wss://host", "room-2").await;
        let other_host = bus.channel("wss://other", "room-1").await;

        let mut rx2 = room2.subscribe();
        let mut rx_other = other_host.subscribe();
        room1.publish(Uuid::new_v4(), Arc::new(vec![9]));

        assert!(rx2.try_recv().is_err());
        assert!(rx_other.try_recv().is_err());
        assert_eq!(bus.channel_count().await, 3);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = RelayBus::default();
        let channel = bus.channel("wss://host", "lonely").await;
        assert_eq!(channel.publish(Uuid::new_v4(), Arc::new(vec![1])), 0);
    }

    #[tokio::test]
    async fn test_prune_idle_channels() {
        let bus = RelayBus::default();
        let busy = bus.channel("wss://host", "busy").await;
        let _rx = busy.subscribe();
        let _idle = bus.channel("wss://host", "idle").await;

        assert_eq!(bus.channel_count().await, 2);
        bus.prune_idle().await;
        assert_eq!(bus.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = RelayBus::new(4);
        let channel = bus.channel("wss://host", "room").await;
        let mut rx = channel.subscribe();

        let origin = Uuid::new_v4();
        for i in 0..6u8 {
            channel.publish(origin, Arc::new(vec![i]));
        }

        // Oldest frames are dropped, not delivered out of order
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let next = rx.recv().await.unwrap();
        assert_eq!(*next.bytes, vec![2]);
    }
}
