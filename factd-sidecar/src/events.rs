//! Server-wide event fan-out.
//!
//! Every connection subscribes once; an event published here is pushed to
//! all of them. Slow subscribers lag and drop events instead of holding up
//! publishers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use factd_core::{TxId, Value};

use crate::protocol::Push;

/// Something that happened to a graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    GraphOpened { name: String, created: bool },
    GraphRemoved { name: String },
    TxApplied { name: String, tx: TxId, datoms: usize },
    SyncApplied { name: String, tx: TxId, datoms: usize, full: bool },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::GraphOpened { .. } => "graph-opened",
            Event::GraphRemoved { .. } => "graph-removed",
            Event::TxApplied { .. } => "tx-applied",
            Event::SyncApplied { .. } => "sync-applied",
        }
    }

    pub fn to_push(&self) -> Push {
        let mut payload = BTreeMap::new();
        match self {
            Event::GraphOpened { name, created } => {
                payload.insert("graph".to_string(), Value::str(name.as_str()));
                payload.insert("created".to_string(), Value::Bool(*created));
            }
            Event::GraphRemoved { name } => {
                payload.insert("graph".to_string(), Value::str(name.as_str()));
            }
            Event::TxApplied { name, tx, datoms } => {
                payload.insert("graph".to_string(), Value::str(name.as_str()));
                payload.insert("tx".to_string(), Value::Long(*tx));
                payload.insert("datoms".to_string(), Value::Long(*datoms as i64));
            }
            Event::SyncApplied {
                name,
                tx,
                datoms,
                full,
            } => {
                payload.insert("graph".to_string(), Value::str(name.as_str()));
                payload.insert("tx".to_string(), Value::Long(*tx));
                payload.insert("datoms".to_string(), Value::Long(*datoms as i64));
                payload.insert("full".to_string(), Value::Bool(*full));
            }
        }
        Push {
            event: self.name().to_string(),
            payload: Value::Map(payload),
        }
    }
}

/// Statistics for monitoring the event bus.
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub published: u64,
    pub undelivered: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`EventBus::stats`].
struct AtomicEventStats {
    published: AtomicU64,
    undelivered: AtomicU64,
}

/// Broadcast channel of pushes shared by all connections.
pub struct EventBus {
    sender: broadcast::Sender<Arc<Push>>,
    capacity: usize,
    stats: AtomicEventStats,
}

impl EventBus {
    /// `capacity` is how many events each subscriber may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicEventStats {
                published: AtomicU64::new(0),
                undelivered: AtomicU64::new(0),
            },
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        log::debug!("Event {event:?}");
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(event.to_push())) {
            Ok(count) => count,
            Err(_) => {
                self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Push>> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.stats.published.load(Ordering::Relaxed),
            undelivered: self.stats.undelivered.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fans_out() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let delivered = bus.publish(Event::GraphRemoved { name: "g".into() });
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap().event, "graph-removed");
        assert_eq!(b.recv().await.unwrap().event, "graph-removed");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(Event::GraphRemoved { name: "g".into() }), 0);
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.undelivered, 1);
        assert_eq!(stats.subscribers, 0);
    }

    #[test]
    fn test_sync_push_payload() {
        let push = Event::SyncApplied {
            name: "notes".into(),
            tx: 7,
            datoms: 2000,
            full: true,
        }
        .to_push();
        assert_eq!(push.event, "sync-applied");
        let map = push.payload.as_map().unwrap();
        assert_eq!(map["graph"], Value::str("notes"));
        assert_eq!(map["datoms"], Value::Long(2000));
        assert_eq!(map["full"], Value::Bool(true));
    }
}
