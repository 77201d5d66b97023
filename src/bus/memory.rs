//! In-process bus.
//!
//! Delivers published messages to subscribers in the same process. Used for
//! loopback wiring (daemon and client in one binary) and as the bus in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Bus, BusError, BusMessage, BusSubscription, ConnectionState, MessageData};

/// Most recent published messages kept for inspection.
pub const PUBLISHED_LOG_CAPACITY: usize = 1024;

struct Subscriber {
    id: u64,
    event: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
    published: VecDeque<BusMessage>,
}

/// Loopback [`Bus`] backed by unbounded in-memory queues.
///
/// Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MemoryBus {
    /// Create a disconnected bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that already reports connected.
    pub fn connected() -> Self {
        let bus = Self::new();
        bus.lock().state = ConnectionState::Connected;
        bus
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory bus lock poisoned")
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    /// Simulate a dropped connection. Subscriptions survive.
    pub fn drop_connection(&self) {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Closed {
            inner.state = ConnectionState::Disconnected;
        }
    }

    /// The last [`PUBLISHED_LOG_CAPACITY`] accepted messages, in publish
    /// order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.lock().published.iter().cloned().collect()
    }

    /// Messages accepted on `channel`.
    pub fn published_on(&self, channel: &str) -> Vec<BusMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().subscribers.get(channel).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn connect(&self) -> Result<(), BusError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Closed => Err(BusError::Closed),
            _ => {
                inner.state = ConnectionState::Connected;
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().state == ConnectionState::Connected
    }

    async fn subscribe(
        &self,
        channel: &str,
        event: Option<&str>,
    ) -> Result<BusSubscription, BusError> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closed {
            return Err(BusError::Closed);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, receiver) = mpsc::unbounded_channel();
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                event: event.filter(|e| !e.is_empty()).map(str::to_string),
                tx,
            });
        log::debug!("[MemoryBus] subscription {id} on {channel}");
        Ok(BusSubscription {
            id,
            channel: channel.to_string(),
            receiver,
        })
    }

    async fn unsubscribe(&self, channel: &str, subscription_id: u64) -> Result<(), BusError> {
        let mut inner = self.lock();
        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|s| s.id != subscription_id);
            if subs.is_empty() {
                inner.subscribers.remove(channel);
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        event: &str,
        data: MessageData,
    ) -> Result<(), BusError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Closed => return Err(BusError::Closed),
            ConnectionState::Connected => {}
            _ => return Err(BusError::NotConnected),
        }

        let message = BusMessage {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            name: event.to_string(),
            data,
            timestamp: Utc::now(),
        };

        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|s| !s.tx.is_closed());
            for sub in subs.iter() {
                if sub.event.as_deref().map_or(true, |e| e == event) {
                    // Receiver may have been dropped since the retain above.
                    let _ = sub.tx.send(message.clone());
                }
            }
        }
        if inner.published.len() == PUBLISHED_LOG_CAPACITY {
            inner.published.pop_front();
        }
        inner.published.push_back(message);
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.lock();
        inner.state = ConnectionState::Closed;
        inner.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let bus = MemoryBus::new();
        assert_eq!(
            bus.publish("c", "e", MessageData::from("x")).await,
            Err(BusError::NotConnected)
        );
        bus.connect().await.unwrap();
        bus.publish("c", "e", MessageData::from("x")).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_event_filter() {
        let bus = MemoryBus::connected();
        let mut all = bus.subscribe("chan", None).await.unwrap();
        let mut only_cmd = bus.subscribe("chan", Some("command")).await.unwrap();

        bus.publish("chan", "status", MessageData::from("a")).await.unwrap();
        bus.publish("chan", "command", MessageData::from("b")).await.unwrap();

        assert_eq!(all.receiver.recv().await.unwrap().name, "status");
        assert_eq!(all.receiver.recv().await.unwrap().name, "command");
        assert_eq!(only_cmd.receiver.recv().await.unwrap().name, "command");
        assert!(only_cmd.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let bus = MemoryBus::connected();
        let sub = bus.subscribe("chan", None).await.unwrap();
        assert_eq!(bus.subscriber_count("chan"), 1);
        bus.unsubscribe("chan", sub.id).await.unwrap();
        assert_eq!(bus.subscriber_count("chan"), 0);

        bus.close().await;
        assert_eq!(bus.connect().await, Err(BusError::Closed));
        assert_eq!(
            bus.publish("chan", "e", MessageData::from("x")).await,
            Err(BusError::Closed)
        );
    }

    #[tokio::test]
    async fn test_published_log_is_bounded() {
        let bus = MemoryBus::connected();
        for i in 0..PUBLISHED_LOG_CAPACITY + 5 {
            bus.publish("chan", "e", MessageData::from(i.to_string()))
                .await
                .unwrap();
        }
        let published = bus.published();
        assert_eq!(published.len(), PUBLISHED_LOG_CAPACITY);
        assert_eq!(published[0].data, MessageData::from("5"));
    }

    #[tokio::test]
    async fn test_drop_connection_keeps_subscriptions() {
        let bus = MemoryBus::connected();
        let mut sub = bus.subscribe("chan", None).await.unwrap();

        bus.drop_connection();
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        assert!(!bus.is_connected());
        assert_eq!(
            bus.publish("chan", "e", MessageData::from("lost")).await,
            Err(BusError::NotConnected)
        );

        bus.connect().await.unwrap();
        bus.publish("chan", "e", MessageData::from("back")).await.unwrap();
        let message = sub.receiver.recv().await.unwrap();
        assert_eq!(message.data, MessageData::from("back"));
        assert!(sub.receiver.try_recv().is_err());

        bus.close().await;
        bus.drop_connection();
        assert_eq!(bus.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_message_data_coercion() {
        assert_eq!(
            MessageData::from(vec![1u8, 2]).into_bytes().unwrap(),
            vec![1, 2]
        );
        assert_eq!(MessageData::from("hi").into_bytes().unwrap(), b"hi");
        let json = MessageData::from(serde_json::json!({"a": 1}));
        assert_eq!(json.into_bytes().unwrap(), br#"{"a":1}"#);
    }
}
