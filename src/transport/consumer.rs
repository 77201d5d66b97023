//! Inbound command consumer.
//!
//! Attaches to the device-scoped command channel and hands envelopes to the
//! daemon one at a time. The delivery channel has a small capacity (one by
//! default), so a slow daemon applies backpressure to the forwarding task
//! instead of letting commands pile up in memory.
//!
//! # Lifecycle
//!
//! ```text
//! new ──connect──▶ connected ──close──▶ closed
//!  │                                     ▲
//!  └──────────────close──────────────────┘
//! ```
//!
//! `close` is idempotent and safe to call while a delivery is blocked.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{TransportEnvelope, TransportError};
use crate::bus::{Bus, BusMessage, MessageData};
use crate::constants::CONSUMER_BUFFER_SIZE;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Channel to attach to.
    pub channel: String,
    /// Only deliver messages with this event name. Empty accepts all.
    pub event_name: String,
    /// Capacity of the delivery channel.
    pub buffer_size: usize,
}

impl ConsumerOptions {
    /// Options for `channel` with default filter and buffer.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            event_name: String::new(),
            buffer_size: CONSUMER_BUFFER_SIZE,
        }
    }

    /// Restrict delivery to one event name.
    pub fn with_event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = event_name.into();
        self
    }
}

#[derive(Default)]
struct ConsumerState {
    connected: bool,
    closed: bool,
    subscription_id: Option<u64>,
    receiver: Option<mpsc::Receiver<TransportEnvelope>>,
    forwarder: Option<JoinHandle<()>>,
}

/// Receives envelopes from one bus channel with at most one in flight.
pub struct TransportConsumer {
    bus: Arc<dyn Bus>,
    options: ConsumerOptions,
    state: Mutex<ConsumerState>,
    closed: CancellationToken,
}

impl std::fmt::Debug for TransportConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConsumer")
            .field("options", &self.options)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl TransportConsumer {
    /// Create a consumer. Nothing happens until [`connect`](Self::connect).
    pub fn new(bus: Arc<dyn Bus>, options: ConsumerOptions) -> Self {
        Self {
            bus,
            options,
            state: Mutex::new(ConsumerState::default()),
            closed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state.lock().expect("consumer state lock poisoned")
    }

    /// Channel this consumer is attached to.
    pub fn channel(&self) -> &str {
        &self.options.channel
    }

    /// Whether `connect` has completed and `close` has not been called.
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        state.connected && !state.closed
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Connect the bus and attach to the channel.
    ///
    /// Waits for as long as the bus takes to connect. Idempotent once
    /// connected.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] after `close`
    /// - [`TransportError::Cancelled`] if `cancel` fires first
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        {
            let state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.connected {
                return Ok(());
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            () = self.closed.cancelled() => return Err(TransportError::Closed),
            res = self.bus.connect() => res?,
        }

        let filter = Some(self.options.event_name.as_str()).filter(|e| !e.is_empty());
        let subscription = self.bus.subscribe(&self.options.channel, filter).await?;
        let subscription_id = subscription.id;

        let (tx, rx) = mpsc::channel(self.options.buffer_size.max(1));

        let mut state = self.lock();
        if state.closed || state.connected {
            // Lost a race with close() or a concurrent connect().
            let bus = Arc::clone(&self.bus);
            let channel = self.options.channel.clone();
            let already_connected = state.connected;
            drop(state);
            tokio::spawn(async move {
                let _ = bus.unsubscribe(&channel, subscription_id).await;
            });
            return if already_connected {
                Ok(())
            } else {
                Err(TransportError::Closed)
            };
        }

        let forwarder = tokio::spawn(forward(
            subscription.receiver,
            tx,
            self.closed.clone(),
            self.options.channel.clone(),
            self.options.event_name.clone(),
        ));
        state.connected = true;
        state.subscription_id = Some(subscription_id);
        state.receiver = Some(rx);
        state.forwarder = Some(forwarder);
        drop(state);

        log::info!(
            "[Consumer] Attached to {} (event filter: {:?})",
            self.options.channel,
            filter.unwrap_or("*")
        );
        Ok(())
    }

    /// Take the delivery channel.
    ///
    /// There is exactly one receiver per consumer. It yields `None` after
    /// `close`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] after `close`
    /// - [`TransportError::NotConnected`] before `connect`
    /// - [`TransportError::AlreadyReceiving`] on the second call
    pub fn receive(&self) -> Result<mpsc::Receiver<TransportEnvelope>, TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.receiver.take().ok_or(TransportError::AlreadyReceiving)
    }

    /// Publish directly on the attached channel.
    ///
    /// Used for immediate acknowledgements that should not wait on the
    /// publisher's retry loop.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        event: &str,
        payload: impl Into<MessageData>,
    ) -> Result<(), TransportError> {
        {
            let state = self.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
        }
        if event.is_empty() {
            return Err(TransportError::InvalidEvent);
        }

        let data = payload.into();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            () = self.closed.cancelled() => Err(TransportError::Closed),
            res = self.bus.publish(&self.options.channel, event, data) => Ok(res?),
        }
    }

    /// Detach from the channel and close the delivery channel.
    ///
    /// Idempotent. Any delivery blocked on a full channel is abandoned.
    pub async fn close(&self) {
        let (subscription_id, forwarder) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.receiver = None;
            (state.subscription_id.take(), state.forwarder.take())
        };
        self.closed.cancel();

        if let Some(id) = subscription_id {
            if let Err(e) = self.bus.unsubscribe(&self.options.channel, id).await {
                log::warn!("[Consumer] Unsubscribe from {} failed: {e}", self.options.channel);
            }
        }
        if let Some(handle) = forwarder {
            let _ = handle.await;
        }
        log::info!("[Consumer] Closed {}", self.options.channel);
    }
}

/// Move bus messages into the bounded delivery channel until closed.
///
/// Messages whose event name does not match a non-empty `event_name` are
/// skipped even if the bus delivered them.
async fn forward(
    mut incoming: mpsc::UnboundedReceiver<BusMessage>,
    tx: mpsc::Sender<TransportEnvelope>,
    closed: CancellationToken,
    channel: String,
    event_name: String,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            msg = incoming.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if !event_name.is_empty() && message.name != event_name {
            log::debug!(
                "[Consumer] Skipping {} event {} on {channel}",
                message.name,
                message.id
            );
            continue;
        }

        let message_id = message.id.clone();
        let envelope = match TransportEnvelope::try_from(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[Consumer] Dropping message {message_id} on {channel}: {e}");
                continue;
            }
        };

        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            res = tx.send(envelope) => {
                if res.is_err() {
                    log::debug!("[Consumer] Receiver for {channel} dropped");
                    break;
                }
            }
        }
    }
    log::debug!("[Consumer] Forwarder for {channel} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;

    fn consumer(bus: &MemoryBus) -> TransportConsumer {
        TransportConsumer::new(Arc::new(bus.clone()), ConsumerOptions::new("remote-commands:dev"))
    }

    #[tokio::test]
    async fn test_receive_before_connect() {
        let bus = MemoryBus::new();
        let consumer = consumer(&bus);
        assert!(matches!(consumer.receive(), Err(TransportError::NotConnected)));
        assert!(matches!(
            consumer.publish(&CancellationToken::new(), "ack", "x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let bus = MemoryBus::new();
        let consumer = consumer(&bus);
        let cancel = CancellationToken::new();
        consumer.connect(&cancel).await.unwrap();
        consumer.connect(&cancel).await.unwrap();
        assert_eq!(bus.subscriber_count("remote-commands:dev"), 1);
        assert!(consumer.is_connected());
    }

    #[tokio::test]
    async fn test_payload_coercion() {
        let bus = MemoryBus::connected();
        let consumer = consumer(&bus);
        consumer.connect(&CancellationToken::new()).await.unwrap();
        let mut rx = consumer.receive().unwrap();

        bus.publish("remote-commands:dev", "command", MessageData::from(vec![0xde, 0xad]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, vec![0xde, 0xad]);

        bus.publish("remote-commands:dev", "command", MessageData::from("text"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"text");

        bus.publish(
            "remote-commands:dev",
            "command",
            MessageData::from(serde_json::json!({"k": "v"})),
        )
        .await
        .unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.payload, br#"{"k":"v"}"#);
        assert_eq!(envelope.event, "command");
        assert_eq!(envelope.channel, "remote-commands:dev");
    }

    #[tokio::test]
    async fn test_at_most_one_undelivered() {
        let bus = MemoryBus::connected();
        let consumer = consumer(&bus);
        consumer.connect(&CancellationToken::new()).await.unwrap();
        let mut rx = consumer.receive().unwrap();

        for i in 0..3u8 {
            bus.publish("remote-commands:dev", "command", MessageData::from(vec![i]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One message sits in the channel; the forwarder holds the next one.
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().await.unwrap().payload, vec![0]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);
    }

    #[tokio::test]
    async fn test_event_filter() {
        let bus = MemoryBus::connected();
        let consumer = TransportConsumer::new(
            Arc::new(bus.clone()),
            ConsumerOptions::new("chan").with_event_name("command"),
        );
        consumer.connect(&CancellationToken::new()).await.unwrap();
        let mut rx = consumer.receive().unwrap();

        bus.publish("chan", "noise", MessageData::from("a")).await.unwrap();
        bus.publish("chan", "command", MessageData::from("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let bus = MemoryBus::connected();
        let consumer = consumer(&bus);
        consumer.connect(&CancellationToken::new()).await.unwrap();
        let _rx = consumer.receive().unwrap();
        assert!(matches!(consumer.receive(), Err(TransportError::AlreadyReceiving)));
    }

    #[tokio::test]
    async fn test_close_while_delivery_blocked() {
        let bus = MemoryBus::connected();
        let consumer = consumer(&bus);
        consumer.connect(&CancellationToken::new()).await.unwrap();
        let mut rx = consumer.receive().unwrap();

        for i in 0..3u8 {
            bus.publish("remote-commands:dev", "command", MessageData::from(vec![i]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        consumer.close().await;
        consumer.close().await;

        // Buffered message may still be drained, then the channel ends.
        while rx.recv().await.is_some() {}
        assert_eq!(bus.subscriber_count("remote-commands:dev"), 0);
        assert!(matches!(
            consumer.connect(&CancellationToken::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(consumer.receive(), Err(TransportError::Closed)));
        assert!(matches!(
            consumer.publish(&CancellationToken::new(), "ack", "x").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let bus = MemoryBus::new();
        let consumer = consumer(&bus);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            consumer.connect(&cancel).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_publish_passthrough() {
        let bus = MemoryBus::connected();
        let consumer = consumer(&bus);
        consumer.connect(&CancellationToken::new()).await.unwrap();
        consumer
            .publish(&CancellationToken::new(), "decision", vec![1u8, 2, 3])
            .await
            .unwrap();
        let published = bus.published_on("remote-commands:dev");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "decision");
    }

    /// Bus that ignores subscription filters and takes a while to connect.
    struct SlowUnfilteredBus {
        inner: MemoryBus,
        connect_delay: Duration,
    }

    #[async_trait::async_trait]
    impl Bus for SlowUnfilteredBus {
        async fn connect(&self) -> Result<(), crate::bus::BusError> {
            tokio::time::sleep(self.connect_delay).await;
            self.inner.connect().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn subscribe(
            &self,
            channel: &str,
            _event: Option<&str>,
        ) -> Result<crate::bus::BusSubscription, crate::bus::BusError> {
            self.inner.subscribe(channel, None).await
        }

        async fn unsubscribe(&self, channel: &str, id: u64) -> Result<(), crate::bus::BusError> {
            self.inner.unsubscribe(channel, id).await
        }

        async fn publish(
            &self,
            channel: &str,
            event: &str,
            data: MessageData,
        ) -> Result<(), crate::bus::BusError> {
            self.inner.publish(channel, event, data).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_slow_bus() {
        let bus = Arc::new(SlowUnfilteredBus {
            inner: MemoryBus::new(),
            connect_delay: Duration::from_secs(30),
        });
        let consumer =
            TransportConsumer::new(Arc::clone(&bus) as Arc<dyn Bus>, ConsumerOptions::new("chan"));
        consumer.connect(&CancellationToken::new()).await.unwrap();
        assert!(consumer.is_connected());
        assert!(bus.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancelled_while_bus_pending() {
        let bus = Arc::new(SlowUnfilteredBus {
            inner: MemoryBus::new(),
            connect_delay: Duration::from_secs(3600),
        });
        let consumer = TransportConsumer::new(bus, ConsumerOptions::new("chan"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });
        assert!(matches!(
            consumer.connect(&cancel).await,
            Err(TransportError::Cancelled)
        ));
        assert!(!consumer.is_connected());
    }

    #[tokio::test]
    async fn test_event_filter_applied_locally() {
        let bus = Arc::new(SlowUnfilteredBus {
            inner: MemoryBus::new(),
            connect_delay: Duration::ZERO,
        });
        let consumer = TransportConsumer::new(
            Arc::clone(&bus) as Arc<dyn Bus>,
            ConsumerOptions::new("chan").with_event_name("command"),
        );
        consumer.connect(&CancellationToken::new()).await.unwrap();
        let mut rx = consumer.receive().unwrap();

        bus.publish("chan", "decision", MessageData::from("a")).await.unwrap();
        bus.publish("chan", "command", MessageData::from("b")).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, "command");
        assert_eq!(envelope.payload, b"b");
        assert!(rx.try_recv().is_err());
    }
}
