//! Outbound side-effect publisher.
//!
//! Publishes each message with a bounded number of attempts. Every attempt
//! gets its own timeout and attempts are separated by a fixed delay. A bus
//! that reports itself closed aborts the loop immediately; anything else
//! (including not-connected) is retried.
//!
//! Delivery is at-least-once: a timed-out attempt may still have reached
//! the bus, so subscribers must tolerate duplicates.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{SideEffect, TransportError};
use crate::bus::{Bus, BusError, MessageData};
use crate::constants::{PUBLISH_MAX_RETRIES, PUBLISH_RETRY_DELAY, PUBLISH_TIMEOUT};

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Default channel for side effects without an override.
    pub channel: String,
    /// Timeout for each attempt.
    pub publish_timeout: Duration,
    /// Attempts per message (at least one is always made).
    pub max_retries: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl PublisherOptions {
    /// Default retry policy publishing to `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            publish_timeout: PUBLISH_TIMEOUT,
            max_retries: PUBLISH_MAX_RETRIES,
            retry_delay: PUBLISH_RETRY_DELAY,
        }
    }
}

/// Publishes side effects and JSON events with retries.
pub struct TransportPublisher {
    bus: Arc<dyn Bus>,
    options: PublisherOptions,
    closed: CancellationToken,
}

impl std::fmt::Debug for TransportPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPublisher")
            .field("options", &self.options)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl TransportPublisher {
    /// Create a publisher over `bus`.
    pub fn new(bus: Arc<dyn Bus>, options: PublisherOptions) -> Self {
        Self {
            bus,
            options,
            closed: CancellationToken::new(),
        }
    }

    /// Default channel.
    pub fn channel(&self) -> &str {
        &self.options.channel
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Publish one side effect.
    ///
    /// The event name is the side effect's override or its kind; the channel
    /// is its override or the default channel.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        effect: &SideEffect,
    ) -> Result<(), TransportError> {
        let channel = effect
            .channel_override()
            .unwrap_or(self.options.channel.as_str());
        let payload = effect.wire_payload()?;
        self.publish_with_retry(cancel, channel, effect.event_name(), payload.into())
            .await
    }

    /// Serialize `payload` as JSON and publish it on the default channel.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        event: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        let channel = self.options.channel.clone();
        self.publish_json_to_channel(cancel, &channel, event, payload)
            .await
    }

    /// Serialize `payload` as JSON and publish it on `channel`.
    pub async fn publish_json_to_channel<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        channel: &str,
        event: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish_with_retry(cancel, channel, event, bytes.into())
            .await
    }

    async fn publish_with_retry(
        &self,
        cancel: &CancellationToken,
        channel: &str,
        event: &str,
        data: MessageData,
    ) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if event.is_empty() {
            return Err(TransportError::InvalidEvent);
        }
        if channel.is_empty() {
            return Err(TransportError::InvalidChannel);
        }

        let attempts = self.options.max_retries.max(1);
        let mut last_error = BusError::NotConnected;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(TransportError::Cancelled),
                    () = self.closed.cancelled() => return Err(TransportError::Closed),
                    () = tokio::time::sleep(self.options.retry_delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = self.closed.cancelled() => return Err(TransportError::Closed),
                res = tokio::time::timeout(
                    self.options.publish_timeout,
                    self.bus.publish(channel, event, data.clone()),
                ) => res,
            };

            match outcome {
                Ok(Ok(())) => {
                    if attempt > 1 {
                        log::info!(
                            "[Publisher] Published {event} to {channel} on attempt {attempt}/{attempts}"
                        );
                    }
                    return Ok(());
                }
                Ok(Err(BusError::Closed)) => return Err(TransportError::Closed),
                Ok(Err(e)) => {
                    log::warn!(
                        "[Publisher] Attempt {attempt}/{attempts} for {event} on {channel} failed: {e}"
                    );
                    last_error = e;
                }
                Err(_elapsed) => {
                    log::warn!(
                        "[Publisher] Attempt {attempt}/{attempts} for {event} on {channel} timed out after {:?}",
                        self.options.publish_timeout
                    );
                    last_error = BusError::Timeout(self.options.publish_timeout);
                }
            }
        }

        log::error!("[Publisher] Giving up on {event} to {channel}: {last_error}");
        Err(TransportError::PublishFailed {
            attempts,
            source: last_error,
        })
    }

    /// Stop publishing and close the bus.
    ///
    /// Wakes any publish waiting between attempts. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.bus.close().await;
        log::info!("[Publisher] Closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, BusSubscription, MemoryBus};
    use crate::transport::SideEffectKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Bus that fails a fixed number of publishes before delegating.
    struct FlakyBus {
        inner: MemoryBus,
        failures_left: AtomicU32,
        failure: BusError,
        attempts: AtomicU32,
        hang: bool,
        seen: Mutex<Vec<String>>,
    }

    impl FlakyBus {
        fn new(failures: u32, failure: BusError) -> Self {
            Self {
                inner: MemoryBus::connected(),
                failures_left: AtomicU32::new(failures),
                failure,
                attempts: AtomicU32::new(0),
                hang: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(0, BusError::NotConnected)
            }
        }
    }

    #[async_trait]
    impl Bus for FlakyBus {
        async fn connect(&self) -> Result<(), BusError> {
            self.inner.connect().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn subscribe(
            &self,
            channel: &str,
            event: Option<&str>,
        ) -> Result<BusSubscription, BusError> {
            self.inner.subscribe(channel, event).await
        }

        async fn unsubscribe(&self, channel: &str, id: u64) -> Result<(), BusError> {
            self.inner.unsubscribe(channel, id).await
        }

        async fn publish(
            &self,
            channel: &str,
            event: &str,
            data: MessageData,
        ) -> Result<(), BusError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(channel.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.failure.clone());
            }
            self.inner.publish(channel, event, data).await
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    fn publisher(bus: Arc<FlakyBus>) -> TransportPublisher {
        TransportPublisher::new(bus, PublisherOptions::new("device-events:dev"))
    }

    fn delivered(bus: &FlakyBus) -> Vec<BusMessage> {
        bus.inner.published()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let bus = Arc::new(FlakyBus::new(2, BusError::Other("boom".into())));
        let publisher = publisher(Arc::clone(&bus));
        let effect = SideEffect::new(SideEffectKind::SessionCreated).with_session("s1");

        publisher
            .publish(&CancellationToken::new(), &effect)
            .await
            .unwrap();

        assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
        let messages = delivered(&bus);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name, "session_created");
        assert_eq!(messages[0].channel, "device-events:dev");
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_is_retried() {
        let bus = Arc::new(FlakyBus::new(1, BusError::NotConnected));
        let publisher = publisher(Arc::clone(&bus));
        publisher
            .publish_json(&CancellationToken::new(), "status", &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_preserve_cause() {
        let bus = Arc::new(FlakyBus::new(10, BusError::Other("rate limited".into())));
        let publisher = publisher(Arc::clone(&bus));

        let err = publisher
            .publish_json(&CancellationToken::new(), "status", &1)
            .await
            .unwrap_err();

        match err {
            TransportError::PublishFailed { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source, BusError::Other("rate limited".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
        assert!(delivered(&bus).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_closed_aborts_immediately() {
        let bus = Arc::new(FlakyBus::new(5, BusError::Closed));
        let publisher = publisher(Arc::clone(&bus));
        let err = publisher
            .publish_json(&CancellationToken::new(), "status", &1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let bus = Arc::new(FlakyBus::hanging());
        let publisher = publisher(Arc::clone(&bus));
        let err = publisher
            .publish_json(&CancellationToken::new(), "status", &1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::PublishFailed {
                source: BusError::Timeout(_),
                ..
            }
        ));
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_channel_override_and_validation() {
        let bus = Arc::new(FlakyBus::new(0, BusError::NotConnected));
        let publisher = publisher(Arc::clone(&bus));
        let cancel = CancellationToken::new();

        let effect = SideEffect::new(SideEffectKind::MessageAppended).with_channel("other");
        publisher.publish(&cancel, &effect).await.unwrap();
        assert_eq!(bus.seen.lock().unwrap().as_slice(), ["other".to_string()]);

        assert!(matches!(
            publisher.publish_json(&cancel, "", &1).await,
            Err(TransportError::InvalidEvent)
        ));
        assert!(matches!(
            publisher.publish_json_to_channel(&cancel, "", "e", &1).await,
            Err(TransportError::InvalidChannel)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_retry_delay() {
        let bus = Arc::new(FlakyBus::new(10, BusError::NotConnected));
        let publisher = Arc::new(TransportPublisher::new(
            Arc::clone(&bus) as Arc<dyn Bus>,
            PublisherOptions {
                retry_delay: Duration::from_secs(3600),
                ..PublisherOptions::new("device-events:dev")
            },
        ));

        let task = {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move {
                publisher
                    .publish_json(&CancellationToken::new(), "status", &1)
                    .await
            })
        };
        tokio::task::yield_now().await;
        publisher.close().await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(publisher.is_closed());
        assert!(matches!(
            publisher.publish_json(&CancellationToken::new(), "status", &1).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts() {
        let bus = Arc::new(FlakyBus::hanging());
        let publisher = publisher(Arc::clone(&bus));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            publisher.publish_json(&cancel, "status", &1).await,
            Err(TransportError::Cancelled)
        ));
    }
}
