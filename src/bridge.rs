//! Daemon-side command loop.
//!
//! Wires a [`TransportConsumer`], a [`CommandHandler`], and a
//! [`TransportPublisher`] together:
//!
//! ```text
//! envelope ─▶ read_frame + decode_command ─▶ track ─▶ handler
//!                  │ (undecodable: log, drop)            │
//!                  ▼                                      ▼
//!                                      resolve decision (mismatch → DO_NOT_ACK)
//!                                                         │
//!                         consumer.publish("decision") ◀──┤
//!                         publisher.publish(effect)    ◀──┘ per side effect
//! ```
//!
//! Commands are processed strictly one at a time; the consumer's small
//! buffer pushes back on the bus while the handler runs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::Config;
use crate::protocol::{
    decode_command, read_frame, CommandFrame, CommandTracker, DaemonDecisionFrame, Decision,
};
use crate::transport::{
    SideEffect, TransportConsumer, TransportEnvelope, TransportError, TransportPublisher,
};

/// Event name commands arrive under.
pub const COMMAND_EVENT: &str = "command";

/// Event name decisions are published under.
pub const DECISION_EVENT: &str = "decision";

/// What the handler decided for one command.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// Decision frame to send back.
    pub decision: DaemonDecisionFrame,
    /// Side effects to publish after the decision.
    pub side_effects: Vec<SideEffect>,
}

impl HandlerOutcome {
    /// Acknowledge `command_id` with no side effects.
    pub fn ack(command_id: Uuid) -> Self {
        Self {
            decision: DaemonDecisionFrame::ack(command_id),
            side_effects: Vec::new(),
        }
    }

    /// Reject `command_id`.
    pub fn reject(command_id: Uuid) -> Self {
        Self {
            decision: DaemonDecisionFrame::reject(command_id),
            side_effects: Vec::new(),
        }
    }

    /// Attach a result payload to the decision.
    pub fn with_result(mut self, result: Vec<u8>) -> Self {
        self.decision.result = result;
        self
    }

    /// Queue a side effect.
    pub fn with_side_effect(mut self, effect: SideEffect) -> Self {
        self.side_effects.push(effect);
        self
    }
}

/// Executes decoded commands.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run `command` and decide whether to acknowledge it.
    async fn handle(&self, command: &CommandFrame) -> HandlerOutcome;
}

/// Counters reported when the bridge stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Envelopes taken from the consumer.
    pub received: u64,
    /// Decisions sent as `ACK_MESSAGE`.
    pub acked: u64,
    /// Decisions sent as `DO_NOT_ACK`.
    pub rejected: u64,
    /// Envelopes dropped before reaching the handler.
    pub dropped: u64,
    /// Decisions that could not be published.
    pub decision_failures: u64,
    /// Side effects published.
    pub side_effects_published: u64,
    /// Side effects that exhausted their retries.
    pub side_effect_failures: u64,
}

/// Runs the command loop for one device.
pub struct CommandBridge {
    consumer: TransportConsumer,
    publisher: TransportPublisher,
    handler: Arc<dyn CommandHandler>,
}

impl std::fmt::Debug for CommandBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBridge")
            .field("consumer", &self.consumer)
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

impl CommandBridge {
    /// Assemble a bridge. Nothing runs until [`run`](Self::run).
    pub fn new(
        consumer: TransportConsumer,
        publisher: TransportPublisher,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            consumer,
            publisher,
            handler,
        }
    }

    /// Assemble a bridge on `bus` using the device's command and event
    /// channels and the transport settings from `config`.
    pub fn from_config(
        bus: Arc<dyn Bus>,
        config: &Config,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let consumer = TransportConsumer::new(Arc::clone(&bus), config.consumer_options());
        let publisher = TransportPublisher::new(bus, config.publisher_options());
        Self::new(consumer, publisher, handler)
    }

    /// Process commands until `cancel` fires or the consumer closes.
    ///
    /// # Errors
    ///
    /// Only setup failures: the consumer could not connect or its receiver
    /// was already taken. Per-command failures are logged and counted.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BridgeStats, TransportError> {
        self.consumer.connect(cancel).await?;
        let mut rx = self.consumer.receive()?;
        let mut tracker = CommandTracker::new();
        let mut stats = BridgeStats::default();

        log::info!("[Bridge] Listening on {}", self.consumer.channel());
        loop {
            let envelope = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            stats.received += 1;
            self.process(cancel, &envelope, &mut tracker, &mut stats)
                .await;
        }

        log::info!(
            "[Bridge] Stopped: {} received, {} acked, {} rejected, {} dropped",
            stats.received,
            stats.acked,
            stats.rejected,
            stats.dropped
        );
        Ok(stats)
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        envelope: &TransportEnvelope,
        tracker: &mut CommandTracker,
        stats: &mut BridgeStats,
    ) {
        let command = match read_frame(&envelope.payload).and_then(|(body, _)| decode_command(body))
        {
            Ok(command) => command,
            Err(e) => {
                log::warn!(
                    "[Bridge] Dropping undecodable envelope {} on {}: {e}",
                    envelope.id,
                    envelope.channel
                );
                stats.dropped += 1;
                return;
            }
        };

        if !tracker.track(&command) {
            log::warn!("[Bridge] Dropping redelivered command {}", command.command_id);
            stats.dropped += 1;
            return;
        }

        let outcome = self.handler.handle(&command).await;
        let (decision, side_effects) = match tracker.resolve(&outcome.decision) {
            Ok(elapsed) => {
                log::debug!(
                    "[Bridge] Command {} -> {} in {elapsed:?}",
                    command.command_id,
                    outcome.decision.decision
                );
                (outcome.decision, outcome.side_effects)
            }
            Err(e) => {
                log::warn!("[Bridge] Handler answered the wrong command: {e}");
                tracker.abandon(&command.command_id);
                (DaemonDecisionFrame::reject(command.command_id), Vec::new())
            }
        };

        match decision.decision {
            Decision::AckMessage => stats.acked += 1,
            Decision::DoNotAck => stats.rejected += 1,
        }
        if let Err(e) = self
            .consumer
            .publish(cancel, DECISION_EVENT, decision.encode())
            .await
        {
            log::warn!(
                "[Bridge] Failed to publish decision for {}: {e}",
                command.command_id
            );
            stats.decision_failures += 1;
        }

        for effect in &side_effects {
            match self.publisher.publish(cancel, effect).await {
                Ok(()) => stats.side_effects_published += 1,
                Err(e) => {
                    log::warn!("[Bridge] Side effect {} not published: {e}", effect.kind);
                    stats.side_effect_failures += 1;
                }
            }
        }
    }

    /// Close the consumer and publisher.
    pub async fn close(&self) {
        self.consumer.close().await;
        self.publisher.close().await;
    }
}
