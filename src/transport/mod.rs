//! Bus transport for daemon commands and side effects.
//!
//! - [`consumer`] - Receives commands from a device-scoped channel, one at a time
//! - [`publisher`] - Publishes side effects and decisions with bounded retries
//! - [`side_effect`] - Events the daemon emits after executing a command

pub mod consumer;
pub mod publisher;
pub mod side_effect;

pub use consumer::{ConsumerOptions, TransportConsumer};
pub use publisher::{PublisherOptions, TransportPublisher};
pub use side_effect::{SideEffect, SideEffectKind};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::bus::{BusError, BusMessage};

/// Errors surfaced by the consumer and publisher.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation attempted before `connect`.
    #[error("transport not connected")]
    NotConnected,

    /// Operation attempted after `close`.
    #[error("transport closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Event name resolved to an empty string.
    #[error("invalid event name")]
    InvalidEvent,

    /// Channel name resolved to an empty string.
    #[error("invalid channel name")]
    InvalidChannel,

    /// The receive channel was already handed out.
    #[error("receiver already taken")]
    AlreadyReceiving,

    /// Every publish attempt failed.
    #[error("publish failed after {attempts} attempts")]
    PublishFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: BusError,
    },

    /// Payload could not be serialized.
    #[error("failed to serialize payload")]
    Serialization(#[from] serde_json::Error),

    /// Any other bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A bus message after payload coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEnvelope {
    /// Bus-assigned message id.
    pub id: String,
    /// Channel the message arrived on.
    pub channel: String,
    /// Event name.
    pub event: String,
    /// Payload normalized to bytes.
    pub payload: Vec<u8>,
    /// Time the message was handed to the consumer.
    pub received_at: DateTime<Utc>,
}

impl TryFrom<BusMessage> for TransportEnvelope {
    type Error = serde_json::Error;

    fn try_from(msg: BusMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: msg.id,
            channel: msg.channel,
            event: msg.name,
            payload: msg.data.into_bytes()?,
            received_at: Utc::now(),
        })
    }
}
