//! Pub/sub bus capability.
//!
//! The relay between devices is an untrusted pub/sub service. This module
//! defines the narrow surface the transport layer needs from it, so the
//! consumer and publisher never depend on a particular vendor SDK.
//!
//! # Architecture
//!
//! ```text
//! Bus (trait)
//!     │
//!     ├── MemoryBus (in-process, loopback and tests)
//!     │
//!     └── <vendor adapter> (implemented by the embedding application)
//! ```
//!
//! Channel names are opaque strings. Delivery guarantees are whatever the
//! underlying service provides; callers tolerate duplicates.

pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Connection state reported by a bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Closed permanently.
    Closed,
}

/// Message body as delivered by the bus.
///
/// Vendor SDKs hand back raw bytes, strings, or already-decoded JSON
/// depending on how the publisher encoded the message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    /// Raw binary body.
    Binary(Bytes),
    /// UTF-8 text body.
    Text(String),
    /// Structured body.
    Json(serde_json::Value),
}

impl MessageData {
    /// Normalize to bytes. Structured values are serialized as JSON.
    pub fn into_bytes(self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Binary(b) => Ok(b.to_vec()),
            Self::Text(s) => Ok(s.into_bytes()),
            Self::Json(v) => serde_json::to_vec(&v),
        }
    }
}

impl From<Vec<u8>> for MessageData {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

impl From<&[u8]> for MessageData {
    fn from(v: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(v))
    }
}

impl From<Bytes> for MessageData {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl From<String> for MessageData {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageData {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<serde_json::Value> for MessageData {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// A message received from a bus subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Bus-assigned message id.
    pub id: String,
    /// Channel the message was published on.
    pub channel: String,
    /// Event name.
    pub name: String,
    /// Body.
    pub data: MessageData,
    /// Time the bus accepted the message.
    pub timestamp: DateTime<Utc>,
}

/// A live subscription. Dropping the receiver stops delivery to it.
#[derive(Debug)]
pub struct BusSubscription {
    /// Handle for [`Bus::unsubscribe`].
    pub id: u64,
    /// Subscribed channel.
    pub channel: String,
    /// Incoming messages.
    pub receiver: mpsc::UnboundedReceiver<BusMessage>,
}

/// Errors reported by a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus has no live connection right now.
    NotConnected,
    /// The bus was closed and will not reconnect.
    Closed,
    /// The operation did not complete in time.
    Timeout(std::time::Duration),
    /// Any other vendor-reported failure.
    Other(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Bus not connected"),
            Self::Closed => write!(f, "Bus closed"),
            Self::Timeout(d) => write!(f, "Bus operation timed out after {d:?}"),
            Self::Other(msg) => write!(f, "Bus error: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Minimal pub/sub surface used by the transport layer.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Establish the connection. Resolves once connected.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] if the bus was closed.
    async fn connect(&self) -> Result<(), BusError>;

    /// Whether the bus currently reports a live connection.
    fn is_connected(&self) -> bool;

    /// Subscribe to `channel`, optionally filtered to one event name.
    async fn subscribe(
        &self,
        channel: &str,
        event: Option<&str>,
    ) -> Result<BusSubscription, BusError>;

    /// Remove a subscription created by [`Bus::subscribe`].
    async fn unsubscribe(&self, channel: &str, subscription_id: u64) -> Result<(), BusError>;

    /// Publish one message. Per-attempt timeouts are applied by the caller.
    async fn publish(&self, channel: &str, event: &str, data: MessageData)
        -> Result<(), BusError>;

    /// Close the connection permanently.
    async fn close(&self);
}
