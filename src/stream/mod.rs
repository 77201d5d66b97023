//! Per-session daemon event streams.
//!
//! A participant's client opens one event stream per session to follow the
//! agent's live activity. Two transports sit behind the [`EventStream`]
//! trait:
//!
//! ```text
//! EventStream (trait)
//!     │
//!     ├── SocketEventStream        newline JSON over a Unix socket
//!     │   └── sessionSubscribe handshake, then events until EOF
//!     │
//!     └── SharedMemoryEventStream  mmap ring buffer, polled
//!         └── waits for the host to create the region
//! ```
//!
//! Both yield [`DaemonEvent`]s in non-decreasing `sequence` order and end
//! when the host shuts down or [`EventStream::disconnect`] is called.

pub mod shm;
pub mod socket;

pub use shm::{RegionWriter, SharedMemoryEventStream};
pub use socket::SocketEventStream;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Kind of daemon event, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DaemonEventType {
    /// A transcript message was stored.
    Message,
    /// Partial assistant output.
    StreamingChunk,
    /// Session status changed.
    StatusChange,
    /// Full state snapshot sent on subscribe.
    InitialState,
    /// Raw terminal bytes.
    TerminalOutput,
    /// Terminal process exited.
    TerminalFinished,
    /// Agent `system` record.
    ClaudeSystem,
    /// Agent `assistant` record.
    ClaudeAssistant,
    /// Agent `user` record (tool results).
    ClaudeUser,
    /// Agent `result` record (turn finished).
    ClaudeResult,
    /// Daemon authentication state changed.
    AuthStateChanged,
    /// A session was created.
    SessionCreated,
    /// A session was deleted.
    SessionDeleted,
}

/// How a raw wire tag should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Deliver as this event type.
    Event(DaemonEventType),
    /// Agent record whose concrete type is inside the payload.
    AgentRecord,
    /// Keepalive; never delivered.
    Ping,
}

/// Fixed lookup from wire tags to event handling.
///
/// Both the daemon's snake_case names and the client's camelCase names are
/// accepted. Unknown tags return `None` and the event is dropped.
pub fn lookup_tag(tag: &str) -> Option<TagKind> {
    use DaemonEventType as T;
    let kind = match tag {
        "message" => TagKind::Event(T::Message),
        "streaming_chunk" | "streamingChunk" => TagKind::Event(T::StreamingChunk),
        "status_change" | "statusChange" => TagKind::Event(T::StatusChange),
        "initial_state" | "initialState" => TagKind::Event(T::InitialState),
        "terminal_output" | "terminalOutput" => TagKind::Event(T::TerminalOutput),
        "terminal_finished" | "terminalFinished" => TagKind::Event(T::TerminalFinished),
        "system" | "claudeSystem" => TagKind::Event(T::ClaudeSystem),
        "assistant" | "claudeAssistant" => TagKind::Event(T::ClaudeAssistant),
        "user" | "claudeUser" => TagKind::Event(T::ClaudeUser),
        "result" | "claudeResult" => TagKind::Event(T::ClaudeResult),
        "auth_state_changed" | "authStateChanged" => TagKind::Event(T::AuthStateChanged),
        "session_created" | "sessionCreated" => TagKind::Event(T::SessionCreated),
        "session_deleted" | "sessionDeleted" => TagKind::Event(T::SessionDeleted),
        "claude_event" | "claudeEvent" => TagKind::AgentRecord,
        "ping" => TagKind::Ping,
        _ => return None,
    };
    Some(kind)
}

/// Resolve the concrete type of an agent record from its JSON text.
///
/// Returns `None` for records whose `type` is missing or not one of
/// `system`, `assistant`, `user`, `result`.
pub fn agent_record_type(raw_json: &str) -> Option<DaemonEventType> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    match lookup_tag(value.get("type")?.as_str()?)? {
        TagKind::Event(
            t @ (DaemonEventType::ClaudeSystem
            | DaemonEventType::ClaudeAssistant
            | DaemonEventType::ClaudeUser
            | DaemonEventType::ClaudeResult),
        ) => Some(t),
        _ => None,
    }
}

/// One decoded event for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: DaemonEventType,
    /// Session this event belongs to.
    pub session_id: String,
    /// Event payload.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Per-session ordering key.
    pub sequence: i64,
}

/// Tracks ordering within one subscription.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    last: Option<i64>,
}

/// Verdict of [`SequenceGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Next expected value (or a repeat of the last).
    InOrder,
    /// Accepted, but `missing` sequence numbers were skipped.
    Gap {
        /// How many were skipped.
        missing: i64,
    },
    /// Lower than an already-delivered sequence. Must be dropped.
    Regressed {
        /// Highest sequence delivered so far.
        last: i64,
    },
}

impl SequenceGuard {
    /// Classify `sequence` and, unless it regressed, record it.
    pub fn check(&mut self, sequence: i64) -> SequenceCheck {
        let verdict = match self.last {
            None => SequenceCheck::InOrder,
            Some(last) if sequence < last => return SequenceCheck::Regressed { last },
            // sequence >= last, so the difference only overflows upward.
            Some(last) => match sequence.saturating_sub(last) {
                0 | 1 => SequenceCheck::InOrder,
                step => SequenceCheck::Gap { missing: step - 1 },
            },
        };
        self.last = Some(sequence);
        verdict
    }

    /// Run [`check`](Self::check) and log anomalies. Returns whether the
    /// event may be delivered.
    pub fn admit(&mut self, event: &DaemonEvent) -> bool {
        match self.check(event.sequence) {
            SequenceCheck::InOrder => true,
            SequenceCheck::Gap { missing } => {
                log::warn!(
                    "[EventStream] {}: {missing} event(s) missing before sequence {}",
                    event.session_id,
                    event.sequence
                );
                true
            }
            SequenceCheck::Regressed { last } => {
                log::warn!(
                    "[EventStream] {}: dropping sequence {} (already at {last})",
                    event.session_id,
                    event.sequence
                );
                false
            }
        }
    }
}

/// Errors from event streams.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The socket or region does not exist.
    #[error("event source not found: {0}")]
    NotFound(String),

    /// Could not connect.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// Request could not be encoded or a response could not be decoded.
    #[error("encoding failed")]
    Encoding(#[from] serde_json::Error),

    /// The stream was disconnected while the operation was pending.
    #[error("disconnected")]
    Disconnected,

    /// The host rejected the request.
    #[error("server error {code}: {message}")]
    Server {
        /// Error code.
        code: i32,
        /// Human-readable message.
        message: String,
    },

    /// `subscribe` was already called on this stream.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// No response to the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The shared-memory region is malformed.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// I/O failure after the connection was established.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Ordered events for one subscription. Ends when the stream finishes.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::Receiver<DaemonEvent>,
}

impl EventSubscription {
    pub(crate) fn new(receiver: mpsc::Receiver<DaemonEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the stream has finished.
    pub async fn next(&mut self) -> Option<DaemonEvent> {
        self.receiver.recv().await
    }

    /// Underlying channel.
    pub fn into_inner(self) -> mpsc::Receiver<DaemonEvent> {
        self.receiver
    }
}

/// A per-session source of [`DaemonEvent`]s.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Session this stream follows.
    fn session_id(&self) -> &str;

    /// Start receiving. May be called once per stream.
    ///
    /// Suspends until the handshake completes (socket) or the region
    /// appears (shared memory).
    async fn subscribe(&self, cancel: &CancellationToken)
        -> Result<EventSubscription, StreamError>;

    /// Release the transport and finish the subscription. Idempotent.
    async fn disconnect(&self);
}

/// Which transport to use for a session's event stream.
#[derive(Debug, Clone)]
pub enum StreamTransport {
    /// Unix socket at this path.
    Socket(PathBuf),
    /// Shared-memory regions under this directory.
    SharedMemory(PathBuf),
}

/// Construct the event stream for `session_id` over `transport`.
pub fn open_event_stream(
    transport: &StreamTransport,
    session_id: &str,
    settings: &crate::config::StreamConfig,
) -> Box<dyn EventStream> {
    match transport {
        StreamTransport::Socket(path) => Box::new(
            SocketEventStream::new(path.clone(), session_id)
                .with_handshake_timeout(settings.handshake_timeout()),
        ),
        StreamTransport::SharedMemory(dir) => Box::new(
            SharedMemoryEventStream::new(dir.clone(), session_id)
                .with_poll_interval(settings.poll_interval())
                .with_open_retry(settings.open_retry_interval(), settings.open_max_attempts),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_tag() {
        assert_eq!(
            lookup_tag("assistant"),
            Some(TagKind::Event(DaemonEventType::ClaudeAssistant))
        );
        assert_eq!(
            lookup_tag("result"),
            Some(TagKind::Event(DaemonEventType::ClaudeResult))
        );
        assert_eq!(
            lookup_tag("streamingChunk"),
            lookup_tag("streaming_chunk")
        );
        assert_eq!(lookup_tag("ping"), Some(TagKind::Ping));
        assert_eq!(lookup_tag("claude_event"), Some(TagKind::AgentRecord));
        assert_eq!(lookup_tag("telemetry"), None);
    }

    #[test]
    fn test_agent_record_type() {
        assert_eq!(
            agent_record_type(r#"{"type":"assistant","message":{}}"#),
            Some(DaemonEventType::ClaudeAssistant)
        );
        assert_eq!(
            agent_record_type(r#"{"type":"result","subtype":"success"}"#),
            Some(DaemonEventType::ClaudeResult)
        );
        assert_eq!(agent_record_type(r#"{"type":"message"}"#), None);
        assert_eq!(agent_record_type("not json"), None);
    }

    #[test]
    fn test_sequence_guard() {
        let mut guard = SequenceGuard::default();
        assert_eq!(guard.check(5), SequenceCheck::InOrder);
        assert_eq!(guard.check(6), SequenceCheck::InOrder);
        assert_eq!(guard.check(6), SequenceCheck::InOrder);
        assert_eq!(guard.check(9), SequenceCheck::Gap { missing: 2 });
        assert_eq!(guard.check(8), SequenceCheck::Regressed { last: 9 });
        assert_eq!(guard.check(10), SequenceCheck::InOrder);
    }

    #[test]
    fn test_sequence_guard_extreme_values() {
        let mut guard = SequenceGuard::default();
        assert_eq!(guard.check(-5), SequenceCheck::InOrder);
        assert_eq!(guard.check(-4), SequenceCheck::InOrder);
        assert!(matches!(
            guard.check(i64::MAX),
            SequenceCheck::Gap { missing } if missing > 0
        ));
        assert_eq!(guard.check(i64::MAX), SequenceCheck::InOrder);
        assert_eq!(
            guard.check(i64::MIN),
            SequenceCheck::Regressed { last: i64::MAX }
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let event: DaemonEvent = serde_json::from_str(
            r#"{"type":"terminalOutput","sessionId":"s1","data":{"output":"hi"},"sequence":3}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, DaemonEventType::TerminalOutput);
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.data["output"], "hi");
    }
}
