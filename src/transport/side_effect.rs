//! Side effects emitted by the daemon after executing a command.
//!
//! A side effect tells other devices that daemon-owned state changed
//! (a session was created, a message was appended, an agent changed status).
//! The publisher turns each one into a single bus message.

use serde::{Deserialize, Serialize};

/// Kind of state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    /// A repository was registered.
    RepositoryCreated,
    /// A repository was removed.
    RepositoryDeleted,
    /// A session was created.
    SessionCreated,
    /// A session was closed by its host.
    SessionClosed,
    /// A session was deleted.
    SessionDeleted,
    /// Session metadata changed.
    SessionUpdated,
    /// A message was appended to a session transcript.
    MessageAppended,
    /// The agent for a session changed status.
    AgentStatusChanged,
    /// The daemon runtime reported a status change.
    RuntimeStatusUpdated,
    /// A batch of outbox events was sent.
    OutboxEventsSent,
    /// A batch of outbox events was acknowledged.
    OutboxEventsAcked,
}

impl SideEffectKind {
    /// Wire name, used as the default event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepositoryCreated => "repository_created",
            Self::RepositoryDeleted => "repository_deleted",
            Self::SessionCreated => "session_created",
            Self::SessionClosed => "session_closed",
            Self::SessionDeleted => "session_deleted",
            Self::SessionUpdated => "session_updated",
            Self::MessageAppended => "message_appended",
            Self::AgentStatusChanged => "agent_status_changed",
            Self::RuntimeStatusUpdated => "runtime_status_updated",
            Self::OutboxEventsSent => "outbox_events_sent",
            Self::OutboxEventsAcked => "outbox_events_acked",
        }
    }
}

impl std::fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state change to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    /// What changed.
    #[serde(rename = "type")]
    pub kind: SideEffectKind,
    /// Channel override; the publisher's default channel is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event name override; [`SideEffectKind::as_str`] is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Explicit payload. When unset the whole side effect is published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Storage key of the affected object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    /// Affected repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    /// Affected session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Affected message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// New status, for status-change kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Outbox batch id, for outbox kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl SideEffect {
    /// A side effect of `kind` with no identifiers set.
    pub fn new(kind: SideEffectKind) -> Self {
        Self {
            kind,
            channel: None,
            event: None,
            payload: None,
            object_key: None,
            repository_id: None,
            session_id: None,
            message_id: None,
            status: None,
            batch_id: None,
        }
    }

    /// Set the affected session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the affected message.
    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the new status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Publish on `channel` instead of the publisher default.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Publish under `event` instead of the kind name.
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Publish `payload` instead of the serialized side effect.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Event name to publish under.
    pub fn event_name(&self) -> &str {
        match self.event.as_deref() {
            Some(event) if !event.is_empty() => event,
            _ => self.kind.as_str(),
        }
    }

    /// Channel override, ignoring empty strings.
    pub fn channel_override(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    /// Bytes to publish: the explicit payload if set and non-null, else the
    /// whole side effect as JSON.
    pub fn wire_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.payload {
            Some(payload) if !payload.is_null() => serde_json::to_vec(payload),
            _ => serde_json::to_vec(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_defaults_to_kind() {
        let effect = SideEffect::new(SideEffectKind::MessageAppended);
        assert_eq!(effect.event_name(), "message_appended");

        let effect = effect.with_event("custom");
        assert_eq!(effect.event_name(), "custom");

        let effect = SideEffect::new(SideEffectKind::SessionCreated).with_event("");
        assert_eq!(effect.event_name(), "session_created");
    }

    #[test]
    fn test_wire_payload_prefers_explicit_payload() {
        let effect = SideEffect::new(SideEffectKind::AgentStatusChanged)
            .with_payload(serde_json::json!({"status": "idle"}));
        assert_eq!(effect.wire_payload().unwrap(), br#"{"status":"idle"}"#);
    }

    #[test]
    fn test_wire_payload_falls_back_to_full_json() {
        let effect = SideEffect::new(SideEffectKind::SessionCreated).with_session("s-1");
        let value: serde_json::Value = serde_json::from_slice(&effect.wire_payload().unwrap()).unwrap();
        assert_eq!(value["type"], "session_created");
        assert_eq!(value["session_id"], "s-1");
        assert!(value.get("channel").is_none());
    }

    #[test]
    fn test_deserialize_minimal() {
        let effect: SideEffect =
            serde_json::from_str(r#"{"type":"outbox_events_acked","batch_id":"b1"}"#).unwrap();
        assert_eq!(effect.kind, SideEffectKind::OutboxEventsAcked);
        assert_eq!(effect.batch_id.as_deref(), Some("b1"));
        assert!(effect.channel_override().is_none());
    }
}
