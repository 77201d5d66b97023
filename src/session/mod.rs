//! Multi-device sessions.
//!
//! A session lets several devices watch (and optionally drive) one agent
//! running on the host. The host encrypts every outbound payload once per
//! participant under a key derived for that participant and session, so
//! the relay in between only ever sees ciphertext.
//!
//! # State machine
//!
//! ```text
//! pending ──activate──▶ active ◀──resume── paused
//!                        │  └────pause────▶  │
//!                        └──────end──────────┴──▶ ended
//! ```
//!
//! Participants may only join an `active` session. Ending a session wipes
//! every derived key and removes it from the manager.
//!
//! - [`keys`] - Device identities, key derivation, AEAD
//! - [`manager`] - Session table and operations
//! - [`clock`] - Time source (injectable for tests)

pub mod clock;
pub mod keys;
pub mod manager;

pub use clock::{Clock, ManualClock, SystemClock};
pub use keys::{DeviceKeyPair, DevicePublicKey, SessionKey, NONCE_SIZE};
pub use manager::{decrypt_participant_message, SessionManager};

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created but not yet accepting participants.
    Pending,
    /// Accepting participants and traffic.
    Active,
    /// Temporarily halted; no traffic, no joins.
    Paused,
    /// Finished. Keys wiped.
    Ended,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Role of a device in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// The executor. Exactly one per session.
    Host,
    /// May send commands.
    Controller,
    /// Receives output only.
    Viewer,
}

impl ParticipantRole {
    /// Permission granted when none is given explicitly.
    pub fn default_permission(self) -> Permission {
        match self {
            Self::Host => Permission::FullControl,
            Self::Controller => Permission::Interact,
            Self::Viewer => Permission::ViewOnly,
        }
    }
}

/// What a participant may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read output.
    ViewOnly,
    /// Read output and send input.
    Interact,
    /// Everything, including session control.
    FullControl,
}

/// One device in a session.
#[derive(Debug)]
pub struct SessionParticipant {
    /// Device identifier.
    pub device_id: String,
    /// Device's X25519 public key.
    pub device_public_key: DevicePublicKey,
    /// Role in the session.
    pub role: ParticipantRole,
    /// Granted permission.
    pub permission: Permission,
    /// Key shared with the host. `None` for the host itself.
    pub session_key: Option<SessionKey>,
    /// When the device joined.
    pub joined_at: DateTime<Utc>,
    /// Inactive participants keep their key but receive no broadcasts.
    pub is_active: bool,
}

impl SessionParticipant {
    /// Wipe the session key in place. The key stays present but all-zero.
    pub(crate) fn wipe_key(&mut self) {
        if let Some(key) = self.session_key.as_mut() {
            zeroize::Zeroize::zeroize(key);
        }
    }

    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            device_id: self.device_id.clone(),
            device_public_key: self.device_public_key,
            role: self.role,
            permission: self.permission,
            joined_at: self.joined_at,
            is_active: self.is_active,
            has_session_key: self.session_key.is_some(),
        }
    }
}

/// Key-free snapshot of a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    /// Device identifier.
    pub device_id: String,
    /// Device's public key.
    pub device_public_key: DevicePublicKey,
    /// Role.
    pub role: ParticipantRole,
    /// Permission.
    pub permission: Permission,
    /// Join time.
    pub joined_at: DateTime<Utc>,
    /// Active flag.
    pub is_active: bool,
    /// Whether a session key is held.
    pub has_session_key: bool,
}

/// A session and its participants.
#[derive(Debug)]
pub struct MultiDeviceSession {
    /// Session identifier.
    pub id: String,
    /// Host device identifier.
    pub host_device_id: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Participants keyed by device id, host included.
    pub participants: HashMap<String, SessionParticipant>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time, if bounded.
    pub expires_at: Option<DateTime<Utc>>,
    /// Caller-defined metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MultiDeviceSession {
    /// Key-free snapshot.
    pub fn info(&self) -> SessionInfo {
        let mut participants: Vec<ParticipantInfo> =
            self.participants.values().map(SessionParticipant::info).collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.device_id.cmp(&b.device_id)));
        SessionInfo {
            id: self.id.clone(),
            host_device_id: self.host_device_id.clone(),
            state: self.state,
            participants,
            created_at: self.created_at,
            expires_at: self.expires_at,
            metadata: self.metadata.clone(),
        }
    }

    /// Whether `now` is past the expiry time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Wipe every key and drop all participants.
    pub(crate) fn destroy(&mut self) {
        for participant in self.participants.values_mut() {
            participant.wipe_key();
        }
        self.participants.clear();
        self.state = SessionState::Ended;
    }
}

/// Key-free snapshot of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: String,
    /// Host device identifier.
    pub host_device_id: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Participants ordered by join time.
    pub participants: Vec<ParticipantInfo>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: Option<DateTime<Utc>>,
    /// Caller-defined metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Explicit id. A random UUID is used when unset.
    pub session_id: Option<String>,
    /// Lifetime. The manager default is used when unset.
    pub duration: Option<Duration>,
    /// Caller-defined metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Start in `pending` and wait for [`SessionManager::activate_session`].
    pub start_pending: bool,
}

/// Ciphertext addressed to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedParticipantMessage {
    /// Recipient device.
    pub target_device_id: String,
    /// AES-256-GCM ciphertext (tag appended).
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Nonce used for this message.
    #[serde(with = "base64_nonce")]
    pub nonce: [u8; NONCE_SIZE],
}

/// Outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastResult {
    /// One message per participant that was encrypted successfully.
    pub messages: Vec<EncryptedParticipantMessage>,
    /// Participants that could not be encrypted for.
    pub failed: Vec<String>,
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session with this id.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A session with this id already exists.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// No participant with this device id in the session.
    #[error("participant {device_id} not found in session {session_id}")]
    ParticipantNotFound {
        /// Session id.
        session_id: String,
        /// Device id.
        device_id: String,
    },

    /// The session is not in a state that allows the operation.
    #[error("session {session_id} is {state}, not active")]
    NotActive {
        /// Session id.
        session_id: String,
        /// Current state.
        state: SessionState,
    },

    /// The participant has no derived key (the host, or a wiped entry).
    #[error("no session key for {0}")]
    MissingSessionKey(String),

    /// The host cannot be added, removed, or deactivated as a participant.
    #[error("operation not permitted on host device {0}")]
    HostParticipant(String),

    /// Public key unusable for key agreement.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Encryption, decryption, or derivation failure.
    #[error("crypto error: {0}")]
    Crypto(String),
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_nonce {
    use super::{BASE64, NONCE_SIZE};
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(nonce: &[u8; NONCE_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(nonce))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; NONCE_SIZE], D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = BASE64.decode(encoded).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_wrong_len| serde::de::Error::custom("nonce must be 12 bytes"))
    }
}
