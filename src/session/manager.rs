//! Session table and operations.
//!
//! All sessions live behind one mutex. Each public method takes the lock
//! once, so every operation is atomic with respect to the others. Nothing
//! here blocks on I/O; encryption happens inside the critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::add_duration;
use super::{
    BroadcastResult, Clock, DeviceKeyPair, DevicePublicKey, EncryptedParticipantMessage,
    MultiDeviceSession, ParticipantInfo, ParticipantRole, Permission, SessionError, SessionInfo,
    SessionOptions, SessionParticipant, SessionState, SystemClock,
};
use crate::config::SessionConfig;
use crate::constants::{DEFAULT_SESSION_DURATION, SESSION_SWEEP_INTERVAL};

/// Owns every multi-device session hosted by this device.
pub struct SessionManager {
    identity: DeviceKeyPair,
    clock: Arc<dyn Clock>,
    default_duration: Duration,
    sweep_interval: Duration,
    sessions: Mutex<HashMap<String, MultiDeviceSession>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &self.identity)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager for the host identified by `identity`.
    pub fn new(identity: DeviceKeyPair) -> Self {
        Self::with_clock(identity, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit time source.
    pub fn with_clock(identity: DeviceKeyPair, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            clock,
            default_duration: DEFAULT_SESSION_DURATION,
            sweep_interval: SESSION_SWEEP_INTERVAL,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a manager using the lifetime and sweep interval from `config`.
    pub fn from_config(identity: DeviceKeyPair, config: &SessionConfig) -> Self {
        Self::new(identity)
            .with_default_duration(config.default_duration())
            .with_sweep_interval(config.sweep_interval())
    }

    /// Override the lifetime used when [`SessionOptions::duration`] is unset.
    pub fn with_default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self
    }

    /// Override how often [`spawn_expiry_sweeper`](Self::spawn_expiry_sweeper)
    /// runs. A zero interval is raised to one second.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_secs(1));
        self
    }

    /// Host public key participants derive against.
    pub fn host_public_key(&self) -> DevicePublicKey {
        self.identity.public_key()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MultiDeviceSession>> {
        self.sessions.lock().expect("session table lock poisoned")
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Create a session with `host_device_id` as its host.
    ///
    /// The host joins immediately with full control and no session key.
    /// The session starts `active` unless [`SessionOptions::start_pending`]
    /// is set.
    pub fn create_session(
        &self,
        host_device_id: &str,
        host_public_key: DevicePublicKey,
        options: SessionOptions,
    ) -> Result<SessionInfo, SessionError> {
        let now = self.clock.now();
        let id = options
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let duration = options.duration.unwrap_or(self.default_duration);

        let host = SessionParticipant {
            device_id: host_device_id.to_string(),
            device_public_key: host_public_key,
            role: ParticipantRole::Host,
            permission: Permission::FullControl,
            session_key: None,
            joined_at: now,
            is_active: true,
        };

        let session = MultiDeviceSession {
            id: id.clone(),
            host_device_id: host_device_id.to_string(),
            state: if options.start_pending {
                SessionState::Pending
            } else {
                SessionState::Active
            },
            participants: HashMap::from([(host_device_id.to_string(), host)]),
            created_at: now,
            expires_at: add_duration(now, duration),
            metadata: options.metadata,
        };

        let mut sessions = self.lock();
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }
        let info = session.info();
        sessions.insert(id.clone(), session);
        drop(sessions);

        log::info!("[Session] Created {id} (host {host_device_id}, state {})", info.state);
        Ok(info)
    }

    /// Move a `pending` session to `active`.
    ///
    /// Returns `false` if the session was not pending.
    pub fn activate_session(&self, session_id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.lock();
        let session = get_mut(&mut sessions, session_id)?;
        if session.state != SessionState::Pending {
            return Ok(false);
        }
        session.state = SessionState::Active;
        log::info!("[Session] Activated {session_id}");
        Ok(true)
    }

    /// Snapshot of a session.
    pub fn get_session(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        let sessions = self.lock();
        sessions
            .get(session_id)
            .map(MultiDeviceSession::info)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Snapshot of one participant.
    pub fn get_participant(
        &self,
        session_id: &str,
        device_id: &str,
    ) -> Result<ParticipantInfo, SessionError> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session
            .participants
            .get(device_id)
            .map(SessionParticipant::info)
            .ok_or_else(|| participant_not_found(session_id, device_id))
    }

    /// Add a device and derive its session key.
    ///
    /// Re-adding a device that is already present replaces its entry; the
    /// old key is wiped.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotActive`] unless the session is `active`
    /// - [`SessionError::HostParticipant`] for the host device or the host role
    /// - [`SessionError::InvalidPublicKey`] for an unusable key
    pub fn add_participant(
        &self,
        session_id: &str,
        device_id: &str,
        device_public_key: DevicePublicKey,
        role: ParticipantRole,
        permission: Option<Permission>,
    ) -> Result<ParticipantInfo, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let session = get_mut(&mut sessions, session_id)?;
        require_active(session)?;
        if role == ParticipantRole::Host || device_id == session.host_device_id {
            return Err(SessionError::HostParticipant(device_id.to_string()));
        }

        let session_key = self
            .identity
            .derive_session_key(&device_public_key, session_id)?;

        let participant = SessionParticipant {
            device_id: device_id.to_string(),
            device_public_key,
            role,
            permission: permission.unwrap_or_else(|| role.default_permission()),
            session_key: Some(session_key),
            joined_at: now,
            is_active: true,
        };
        let info = participant.info();
        if let Some(mut previous) = session.participants.insert(device_id.to_string(), participant)
        {
            previous.wipe_key();
            log::debug!("[Session] Replaced participant {device_id} in {session_id}");
        }

        log::info!("[Session] {device_id} joined {session_id} as {role:?}");
        Ok(info)
    }

    /// Encrypt `plaintext` for one participant under a fresh nonce.
    pub fn encrypt_for_participant(
        &self,
        session_id: &str,
        device_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedParticipantMessage, SessionError> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        require_active(session)?;
        let participant = session
            .participants
            .get(device_id)
            .ok_or_else(|| participant_not_found(session_id, device_id))?;
        seal_for(participant, plaintext)
    }

    /// Encrypt `plaintext` independently for every active non-host participant.
    ///
    /// Per-participant failures are collected in
    /// [`BroadcastResult::failed`]; they never fail the whole broadcast.
    pub fn broadcast_to_participants(
        &self,
        session_id: &str,
        plaintext: &[u8],
    ) -> Result<BroadcastResult, SessionError> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        require_active(session)?;

        let mut result = BroadcastResult::default();
        for participant in session.participants.values() {
            if participant.role == ParticipantRole::Host || !participant.is_active {
                continue;
            }
            match seal_for(participant, plaintext) {
                Ok(message) => result.messages.push(message),
                Err(e) => {
                    log::warn!(
                        "[Session] Broadcast to {} in {session_id} failed: {e}",
                        participant.device_id
                    );
                    result.failed.push(participant.device_id.clone());
                }
            }
        }
        Ok(result)
    }

    /// Remove a participant, wiping its key first.
    ///
    /// Returns the removed entry; its key (if any) is already all-zero.
    pub fn remove_participant(
        &self,
        session_id: &str,
        device_id: &str,
    ) -> Result<SessionParticipant, SessionError> {
        let mut sessions = self.lock();
        let session = get_mut(&mut sessions, session_id)?;
        if device_id == session.host_device_id {
            return Err(SessionError::HostParticipant(device_id.to_string()));
        }
        let participant = session
            .participants
            .get_mut(device_id)
            .ok_or_else(|| participant_not_found(session_id, device_id))?;
        participant.wipe_key();
        let removed = session
            .participants
            .remove(device_id)
            .ok_or_else(|| participant_not_found(session_id, device_id))?;
        log::info!("[Session] {device_id} left {session_id}");
        Ok(removed)
    }

    /// Stop broadcasting to a participant without discarding its key.
    pub fn set_participant_inactive(
        &self,
        session_id: &str,
        device_id: &str,
    ) -> Result<(), SessionError> {
        self.set_participant_active(session_id, device_id, false)
    }

    /// Resume broadcasting to a previously inactive participant.
    pub fn reactivate_participant(
        &self,
        session_id: &str,
        device_id: &str,
    ) -> Result<(), SessionError> {
        self.set_participant_active(session_id, device_id, true)
    }

    fn set_participant_active(
        &self,
        session_id: &str,
        device_id: &str,
        active: bool,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = get_mut(&mut sessions, session_id)?;
        if device_id == session.host_device_id {
            return Err(SessionError::HostParticipant(device_id.to_string()));
        }
        let participant = session
            .participants
            .get_mut(device_id)
            .ok_or_else(|| participant_not_found(session_id, device_id))?;
        participant.is_active = active;
        log::debug!("[Session] {device_id} in {session_id} active={active}");
        Ok(())
    }

    /// Active participants (host included), ordered by join time.
    pub fn get_active_participants(
        &self,
        session_id: &str,
    ) -> Result<Vec<ParticipantInfo>, SessionError> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut active: Vec<ParticipantInfo> = session
            .participants
            .values()
            .filter(|p| p.is_active)
            .map(SessionParticipant::info)
            .collect();
        active.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.device_id.cmp(&b.device_id)));
        Ok(active)
    }

    /// `active` → `paused`. Returns `false` from any other state.
    pub fn pause_session(&self, session_id: &str) -> Result<bool, SessionError> {
        self.transition(session_id, SessionState::Active, SessionState::Paused)
    }

    /// `paused` → `active`. Returns `false` from any other state.
    pub fn resume_session(&self, session_id: &str) -> Result<bool, SessionError> {
        self.transition(session_id, SessionState::Paused, SessionState::Active)
    }

    fn transition(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
    ) -> Result<bool, SessionError> {
        let mut sessions = self.lock();
        let session = get_mut(&mut sessions, session_id)?;
        if session.state != from {
            return Ok(false);
        }
        session.state = to;
        log::info!("[Session] {session_id}: {from} -> {to}");
        Ok(true)
    }

    /// End a session: wipe every key and forget it.
    pub fn end_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let mut session = sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        drop(sessions);
        session.destroy();
        log::info!("[Session] Ended {session_id}");
        Ok(())
    }

    /// Whether the session's expiry time has passed.
    pub fn is_session_expired(&self, session_id: &str) -> Result<bool, SessionError> {
        let now = self.clock.now();
        let sessions = self.lock();
        sessions
            .get(session_id)
            .map(|s| s.is_expired_at(now))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// End every expired session. Returns how many were ended.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            if let Some(mut session) = sessions.remove(id) {
                session.destroy();
            }
        }
        drop(sessions);

        if !expired.is_empty() {
            log::info!("[Session] Swept {} expired session(s)", expired.len());
        }
        expired.len()
    }

    /// Run [`cleanup_expired_sessions`](Self::cleanup_expired_sessions)
    /// once per sweep interval until `cancel` fires.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.cleanup_expired_sessions();
                    }
                }
            }
            log::debug!("[Session] Expiry sweeper stopped");
        })
    }
}

/// Participant-side decryption of a message from the host.
///
/// Derives the same key the host used, from this device's identity and
/// the host's public key.
pub fn decrypt_participant_message(
    identity: &DeviceKeyPair,
    host_public_key: &DevicePublicKey,
    session_id: &str,
    message: &EncryptedParticipantMessage,
) -> Result<Vec<u8>, SessionError> {
    let key = identity.derive_session_key(host_public_key, session_id)?;
    key.open(&message.nonce, &message.payload)
}

fn get_mut<'a>(
    sessions: &'a mut HashMap<String, MultiDeviceSession>,
    session_id: &str,
) -> Result<&'a mut MultiDeviceSession, SessionError> {
    sessions
        .get_mut(session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
}

fn require_active(session: &MultiDeviceSession) -> Result<(), SessionError> {
    if session.state == SessionState::Active {
        Ok(())
    } else {
        Err(SessionError::NotActive {
            session_id: session.id.clone(),
            state: session.state,
        })
    }
}

fn participant_not_found(session_id: &str, device_id: &str) -> SessionError {
    SessionError::ParticipantNotFound {
        session_id: session_id.to_string(),
        device_id: device_id.to_string(),
    }
}

fn seal_for(
    participant: &SessionParticipant,
    plaintext: &[u8],
) -> Result<EncryptedParticipantMessage, SessionError> {
    let key = participant
        .session_key
        .as_ref()
        .filter(|k| !k.is_zeroed())
        .ok_or_else(|| SessionError::MissingSessionKey(participant.device_id.clone()))?;
    let (payload, nonce) = key.seal(plaintext)?;
    Ok(EncryptedParticipantMessage {
        target_device_id: participant.device_id.clone(),
        payload,
        nonce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;

    struct Fixture {
        manager: SessionManager,
        host_key: DevicePublicKey,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let identity = DeviceKeyPair::generate();
        let host_key = identity.public_key();
        let clock = Arc::new(ManualClock::default());
        let manager = SessionManager::with_clock(identity, Arc::clone(&clock) as Arc<dyn Clock>);
        Fixture {
            manager,
            host_key,
            clock,
        }
    }

    fn create(f: &Fixture, id: &str) -> SessionInfo {
        f.manager
            .create_session(
                "host",
                f.host_key,
                SessionOptions {
                    session_id: Some(id.to_string()),
                    ..SessionOptions::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn test_create_session_inserts_host_without_key() {
        let f = fixture();
        let info = create(&f, "s1");
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.participants.len(), 1);
        let host = &info.participants[0];
        assert_eq!(host.role, ParticipantRole::Host);
        assert_eq!(host.permission, Permission::FullControl);
        assert!(!host.has_session_key);
        assert_eq!(
            info.expires_at.unwrap() - info.created_at,
            chrono::TimeDelta::hours(1)
        );
    }

    #[test]
    fn test_generated_id_and_duplicate_rejected() {
        let f = fixture();
        let info = f
            .manager
            .create_session("host", f.host_key, SessionOptions::default())
            .unwrap();
        assert!(Uuid::parse_str(&info.id).is_ok());

        create(&f, "dup");
        assert!(matches!(
            f.manager.create_session(
                "host",
                f.host_key,
                SessionOptions {
                    session_id: Some("dup".into()),
                    ..SessionOptions::default()
                }
            ),
            Err(SessionError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_pending_session_rejects_participants_until_activated() {
        let f = fixture();
        f.manager
            .create_session(
                "host",
                f.host_key,
                SessionOptions {
                    session_id: Some("p".into()),
                    start_pending: true,
                    ..SessionOptions::default()
                },
            )
            .unwrap();
        let phone = DeviceKeyPair::generate();
        assert!(matches!(
            f.manager
                .add_participant("p", "phone", phone.public_key(), ParticipantRole::Viewer, None),
            Err(SessionError::NotActive {
                state: SessionState::Pending,
                ..
            })
        ));

        assert!(f.manager.activate_session("p").unwrap());
        assert!(!f.manager.activate_session("p").unwrap());
        f.manager
            .add_participant("p", "phone", phone.public_key(), ParticipantRole::Viewer, None)
            .unwrap();
    }

    #[test]
    fn test_participant_key_matches_participant_side() {
        let f = fixture();
        create(&f, "s1");
        let phone = DeviceKeyPair::generate();
        let info = f
            .manager
            .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Controller, None)
            .unwrap();
        assert_eq!(info.permission, Permission::Interact);
        assert!(info.has_session_key);

        let message = f
            .manager
            .encrypt_for_participant("s1", "phone", b"ls -la")
            .unwrap();
        assert_eq!(message.target_device_id, "phone");
        let plaintext =
            decrypt_participant_message(&phone, &f.manager.host_public_key(), "s1", &message)
                .unwrap();
        assert_eq!(plaintext, b"ls -la");

        // A different session id derives a different key.
        assert!(
            decrypt_participant_message(&phone, &f.manager.host_public_key(), "s2", &message)
                .is_err()
        );
    }

    #[test]
    fn test_same_device_gets_distinct_key_per_session() {
        let f = fixture();
        create(&f, "s1");
        create(&f, "s2");
        let phone = DeviceKeyPair::generate();
        for id in ["s1", "s2"] {
            f.manager
                .add_participant(id, "phone", phone.public_key(), ParticipantRole::Viewer, None)
                .unwrap();
        }
        let host = f.manager.host_public_key();

        let from_s1 = f.manager.encrypt_for_participant("s1", "phone", b"one").unwrap();
        let from_s2 = f.manager.encrypt_for_participant("s2", "phone", b"two").unwrap();
        assert_eq!(
            decrypt_participant_message(&phone, &host, "s1", &from_s1).unwrap(),
            b"one"
        );
        assert_eq!(
            decrypt_participant_message(&phone, &host, "s2", &from_s2).unwrap(),
            b"two"
        );
        assert!(decrypt_participant_message(&phone, &host, "s2", &from_s1).is_err());
        assert!(decrypt_participant_message(&phone, &host, "s1", &from_s2).is_err());

        // Re-adding derives the same key again for the same session.
        f.manager
            .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Viewer, None)
            .unwrap();
        let again = f.manager.encrypt_for_participant("s1", "phone", b"three").unwrap();
        assert_eq!(
            decrypt_participant_message(&phone, &host, "s1", &again).unwrap(),
            b"three"
        );
        assert_eq!(
            decrypt_participant_message(&phone, &host, "s1", &from_s1).unwrap(),
            b"one"
        );
    }

    #[test]
    fn test_from_config_applies_session_settings() {
        let config = SessionConfig {
            default_duration_secs: 90,
            sweep_interval_secs: 0,
        };
        let manager = SessionManager::from_config(DeviceKeyPair::generate(), &config);
        assert_eq!(manager.default_duration, Duration::from_secs(90));
        assert_eq!(manager.sweep_interval, Duration::from_secs(1));

        let info = manager
            .create_session("host", manager.host_public_key(), SessionOptions::default())
            .unwrap();
        assert_eq!(
            info.expires_at,
            Some(info.created_at + chrono::TimeDelta::seconds(90))
        );
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let f = fixture();
        create(&f, "s1");
        let phone = DeviceKeyPair::generate();
        f.manager
            .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Viewer, None)
            .unwrap();
        let a = f.manager.encrypt_for_participant("s1", "phone", b"x").unwrap();
        let b = f.manager.encrypt_for_participant("s1", "phone", b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_broadcast_skips_host_and_inactive() {
        let f = fixture();
        create(&f, "s1");
        let viewer_a = DeviceKeyPair::generate();
        let viewer_b = DeviceKeyPair::generate();
        let viewer_c = DeviceKeyPair::generate();
        for (id, pair) in [("a", &viewer_a), ("b", &viewer_b), ("c", &viewer_c)] {
            f.manager
                .add_participant("s1", id, pair.public_key(), ParticipantRole::Viewer, None)
                .unwrap();
        }
        f.manager.set_participant_inactive("s1", "c").unwrap();

        let result = f.manager.broadcast_to_participants("s1", b"output").unwrap();
        assert!(result.failed.is_empty());
        assert_eq!(result.messages.len(), 2);

        let mut targets: Vec<&str> = result
            .messages
            .iter()
            .map(|m| m.target_device_id.as_str())
            .collect();
        targets.sort_unstable();
        assert_eq!(targets, ["a", "b"]);
        assert_ne!(result.messages[0].nonce, result.messages[1].nonce);
        assert_ne!(result.messages[0].payload, result.messages[1].payload);

        f.manager.reactivate_participant("s1", "c").unwrap();
        let result = f.manager.broadcast_to_participants("s1", b"output").unwrap();
        assert_eq!(result.messages.len(), 3);
    }

    #[test]
    fn test_active_participants_excludes_inactive() {
        let f = fixture();
        create(&f, "s1");
        let phone = DeviceKeyPair::generate();
        f.manager
            .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Viewer, None)
            .unwrap();
        assert_eq!(f.manager.get_active_participants("s1").unwrap().len(), 2);
        f.manager.set_participant_inactive("s1", "phone").unwrap();
        let active = f.manager.get_active_participants("s1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_id, "host");
        // Key survives deactivation.
        assert!(f.manager.get_participant("s1", "phone").unwrap().has_session_key);
    }

    #[test]
    fn test_remove_participant_wipes_key() {
        let f = fixture();
        create(&f, "s1");
        let phone = DeviceKeyPair::generate();
        f.manager
            .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Viewer, None)
            .unwrap();

        let removed = f.manager.remove_participant("s1", "phone").unwrap();
        assert!(removed.session_key.as_ref().unwrap().is_zeroed());
        assert!(matches!(
            f.manager.encrypt_for_participant("s1", "phone", b"x"),
            Err(SessionError::ParticipantNotFound { .. })
        ));
        assert!(matches!(
            f.manager.remove_participant("s1", "host"),
            Err(SessionError::HostParticipant(_))
        ));
    }

    #[test]
    fn test_host_cannot_be_encrypted_for_or_added() {
        let f = fixture();
        create(&f, "s1");
        assert!(matches!(
            f.manager.encrypt_for_participant("s1", "host", b"x"),
            Err(SessionError::MissingSessionKey(_))
        ));
        let other = DeviceKeyPair::generate();
        assert!(matches!(
            f.manager
                .add_participant("s1", "host", other.public_key(), ParticipantRole::Viewer, None),
            Err(SessionError::HostParticipant(_))
        ));
        assert!(matches!(
            f.manager
                .add_participant("s1", "x", other.public_key(), ParticipantRole::Host, None),
            Err(SessionError::HostParticipant(_))
        ));
    }

    #[test]
    fn test_pause_resume_transitions() {
        let f = fixture();
        create(&f, "s1");
        assert!(!f.manager.resume_session("s1").unwrap());
        assert!(f.manager.pause_session("s1").unwrap());
        assert!(!f.manager.pause_session("s1").unwrap());

        let phone = DeviceKeyPair::generate();
        assert!(matches!(
            f.manager
                .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Viewer, None),
            Err(SessionError::NotActive { .. })
        ));
        assert!(matches!(
            f.manager.broadcast_to_participants("s1", b"x"),
            Err(SessionError::NotActive { .. })
        ));

        assert!(f.manager.resume_session("s1").unwrap());
        assert_eq!(f.manager.get_session("s1").unwrap().state, SessionState::Active);
    }

    #[test]
    fn test_end_session_forgets_everything() {
        let f = fixture();
        create(&f, "s1");
        let phone = DeviceKeyPair::generate();
        f.manager
            .add_participant("s1", "phone", phone.public_key(), ParticipantRole::Viewer, None)
            .unwrap();

        f.manager.end_session("s1").unwrap();
        assert_eq!(f.manager.session_count(), 0);
        assert!(matches!(
            f.manager.get_session("s1"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.encrypt_for_participant("s1", "phone", b"x"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.pause_session("s1"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.end_session("s1"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_expiry_with_virtual_clock() {
        let f = fixture();
        f.manager
            .create_session(
                "host",
                f.host_key,
                SessionOptions {
                    session_id: Some("short".into()),
                    duration: Some(Duration::from_millis(1000)),
                    ..SessionOptions::default()
                },
            )
            .unwrap();
        create(&f, "long");

        f.clock.advance(Duration::from_millis(1000));
        assert!(!f.manager.is_session_expired("short").unwrap());

        f.clock.advance(Duration::from_millis(1));
        assert!(f.manager.is_session_expired("short").unwrap());
        assert!(!f.manager.is_session_expired("long").unwrap());

        assert_eq!(f.manager.cleanup_expired_sessions(), 1);
        assert_eq!(f.manager.cleanup_expired_sessions(), 0);
        assert_eq!(f.manager.session_count(), 1);
        assert!(matches!(
            f.manager.is_session_expired("short"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_sweeper() {
        let f = fixture();
        let clock = Arc::clone(&f.clock);
        let manager = Arc::new(f.manager);
        manager
            .create_session(
                "host",
                f.host_key,
                SessionOptions {
                    duration: Some(Duration::from_secs(1)),
                    ..SessionOptions::default()
                },
            )
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let cancel = CancellationToken::new();
        let handle = manager.spawn_expiry_sweeper(cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.session_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
