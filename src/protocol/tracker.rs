//! Correlation of decisions with outstanding commands.
//!
//! Every [`DaemonDecisionFrame`] must answer a command the daemon actually
//! received. The tracker records command ids as they arrive and releases
//! them when the matching decision is produced.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use super::{CommandFrame, DaemonDecisionFrame, FrameError};

/// Outstanding command ids awaiting a decision.
#[derive(Debug, Default)]
pub struct CommandTracker {
    outstanding: HashMap<Uuid, Instant>,
}

impl CommandTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound command.
    ///
    /// Returns `false` if the id was already outstanding (a redelivery).
    pub fn track(&mut self, command: &CommandFrame) -> bool {
        if self.outstanding.contains_key(&command.command_id) {
            return false;
        }
        self.outstanding.insert(command.command_id, Instant::now());
        true
    }

    /// Release the command answered by `decision`.
    ///
    /// Returns how long the command was outstanding.
    ///
    /// # Errors
    ///
    /// [`FrameError::CommandIdMismatch`] if no command with that id is
    /// outstanding.
    pub fn resolve(
        &mut self,
        decision: &DaemonDecisionFrame,
    ) -> Result<std::time::Duration, FrameError> {
        self.outstanding
            .remove(&decision.command_id)
            .map(|started| started.elapsed())
            .ok_or(FrameError::CommandIdMismatch {
                expected: None,
                got: decision.command_id,
            })
    }

    /// Forget a command without a decision (handler dropped it).
    pub fn abandon(&mut self, command_id: &Uuid) -> bool {
        self.outstanding.remove(command_id).is_some()
    }

    /// Whether `command_id` is awaiting a decision.
    pub fn is_outstanding(&self, command_id: &Uuid) -> bool {
        self.outstanding.contains_key(command_id)
    }

    /// Number of commands awaiting a decision.
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Check that `decision` answers `command`.
///
/// # Errors
///
/// [`FrameError::CommandIdMismatch`] when the ids differ.
pub fn ensure_matches(
    command: &CommandFrame,
    decision: &DaemonDecisionFrame,
) -> Result<(), FrameError> {
    if command.command_id == decision.command_id {
        Ok(())
    } else {
        Err(FrameError::CommandIdMismatch {
            expected: Some(command.command_id),
            got: decision.command_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> CommandFrame {
        CommandFrame {
            command_id: Uuid::new_v4(),
            flags: 0,
            encrypted_payload: Vec::new(),
        }
    }

    #[test]
    fn test_track_then_resolve() {
        let mut tracker = CommandTracker::new();
        let cmd = command();
        assert!(tracker.track(&cmd));
        assert!(tracker.is_outstanding(&cmd.command_id));

        tracker
            .resolve(&DaemonDecisionFrame::ack(cmd.command_id))
            .unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_track_reports_redelivery() {
        let mut tracker = CommandTracker::new();
        let cmd = command();
        assert!(tracker.track(&cmd));
        assert!(!tracker.track(&cmd));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_unknown_decision_is_mismatch() {
        let mut tracker = CommandTracker::new();
        tracker.track(&command());
        let stray = DaemonDecisionFrame::ack(Uuid::new_v4());
        assert_eq!(
            tracker.resolve(&stray).unwrap_err(),
            FrameError::CommandIdMismatch {
                expected: None,
                got: stray.command_id,
            }
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_resolve_twice_fails() {
        let mut tracker = CommandTracker::new();
        let cmd = command();
        tracker.track(&cmd);
        let decision = DaemonDecisionFrame::reject(cmd.command_id);
        assert!(tracker.resolve(&decision).is_ok());
        assert!(tracker.resolve(&decision).is_err());
    }

    #[test]
    fn test_ensure_matches() {
        let cmd = command();
        assert!(ensure_matches(&cmd, &DaemonDecisionFrame::ack(cmd.command_id)).is_ok());
        assert!(matches!(
            ensure_matches(&cmd, &DaemonDecisionFrame::ack(Uuid::new_v4())),
            Err(FrameError::CommandIdMismatch { expected: Some(_), .. })
        ));
    }
}
