//! Wire protocol between remote clients and the local daemon.
//!
//! - [`frame`] - Fixed-layout binary command and decision frames
//! - [`tracker`] - Decision-to-command correlation

pub mod frame;
pub mod tracker;

pub use frame::{
    decode_command, decode_decision, decode_frame, read_frame, CommandFrame, DaemonDecisionFrame,
    Decision, Frame, FrameDecoder, HEADER_SIZE, LENGTH_PREFIX, MAX_FRAME_SIZE,
};
pub use tracker::{ensure_matches, CommandTracker};

use thiserror::Error;
use uuid::Uuid;

/// Errors produced while framing or parsing.
///
/// These are deterministic: retrying the same bytes yields the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough bytes buffered for a complete frame yet.
    #[error("incomplete frame")]
    IncompleteFrame,

    /// Frame body shorter than the fixed header.
    #[error("frame too short: got {got} bytes, need at least {need}")]
    FrameTooShort {
        /// Bytes present.
        got: usize,
        /// Header size.
        need: usize,
    },

    /// Type byte differs from the kind the caller asked for.
    #[error("invalid frame type: expected 0x{expected:02x}, got 0x{got:02x}")]
    InvalidFrameType {
        /// Expected type byte.
        expected: u8,
        /// Actual type byte.
        got: u8,
    },

    /// Type byte is not a known frame kind.
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    /// Decision byte outside `{0x01, 0x02}`.
    #[error("invalid decision value: 0x{0:02x}")]
    InvalidDecision(u8),

    /// Declared payload length disagrees with the bytes present.
    #[error("payload length mismatch: header says {expected} bytes, got {actual}")]
    PayloadLenMismatch {
        /// `HEADER_SIZE + payload_len`.
        expected: usize,
        /// Actual frame body length.
        actual: usize,
    },

    /// A decision does not answer an outstanding command.
    #[error("command ID mismatch: {got} is not outstanding")]
    CommandIdMismatch {
        /// The command the decision was checked against, if any.
        expected: Option<Uuid>,
        /// The decision's command id.
        got: Uuid,
    },

    /// Declared frame length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared length.
        size: usize,
        /// Limit.
        max: usize,
    },
}
