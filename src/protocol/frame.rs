//! Binary codec for command and decision frames.
//!
//! Both frame kinds share one little-endian skeleton:
//!
//! ```text
//! [u32 LE total_len] [u8 type] [u8 flags|decision] [u16 reserved=0]
//! [16B command_id] [u32 LE payload_len] [payload: payload_len bytes]
//! ```
//!
//! `total_len` excludes the prefix itself and always equals
//! `HEADER_SIZE + payload_len`.
//!
//! Frame types:
//! - `0x01`: Command (remote client → daemon), second byte is `flags`
//! - `0x02`: DaemonDecision (daemon → remote client), second byte is the decision

use uuid::Uuid;

use super::FrameError;

/// Bytes in the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Bytes in the fixed header that follows the length prefix:
/// type(1) + flags(1) + reserved(2) + command_id(16) + payload_len(4).
pub const HEADER_SIZE: usize = 24;

/// Largest frame the streaming decoder will buffer (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// Command sent by a remote client.
    pub const COMMAND: u8 = 0x01;
    /// Decision sent back by the daemon.
    pub const DAEMON_DECISION: u8 = 0x02;
}

/// The daemon's verdict on a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Decision {
    /// The command was accepted; the bus message may be acknowledged.
    AckMessage = 0x01,
    /// The command was rejected; the bus message must not be acknowledged.
    DoNotAck = 0x02,
}

impl TryFrom<u8> for Decision {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::AckMessage),
            0x02 => Ok(Self::DoNotAck),
            other => Err(FrameError::InvalidDecision(other)),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AckMessage => write!(f, "ACK_MESSAGE"),
            Self::DoNotAck => write!(f, "DO_NOT_ACK"),
        }
    }
}

/// A command issued by a remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Identifier correlating this command with its decision.
    pub command_id: Uuid,
    /// Opaque flag bits set by the client.
    pub flags: u8,
    /// Payload encrypted end-to-end by the client.
    pub encrypted_payload: Vec<u8>,
}

impl CommandFrame {
    /// Encode into a freshly allocated wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_frame(
            buf,
            frame_type::COMMAND,
            self.flags,
            &self.command_id,
            &self.encrypted_payload,
        );
    }

    /// Total bytes this frame occupies on the wire, prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX + HEADER_SIZE + self.encrypted_payload.len()
    }
}

/// The daemon's answer to a [`CommandFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonDecisionFrame {
    /// Identifier of the command this decision answers.
    pub command_id: Uuid,
    /// Ack or reject.
    pub decision: Decision,
    /// Optional result payload, empty when nothing needs to be returned.
    pub result: Vec<u8>,
}

impl DaemonDecisionFrame {
    /// Acknowledge `command_id` with an empty result.
    pub fn ack(command_id: Uuid) -> Self {
        Self {
            command_id,
            decision: Decision::AckMessage,
            result: Vec::new(),
        }
    }

    /// Reject `command_id` with an empty result.
    pub fn reject(command_id: Uuid) -> Self {
        Self {
            command_id,
            decision: Decision::DoNotAck,
            result: Vec::new(),
        }
    }

    /// Encode into a freshly allocated wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_frame(
            buf,
            frame_type::DAEMON_DECISION,
            self.decision as u8,
            &self.command_id,
            &self.result,
        );
    }

    /// Total bytes this frame occupies on the wire, prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX + HEADER_SIZE + self.result.len()
    }
}

/// Either frame kind, discriminated by the type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Remote client → daemon.
    Command(CommandFrame),
    /// Daemon → remote client.
    Decision(DaemonDecisionFrame),
}

impl Frame {
    /// Command id carried by either frame kind.
    pub fn command_id(&self) -> Uuid {
        match self {
            Self::Command(f) => f.command_id,
            Self::Decision(f) => f.command_id,
        }
    }

    /// Encode into a freshly allocated wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Command(f) => f.encode(),
            Self::Decision(f) => f.encode(),
        }
    }
}

fn write_frame(buf: &mut Vec<u8>, kind: u8, second: u8, command_id: &Uuid, payload: &[u8]) {
    let total_len = (HEADER_SIZE + payload.len()) as u32;
    buf.reserve(LENGTH_PREFIX + HEADER_SIZE + payload.len());
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf.push(kind);
    buf.push(second);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(command_id.as_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Split one complete frame off the front of `buf`.
///
/// Only the length prefix is inspected. Returns the frame body (without the
/// prefix) and the number of bytes consumed. Safe to call again after more
/// bytes are appended.
///
/// # Errors
///
/// [`FrameError::IncompleteFrame`] if fewer than 4 bytes are buffered or the
/// declared length runs past the end of `buf`.
pub fn read_frame(buf: &[u8]) -> Result<(&[u8], usize), FrameError> {
    if buf.len() < LENGTH_PREFIX {
        return Err(FrameError::IncompleteFrame);
    }
    let frame_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = LENGTH_PREFIX + frame_len;
    if buf.len() < total {
        return Err(FrameError::IncompleteFrame);
    }
    Ok((&buf[LENGTH_PREFIX..total], total))
}

/// Validated view over a frame body's header.
struct Header<'a> {
    kind: u8,
    second: u8,
    command_id: Uuid,
    payload: &'a [u8],
}

fn parse_header(data: &[u8]) -> Result<Header<'_>, FrameError> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::FrameTooShort {
            got: data.len(),
            need: HEADER_SIZE,
        });
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&data[4..20]);
    let payload_len = u32::from_le_bytes([data[20], data[21], data[22], data[23]]) as usize;

    Ok(Header {
        kind: data[0],
        second: data[1],
        command_id: Uuid::from_bytes(id),
        payload: checked_payload(data, payload_len)?,
    })
}

fn checked_payload(data: &[u8], payload_len: usize) -> Result<&[u8], FrameError> {
    let expected = HEADER_SIZE + payload_len;
    if data.len() != expected {
        return Err(FrameError::PayloadLenMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(&data[HEADER_SIZE..])
}

fn expect_type(data: &[u8], want: u8) -> Result<(), FrameError> {
    match data.first() {
        Some(&got) if got == want => Ok(()),
        Some(&got) => Err(FrameError::InvalidFrameType {
            expected: want,
            got,
        }),
        None => Err(FrameError::FrameTooShort {
            got: 0,
            need: HEADER_SIZE,
        }),
    }
}

/// Parse a command frame body as returned by [`read_frame`].
///
/// Checks run in wire order: length, type byte, then payload length.
pub fn decode_command(data: &[u8]) -> Result<CommandFrame, FrameError> {
    if data.len() >= HEADER_SIZE {
        expect_type(data, frame_type::COMMAND)?;
    }
    let header = parse_header(data)?;
    Ok(CommandFrame {
        command_id: header.command_id,
        flags: header.second,
        encrypted_payload: header.payload.to_vec(),
    })
}

/// Parse a decision frame body as returned by [`read_frame`].
///
/// Checks run in wire order: length, type byte, decision byte, then
/// payload length.
pub fn decode_decision(data: &[u8]) -> Result<DaemonDecisionFrame, FrameError> {
    if data.len() >= HEADER_SIZE {
        expect_type(data, frame_type::DAEMON_DECISION)?;
        Decision::try_from(data[1])?;
    }
    let header = parse_header(data)?;
    Ok(DaemonDecisionFrame {
        command_id: header.command_id,
        decision: Decision::try_from(header.second)?,
        result: header.payload.to_vec(),
    })
}

/// Parse a frame body of either kind.
pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    let header = parse_header(data)?;
    match header.kind {
        frame_type::COMMAND => Ok(Frame::Command(CommandFrame {
            command_id: header.command_id,
            flags: header.second,
            encrypted_payload: header.payload.to_vec(),
        })),
        frame_type::DAEMON_DECISION => Ok(Frame::Decision(DaemonDecisionFrame {
            command_id: header.command_id,
            decision: Decision::try_from(header.second)?,
            result: header.payload.to_vec(),
        })),
        other => Err(FrameError::UnknownFrameType(other)),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Handles TCP-style byte stream reassembly on top of [`read_frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds [`MAX_FRAME_SIZE`].
    /// The buffer is cleared on error since the stream can no longer be
    /// resynchronized.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut offset = 0;

        loop {
            let rest = &self.buf[offset..];
            if rest.len() >= LENGTH_PREFIX {
                let declared = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                if declared > MAX_FRAME_SIZE {
                    self.buf.clear();
                    return Err(FrameError::FrameTooLarge {
                        size: declared,
                        max: MAX_FRAME_SIZE,
                    });
                }
            }

            let (body, consumed) = match read_frame(rest) {
                Ok(found) => found,
                Err(FrameError::IncompleteFrame) => break,
                Err(e) => return Err(e),
            };
            match decode_frame(body) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
            offset += consumed;
        }

        self.buf.drain(..offset);
        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
