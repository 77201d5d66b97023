//! Botster Remote - remote command relay for the botster daemon.
//!
//! This crate carries commands from remote devices to the local daemon and
//! carries the daemon's activity back out:
//!
//! - Remote clients send binary command frames over a pub/sub bus; the
//!   daemon answers each with an ack or reject decision frame.
//! - Side effects of executed commands are published to the device's event
//!   channel with bounded retries.
//! - Multi-device sessions encrypt outbound payloads once per participant.
//! - Clients follow a session's live activity through an event stream over
//!   a Unix socket or a shared-memory ring.
//!
//! # Modules
//!
//! - [`protocol`] - Command/decision frame codec
//! - [`bus`] - Pub/sub capability and in-process implementation
//! - [`transport`] - Inbound consumer and outbound publisher
//! - [`bridge`] - Daemon command loop tying the transport to a handler
//! - [`session`] - Multi-device sessions and per-participant encryption
//! - [`stream`] - Per-session daemon event streams
//! - [`config`] - Configuration loading/saving

pub mod bridge;
pub mod bus;
pub mod config;
pub mod constants;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use bridge::{BridgeStats, CommandBridge, CommandHandler, HandlerOutcome};
pub use bus::{Bus, MemoryBus};
pub use config::Config;
pub use protocol::{CommandFrame, DaemonDecisionFrame, Decision, FrameError};
pub use session::{SessionError, SessionManager};
pub use stream::{DaemonEvent, EventStream, StreamError};
pub use transport::{TransportConsumer, TransportError, TransportPublisher};
