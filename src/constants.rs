//! Crate-wide constants for botster-remote.
//!
//! Timing and sizing values shared by the transport, session, and stream
//! layers. Each value here is also the default for the matching field in
//! [`crate::config::Config`].
//!
//! # Categories
//!
//! - **Transport**: Bus publish timeouts and retry limits
//! - **Sessions**: Lifetime of multi-device sessions
//! - **Event stream**: Socket handshake and shared-memory polling
//! - **Reconnect**: Connection-level exponential backoff

use std::time::Duration;

// ============================================================================
// Transport
// ============================================================================

/// Capacity of the consumer's delivery channel.
///
/// A capacity of one keeps at most one command in flight: the forwarding
/// task blocks until the daemon has taken the previous message.
pub const CONSUMER_BUFFER_SIZE: usize = 1;

/// Timeout applied to each individual publish attempt.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of publish attempts before giving up.
pub const PUBLISH_MAX_RETRIES: u32 = 3;

/// Fixed delay between publish attempts.
///
/// Total wait is bounded by
/// `(PUBLISH_MAX_RETRIES - 1) * PUBLISH_RETRY_DELAY` plus attempt timeouts.
pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Sessions
// ============================================================================

/// Default lifetime of a multi-device session.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(60 * 60);

/// Interval between expiry sweeps when the caller runs a sweeper task.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Event stream
// ============================================================================

/// Time allowed for the `sessionSubscribe` handshake to complete.
pub const STREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between attempts to open a shared-memory region that the host
/// has not created yet.
pub const SHM_OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum number of open attempts before giving up (about 10 seconds).
pub const SHM_OPEN_MAX_ATTEMPTS: u32 = 200;

/// Poll interval for the shared-memory ring.
///
/// Must stay at or below 5ms for interactive latency.
pub const SHM_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Capacity of the per-subscription event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Reconnect
// ============================================================================

/// Initial backoff for connection-level reconnects.
///
/// Distinct from [`PUBLISH_RETRY_DELAY`]: reconnects back off
/// exponentially, publishes retry on a fixed delay.
pub const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for connection-level reconnect backoff.
pub const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);
