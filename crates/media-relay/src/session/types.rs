//! Type definitions for the session table and controller.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::relay::{RelayHandle, RelayStats};
use crate::types::{CallId, MediaKind, SessionState};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit `stop_session` from the control collaborator
    Stopped,
    /// Reserved but never started within the grace window
    Expired,
    /// Active but idle longer than the configured idle timeout
    Idle,
    /// A relay loop hit a fatal socket error
    TransportFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::Expired => write!(f, "reservation expired"),
            CloseReason::Idle => write!(f, "idle timeout"),
            CloseReason::TransportFailed => write!(f, "transport failure"),
        }
    }
}

/// Events emitted by the session controller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Ports reserved, session created in `Reserved` state
    SessionReserved {
        call_id: CallId,
        media_kind: MediaKind,
        port_a: u16,
        port_b: u16,
    },
    /// Relay loops launched, session promoted to `Active`
    SessionStarted { call_id: CallId },
    /// Session closed, ports returned to the pool
    SessionClosed {
        call_id: CallId,
        reason: CloseReason,
    },
}

/// Read-only snapshot of one session, returned by `lookup`.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Call this session belongs to
    pub call_id: CallId,
    /// Media kind (informational)
    pub media_kind: MediaKind,
    /// Port facing participant A
    pub port_a: u16,
    /// Port facing participant B
    pub port_b: u16,
    /// Lifecycle state at snapshot time
    pub state: SessionState,
    /// When the ports were reserved
    pub reserved_at: Instant,
    /// Peer address latched on side A, once traffic has been seen there
    pub peer_a: Option<SocketAddr>,
    /// Peer address latched on side B
    pub peer_b: Option<SocketAddr>,
    /// Time since the last forwarded datagram; `None` while not active
    pub idle_for: Option<Duration>,
    /// Forwarding counters; `None` while not active
    pub stats: Option<RelayStats>,
}

/// Authoritative record for one session.
///
/// Mutated only under the owning [`SessionHandle`]'s lock.
pub(crate) struct SessionRecord {
    pub(crate) call_id: CallId,
    pub(crate) media_kind: MediaKind,
    pub(crate) port_a: u16,
    pub(crate) port_b: u16,
    pub(crate) state: SessionState,
    pub(crate) reserved_at: Instant,
    /// Present exactly while the session is `Active`
    pub(crate) relay: Option<RelayHandle>,
}

impl SessionRecord {
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let relay = self.relay.as_ref();
        SessionSnapshot {
            call_id: self.call_id.clone(),
            media_kind: self.media_kind,
            port_a: self.port_a,
            port_b: self.port_b,
            state: self.state,
            reserved_at: self.reserved_at,
            peer_a: relay.and_then(|r| r.peer_a.get()),
            peer_b: relay.and_then(|r| r.peer_b.get()),
            idle_for: relay.map(|r| r.activity.idle_for()),
            stats: relay.map(|r| r.stats.snapshot()),
        }
    }
}

/// Table entry: serializes all state transitions for one call id.
///
/// Controller operations fetch the `Arc` under the table lock, drop the
/// table lock, then take this per-session lock; racing operations on the
/// same call id are ordered here and the loser re-checks `state`.
pub(crate) struct SessionHandle {
    pub(crate) record: Mutex<SessionRecord>,
}

impl SessionHandle {
    pub(crate) fn new(record: SessionRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}
