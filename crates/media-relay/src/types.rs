//! Core identifier and configuration types shared across the relay engine.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port range for relay media.
///
/// The 16384-32767 window is the range commonly carved out for RTP media
/// on relay deployments; it stays clear of privileged and ephemeral ports.
pub const DEFAULT_PORT_RANGE_START: u16 = 16384;
pub const DEFAULT_PORT_RANGE_END: u16 = 32767;

/// Opaque call identifier supplied by the signaling/control collaborator.
///
/// Stable for the lifetime of a session and unique within the session table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    /// Create a new call identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of media carried by a session.
///
/// Informational only: audio and video legs are independent sessions and
/// the relay forwards both as opaque datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle state of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Ports granted, relay not yet started; expires after the grace window
    Reserved,
    /// Relay loops running, forwarding traffic
    Active,
    /// Torn down; ports returned to the pool, record removed from the table
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Reserved => write!(f, "reserved"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Configuration for the relay engine.
///
/// Consumed from process bootstrap; loading it from a file or CLI is the
/// embedding application's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Local address relay sockets bind to
    pub bind_addr: IpAddr,
    /// First port of the allocation range (inclusive)
    pub port_range_start: u16,
    /// Last port of the allocation range (inclusive)
    pub port_range_end: u16,
    /// Grace window for reserved-but-unstarted sessions before the reaper
    /// expires them
    pub reservation_timeout: Duration,
    /// Interval between reaper sweeps
    pub reaper_interval: Duration,
    /// Close active sessions with no forwarded traffic for this long.
    /// Off by default; correctness does not depend on it.
    pub idle_timeout: Option<Duration>,
    /// Largest datagram the relay will forward; anything bigger is dropped
    pub max_packet_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            reservation_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(10),
            idle_timeout: None,
            max_packet_size: 1500,
        }
    }
}
