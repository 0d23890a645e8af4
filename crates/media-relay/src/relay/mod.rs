//! Bidirectional datagram forwarding for active sessions.
//!
//! Each active session runs two forwarding loops, one per owned port. A loop
//! latches the source address of the first datagram it sees as that side's
//! peer, re-latches when the source changes (trust-the-last-sender, not an
//! authentication mechanism), and forwards payloads verbatim out of the
//! paired port to the peer learned on the opposite side. Until the opposite
//! side has latched, datagrams are dropped because no destination is known.
//!
//! Loops suspend only while waiting for the next datagram, and that wait is
//! cancellable, so stopping a session never depends on traffic arriving.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::CallId;

/// Which of the session's two ports a forwarding loop serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    A,
    B,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// Outcome of offering a datagram source to a peer latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchOutcome {
    /// First datagram on this side; peer learned
    First,
    /// Same source as before
    Unchanged,
    /// Source changed; latch moved to the new address
    Moved(SocketAddr),
}

/// Learned peer address for one side of a session.
///
/// Shared between both forwarding loops: each loop writes its own side's
/// latch and reads the opposite side's as its forwarding target.
pub(crate) struct PeerLatch {
    addr: Mutex<Option<SocketAddr>>,
}

impl PeerLatch {
    pub(crate) fn new() -> Self {
        Self {
            addr: Mutex::new(None),
        }
    }

    /// Current latched address, if any datagram has been seen.
    pub(crate) fn get(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }

    /// Record `src` as this side's peer, replacing a previous address if the
    /// sender moved (e.g. NAT rebinding mid-call).
    pub(crate) fn latch(&self, src: SocketAddr) -> LatchOutcome {
        let mut addr = self.addr.lock();
        match *addr {
            None => {
                *addr = Some(src);
                LatchOutcome::First
            }
            Some(current) if current == src => LatchOutcome::Unchanged,
            Some(current) => {
                *addr = Some(src);
                LatchOutcome::Moved(current)
            }
        }
    }
}

/// Tracks when a session last forwarded a datagram.
///
/// Written from the forwarding loops without locks; read by the snapshot
/// path and the reaper's idle sweep.
pub(crate) struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub(crate) fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last recorded activity (or since relay start when no
    /// datagram has been forwarded yet).
    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Per-session forwarding counters, updated from the loops via atomics.
#[derive(Default)]
pub(crate) struct RelayStatsInner {
    packets_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
    packets_dropped: AtomicU64,
}

impl RelayStatsInner {
    fn record_forwarded(&self, bytes: usize) {
        self.packets_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            packets_relayed: self.packets_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Relay statistics for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Datagrams forwarded to a learned peer
    pub packets_relayed: u64,
    /// Payload bytes forwarded
    pub bytes_relayed: u64,
    /// Datagrams dropped (no peer learned yet, oversized, or send failure)
    pub packets_dropped: u64,
}

/// Handle to a session's pair of forwarding loops.
///
/// Owned by the session record; dropping it without calling [`shutdown`]
/// leaves tasks running, so teardown always goes through the controller.
///
/// [`shutdown`]: RelayHandle::shutdown
pub(crate) struct RelayHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pub(crate) peer_a: Arc<PeerLatch>,
    pub(crate) peer_b: Arc<PeerLatch>,
    pub(crate) activity: Arc<ActivityClock>,
    pub(crate) stats: Arc<RelayStatsInner>,
}

impl RelayHandle {
    /// Spawn both forwarding loops for a session.
    ///
    /// `socket_a`/`socket_b` are already bound to the session's two ports.
    /// A loop that hits a fatal socket error posts the call id on
    /// `failure_tx` so the controller can close the session.
    pub(crate) fn spawn(
        call_id: CallId,
        socket_a: Arc<UdpSocket>,
        socket_b: Arc<UdpSocket>,
        max_packet_size: usize,
        failure_tx: mpsc::UnboundedSender<CallId>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let peer_a = Arc::new(PeerLatch::new());
        let peer_b = Arc::new(PeerLatch::new());
        let activity = Arc::new(ActivityClock::new());
        let stats = Arc::new(RelayStatsInner::default());

        let loop_a = tokio::spawn(relay_loop(RelayLoop {
            call_id: call_id.clone(),
            side: Side::A,
            recv_socket: socket_a.clone(),
            send_socket: socket_b.clone(),
            near: peer_a.clone(),
            far: peer_b.clone(),
            activity: activity.clone(),
            stats: stats.clone(),
            max_packet_size,
            cancel: cancel.clone(),
            failure_tx: failure_tx.clone(),
        }));

        let loop_b = tokio::spawn(relay_loop(RelayLoop {
            call_id,
            side: Side::B,
            recv_socket: socket_b,
            send_socket: socket_a,
            near: peer_b.clone(),
            far: peer_a.clone(),
            activity: activity.clone(),
            stats: stats.clone(),
            max_packet_size,
            cancel: cancel.clone(),
            failure_tx,
        }));

        Self {
            cancel,
            tasks: vec![loop_a, loop_b],
            peer_a,
            peer_b,
            activity,
            stats,
        }
    }

    /// Cancel both loops and wait for them to exit.
    ///
    /// Completes in bounded time regardless of traffic: the loops' receive
    /// waits are interrupted by the cancellation token.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Everything one forwarding loop needs; `near` is the latch for the side
/// this loop receives on, `far` the forwarding target learned by the other.
struct RelayLoop {
    call_id: CallId,
    side: Side,
    recv_socket: Arc<UdpSocket>,
    send_socket: Arc<UdpSocket>,
    near: Arc<PeerLatch>,
    far: Arc<PeerLatch>,
    activity: Arc<ActivityClock>,
    stats: Arc<RelayStatsInner>,
    max_packet_size: usize,
    cancel: CancellationToken,
    failure_tx: mpsc::UnboundedSender<CallId>,
}

async fn relay_loop(ctx: RelayLoop) {
    // One extra byte so an exactly-max datagram is distinguishable from a
    // truncated oversized one.
    let mut buf = vec![0u8; ctx.max_packet_size + 1];

    debug!("Relay loop {} started for call {}", ctx.side, ctx.call_id);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("Relay loop {} for call {} cancelled", ctx.side, ctx.call_id);
                break;
            }
            result = ctx.recv_socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    match ctx.near.latch(src) {
                        LatchOutcome::First => {
                            info!("Call {}: latched peer {} on side {}", ctx.call_id, src, ctx.side);
                        }
                        LatchOutcome::Moved(old) => {
                            debug!(
                                "Call {}: side {} peer moved {} -> {}",
                                ctx.call_id, ctx.side, old, src
                            );
                        }
                        LatchOutcome::Unchanged => {}
                    }

                    if len > ctx.max_packet_size {
                        warn!(
                            "Call {}: dropping oversized datagram on side {} ({} bytes)",
                            ctx.call_id, ctx.side, len
                        );
                        ctx.stats.record_dropped();
                        continue;
                    }

                    match ctx.far.get() {
                        Some(dst) => match ctx.send_socket.send_to(&buf[..len], dst).await {
                            Ok(_) => {
                                ctx.activity.touch();
                                ctx.stats.record_forwarded(len);
                            }
                            Err(e) => {
                                warn!(
                                    "Call {}: send to {} failed on side {}: {}",
                                    ctx.call_id, dst, ctx.side, e
                                );
                                ctx.stats.record_dropped();
                            }
                        },
                        None => {
                            // No peer learned on the other side yet
                            ctx.stats.record_dropped();
                        }
                    }
                }
                Err(e) if is_transient(&e) => {
                    warn!(
                        "Call {}: transient receive error on side {}: {}",
                        ctx.call_id, ctx.side, e
                    );
                }
                Err(e) => {
                    error!(
                        "Call {}: fatal receive error on side {}: {}",
                        ctx.call_id, ctx.side, e
                    );
                    // Tell the controller to close the session; if it is
                    // already being torn down the notification is ignored.
                    let _ = ctx.failure_tx.send(ctx.call_id.clone());
                    break;
                }
            }
        }
    }

    debug!("Relay loop {} for call {} exited", ctx.side, ctx.call_id);
}

/// Receive errors that do not invalidate the socket. UDP sockets surface
/// ICMP unreachable notifications for earlier sends as ConnectionReset or
/// ConnectionRefused on receive; the socket itself is still usable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
