//! Session table and controller.
//!
//! The controller is the façade the control-channel collaborator drives:
//! `allocate_session` reserves ports, `start_session` promotes a reservation
//! and launches the relay loops, `stop_session` tears down, `lookup` reads.
//! It coordinates the port pool, the session table, the per-session relay
//! tasks, the pending-reservation reaper, and a cleanup task that closes
//! sessions whose relay loops died on a fatal socket error.
//!
//! Locking discipline: the table `RwLock` is held only long enough to
//! fetch/insert/remove an entry; every state transition happens under that
//! session's own lock, so operations on different calls do not block each
//! other beyond the pool's short critical sections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::port::{PoolUsage, PortPool};
use crate::relay::RelayHandle;
use crate::types::{CallId, MediaKind, RelayConfig, SessionState};

pub mod types;
mod reaper;


pub use types::{CloseReason, SessionEvent, SessionSnapshot};

use types::{SessionHandle, SessionRecord};

/// State shared between the controller and its background tasks.
pub(crate) struct Shared {
    pub(crate) config: RelayConfig,
    pub(crate) pool: PortPool,
    pub(crate) sessions: RwLock<HashMap<CallId, Arc<SessionHandle>>>,
    pub(crate) event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    /// Fetch a session's entry without holding the table lock afterwards.
    pub(crate) async fn handle_for(&self, call_id: &CallId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Common close path for stop, expiry, idle close and transport failure.
    ///
    /// Caller holds the per-session lock and has verified the session is not
    /// already `Closed`. Halts the relay loops (bounded, cancellable wait),
    /// returns the ports to the pool exactly once, marks the record `Closed`
    /// and removes it from the table.
    pub(crate) async fn finish_close(&self, rec: &mut SessionRecord, reason: CloseReason) {
        if let Some(relay) = rec.relay.take() {
            relay.shutdown().await;
        }

        if let Err(e) = self.pool.release(&[rec.port_a, rec.port_b]) {
            // Cannot happen while the pool/session invariant holds
            error!("Failed to release ports for call {}: {}", rec.call_id, e);
        }

        rec.state = SessionState::Closed;
        self.sessions.write().await.remove(&rec.call_id);

        let _ = self.event_tx.send(SessionEvent::SessionClosed {
            call_id: rec.call_id.clone(),
            reason,
        });

        info!(
            "Closed session for call {} ({}); ports {} and {} freed",
            rec.call_id, reason, rec.port_a, rec.port_b
        );
    }
}

/// Session controller: the engine's external interface.
pub struct SessionController {
    shared: Arc<Shared>,
    /// Relay loops post here when they die on a fatal socket error
    failure_tx: mpsc::UnboundedSender<CallId>,
    /// Event receiver (taken by the user)
    event_rx: RwLock<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    /// Cancels the reaper and the failure cleanup task
    shutdown_token: CancellationToken,
    background: RwLock<Vec<JoinHandle<()>>>,
}

impl SessionController {
    /// Create a controller and launch its background tasks.
    pub fn new(config: RelayConfig) -> Result<Self> {
        if config.port_range_start == 0 {
            return Err(Error::config("port range must not start at 0"));
        }
        if config.port_range_start > config.port_range_end {
            return Err(Error::config(format!(
                "port range start {} is above end {}",
                config.port_range_start, config.port_range_end
            )));
        }
        if (config.port_range_end - config.port_range_start + 1) < 2 {
            return Err(Error::config("port range must contain at least two ports"));
        }
        if config.max_packet_size == 0 {
            return Err(Error::config("max packet size must be non-zero"));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            pool: PortPool::new(config.port_range_start, config.port_range_end),
            config,
            sessions: RwLock::new(HashMap::new()),
            event_tx,
        });

        let shutdown_token = CancellationToken::new();
        let reaper_task = reaper::spawn(shared.clone(), shutdown_token.clone());
        let cleanup_task = spawn_failure_cleanup(shared.clone(), failure_rx, shutdown_token.clone());

        info!(
            "Session controller started: port range {}-{}, reservation timeout {:?}",
            shared.config.port_range_start,
            shared.config.port_range_end,
            shared.config.reservation_timeout
        );

        Ok(Self {
            shared,
            failure_tx,
            event_rx: RwLock::new(Some(event_rx)),
            shutdown_token,
            background: RwLock::new(vec![reaper_task, cleanup_task]),
        })
    }

    /// Reserve a pair of ports and create a `Reserved` session for `call_id`.
    ///
    /// Fails with `DuplicateCallId` if a session already exists for the call,
    /// or `PoolExhausted` if fewer than two ports are free (the pool is left
    /// unchanged). The reservation expires via the reaper unless
    /// [`start_session`](Self::start_session) is called within the grace
    /// window.
    pub async fn allocate_session(
        &self,
        call_id: CallId,
        media_kind: MediaKind,
    ) -> Result<SessionSnapshot> {
        let mut sessions = self.shared.sessions.write().await;

        if sessions.contains_key(&call_id) {
            return Err(Error::duplicate_call_id(&call_id));
        }

        let ports = self.shared.pool.reserve(2, &call_id)?;
        let (port_a, port_b) = (ports[0], ports[1]);

        let record = SessionRecord {
            call_id: call_id.clone(),
            media_kind,
            port_a,
            port_b,
            state: SessionState::Reserved,
            reserved_at: Instant::now(),
            relay: None,
        };
        let snapshot = record.snapshot();
        sessions.insert(call_id.clone(), Arc::new(SessionHandle::new(record)));
        drop(sessions);

        let _ = self.shared.event_tx.send(SessionEvent::SessionReserved {
            call_id: call_id.clone(),
            media_kind,
            port_a,
            port_b,
        });

        info!(
            "Reserved ports {} and {} for call {} ({})",
            port_a, port_b, call_id, media_kind
        );
        Ok(snapshot)
    }

    /// Promote a `Reserved` session to `Active` and launch its relay loops.
    ///
    /// Fails with `UnknownCallId` if absent, `InvalidState` if not
    /// `Reserved`, or `Transport` if a relay socket cannot be bound. On a
    /// bind failure the session stays `Reserved` with its ports, so the
    /// caller may retry or stop it; the reaper is the backstop.
    pub async fn start_session(&self, call_id: &CallId) -> Result<()> {
        let handle = self
            .shared
            .handle_for(call_id)
            .await
            .ok_or_else(|| Error::unknown_call_id(call_id))?;
        let mut rec = handle.record.lock().await;

        if rec.state != SessionState::Reserved {
            return Err(Error::invalid_state(call_id, rec.state));
        }

        let bind_addr = self.shared.config.bind_addr;
        let socket_a = bind_relay_socket(bind_addr, rec.port_a).await?;
        let socket_b = bind_relay_socket(bind_addr, rec.port_b).await?;

        self.shared.pool.commit(&[rec.port_a, rec.port_b], call_id)?;

        rec.relay = Some(RelayHandle::spawn(
            call_id.clone(),
            Arc::new(socket_a),
            Arc::new(socket_b),
            self.shared.config.max_packet_size,
            self.failure_tx.clone(),
        ));
        rec.state = SessionState::Active;
        drop(rec);

        let _ = self.shared.event_tx.send(SessionEvent::SessionStarted {
            call_id: call_id.clone(),
        });

        info!("Started relay for call {}", call_id);
        Ok(())
    }

    /// Stop a session: halt its relay loops, free its ports, remove it.
    ///
    /// Fails with `UnknownCallId` if no session exists for the call. A stop
    /// that races another close and still holds the record observes `Closed`
    /// and returns Ok without touching the pool again.
    pub async fn stop_session(&self, call_id: &CallId) -> Result<()> {
        let handle = self
            .shared
            .handle_for(call_id)
            .await
            .ok_or_else(|| Error::unknown_call_id(call_id))?;
        let mut rec = handle.record.lock().await;

        if rec.state == SessionState::Closed {
            return Ok(());
        }

        self.shared.finish_close(&mut rec, CloseReason::Stopped).await;
        Ok(())
    }

    /// Read-only snapshot of a session, if one exists for the call.
    pub async fn lookup(&self, call_id: &CallId) -> Option<SessionSnapshot> {
        let handle = self.shared.handle_for(call_id).await?;
        let rec = handle.record.lock().await;
        Some(rec.snapshot())
    }

    /// Snapshots of all live sessions.
    pub async fn all_sessions(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<Arc<SessionHandle>> =
            self.shared.sessions.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.record.lock().await.snapshot());
        }
        snapshots
    }

    /// Number of live (non-`Closed`) sessions.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Current port pool occupancy.
    pub fn pool_usage(&self) -> PoolUsage {
        self.shared.pool.usage()
    }

    /// Engine configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Get event receiver (can only be called once).
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        let mut event_rx = self.event_rx.write().await;
        event_rx.take()
    }

    /// Stop the background tasks and close every live session.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        for task in self.background.write().await.drain(..) {
            let _ = task.await;
        }

        let call_ids: Vec<CallId> = self.shared.sessions.read().await.keys().cloned().collect();
        for call_id in call_ids {
            if let Err(e) = self.stop_session(&call_id).await {
                debug!("Session {} already gone during shutdown: {}", call_id, e);
            }
        }

        info!("Session controller shut down");
    }
}

async fn bind_relay_socket(addr: std::net::IpAddr, port: u16) -> Result<UdpSocket> {
    let socket_addr = SocketAddr::new(addr, port);
    UdpSocket::bind(socket_addr)
        .await
        .map_err(|e| Error::transport(format!("failed to bind {socket_addr}: {e}")))
}

/// Closes sessions whose relay loops reported a fatal socket error, so the
/// control collaborator's next `lookup` reflects reality instead of a
/// phantom active session.
fn spawn_failure_cleanup(
    shared: Arc<Shared>,
    mut failure_rx: mpsc::UnboundedReceiver<CallId>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_failed = failure_rx.recv() => match maybe_failed {
                    Some(call_id) => {
                        let Some(handle) = shared.handle_for(&call_id).await else {
                            continue; // already torn down
                        };
                        let mut rec = handle.record.lock().await;
                        if rec.state == SessionState::Closed {
                            continue;
                        }
                        warn!("Closing session {} after relay transport failure", call_id);
                        shared.finish_close(&mut rec, CloseReason::TransportFailed).await;
                    }
                    None => break,
                }
            }
        }
        debug!("Failure cleanup task exited");
    })
}
