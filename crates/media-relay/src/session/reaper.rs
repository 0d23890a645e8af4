//! Pending-reservation reaper.
//!
//! A periodic task that releases ports granted to sessions whose relay never
//! started within the grace window, and (when an idle timeout is configured)
//! closes active sessions that have forwarded nothing for too long.
//!
//! Expiry takes the same per-session lock as `start_session`/`stop_session`:
//! whichever acquires it first wins, and the loser re-checks the state, so a
//! late start cannot race an expiry into a double release.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::SessionState;

use super::types::{CloseReason, SessionHandle};
use super::Shared;

pub(crate) fn spawn(shared: Arc<Shared>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(shared.config.reaper_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = sweep(&shared).await;
                    if reaped > 0 {
                        debug!("Reaper pass closed {} session(s)", reaped);
                    }
                }
            }
        }
        debug!("Reaper task exited");
    })
}

/// One reaper pass over all live sessions. Returns how many were closed.
pub(crate) async fn sweep(shared: &Shared) -> usize {
    let handles: Vec<Arc<SessionHandle>> =
        shared.sessions.read().await.values().cloned().collect();

    let mut closed = 0;
    for handle in handles {
        let mut rec = handle.record.lock().await;

        let reason = match rec.state {
            SessionState::Reserved
                if rec.reserved_at.elapsed() >= shared.config.reservation_timeout =>
            {
                Some(CloseReason::Expired)
            }
            SessionState::Active => {
                let idle_expired = match (shared.config.idle_timeout, rec.relay.as_ref()) {
                    (Some(limit), Some(relay)) => relay.activity.idle_for() >= limit,
                    _ => false,
                };
                idle_expired.then_some(CloseReason::Idle)
            }
            _ => None,
        };

        if let Some(reason) = reason {
            warn!(
                "Reaping session for call {} ({}); ports {} and {}",
                rec.call_id, reason, rec.port_a, rec.port_b
            );
            shared.finish_close(&mut rec, reason).await;
            closed += 1;
        }
    }
    closed
}
