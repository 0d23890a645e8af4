//! Port pool for relay media transport.
//!
//! Tracks every port in the configured `[range_start, range_end]` window as
//! Free, Reserved, or InUse in a single map, so port status and session
//! bookkeeping can never fall out of sync. Reservations are granted
//! lowest-available-first to keep allocation patterns predictable.
//!
//! All methods take `&self` and synchronize through one short-held lock that
//! is never held across an await point, so pool calls stay off the relay
//! hot path.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::CallId;

/// Status of a single port in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortStatus {
    /// Available for reservation
    Free,
    /// Granted to a session whose relay has not started yet
    Reserved {
        /// Session holding the reservation
        owner: CallId,
        /// When the reservation was made
        since: Instant,
    },
    /// Owned by an active session
    InUse {
        /// Session using the port
        owner: CallId,
    },
}

/// Snapshot of pool occupancy, used for reporting and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolUsage {
    /// Ports available for reservation
    pub free: usize,
    /// Ports granted but not yet committed
    pub reserved: usize,
    /// Ports owned by active sessions
    pub in_use: usize,
}

/// Pool of transport ports shared by all sessions.
pub struct PortPool {
    range_start: u16,
    range_end: u16,
    ports: Mutex<BTreeMap<u16, PortStatus>>,
}

impl PortPool {
    /// Create a pool covering `[range_start, range_end]` inclusive, all Free.
    pub fn new(range_start: u16, range_end: u16) -> Self {
        let ports = (range_start..=range_end)
            .map(|port| (port, PortStatus::Free))
            .collect();

        Self {
            range_start,
            range_end,
            ports: Mutex::new(ports),
        }
    }

    /// Reserve `count` distinct free ports for `owner`.
    ///
    /// Ports are chosen lowest-available-first. All-or-nothing: on
    /// `PoolExhausted` the pool is left unchanged.
    pub fn reserve(&self, count: usize, owner: &CallId) -> Result<Vec<u16>> {
        let mut ports = self.ports.lock();

        let chosen: Vec<u16> = ports
            .iter()
            .filter(|(_, status)| **status == PortStatus::Free)
            .map(|(port, _)| *port)
            .take(count)
            .collect();

        if chosen.len() < count {
            return Err(Error::PoolExhausted {
                requested: count,
                free: chosen.len(),
            });
        }

        let since = Instant::now();
        for port in &chosen {
            ports.insert(
                *port,
                PortStatus::Reserved {
                    owner: owner.clone(),
                    since,
                },
            );
        }

        debug!("Reserved ports {:?} for call {}", chosen, owner);
        Ok(chosen)
    }

    /// Promote previously reserved ports to InUse.
    ///
    /// Idempotent when a port is already InUse by the same owner. Fails with
    /// `InvalidPort` if any port is Free, outside the range, or held by a
    /// different session; nothing is committed in that case.
    pub fn commit(&self, ports: &[u16], owner: &CallId) -> Result<()> {
        let mut pool = self.ports.lock();

        // Validate the whole set before mutating anything
        for port in ports {
            match pool.get(port) {
                None => return Err(Error::invalid_port(*port, "outside configured range")),
                Some(PortStatus::Free) => {
                    return Err(Error::invalid_port(*port, "commit of a free port"))
                }
                Some(PortStatus::Reserved { owner: o, .. })
                | Some(PortStatus::InUse { owner: o }) => {
                    if o != owner {
                        return Err(Error::invalid_port(
                            *port,
                            format!("owned by call {o}, not {owner}"),
                        ));
                    }
                }
            }
        }

        for port in ports {
            pool.insert(
                *port,
                PortStatus::InUse {
                    owner: owner.clone(),
                },
            );
        }

        debug!("Committed ports {:?} for call {}", ports, owner);
        Ok(())
    }

    /// Return ports to the Free state, whatever their prior non-Free status.
    ///
    /// Double release or an out-of-range port is a lifecycle bug and is
    /// surfaced as `InvalidPort` rather than silently ignored; in that case
    /// no port in the set is released.
    pub fn release(&self, ports: &[u16]) -> Result<()> {
        let mut pool = self.ports.lock();

        for port in ports {
            match pool.get(port) {
                None => return Err(Error::invalid_port(*port, "outside configured range")),
                Some(PortStatus::Free) => {
                    return Err(Error::invalid_port(*port, "already free (double release)"))
                }
                Some(_) => {}
            }
        }

        for port in ports {
            pool.insert(*port, PortStatus::Free);
        }

        debug!("Released ports {:?}", ports);
        Ok(())
    }

    /// Current status of a port, or `None` when outside the range.
    pub fn status_of(&self, port: u16) -> Option<PortStatus> {
        self.ports.lock().get(&port).cloned()
    }

    /// Current pool occupancy.
    pub fn usage(&self) -> PoolUsage {
        let pool = self.ports.lock();
        let mut usage = PoolUsage::default();
        for status in pool.values() {
            match status {
                PortStatus::Free => usage.free += 1,
                PortStatus::Reserved { .. } => usage.reserved += 1,
                PortStatus::InUse { .. } => usage.in_use += 1,
            }
        }
        usage
    }

    /// Number of free ports.
    pub fn free_count(&self) -> usize {
        self.usage().free
    }

    /// Total number of ports in the configured range.
    pub fn capacity(&self) -> usize {
        // In usize so a full u16 range does not overflow the +1
        self.range_end as usize - self.range_start as usize + 1
    }

    /// First port of the configured range.
    pub fn range_start(&self) -> u16 {
        self.range_start
    }

    /// Last port of the configured range.
    pub fn range_end(&self) -> u16 {
        self.range_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> CallId {
        CallId::from(id)
    }

    #[test]
    fn test_reserve_lowest_first() {
        let pool = PortPool::new(20000, 20009);

        let ports = pool.reserve(2, &call("a")).unwrap();
        assert_eq!(ports, vec![20000, 20001]);

        let ports = pool.reserve(2, &call("b")).unwrap();
        assert_eq!(ports, vec![20002, 20003]);

        assert_eq!(pool.usage().reserved, 4);
        assert_eq!(pool.usage().free, 6);
    }

    #[test]
    fn test_exhaustion_leaves_pool_unchanged() {
        let pool = PortPool::new(20010, 20012);
        pool.reserve(2, &call("a")).unwrap();

        let before = pool.usage();
        let err = pool.reserve(2, &call("b")).unwrap_err();
        assert!(matches!(
            err,
            Error::PoolExhausted {
                requested: 2,
                free: 1
            }
        ));
        assert_eq!(pool.usage(), before);

        // The single remaining port is still reservable
        let ports = pool.reserve(1, &call("c")).unwrap();
        assert_eq!(ports, vec![20012]);
    }

    #[test]
    fn test_commit_is_idempotent_for_same_owner() {
        let pool = PortPool::new(20020, 20029);
        let owner = call("a");
        let ports = pool.reserve(2, &owner).unwrap();

        pool.commit(&ports, &owner).unwrap();
        pool.commit(&ports, &owner).unwrap();

        assert_eq!(pool.usage().in_use, 2);
        assert_eq!(pool.usage().reserved, 0);
    }

    #[test]
    fn test_commit_rejects_wrong_owner_and_free_ports() {
        let pool = PortPool::new(20030, 20039);
        let ports = pool.reserve(2, &call("a")).unwrap();

        let err = pool.commit(&ports, &call("b")).unwrap_err();
        assert!(matches!(err, Error::InvalidPort { .. }));

        let err = pool.commit(&[20035], &call("a")).unwrap_err();
        assert!(matches!(err, Error::InvalidPort { port: 20035, .. }));

        // Failed commits must not have mutated anything
        assert_eq!(pool.usage().reserved, 2);
        assert_eq!(pool.usage().in_use, 0);
    }

    #[test]
    fn test_release_and_double_release() {
        let pool = PortPool::new(20040, 20049);
        let owner = call("a");
        let ports = pool.reserve(2, &owner).unwrap();
        pool.commit(&ports, &owner).unwrap();

        pool.release(&ports).unwrap();
        assert_eq!(pool.free_count(), pool.capacity());

        let err = pool.release(&ports).unwrap_err();
        assert!(matches!(err, Error::InvalidPort { .. }));
    }

    #[test]
    fn test_release_out_of_range() {
        let pool = PortPool::new(20050, 20059);
        let err = pool.release(&[19999]).unwrap_err();
        assert!(matches!(err, Error::InvalidPort { port: 19999, .. }));
    }

    #[test]
    fn test_released_ports_are_immediately_reusable() {
        let pool = PortPool::new(20060, 20069);
        let ports = pool.reserve(2, &call("a")).unwrap();
        pool.release(&ports).unwrap();

        // No quarantine: the same lowest ports come back on the next reserve
        let again = pool.reserve(2, &call("b")).unwrap();
        assert_eq!(again, ports);
    }

    #[test]
    fn test_capacity_spans_full_port_range() {
        let pool = PortPool::new(0, u16::MAX);
        assert_eq!(pool.capacity(), 65536);
        assert_eq!(pool.free_count(), 65536);
    }

    #[test]
    fn test_status_of() {
        let pool = PortPool::new(20070, 20079);
        assert_eq!(pool.status_of(20070), Some(PortStatus::Free));
        assert_eq!(pool.status_of(30000), None);

        let owner = call("a");
        pool.reserve(1, &owner).unwrap();
        assert!(matches!(
            pool.status_of(20070),
            Some(PortStatus::Reserved { owner: o, .. }) if o == owner
        ));
    }
}
