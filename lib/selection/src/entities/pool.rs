use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spool_core::protocols::PoolMode;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A storage node as the selection unit sees it.
///
/// Created or refreshed on receipt of a heartbeat; removed only by explicit
/// administrative command. The heartbeat timestamp is atomic so a no-op
/// heartbeat can refresh it under the shared read lock.
#[derive(Debug)]
pub struct Pool {
    name: String,
    pub address: String,
    pub hostname: Option<String>,
    pub enabled: bool,
    pub read_only: bool,
    pub mode: PoolMode,
    /// Restart generation counter reported by the pool; 0 while down.
    pub serial: u64,
    pub hsm_instances: BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
    /// Pool groups this pool belongs to (always includes the default group).
    pub pgroups: BTreeSet<String>,
    /// Links targeting this pool directly.
    pub links: BTreeSet<String>,
    active_at: AtomicU64,
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            address: self.address.clone(),
            hostname: self.hostname.clone(),
            enabled: self.enabled,
            read_only: self.read_only,
            mode: self.mode,
            serial: self.serial,
            hsm_instances: self.hsm_instances.clone(),
            tags: self.tags.clone(),
            pgroups: self.pgroups.clone(),
            links: self.links.clone(),
            active_at: AtomicU64::new(self.active_at.load(Ordering::Relaxed)),
        }
    }
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: String::new(),
            hostname: None,
            enabled: true,
            read_only: false,
            mode: PoolMode::new(0),
            serial: 0,
            hsm_instances: BTreeSet::new(),
            tags: BTreeMap::new(),
            pgroups: BTreeSet::new(),
            links: BTreeSet::new(),
            active_at: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn touch(&self) {
        self.active_at.store(now_millis(), Ordering::Relaxed);
    }

    pub fn heartbeat_age(&self) -> Duration {
        let at = self.active_at.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(at))
    }

    pub fn is_active(&self, timeout: Duration) -> bool {
        self.active_at.load(Ordering::Relaxed) != 0 && self.heartbeat_age() < timeout
    }

    pub fn can_read(&self) -> bool {
        self.enabled && self.mode.may_read()
    }

    pub fn can_write(&self) -> bool {
        self.enabled && !self.read_only && self.mode.may_write()
    }

    /// Staging writes a fresh replica into the pool.
    pub fn can_read_from_tape(&self) -> bool {
        self.enabled && !self.read_only && self.mode.may_stage()
    }

    /// Eligible as a pool-to-pool source.
    pub fn can_read_for_p2p(&self) -> bool {
        self.enabled && self.mode.may_p2p_server()
    }

    /// Eligible as a pool-to-pool destination.
    pub fn can_write_for_p2p(&self) -> bool {
        self.enabled && !self.read_only && self.mode.may_p2p_client()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_predicates() {
        let mut p = Pool::new("pool1");
        p.mode = PoolMode::enabled();
        assert!(p.can_read() && p.can_write() && p.can_read_from_tape());
        assert!(p.can_read_for_p2p() && p.can_write_for_p2p());

        p.read_only = true;
        assert!(p.can_read());
        assert!(!p.can_write());
        assert!(!p.can_read_from_tape());
        assert!(p.can_read_for_p2p());
        assert!(!p.can_write_for_p2p());

        p.read_only = false;
        p.enabled = false;
        assert!(!p.can_read() && !p.can_write());
    }

    #[test]
    fn test_activity_tracking() {
        let p = Pool::new("pool1");
        let timeout = Duration::from_secs(300);
        assert!(!p.is_active(timeout), "never-seen pool must be inactive");

        p.touch();
        assert!(p.is_active(timeout));
        assert!(!p.is_active(Duration::ZERO));
    }
}
