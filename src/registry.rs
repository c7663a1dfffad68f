// ABOUTME: The acceptor's connection set and per-remote-IP map, sharing one lock
// ABOUTME: Acquisition order never needs stating explicitly here: both live behind a single mutex

use crate::connection::ConnectionHandle;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

struct Inner {
    cnxns: HashMap<SocketAddr, ConnectionHandle>,
    by_ip: HashMap<IpAddr, HashSet<SocketAddr>>,
}

/// Shared across every connection task and the acceptor itself. `cnxns`
/// and the per-IP map share one lock acquired in a fixed order by
/// construction: collapsing them into a single guarded struct makes that
/// order structural rather than a convention callers must remember.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
    trace_mask: Arc<AtomicI64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            inner: Arc::new(Mutex::new(Inner {
                cnxns: HashMap::new(),
                // 2-bucket initial capacity: the common case is one
                // connection per remote IP.
                by_ip: HashMap::with_capacity(2),
            })),
            trace_mask: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn trace_mask(&self) -> i64 {
        self.trace_mask.load(Ordering::SeqCst)
    }

    pub fn set_trace_mask(&self, mask: i64) {
        self.trace_mask.store(mask, Ordering::SeqCst);
    }

    /// Admission check plus insertion, atomically under the registry's
    /// lock. `max_per_ip == 0` disables the cap.
    pub fn try_insert(&self, addr: SocketAddr, handle: ConnectionHandle, max_per_ip: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ip = addr.ip();
        let current = inner.by_ip.get(&ip).map_or(0, HashSet::len);
        if max_per_ip > 0 && current >= max_per_ip {
            return false;
        }
        inner.cnxns.insert(addr, handle);
        inner.by_ip.entry(ip).or_default().insert(addr);
        true
    }

    pub fn remove(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.cnxns.remove(&addr);
        let ip = addr.ip();
        if let Some(set) = inner.by_ip.get_mut(&ip) {
            set.remove(&addr);
            if set.is_empty() {
                inner.by_ip.remove(&ip);
            }
        }
    }

    pub fn find_by_session(&self, session_id: i64) -> Option<ConnectionHandle> {
        let inner = self.inner.lock().unwrap();
        inner.cnxns.values().find(|h| h.session_id() == session_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.inner.lock().unwrap().cnxns.values().cloned().collect()
    }

    pub fn ip_count(&self, ip: IpAddr) -> usize {
        self.inner.lock().unwrap().by_ip.get(&ip).map_or(0, HashSet::len)
    }

    pub fn total_count(&self) -> usize {
        self.inner.lock().unwrap().cnxns.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn per_ip_cap_rejects_beyond_the_limit() {
        let registry = ConnectionRegistry::new();
        assert!(registry.try_insert(addr(1), ConnectionHandle::for_test(addr(1)), 2));
        assert!(registry.try_insert(addr(2), ConnectionHandle::for_test(addr(2)), 2));
        assert!(!registry.try_insert(addr(3), ConnectionHandle::for_test(addr(3)), 2));
        assert_eq!(registry.ip_count(addr(1).ip()), 2);
        assert_eq!(registry.total_count(), 2);
    }

    #[test]
    fn cap_of_zero_is_unlimited() {
        let registry = ConnectionRegistry::new();
        for port in 1..=5u16 {
            assert!(registry.try_insert(addr(port), ConnectionHandle::for_test(addr(port)), 0));
        }
        assert_eq!(registry.total_count(), 5);
    }

    #[test]
    fn remove_drops_from_both_the_set_and_the_ip_map() {
        let registry = ConnectionRegistry::new();
        registry.try_insert(addr(1), ConnectionHandle::for_test(addr(1)), 0);
        registry.remove(addr(1));
        assert_eq!(registry.total_count(), 0);
        assert_eq!(registry.ip_count(addr(1).ip()), 0);
    }

    #[test]
    fn find_by_session_matches_the_handshake_assigned_id() {
        let registry = ConnectionRegistry::new();
        let handle = ConnectionHandle::for_test(addr(1));
        handle.set_session_id_for_test(99);
        registry.try_insert(addr(1), handle, 0);
        assert!(registry.find_by_session(99).is_some());
        assert!(registry.find_by_session(100).is_none());
    }
}
