// ABOUTME: Per-connection and server-wide counters surfaced by the diagnostic responders

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Running latency/packet statistics for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    min_latency: Option<Duration>,
    max_latency: Option<Duration>,
    total_latency: Duration,
    latency_samples: u64,
    pub last_cxid: i32,
    pub last_zxid: i64,
    pub last_op: Option<i32>,
    pub last_response_time: Option<Instant>,
    established: Instant,
    /// Receive time of each request still awaiting a response, keyed by
    /// xid. Requests on a connection can be outstanding concurrently (the
    /// pipeline answers them in whatever order it finishes), so latency is
    /// tracked per-xid rather than against a single "last received" clock.
    pending: HashMap<i32, Instant>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        ConnectionStats {
            packets_sent: 0,
            packets_received: 0,
            min_latency: None,
            max_latency: None,
            total_latency: Duration::ZERO,
            latency_samples: 0,
            last_cxid: 0,
            last_zxid: 0,
            last_op: None,
            last_response_time: None,
            established: Instant::now(),
            pending: HashMap::new(),
        }
    }

    pub fn record_received(&mut self, cxid: i32, op: i32) {
        self.packets_received += 1;
        self.last_cxid = cxid;
        self.last_op = Some(op);
        self.pending.insert(cxid, Instant::now());
    }

    /// Records a response to `cxid`/`zxid`, computing latency against the
    /// timestamp `record_received` stored for that xid. Notifications and
    /// other responses with no matching request (`cxid` never seen, e.g.
    /// `ReplyHeader::NOTIFICATION_XID`) contribute no latency sample.
    pub fn record_sent(&mut self, cxid: i32, zxid: i64) {
        self.packets_sent += 1;
        self.last_zxid = zxid;
        self.last_response_time = Some(Instant::now());

        if let Some(received_at) = self.pending.remove(&cxid) {
            let latency = received_at.elapsed();
            self.min_latency = Some(self.min_latency.map_or(latency, |m| m.min(latency)));
            self.max_latency = Some(self.max_latency.map_or(latency, |m| m.max(latency)));
            self.total_latency += latency;
            self.latency_samples += 1;
        }
    }

    pub fn min_latency(&self) -> Duration {
        self.min_latency.unwrap_or(Duration::ZERO)
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency.unwrap_or(Duration::ZERO)
    }

    pub fn avg_latency(&self) -> Duration {
        if self.latency_samples == 0 {
            Duration::ZERO
        } else {
            self.total_latency / self.latency_samples as u32
        }
    }

    pub fn uptime(&self) -> Duration {
        self.established.elapsed()
    }

    /// Reset counters, preserving connection identity. Backs the `crst`
    /// diagnostic responder.
    pub fn reset(&mut self) {
        *self = ConnectionStats {
            established: self.established,
            ..ConnectionStats::new()
        };
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-wide aggregate used by the `srvr`/`stat` responders.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub version: &'static str,
    started: Instant,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl ServerStats {
    pub fn new(version: &'static str) -> Self {
        ServerStats {
            version,
            started: Instant::now(),
            packets_sent: 0,
            packets_received: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn reset(&mut self) {
        self.packets_sent = 0;
        self.packets_received = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_counters_but_not_identity() {
        let mut stats = ConnectionStats::new();
        stats.record_received(5, 1);
        stats.record_sent(5, 10);
        assert_eq!(stats.packets_received, 1);
        stats.reset();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.last_cxid, 0);
    }

    #[test]
    fn latency_tracks_min_avg_max() {
        let mut stats = ConnectionStats::new();
        stats.record_received(1, 0);
        std::thread::sleep(Duration::from_millis(5));
        stats.record_sent(1, 1);
        stats.record_received(2, 0);
        std::thread::sleep(Duration::from_millis(15));
        stats.record_sent(2, 2);
        assert!(stats.min_latency() <= stats.max_latency());
        assert!(stats.min_latency() >= Duration::from_millis(4));
        assert!(stats.max_latency() >= Duration::from_millis(14));
        assert!(stats.avg_latency() > Duration::ZERO);
    }

    #[test]
    fn a_response_with_no_matching_request_contributes_no_latency_sample() {
        let mut stats = ConnectionStats::new();
        stats.record_sent(-1, 7);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.min_latency(), Duration::ZERO);
        assert_eq!(stats.avg_latency(), Duration::ZERO);
    }
}
