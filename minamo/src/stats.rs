//! Traffic accounting for relay sessions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives per-session traffic totals when a relay worker exits.
pub trait Collector: Send + Sync {
    fn collect_udp_session_uplink(&self, username: &str, packets: u64, bytes: u64);
    fn collect_udp_session_downlink(&self, username: &str, packets: u64, bytes: u64);
}

#[derive(Debug, Default)]
struct Direction {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Direction {
    fn add(&self, packets: u64, bytes: u64) {
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Point-in-time view of accumulated traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub uplink_packets: u64,
    pub uplink_bytes: u64,
    pub downlink_packets: u64,
    pub downlink_bytes: u64,
}

/// Lock-free collector backed by atomic counters.
#[derive(Debug, Default)]
pub struct AtomicCollector {
    uplink: Direction,
    downlink: Direction,
}

impl AtomicCollector {
    pub fn new() -> AtomicCollector {
        AtomicCollector::default()
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            uplink_packets: self.uplink.packets.load(Ordering::Relaxed),
            uplink_bytes: self.uplink.bytes.load(Ordering::Relaxed),
            downlink_packets: self.downlink.packets.load(Ordering::Relaxed),
            downlink_bytes: self.downlink.bytes.load(Ordering::Relaxed),
        }
    }
}

impl Collector for AtomicCollector {
    fn collect_udp_session_uplink(&self, _username: &str, packets: u64, bytes: u64) {
        self.uplink.add(packets, bytes);
    }

    fn collect_udp_session_downlink(&self, _username: &str, packets: u64, bytes: u64) {
        self.downlink.add(packets, bytes);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn collect_udp_session_uplink(&self, _username: &str, _packets: u64, _bytes: u64) {}

    fn collect_udp_session_downlink(&self, _username: &str, _packets: u64, _bytes: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_collector_accumulates() {
        let collector = AtomicCollector::new();
        collector.collect_udp_session_uplink("alice", 3, 300);
        collector.collect_udp_session_uplink("bob", 1, 50);
        collector.collect_udp_session_downlink("alice", 2, 128);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.uplink_packets, 4);
        assert_eq!(snapshot.uplink_bytes, 350);
        assert_eq!(snapshot.downlink_packets, 2);
        assert_eq!(snapshot.downlink_bytes, 128);
    }
}
