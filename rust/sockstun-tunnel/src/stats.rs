//! Traffic counters for the tunnel engine
//!
//! The four traffic counters are updated under one lock so a reader never sees
//! packets counted without their bytes. Diagnostic counters are independent
//! atomics.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Aggregate traffic seen on the tun device.
///
/// `rx` counts packets accepted from the device, `tx` counts packets written
/// to it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl TrafficStats {
    /// Layout used by the platform stats call.
    pub fn to_array(&self) -> [u64; 4] {
        [self.tx_packets, self.tx_bytes, self.rx_packets, self.rx_bytes]
    }
}

/// Engine-wide statistics, shared between the event loop and stats readers.
#[derive(Debug)]
pub struct TunnelStats {
    start_time: Instant,
    traffic: Mutex<TrafficStats>,

    pub malformed_packets: AtomicU64,
    pub dropped_packets: AtomicU64,
    pub unsupported_packets: AtomicU64,

    pub tcp_sessions_total: AtomicU64,
    pub tcp_sessions_active: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,

    pub proxy_errors: AtomicU64,
    pub retransmits: AtomicU64,
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            traffic: Mutex::new(TrafficStats::default()),
            malformed_packets: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            unsupported_packets: AtomicU64::new(0),
            tcp_sessions_total: AtomicU64::new(0),
            tcp_sessions_active: AtomicU64::new(0),
            udp_sessions_total: AtomicU64::new(0),
            udp_sessions_active: AtomicU64::new(0),
            proxy_errors: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record a packet accepted from the tun device
    pub fn record_received(&self, bytes: usize) {
        let mut traffic = self.traffic.lock();
        traffic.rx_packets += 1;
        traffic.rx_bytes += bytes as u64;
    }

    /// Record a packet written to the tun device
    pub fn record_sent(&self, bytes: usize) {
        let mut traffic = self.traffic.lock();
        traffic.tx_packets += 1;
        traffic.tx_bytes += bytes as u64;
    }

    pub fn record_malformed(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported(&self) {
        self.unsupported_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_session(&self) {
        self.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        decrement(&self.tcp_sessions_active);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        decrement(&self.udp_sessions_active);
    }

    pub fn record_proxy_error(&self) {
        self.proxy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent copy of the four traffic counters
    pub fn traffic(&self) -> TrafficStats {
        *self.traffic.lock()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            traffic: self.traffic(),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            unsupported_packets: self.unsupported_packets.load(Ordering::Relaxed),
            tcp_sessions_total: self.tcp_sessions_total.load(Ordering::Relaxed),
            tcp_sessions_active: self.tcp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            proxy_errors: self.proxy_errors.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
        }
    }
}

// Saturating so a double close can never wrap the gauge.
fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub traffic: TrafficStats,
    pub malformed_packets: u64,
    pub dropped_packets: u64,
    pub unsupported_packets: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub proxy_errors: u64,
    pub retransmits: u64,
}

impl StatsSnapshot {
    pub fn active_sessions(&self) -> u64 {
        self.tcp_sessions_active + self.udp_sessions_active
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tx {} pkts / {} bytes, rx {} pkts / {} bytes, tcp {} (active {}), udp {} (active {}), malformed {}, dropped {}, proxy errors {}",
            self.traffic.tx_packets,
            self.traffic.tx_bytes,
            self.traffic.rx_packets,
            self.traffic.rx_bytes,
            self.tcp_sessions_total,
            self.tcp_sessions_active,
            self.udp_sessions_total,
            self.udp_sessions_active,
            self.malformed_packets,
            self.dropped_packets,
            self.proxy_errors,
        )
    }
}
