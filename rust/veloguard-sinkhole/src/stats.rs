//! Engine-wide counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct EngineStats {
    start_time: Option<Instant>,

    // Tun traffic
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Per protocol, inbound
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub icmp_packets: AtomicU64,
    pub other_packets: AtomicU64,

    // Sessions
    pub sessions_created: AtomicU64,
    pub sessions_refused: AtomicU64,
    pub flows_denied: AtomicU64,
    pub resets_sent: AtomicU64,

    // DNS
    pub dns_queries: AtomicU64,
    pub dns_blocked: AtomicU64,
    pub dns_scrubbed: AtomicU64,

    pub socks5_errors: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol(&self, protocol: u8) {
        let counter = match protocol {
            crate::packet::IPPROTO_TCP => &self.tcp_packets,
            crate::packet::IPPROTO_UDP => &self.udp_packets,
            crate::packet::IPPROTO_ICMP | crate::packet::IPPROTO_ICMPV6 => &self.icmp_packets,
            _ => &self.other_packets,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refused(&self) {
        self.sessions_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.flows_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_query(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_blocked(&self) {
        self.dns_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_scrubbed(&self) {
        self.dns_scrubbed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_socks5_error(&self) {
        self.socks5_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: load(&self.packets_received),
            packets_sent: load(&self.packets_sent),
            packets_dropped: load(&self.packets_dropped),
            packets_invalid: load(&self.packets_invalid),
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
            tcp_packets: load(&self.tcp_packets),
            udp_packets: load(&self.udp_packets),
            icmp_packets: load(&self.icmp_packets),
            other_packets: load(&self.other_packets),
            sessions_created: load(&self.sessions_created),
            sessions_refused: load(&self.sessions_refused),
            flows_denied: load(&self.flows_denied),
            resets_sent: load(&self.resets_sent),
            dns_queries: load(&self.dns_queries),
            dns_blocked: load(&self.dns_blocked),
            dns_scrubbed: load(&self.dns_scrubbed),
            socks5_errors: load(&self.socks5_errors),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub other_packets: u64,
    pub sessions_created: u64,
    pub sessions_refused: u64,
    pub flows_denied: u64,
    pub resets_sent: u64,
    pub dns_queries: u64,
    pub dns_blocked: u64,
    pub dns_scrubbed: u64,
    pub socks5_errors: u64,
}

impl StatsSnapshot {
    /// Inbound packets per second between two snapshots.
    pub fn packets_per_second(&self, previous: &StatsSnapshot, interval: Duration) -> f64 {
        let delta = self.packets_received.saturating_sub(previous.packets_received);
        delta as f64 / interval.as_secs_f64()
    }
}
