use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Protocol counters shared between a worker and whoever embeds it.
///
/// - Packet flow: received, sent, dropped by the tag filters, as replays, or
///   for failing authentication
/// - Route lifecycle: requests sent, routes established, fallbacks
/// - Sessions: active, upgrades completed and timed out
pub struct Metrics {
    // === Packet Flow ===
    pub packets_rx_total: AtomicU64,
    pub packets_tx_total: AtomicU64,
    /// Rejected by the basic or advanced packet filter
    pub packets_dropped_filter: AtomicU64,
    /// Sequence already seen by a replay window
    pub packets_dropped_replay: AtomicU64,
    /// Bad AEAD tag, bad signature, or a route header no slot verifies
    pub packets_dropped_auth: AtomicU64,
    pub payloads_delivered: AtomicU64,

    // === Routes ===
    pub route_requests_sent: AtomicU64,
    pub routes_established: AtomicU64,
    pub fallbacks_to_direct: AtomicU64,

    // === Sessions ===
    pub sessions_active: AtomicU64,
    pub upgrades_completed: AtomicU64,
    pub upgrades_timed_out: AtomicU64,
    pub sessions_timed_out: AtomicU64,
    pub backend_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            packets_rx_total: AtomicU64::new(0),
            packets_tx_total: AtomicU64::new(0),
            packets_dropped_filter: AtomicU64::new(0),
            packets_dropped_replay: AtomicU64::new(0),
            packets_dropped_auth: AtomicU64::new(0),
            payloads_delivered: AtomicU64::new(0),
            route_requests_sent: AtomicU64::new(0),
            routes_established: AtomicU64::new(0),
            fallbacks_to_direct: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            upgrades_completed: AtomicU64::new(0),
            upgrades_timed_out: AtomicU64::new(0),
            sessions_timed_out: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    // === Packet Flow ===

    pub fn inc_packets_rx(&self) {
        self.packets_rx_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_packets_tx(&self, count: u64) {
        self.packets_tx_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_dropped_filter(&self) {
        self.packets_dropped_filter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_replay(&self) {
        self.packets_dropped_replay.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_auth(&self) {
        self.packets_dropped_auth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payloads_delivered(&self) {
        self.payloads_delivered.fetch_add(1, Ordering::Relaxed);
    }

    // === Routes ===

    pub fn inc_route_requests(&self) {
        self.route_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_routes_established(&self) {
        self.routes_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallbacks(&self) {
        self.fallbacks_to_direct.fetch_add(1, Ordering::Relaxed);
    }

    // === Sessions ===

    pub fn set_sessions_active(&self, count: u64) {
        self.sessions_active.store(count, Ordering::Relaxed);
    }

    pub fn inc_upgrades_completed(&self) {
        self.upgrades_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_upgrades_timed_out(&self) {
        self.upgrades_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_timed_out(&self) {
        self.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_failures(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One line for the periodic status log.
    pub fn summary(&self) -> String {
        format!(
            "rx={} tx={} delivered={} dropped(filter={} replay={} auth={}) routes(requested={} established={} fallbacks={}) sessions={} upgrades(ok={} timeout={})",
            self.packets_rx_total.load(Ordering::Relaxed),
            self.packets_tx_total.load(Ordering::Relaxed),
            self.payloads_delivered.load(Ordering::Relaxed),
            self.packets_dropped_filter.load(Ordering::Relaxed),
            self.packets_dropped_replay.load(Ordering::Relaxed),
            self.packets_dropped_auth.load(Ordering::Relaxed),
            self.route_requests_sent.load(Ordering::Relaxed),
            self.routes_established.load(Ordering::Relaxed),
            self.fallbacks_to_direct.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
            self.upgrades_completed.load(Ordering::Relaxed),
            self.upgrades_timed_out.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.packets_rx_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_packet_counters() {
        let metrics = Metrics::new();

        metrics.inc_packets_rx();
        metrics.inc_packets_rx();
        metrics.add_packets_tx(3);
        metrics.inc_dropped_filter();
        metrics.inc_dropped_replay();
        metrics.inc_dropped_auth();
        metrics.inc_dropped_auth();

        assert_eq!(metrics.packets_rx_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.packets_tx_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.packets_dropped_filter.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.packets_dropped_replay.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.packets_dropped_auth.load(Ordering::Relaxed), 2);
        assert!(metrics.summary().contains("replay=1 auth=2"));
    }

    #[test]
    fn test_session_counters() {
        let metrics = Metrics::new();

        metrics.set_sessions_active(4);
        metrics.set_sessions_active(2);
        metrics.inc_upgrades_completed();
        metrics.inc_upgrades_timed_out();

        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.upgrades_completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.upgrades_timed_out.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_summary_output() {
        let metrics = Metrics::new();
        metrics.inc_routes_established();
        metrics.inc_fallbacks();

        let output = metrics.summary();
        assert!(output.contains("established=1"));
        assert!(output.contains("fallbacks=1"));
    }
}
