//! Path Quality Trackers
//!
//! Ping history with windowed RTT / jitter / loss statistics, plus the
//! payload-sequence trackers (loss, out of order, jitter) that run on every
//! received game packet.

use crate::constants::{
    PACKET_LOSS_TRACKER_HISTORY, PACKET_LOSS_TRACKER_SAFETY, PING_HISTORY_ENTRY_COUNT,
};

// ============================================================================
// Ping History
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PingEntry {
    sequence: u64,
    time_sent: f64,
    /// Negative until a pong arrives.
    time_received: f64,
}

const EMPTY_ENTRY: PingEntry = PingEntry {
    sequence: u64::MAX,
    time_sent: -1.0,
    time_received: -1.0,
};

#[derive(Debug, Clone)]
pub struct PingHistory {
    sequence: u64,
    entries: Box<[PingEntry; PING_HISTORY_ENTRY_COUNT]>,
}

impl Default for PingHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PingHistory {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            entries: Box::new([EMPTY_ENTRY; PING_HISTORY_ENTRY_COUNT]),
        }
    }

    pub fn clear(&mut self) {
        self.sequence = 0;
        self.entries.fill(EMPTY_ENTRY);
    }

    /// Record a ping going out and return the sequence to put on the wire.
    pub fn send(&mut self, time: f64) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        self.entries[(sequence % PING_HISTORY_ENTRY_COUNT as u64) as usize] = PingEntry {
            sequence,
            time_sent: time,
            time_received: -1.0,
        };
        sequence
    }

    /// Pongs for overwritten or already answered sequences are ignored.
    pub fn received(&mut self, sequence: u64, time: f64) {
        let entry = &mut self.entries[(sequence % PING_HISTORY_ENTRY_COUNT as u64) as usize];
        if entry.sequence == sequence && entry.time_received < 0.0 {
            entry.time_received = time;
        }
    }

    pub fn last_pong_time(&self) -> Option<f64> {
        self.entries
            .iter()
            .filter(|e| e.sequence != u64::MAX && e.time_received >= 0.0)
            .map(|e| e.time_received)
            .fold(None, |max, t| Some(max.map_or(t, |m: f64| m.max(t))))
    }

    fn in_window(&self, start: f64, end: f64) -> impl Iterator<Item = &PingEntry> {
        self.entries
            .iter()
            .filter(move |e| e.sequence != u64::MAX && e.time_sent >= start && e.time_sent <= end)
    }
}

/// RTT and jitter in milliseconds, packet loss in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RouteStats {
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

/// Compute stats over pings sent in `[start, end]`.
///
/// Loss only counts pings sent before the most recent pong minus `safety`,
/// so pings still in flight never show up as lost. No replies at all gives
/// zeros, not 100% loss.
pub fn route_stats(history: &PingHistory, start: f64, end: f64, safety: f64) -> RouteStats {
    let most_recent_pong = history
        .in_window(start, end)
        .filter(|e| e.time_received >= e.time_sent)
        .map(|e| e.time_sent)
        .fold(f64::NEG_INFINITY, f64::max);
    if most_recent_pong == f64::NEG_INFINITY {
        return RouteStats::default();
    }

    let loss_end = most_recent_pong - safety;
    let (mut pings, mut pongs) = (0u32, 0u32);
    for entry in history.in_window(start, loss_end) {
        pings += 1;
        if entry.time_received >= entry.time_sent {
            pongs += 1;
        }
    }
    let packet_loss = if pings > 0 {
        100.0 * (1.0 - pongs as f64 / pings as f64)
    } else {
        0.0
    };

    let rtts: Vec<f64> = history
        .in_window(start, end)
        .filter(|e| e.time_received >= e.time_sent)
        .map(|e| e.time_received - e.time_sent)
        .collect();
    let min_rtt = rtts.iter().copied().fold(f64::INFINITY, f64::min);
    let variance =
        rtts.iter().map(|rtt| (rtt - min_rtt).powi(2)).sum::<f64>() / rtts.len() as f64;

    RouteStats {
        rtt: (min_rtt * 1000.0) as f32,
        jitter: (variance.sqrt() * 1000.0) as f32,
        packet_loss: packet_loss as f32,
    }
}

/// Stats for one path with jitter smoothed across samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathQuality {
    pub stats: RouteStats,
}

impl PathQuality {
    const JITTER_SMOOTHING: f32 = 0.01;

    pub fn update(&mut self, sample: RouteStats) {
        let jitter = if self.stats.jitter > 0.0 {
            self.stats.jitter + (sample.jitter - self.stats.jitter) * Self::JITTER_SMOOTHING
        } else {
            sample.jitter
        };
        self.stats = RouteStats { jitter, ..sample };
    }

    pub fn reset(&mut self) {
        self.stats = RouteStats::default();
    }
}

// ============================================================================
// Payload Sequence Trackers
// ============================================================================

/// Counts gaps in the payload sequence, trailing the newest packet by a
/// safety margin so reordered packets are not counted as lost.
#[derive(Debug, Clone)]
pub struct PacketLossTracker {
    last_packet_processed: u64,
    most_recent_packet_received: u64,
    received: Box<[u64; PACKET_LOSS_TRACKER_HISTORY]>,
}

impl Default for PacketLossTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLossTracker {
    pub fn new() -> Self {
        Self {
            last_packet_processed: 0,
            most_recent_packet_received: 0,
            received: Box::new([u64::MAX; PACKET_LOSS_TRACKER_HISTORY]),
        }
    }

    pub fn packet_received(&mut self, sequence: u64) {
        // Stored off by one so slot value 0 never matches.
        let sequence = sequence.saturating_add(1);
        self.received[(sequence % PACKET_LOSS_TRACKER_HISTORY as u64) as usize] = sequence;
        if sequence > self.most_recent_packet_received {
            self.most_recent_packet_received = sequence;
        }
    }

    /// Number of newly lost packets since the previous call.
    pub fn update(&mut self) -> u64 {
        let history = PACKET_LOSS_TRACKER_HISTORY as u64;
        let mut start = self.last_packet_processed + 1;
        let Some(finish) = self
            .most_recent_packet_received
            .checked_sub(PACKET_LOSS_TRACKER_SAFETY)
        else {
            return 0;
        };
        if finish < start {
            return 0;
        }
        if finish - start >= history {
            start = finish - history + 1;
        }

        let lost = (start..=finish)
            .filter(|&sequence| self.received[(sequence % history) as usize] != sequence)
            .count() as u64;
        self.last_packet_processed = finish;
        lost
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutOfOrderTracker {
    last_sequence: Option<u64>,
    out_of_order: u64,
}

impl OutOfOrderTracker {
    pub fn packet_received(&mut self, sequence: u64) {
        match self.last_sequence {
            Some(last) if sequence < last => self.out_of_order += 1,
            _ => self.last_sequence = Some(sequence),
        }
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}

/// Inter-arrival jitter over consecutive payload sequences.
#[derive(Debug, Clone, Default)]
pub struct JitterTracker {
    last_sequence: Option<u64>,
    last_time: f64,
    last_delta: Option<f64>,
    jitter: f64,
}

impl JitterTracker {
    pub fn packet_received(&mut self, sequence: u64, time: f64) {
        if self.last_sequence.map(|last| last.wrapping_add(1)) == Some(sequence) {
            let delta = time - self.last_time;
            if let Some(last_delta) = self.last_delta {
                self.jitter += ((delta - last_delta).abs() - self.jitter) * 0.01;
            }
            self.last_delta = Some(delta);
        }
        self.last_sequence = Some(sequence);
        self.last_time = time;
    }

    /// Milliseconds.
    pub fn jitter(&self) -> f32 {
        (self.jitter * 1000.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_replies_yield_zero_stats() {
        let mut history = PingHistory::new();
        for i in 0..100 {
            history.send(i as f64 * 0.1);
        }
        assert_eq!(route_stats(&history, 0.0, 10.0, 1.0), RouteStats::default());
    }

    #[test]
    fn test_rtt_and_loss() {
        let mut history = PingHistory::new();
        for i in 0..100 {
            let sent = i as f64 * 0.1;
            let sequence = history.send(sent);
            // Every fourth ping is lost.
            if i % 4 != 0 {
                history.received(sequence, sent + 0.05);
            }
        }
        let stats = route_stats(&history, 0.0, 10.0, 1.0);
        assert!((stats.rtt - 50.0).abs() < 0.01);
        assert!(stats.jitter < 0.01);
        assert!((stats.packet_loss - 25.0).abs() < 2.0);
    }

    #[test]
    fn test_in_flight_pings_not_lost() {
        let mut history = PingHistory::new();
        for i in 0..50 {
            let sent = i as f64 * 0.1;
            let sequence = history.send(sent);
            if i < 40 {
                history.received(sequence, sent + 0.02);
            }
        }
        // The last ten pings are younger than the last pong plus safety.
        let stats = route_stats(&history, 0.0, 10.0, 1.0);
        assert_eq!(stats.packet_loss, 0.0);
    }

    #[test]
    fn test_jitter_against_minimum() {
        let mut history = PingHistory::new();
        for (i, rtt) in [0.010, 0.030, 0.010, 0.030].iter().enumerate() {
            let sent = i as f64;
            let sequence = history.send(sent);
            history.received(sequence, sent + rtt);
        }
        let stats = route_stats(&history, 0.0, 10.0, 0.0);
        assert!((stats.rtt - 10.0).abs() < 0.01);
        // sqrt(mean([0, 400, 0, 400])) ms
        assert!((stats.jitter - 14.142).abs() < 0.01);
    }

    #[test]
    fn test_late_and_duplicate_pongs() {
        let mut history = PingHistory::new();
        let sequence = history.send(1.0);
        history.received(sequence, 1.5);
        history.received(sequence, 2.0);
        history.received(sequence + 1000, 2.0);
        assert_eq!(history.last_pong_time(), Some(1.5));
    }

    #[test]
    fn test_path_quality_smooths_jitter() {
        let mut quality = PathQuality::default();
        quality.update(RouteStats { rtt: 10.0, jitter: 4.0, packet_loss: 0.0 });
        assert_eq!(quality.stats.jitter, 4.0);
        quality.update(RouteStats { rtt: 12.0, jitter: 104.0, packet_loss: 1.0 });
        assert!((quality.stats.jitter - 5.0).abs() < 1e-4);
        assert_eq!(quality.stats.rtt, 12.0);
    }

    #[test]
    fn test_packet_loss_tracker() {
        let mut tracker = PacketLossTracker::new();
        for sequence in 0..200u64 {
            if sequence % 10 != 5 {
                tracker.packet_received(sequence);
            }
        }
        // Only sequences older than the safety margin are examined.
        let lost = tracker.update();
        assert_eq!(lost, 17);
        assert_eq!(tracker.update(), 0);
    }

    #[test]
    fn test_packet_loss_tracker_large_jump() {
        let mut tracker = PacketLossTracker::new();
        tracker.packet_received(0);
        tracker.packet_received(100_000);
        let lost = tracker.update();
        assert!(lost <= PACKET_LOSS_TRACKER_HISTORY as u64);
    }

    #[test]
    fn test_out_of_order_tracker() {
        let mut tracker = OutOfOrderTracker::default();
        for sequence in [0, 1, 3, 2, 4, 5, 1] {
            tracker.packet_received(sequence);
        }
        assert_eq!(tracker.out_of_order(), 2);
    }

    #[test]
    fn test_jitter_tracker() {
        let mut steady = JitterTracker::default();
        for sequence in 0..100u64 {
            steady.packet_received(sequence, sequence as f64 * 0.01);
        }
        assert!(steady.jitter() < 0.001);

        let mut bursty = JitterTracker::default();
        for sequence in 0..100u64 {
            let wobble = if sequence % 2 == 0 { 0.0 } else { 0.005 };
            bursty.packet_received(sequence, sequence as f64 * 0.01 + wobble);
        }
        assert!(bursty.jitter() > 1.0);
    }
}
