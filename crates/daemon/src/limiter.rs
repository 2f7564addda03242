//! Bandwidth Limiter
//!
//! Gates use of the accelerated path. Bits are counted over a one second
//! window that restarts once it has fully elapsed; a packet that pushes the
//! window past the route's kbps envelope is reported as over budget and the
//! caller sends it direct instead. Usage is also sampled every 100ms into an
//! exponentially smoothed kbps estimate for client stats.

use crate::constants::{
    BANDWIDTH_LIMITER_INTERVAL, BANDWIDTH_SAMPLE_INTERVAL, HEADER_BYTES, IPV4_UDP_HEADER_BYTES,
    PACKET_PREFIX_BYTES, PACKET_SUFFIX_BYTES,
};

const SMOOTHING: f64 = 0.1;

/// Bits a payload of `payload_bytes` occupies on the wire over next.
pub fn wire_packet_bits(payload_bytes: usize) -> u32 {
    let bytes = IPV4_UDP_HEADER_BYTES
        + PACKET_PREFIX_BYTES
        + HEADER_BYTES
        + payload_bytes
        + PACKET_SUFFIX_BYTES;
    (bytes * 8) as u32
}

#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    last_check_time: Option<f64>,
    bits_sent: u64,
    sample_start: Option<f64>,
    sample_bits: u64,
    average_kbps: f64,
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthLimiter {
    pub fn new() -> Self {
        Self {
            last_check_time: None,
            bits_sent: 0,
            sample_start: None,
            sample_bits: 0,
            average_kbps: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Count a packet and return true if the window is now over budget.
    pub fn add_packet(&mut self, now: f64, kbps_allowed: u32, packet_bits: u32) -> bool {
        let restart = match self.last_check_time {
            None => true,
            Some(start) => now - start >= BANDWIDTH_LIMITER_INTERVAL - 0.00001,
        };
        if restart {
            self.bits_sent = 0;
            self.last_check_time = Some(now);
        }
        self.bits_sent += u64::from(packet_bits);
        self.sample_bits += u64::from(packet_bits);
        self.bits_sent > u64::from(kbps_allowed) * 1000
    }

    /// Fold a usage sample into the smoothed estimate. Transitions to and
    /// from zero snap instead of decaying.
    pub fn add_sample(&mut self, kbps: f64) {
        if self.average_kbps == 0.0 && kbps != 0.0 {
            self.average_kbps = kbps;
        } else if self.average_kbps != 0.0 && kbps == 0.0 {
            self.average_kbps = 0.0;
        } else {
            self.average_kbps += (kbps - self.average_kbps) * SMOOTHING;
        }
    }

    /// Turn the bits counted since the last poll into a sample once the
    /// sample interval has passed.
    pub fn poll(&mut self, now: f64) {
        let Some(start) = self.sample_start else {
            self.sample_start = Some(now);
            self.sample_bits = 0;
            return;
        };
        let elapsed = now - start;
        if elapsed < BANDWIDTH_SAMPLE_INTERVAL {
            return;
        }
        let kbps = self.sample_bits as f64 / elapsed / 1000.0;
        self.add_sample(kbps);
        self.sample_start = Some(now);
        self.sample_bits = 0;
    }

    pub fn usage_kbps(&self) -> f64 {
        self.average_kbps
    }
}
