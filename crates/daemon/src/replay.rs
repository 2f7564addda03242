//! Replay Protection Window
//!
//! Fixed ring of recently accepted sequence numbers. A sequence is rejected
//! if it is older than the window or its slot already holds an equal or
//! newer value.
//!
//! `already_received` is checked before verification and `advance` is only
//! called once the packet has fully verified, so forged packets can never
//! burn a slot.

use crate::constants::REPLAY_PROTECTION_BUFFER_SIZE;

const EMPTY: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct ReplayProtection {
    most_recent_sequence: u64,
    received: Box<[u64; REPLAY_PROTECTION_BUFFER_SIZE]>,
}

impl Default for ReplayProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayProtection {
    pub fn new() -> Self {
        Self {
            most_recent_sequence: 0,
            received: Box::new([EMPTY; REPLAY_PROTECTION_BUFFER_SIZE]),
        }
    }

    pub fn reset(&mut self) {
        self.most_recent_sequence = 0;
        self.received.fill(EMPTY);
    }

    pub fn most_recent_sequence(&self) -> u64 {
        self.most_recent_sequence
    }

    pub fn already_received(&self, sequence: u64) -> bool {
        let window = REPLAY_PROTECTION_BUFFER_SIZE as u64;
        if sequence.saturating_add(window) <= self.most_recent_sequence {
            return true;
        }
        let slot = self.received[(sequence % window) as usize];
        slot != EMPTY && slot >= sequence
    }

    pub fn advance(&mut self, sequence: u64) {
        if sequence > self.most_recent_sequence {
            self.most_recent_sequence = sequence;
        }
        let index = (sequence % REPLAY_PROTECTION_BUFFER_SIZE as u64) as usize;
        self.received[index] = sequence;
    }

    /// Check-and-record for callers that have nothing left to verify.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if self.already_received(sequence) {
            return false;
        }
        self.advance(sequence);
        true
    }
}
