//! Near Relay Set
//!
//! The small set of candidate relays the control plane asks a client to
//! measure. The set is replaced wholesale on every route update that carries
//! one; pings are paced per relay and staggered across the set.

use log::debug;

use crate::address::Address;
use crate::constants::{
    ENCRYPTED_PING_TOKEN_BYTES, MAX_NEAR_RELAYS, PING_SAFETY, PING_STATS_WINDOW, RELAY_PING_TIME,
};
use crate::packets::{NearRelaySet, NearRelayStats, RelayPingPacket, RelayPongPacket};
use crate::quality::{route_stats, PathQuality, PingHistory};

#[derive(Debug, Clone)]
pub struct NearRelayEntry {
    pub relay_id: u64,
    pub address: Address,
    ping_token: [u8; ENCRYPTED_PING_TOKEN_BYTES],
    last_ping_time: f64,
    history: PingHistory,
    quality: PathQuality,
}

#[derive(Debug, Clone, Default)]
pub struct NearRelayManager {
    relays: Vec<NearRelayEntry>,
    expire_timestamp: u64,
}

impl NearRelayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new set, dropping all history from the previous one.
    pub fn update(&mut self, set: &NearRelaySet, now: f64) {
        let count = set.relays.len().min(MAX_NEAR_RELAYS);
        self.expire_timestamp = set.expire_timestamp;
        self.relays = set
            .relays
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, relay)| NearRelayEntry {
                relay_id: relay.relay_id,
                address: relay.address,
                ping_token: relay.ping_token,
                last_ping_time: now - RELAY_PING_TIME
                    + RELAY_PING_TIME * i as f64 / count as f64,
                history: PingHistory::new(),
                quality: PathQuality::default(),
            })
            .collect();
        debug!("Near relay set replaced with {} relays", self.relays.len());
    }

    pub fn clear(&mut self) {
        self.relays.clear();
        self.expire_timestamp = 0;
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn relays(&self) -> &[NearRelayEntry] {
        &self.relays
    }

    /// Relay pings due now. Nothing is sent once the ping tokens expire.
    pub fn pings_due(
        &mut self,
        now: f64,
        timestamp: u64,
        session_id: u64,
    ) -> Vec<(Address, RelayPingPacket)> {
        if self.expire_timestamp < timestamp {
            return Vec::new();
        }
        self.relays
            .iter_mut()
            .filter(|relay| now - relay.last_ping_time >= RELAY_PING_TIME)
            .map(|relay| {
                relay.last_ping_time = now;
                let ping = RelayPingPacket {
                    ping_sequence: relay.history.send(now),
                    session_id,
                    ping_token: relay.ping_token,
                };
                (relay.address, ping)
            })
            .collect()
    }

    /// Match a pong to the relay it came from. False if nothing matched.
    pub fn process_pong(
        &mut self,
        from: &Address,
        pong: &RelayPongPacket,
        session_id: u64,
        now: f64,
    ) -> bool {
        if pong.session_id != session_id {
            return false;
        }
        match self.relays.iter_mut().find(|relay| relay.address == *from) {
            Some(relay) => {
                relay.history.received(pong.ping_sequence, now);
                true
            }
            None => false,
        }
    }

    pub fn update_stats(&mut self, now: f64) {
        for relay in &mut self.relays {
            let sample = route_stats(&relay.history, now - PING_STATS_WINDOW, now, PING_SAFETY);
            relay.quality.update(sample);
        }
    }

    pub fn stats(&self) -> Vec<NearRelayStats> {
        self.relays
            .iter()
            .map(|relay| NearRelayStats {
                relay_id: relay.relay_id,
                rtt: relay.quality.stats.rtt,
                jitter: relay.quality.stats.jitter,
                packet_loss: relay.quality.stats.packet_loss,
            })
            .collect()
    }
}
