//! Payload Send Path
//!
//! The state the application thread needs to put a game packet on the wire
//! without waiting for the worker: peer endpoints, magic, session send key,
//! the current route slot and the bandwidth envelope. Workers keep one of
//! these per peer behind a short-hold mutex and refresh it after every tick.

use log::debug;

use crate::address::Address;
use crate::constants::MTU;
use crate::crypto::{Direction, Key};
use crate::limiter::{wire_packet_bits, BandwidthLimiter};
use crate::packets::{write_packet, DirectPacket, HeaderPacket, Packet, PacketType, WriteContext};
use crate::route::RouteSlot;
use crate::tags::Magic;

#[derive(Debug, Clone)]
pub struct PayloadSender {
    direction: Direction,
    pub local_address: Address,
    pub peer_address: Address,
    pub magic: Magic,
    send_key: Option<Key>,
    pub open_session_sequence: u8,
    payload_sequence: u64,
    route: Option<RouteSlot>,
    send_over_next: bool,
    multipath: bool,
    limiter: BandwidthLimiter,
    packets_sent: u64,
}

impl PayloadSender {
    pub fn new(direction: Direction, local_address: Address, peer_address: Address) -> Self {
        Self {
            direction,
            local_address,
            peer_address,
            magic: [0u8; 8],
            send_key: None,
            open_session_sequence: 0,
            payload_sequence: 0,
            route: None,
            send_over_next: false,
            multipath: false,
            limiter: BandwidthLimiter::new(),
            packets_sent: 0,
        }
    }

    /// Switch from passthrough to encrypted direct packets.
    pub fn upgrade(&mut self, send_key: Key, open_session_sequence: u8, magic: Magic) {
        self.send_key = Some(send_key);
        self.open_session_sequence = open_session_sequence;
        self.magic = magic;
    }

    pub fn is_upgraded(&self) -> bool {
        self.send_key.is_some()
    }

    pub fn set_route(&mut self, route: Option<RouteSlot>, send_over_next: bool, multipath: bool) {
        if route.is_none() && self.route.is_some() {
            self.limiter.reset();
        }
        self.route = route;
        self.send_over_next = send_over_next;
        self.multipath = multipath;
    }

    pub fn route(&self) -> Option<&RouteSlot> {
        self.route.as_ref()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn usage_kbps(&self) -> f64 {
        self.limiter.usage_kbps()
    }

    pub fn poll(&mut self, now: f64) {
        self.limiter.poll(now);
    }

    fn kbps_allowed(&self, route: &RouteSlot) -> u32 {
        match self.direction {
            Direction::ClientToServer => route.kbps_up,
            Direction::ServerToClient => route.kbps_down,
        }
    }

    fn payload_type(&self) -> PacketType {
        match self.direction {
            Direction::ClientToServer => PacketType::ClientToServer,
            Direction::ServerToClient => PacketType::ServerToClient,
        }
    }

    fn next_packet(&mut self, sequence: u64, payload: &[u8], now: f64) -> Option<(Address, Vec<u8>)> {
        if !self.send_over_next {
            return None;
        }
        let route = self.route.as_ref()?;
        let kbps = self.kbps_allowed(route);
        if self.limiter.add_packet(now, kbps, wire_packet_bits(payload.len())) {
            debug!("Over bandwidth envelope of {} kbps, sending direct", kbps);
            return None;
        }
        let packet_type = self.payload_type();
        let header = route.write_header(self.direction, packet_type, sequence)?;
        let body = HeaderPacket::new(header, payload.to_vec());
        let packet = match packet_type {
            PacketType::ClientToServer => Packet::ClientToServer(body),
            _ => Packet::ServerToClient(body),
        };
        let ctx = WriteContext::new(self.local_address, route.next_address, self.magic);
        Some((route.next_address, write_packet(&packet, &ctx)?))
    }

    /// Wire datagrams for one payload. Empty if the payload is unsendable.
    pub fn prepare(&mut self, payload: &[u8], now: f64) -> Vec<(Address, Vec<u8>)> {
        if payload.is_empty() || payload.len() > MTU {
            return Vec::new();
        }

        let Some(key) = self.send_key else {
            let ctx = WriteContext::new(self.local_address, self.peer_address, self.magic);
            self.packets_sent += 1;
            return write_packet(&Packet::Passthrough(payload.to_vec()), &ctx)
                .map(|bytes| vec![(self.peer_address, bytes)])
                .unwrap_or_default();
        };

        self.payload_sequence += 1;
        let sequence = self.payload_sequence;
        let mut out = Vec::with_capacity(2);

        let over_next = self.next_packet(sequence, payload, now);
        let send_direct = over_next.is_none() || self.multipath;
        out.extend(over_next);

        if send_direct {
            let packet = Packet::Direct(DirectPacket {
                open_session_sequence: self.open_session_sequence,
                sequence,
                payload: payload.to_vec(),
            });
            let ctx = WriteContext::new(self.local_address, self.peer_address, self.magic)
                .encrypted(&key, sequence);
            out.extend(write_packet(&packet, &ctx).map(|bytes| (self.peer_address, bytes)));
        }

        if !out.is_empty() {
            self.packets_sent += 1;
        }
        out
    }
}
