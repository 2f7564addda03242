//! Client Route Manager
//!
//! Owns the pending / current / previous route slots and the outstanding
//! route or continue request. Driven by route updates from the server, by
//! verified responses from the first relay, and by the worker tick.
//!
//! ```text
//!   Direct ──begin──► PendingRoute ──response──► CurrentRoute ◄─┐
//!     ▲                                              │ continue │
//!     └──────────── direct_route ◄───────────────────┴──────────┘
//!
//!   any ──violation / timeout──► FallbackToDirect (sticky)
//! ```

use std::fmt;
use std::ops::BitOr;

use crypto_box::{PublicKey, SecretKey};
use log::{debug, info, warn};

use crate::address::Address;
use crate::constants::{
    CONTINUE_REQUEST_SEND_TIME, CONTINUE_REQUEST_TIMEOUT, ENCRYPTED_CONTINUE_TOKEN_BYTES,
    ENCRYPTED_ROUTE_TOKEN_BYTES, HEADER_BYTES, MAX_TOKENS, ROUTE_REQUEST_SEND_TIME,
    ROUTE_REQUEST_TIMEOUT, SLICE_SECONDS,
};
use crate::crypto::{self, Direction, HeaderFields, Key};
use crate::packets::{HeaderPacket, Packet, PacketType};
use crate::tokens::{ContinueToken, RouteToken};

// ============================================================================
// Fallback Flags
// ============================================================================

/// Conditions that forced the connection back to direct. Diagnostics only;
/// any non-empty value means fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FallbackFlags(u32);

impl FallbackFlags {
    pub const BAD_ROUTE_TOKEN: Self = Self(1);
    pub const NO_ROUTE_TO_CONTINUE: Self = Self(1 << 1);
    pub const PREVIOUS_UPDATE_STILL_PENDING: Self = Self(1 << 2);
    pub const BAD_CONTINUE_TOKEN: Self = Self(1 << 3);
    pub const ROUTE_EXPIRED: Self = Self(1 << 4);
    pub const ROUTE_REQUEST_TIMED_OUT: Self = Self(1 << 5);
    pub const CONTINUE_REQUEST_TIMED_OUT: Self = Self(1 << 6);
    pub const ROUTE_TIMED_OUT: Self = Self(1 << 7);
    pub const UPGRADE_RESPONSE_TIMED_OUT: Self = Self(1 << 8);
    pub const ROUTE_UPDATE_TIMED_OUT: Self = Self(1 << 9);
    pub const DIRECT_PONG_TIMED_OUT: Self = Self(1 << 10);
    pub const NEXT_PONG_TIMED_OUT: Self = Self(1 << 11);

    const NAMES: [(Self, &'static str); 12] = [
        (Self::BAD_ROUTE_TOKEN, "bad route token"),
        (Self::NO_ROUTE_TO_CONTINUE, "no route to continue"),
        (Self::PREVIOUS_UPDATE_STILL_PENDING, "previous update still pending"),
        (Self::BAD_CONTINUE_TOKEN, "bad continue token"),
        (Self::ROUTE_EXPIRED, "route expired"),
        (Self::ROUTE_REQUEST_TIMED_OUT, "route request timed out"),
        (Self::CONTINUE_REQUEST_TIMED_OUT, "continue request timed out"),
        (Self::ROUTE_TIMED_OUT, "route timed out"),
        (Self::UPGRADE_RESPONSE_TIMED_OUT, "upgrade response timed out"),
        (Self::ROUTE_UPDATE_TIMED_OUT, "route update timed out"),
        (Self::DIRECT_PONG_TIMED_OUT, "direct pong timed out"),
        (Self::NEXT_PONG_TIMED_OUT, "next pong timed out"),
    ];

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for FallbackFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for FallbackFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

// ============================================================================
// Route Slots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Direct,
    PendingRoute,
    CurrentRoute,
    FallbackToDirect,
}

/// One installed or pending route, as opened from its route token.
#[derive(Clone, PartialEq, Eq)]
pub struct RouteSlot {
    pub session_id: u64,
    pub session_version: u8,
    pub expire_timestamp: u64,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub next_address: Address,
    pub private_key: Key,
}

impl fmt::Debug for RouteSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSlot")
            .field("session_id", &format_args!("{:016x}", self.session_id))
            .field("session_version", &self.session_version)
            .field("kbps_up", &self.kbps_up)
            .field("kbps_down", &self.kbps_down)
            .field("next_address", &self.next_address)
            .finish_non_exhaustive()
    }
}

impl From<&RouteToken> for RouteSlot {
    fn from(token: &RouteToken) -> Self {
        Self {
            session_id: token.session_id,
            session_version: token.session_version,
            expire_timestamp: token.expire_timestamp,
            kbps_up: token.kbps_up,
            kbps_down: token.kbps_down,
            next_address: token.next_address,
            private_key: token.private_key,
        }
    }
}

impl RouteSlot {
    pub fn write_header(
        &self,
        direction: Direction,
        packet_type: PacketType,
        sequence: u64,
    ) -> Option<[u8; HEADER_BYTES]> {
        let fields = HeaderFields {
            sequence,
            session_id: self.session_id,
            session_version: self.session_version,
        };
        crypto::write_header(direction, packet_type as u8, &fields, &self.private_key)
    }

    /// Verify a header against this slot's key and identity.
    pub fn read_header(
        &self,
        direction: Direction,
        packet_type: PacketType,
        header: &[u8],
    ) -> Option<HeaderFields> {
        let fields = crypto::read_header(direction, packet_type as u8, header, &self.private_key)?;
        (fields.session_id == self.session_id && fields.session_version == self.session_version)
            .then_some(fields)
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    start_time: f64,
    last_send_time: Option<f64>,
    send_interval: f64,
    next_address: Address,
    packet: Packet,
}

impl PendingRequest {
    fn new(now: f64, send_interval: f64, next_address: Address, packet: Packet) -> Self {
        Self {
            start_time: now,
            last_send_time: None,
            send_interval,
            next_address,
            packet,
        }
    }

    fn due(&mut self, now: f64) -> Option<(Address, Packet)> {
        if let Some(last) = self.last_send_time {
            if now - last < self.send_interval {
                return None;
            }
        }
        self.last_send_time = Some(now);
        Some((self.next_address, self.packet.clone()))
    }
}

// ============================================================================
// Route Manager
// ============================================================================

pub struct RouteManager {
    route_secret: SecretKey,
    backend_public: PublicKey,
    fallback_flags: FallbackFlags,
    current: Option<RouteSlot>,
    previous: Option<RouteSlot>,
    pending_route: Option<(RouteSlot, PendingRequest)>,
    pending_continue: Option<PendingRequest>,
    route_expire_time: f64,
}

impl RouteManager {
    /// `route_secret` opens tokens addressed to this client; `backend_public`
    /// is the control-plane key that sealed them.
    pub fn new(route_secret: SecretKey, backend_public: PublicKey) -> Self {
        Self {
            route_secret,
            backend_public,
            fallback_flags: FallbackFlags::empty(),
            current: None,
            previous: None,
            pending_route: None,
            pending_continue: None,
            route_expire_time: 0.0,
        }
    }

    pub fn route_public_key(&self) -> PublicKey {
        self.route_secret.public_key()
    }

    pub fn state(&self) -> RouteState {
        if !self.fallback_flags.is_empty() {
            RouteState::FallbackToDirect
        } else if self.pending_route.is_some() {
            RouteState::PendingRoute
        } else if self.current.is_some() {
            RouteState::CurrentRoute
        } else {
            RouteState::Direct
        }
    }

    pub fn fallback_flags(&self) -> FallbackFlags {
        self.fallback_flags
    }

    pub fn is_fallback(&self) -> bool {
        !self.fallback_flags.is_empty()
    }

    pub fn current_route(&self) -> Option<&RouteSlot> {
        self.current.as_ref()
    }

    pub fn previous_route(&self) -> Option<&RouteSlot> {
        self.previous.as_ref()
    }

    pub fn pending_route(&self) -> Option<&RouteSlot> {
        self.pending_route.as_ref().map(|(slot, _)| slot)
    }

    pub fn has_pending_continue(&self) -> bool {
        self.pending_continue.is_some()
    }

    pub fn route_expire_time(&self) -> f64 {
        self.route_expire_time
    }

    fn clear_routes(&mut self) {
        self.current = None;
        self.previous = None;
        self.pending_route = None;
        self.pending_continue = None;
    }

    pub fn fallback_to_direct(&mut self, flag: FallbackFlags) {
        if self.fallback_flags.is_empty() {
            warn!("Falling back to direct: {}", flag);
        } else {
            debug!("Additional fallback condition: {}", flag);
        }
        self.fallback_flags.insert(flag);
        self.clear_routes();
    }

    /// Control plane chose the direct path. Not a failure.
    pub fn direct_route(&mut self) {
        if self.current.is_some() || self.pending_route.is_some() {
            info!("Route manager switching to direct");
        }
        self.clear_routes();
    }

    /// Start a new route from `num_tokens` concatenated route tokens. The
    /// first is ours; the rest are forwarded to the first hop.
    pub fn begin_next_route(&mut self, tokens: &[u8], num_tokens: usize, timestamp: u64, now: f64) {
        if self.is_fallback() {
            return;
        }
        if self.pending_route.is_some() || self.pending_continue.is_some() {
            self.fallback_to_direct(FallbackFlags::PREVIOUS_UPDATE_STILL_PENDING);
            return;
        }
        if !(2..=MAX_TOKENS).contains(&num_tokens)
            || tokens.len() != num_tokens * ENCRYPTED_ROUTE_TOKEN_BYTES
        {
            self.fallback_to_direct(FallbackFlags::BAD_ROUTE_TOKEN);
            return;
        }

        let (ours, forward) = tokens.split_at(ENCRYPTED_ROUTE_TOKEN_BYTES);
        let token = match RouteToken::open(ours, &self.backend_public, &self.route_secret) {
            Some(token) if !token.is_expired(timestamp) => token,
            _ => {
                self.fallback_to_direct(FallbackFlags::BAD_ROUTE_TOKEN);
                return;
            }
        };

        info!(
            "Requesting route {:016x} v{} via {}",
            token.session_id, token.session_version, token.next_address
        );
        let slot = RouteSlot::from(&token);
        let request = PendingRequest::new(
            now,
            ROUTE_REQUEST_SEND_TIME,
            token.next_address,
            Packet::RouteRequest(forward.to_vec()),
        );
        self.pending_route = Some((slot, request));
    }

    /// Extend the current route with `num_tokens` continue tokens.
    pub fn continue_next_route(
        &mut self,
        tokens: &[u8],
        num_tokens: usize,
        timestamp: u64,
        now: f64,
    ) {
        if self.is_fallback() {
            return;
        }
        let Some((session_id, session_version, next_address)) = self
            .current
            .as_ref()
            .map(|c| (c.session_id, c.session_version, c.next_address))
        else {
            self.fallback_to_direct(FallbackFlags::NO_ROUTE_TO_CONTINUE);
            return;
        };
        if self.pending_route.is_some() || self.pending_continue.is_some() {
            self.fallback_to_direct(FallbackFlags::PREVIOUS_UPDATE_STILL_PENDING);
            return;
        }
        if !(2..=MAX_TOKENS).contains(&num_tokens)
            || tokens.len() != num_tokens * ENCRYPTED_CONTINUE_TOKEN_BYTES
        {
            self.fallback_to_direct(FallbackFlags::BAD_CONTINUE_TOKEN);
            return;
        }

        let (ours, forward) = tokens.split_at(ENCRYPTED_CONTINUE_TOKEN_BYTES);
        let valid = ContinueToken::open(ours, &self.backend_public, &self.route_secret).filter(|t| {
            !t.is_expired(timestamp)
                && t.session_id == session_id
                && t.session_version == session_version
        });
        if valid.is_none() {
            self.fallback_to_direct(FallbackFlags::BAD_CONTINUE_TOKEN);
            return;
        }

        debug!("Continuing route {:016x} v{}", session_id, session_version);
        self.pending_continue = Some(PendingRequest::new(
            now,
            CONTINUE_REQUEST_SEND_TIME,
            next_address,
            Packet::ContinueRequest(forward.to_vec()),
        ));
    }

    /// The route or continue request to (re)send now, if one is due.
    pub fn update(&mut self, now: f64) -> Option<(Address, Packet)> {
        if self.is_fallback() {
            return None;
        }
        if let Some((_, request)) = self.pending_route.as_mut() {
            return request.due(now);
        }
        self.pending_continue.as_mut().and_then(|request| request.due(now))
    }

    pub fn check_for_timeouts(&mut self, now: f64) {
        if self.is_fallback() {
            return;
        }
        if let Some((_, request)) = &self.pending_route {
            if now - request.start_time >= ROUTE_REQUEST_TIMEOUT {
                self.fallback_to_direct(FallbackFlags::ROUTE_REQUEST_TIMED_OUT);
                return;
            }
        }
        if let Some(request) = &self.pending_continue {
            if now - request.start_time >= CONTINUE_REQUEST_TIMEOUT {
                self.fallback_to_direct(FallbackFlags::CONTINUE_REQUEST_TIMED_OUT);
                return;
            }
        }
        if self.current.is_some() && now >= self.route_expire_time {
            self.fallback_to_direct(FallbackFlags::ROUTE_EXPIRED);
        }
    }

    /// Header of a route response that verifies under the pending route.
    pub fn verify_route_response(&self, packet: &HeaderPacket) -> Option<HeaderFields> {
        let (slot, _) = self.pending_route.as_ref()?;
        slot.read_header(Direction::ServerToClient, PacketType::RouteResponse, &packet.header)
    }

    /// Route response from the first hop. True if it confirmed the pending route.
    pub fn process_route_response(&mut self, packet: &HeaderPacket, now: f64) -> bool {
        if self.verify_route_response(packet).is_none() {
            return false;
        }
        self.confirm_pending_route(now);
        true
    }

    /// Pending becomes current; current is kept as previous for the grace window.
    pub fn confirm_pending_route(&mut self, now: f64) {
        let Some((slot, request)) = self.pending_route.take() else {
            return;
        };
        if self.current.is_some() {
            self.route_expire_time += 2.0 * SLICE_SECONDS;
        } else {
            self.route_expire_time = request.start_time + 2.0 * SLICE_SECONDS;
        }
        info!(
            "Route {:016x} v{} established via {} after {:.3}s",
            slot.session_id,
            slot.session_version,
            slot.next_address,
            now - request.start_time
        );
        self.previous = self.current.replace(slot);
    }

    /// Header of a continue response that verifies under the current route,
    /// while a continue is outstanding.
    pub fn verify_continue_response(&self, packet: &HeaderPacket) -> Option<HeaderFields> {
        self.pending_continue.as_ref()?;
        self.current
            .as_ref()?
            .read_header(Direction::ServerToClient, PacketType::ContinueResponse, &packet.header)
    }

    pub fn process_continue_response(&mut self, packet: &HeaderPacket) -> bool {
        if self.verify_continue_response(packet).is_none() {
            return false;
        }
        self.confirm_continue_route();
        true
    }

    pub fn confirm_continue_route(&mut self) {
        if self.pending_continue.take().is_some() {
            self.route_expire_time += SLICE_SECONDS;
            self.previous = None;
            debug!("Continue confirmed, route expires at {:.1}", self.route_expire_time);
        }
    }

    /// Wrap an outgoing payload or ping under the current route.
    pub fn prepare_send_packet(
        &self,
        packet_type: PacketType,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Option<(Address, Packet)> {
        let current = self.current.as_ref()?;
        let header = current.write_header(Direction::ClientToServer, packet_type, sequence)?;
        let packet = HeaderPacket::new(header, payload);
        let packet = match packet_type {
            PacketType::ClientToServer => Packet::ClientToServer(packet),
            PacketType::Ping => Packet::Ping(packet),
            _ => return None,
        };
        Some((current.next_address, packet))
    }

    /// Verify a server-to-client or pong header against current, then previous.
    pub fn process_server_to_client_packet(
        &self,
        packet_type: PacketType,
        packet: &HeaderPacket,
    ) -> Option<HeaderFields> {
        [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|slot| slot.read_header(Direction::ServerToClient, packet_type, &packet.header))
    }
}
