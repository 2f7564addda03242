//! Server Session Tables
//!
//! `PendingSessionManager` holds clients the application asked to upgrade
//! until their upgrade response arrives. `SessionManager` holds upgraded
//! sessions, indexed by client address and by session id. Each entry owns
//! its route slots, replay windows and trackers.

use std::collections::HashMap;

use log::{debug, info};

use crate::address::Address;
use crate::constants::{
    ENCRYPTED_UPGRADE_TOKEN_BYTES, KEY_BYTES, ROUTE_EXPIRE_SAFETY, ROUTE_UPDATE_RESEND_TIME,
    SESSION_TIMEOUT, SLICE_SECONDS, UPGRADE_TIMEOUT,
};
use crate::crypto::{Direction, HeaderFields, KxKeyPair, SessionKeys};
use crate::packets::{
    ClientStatsPacket, HeaderPacket, Packet, PacketType, RouteUpdatePacket, UpdateType,
    UpgradeConfirmPacket,
};
use crate::quality::{JitterTracker, OutOfOrderTracker, PacketLossTracker};
use crate::replay::ReplayProtection;
use crate::route::RouteSlot;
use crate::tokens::{ContinueToken, RouteToken};

// ============================================================================
// Pending Sessions
// ============================================================================

pub struct PendingSessionEntry {
    pub address: Address,
    pub session_id: u64,
    pub user_tag: u64,
    pub kx: KxKeyPair,
    pub upgrade_token: [u8; ENCRYPTED_UPGRADE_TOKEN_BYTES],
    pub upgrade_sequence: u64,
    pub create_time: f64,
    pub last_send_time: Option<f64>,
}

impl PendingSessionEntry {
    pub fn is_expired(&self, now: f64) -> bool {
        now - self.create_time >= UPGRADE_TIMEOUT
    }
}

#[derive(Default)]
pub struct PendingSessionManager {
    entries: HashMap<Address, PendingSessionEntry>,
}

impl PendingSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any pending upgrade for the same address.
    pub fn add(&mut self, entry: PendingSessionEntry) -> Option<PendingSessionEntry> {
        self.entries.insert(entry.address, entry)
    }

    pub fn remove(&mut self, address: &Address) -> Option<PendingSessionEntry> {
        self.entries.remove(address)
    }

    pub fn find(&self, address: &Address) -> Option<&PendingSessionEntry> {
        self.entries.get(address)
    }

    pub fn find_mut(&mut self, address: &Address) -> Option<&mut PendingSessionEntry> {
        self.entries.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingSessionEntry> {
        self.entries.values_mut()
    }

    /// Remove and return every entry whose upgrade window has passed.
    pub fn take_expired(&mut self, now: f64) -> Vec<PendingSessionEntry> {
        let expired: Vec<Address> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.address)
            .collect();
        expired
            .iter()
            .filter_map(|address| self.entries.remove(address))
            .collect()
    }
}

// ============================================================================
// Session Entry
// ============================================================================

/// What the server did with a route request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteRequestOutcome {
    /// Newer version, installed as pending. Carries the response to send.
    Installed(Address, Packet),
    /// Same version as already installed. Response is resent.
    Duplicate(Address, Packet),
    Ignored,
}

pub struct SessionEntry {
    pub address: Address,
    pub session_id: u64,
    pub user_tag: u64,
    pub keys: SessionKeys,
    pub open_session_sequence: u8,
    pub client_route_public_key: [u8; KEY_BYTES],
    pub platform_id: u32,
    pub connection_type: u32,
    /// Resent if the client repeats its upgrade response.
    pub upgrade_confirm: Option<UpgradeConfirmPacket>,

    pending_route: Option<RouteSlot>,
    current_route: Option<RouteSlot>,
    previous_route: Option<RouteSlot>,

    pub payload_replay: ReplayProtection,
    pub special_replay: ReplayProtection,
    pub internal_replay: ReplayProtection,
    pub packet_loss: PacketLossTracker,
    pub out_of_order: OutOfOrderTracker,
    pub jitter: JitterTracker,
    pub packets_lost_client_to_server: u64,

    pub stats: ClientStatsPacket,
    pub last_stats_time: Option<f64>,
    pub last_packet_time: f64,

    special_sequence: u64,
    internal_sequence: u64,

    update_sequence: u64,
    pending_update: Option<RouteUpdatePacket>,
    last_update_send_time: Option<f64>,

    pub next_backend_update_time: f64,
    pub backend_failures: u32,
    pub slice_number: u64,
    pub send_over_next: bool,
    pub multipath: bool,
    /// Earliest time the client's route can lapse without another update.
    route_expire_time: f64,
}

impl SessionEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: Address,
        session_id: u64,
        user_tag: u64,
        keys: SessionKeys,
        open_session_sequence: u8,
        client_route_public_key: [u8; KEY_BYTES],
        platform_id: u32,
        connection_type: u32,
        now: f64,
    ) -> Self {
        Self {
            address,
            session_id,
            user_tag,
            keys,
            open_session_sequence,
            client_route_public_key,
            platform_id,
            connection_type,
            upgrade_confirm: None,
            pending_route: None,
            current_route: None,
            previous_route: None,
            payload_replay: ReplayProtection::new(),
            special_replay: ReplayProtection::new(),
            internal_replay: ReplayProtection::new(),
            packet_loss: PacketLossTracker::new(),
            out_of_order: OutOfOrderTracker::default(),
            jitter: JitterTracker::default(),
            packets_lost_client_to_server: 0,
            stats: ClientStatsPacket::default(),
            last_stats_time: None,
            last_packet_time: now,
            special_sequence: 0,
            internal_sequence: 0,
            update_sequence: 0,
            pending_update: None,
            last_update_send_time: None,
            next_backend_update_time: now,
            backend_failures: 0,
            slice_number: 0,
            send_over_next: false,
            multipath: false,
            route_expire_time: 0.0,
        }
    }

    pub fn current_route(&self) -> Option<&RouteSlot> {
        self.current_route.as_ref()
    }

    pub fn pending_route(&self) -> Option<&RouteSlot> {
        self.pending_route.as_ref()
    }

    pub fn previous_route(&self) -> Option<&RouteSlot> {
        self.previous_route.as_ref()
    }

    pub fn route_expire_time(&self) -> f64 {
        self.route_expire_time
    }

    /// Track the client's route lifetime for an update sent at `now`. A new
    /// route lives two slices from when the client starts it, a continue
    /// adds one slice. The client starts no earlier than `now`, so this
    /// never runs past the client's own expiry.
    pub fn extend_route_lifetime(&mut self, update_type: UpdateType, now: f64) {
        match update_type {
            UpdateType::Direct => self.route_expire_time = 0.0,
            UpdateType::Route => self.route_expire_time = now + 2.0 * SLICE_SECONDS,
            UpdateType::Continue => self.route_expire_time += SLICE_SECONDS,
        }
    }

    pub fn route_expiring(&self, now: f64) -> bool {
        now + ROUTE_EXPIRE_SAFETY >= self.route_expire_time
    }

    pub fn next_special_sequence(&mut self) -> u64 {
        self.special_sequence += 1;
        self.special_sequence
    }

    pub fn next_internal_sequence(&mut self) -> u64 {
        self.internal_sequence += 1;
        self.internal_sequence
    }

    pub fn is_timed_out(&self, now: f64) -> bool {
        now - self.last_packet_time >= SESSION_TIMEOUT
    }

    pub fn clear_routes(&mut self) {
        self.pending_route = None;
        self.current_route = None;
        self.previous_route = None;
    }

    fn special_response(&mut self, packet_type: PacketType, slot: &RouteSlot) -> Option<(Address, Packet)> {
        let sequence = self.next_special_sequence();
        let header = slot.write_header(Direction::ServerToClient, packet_type, sequence)?;
        let packet = HeaderPacket::new(header, Vec::new());
        let packet = match packet_type {
            PacketType::RouteResponse => Packet::RouteResponse(packet),
            PacketType::ContinueResponse => Packet::ContinueResponse(packet),
            _ => return None,
        };
        Some((slot.next_address, packet))
    }

    /// Install a route token forwarded by the last hop. Only a strictly newer
    /// session version replaces what is installed.
    pub fn process_route_request(&mut self, token: &RouteToken, timestamp: u64) -> RouteRequestOutcome {
        if token.session_id != self.session_id || token.is_expired(timestamp) {
            return RouteRequestOutcome::Ignored;
        }

        let installed = self.pending_route.as_ref().or(self.current_route.as_ref()).cloned();
        if let Some(slot) = installed {
            if token.session_version == slot.session_version {
                return match self.special_response(PacketType::RouteResponse, &slot) {
                    Some((to, packet)) => RouteRequestOutcome::Duplicate(to, packet),
                    None => RouteRequestOutcome::Ignored,
                };
            }
            if token.session_version <= slot.session_version {
                debug!(
                    "Ignoring route request v{} for session {:016x}, have v{}",
                    token.session_version, self.session_id, slot.session_version
                );
                return RouteRequestOutcome::Ignored;
            }
        }

        let slot = RouteSlot::from(token);
        info!(
            "Session {:016x} pending route v{} via {}",
            self.session_id, slot.session_version, slot.next_address
        );
        let response = self.special_response(PacketType::RouteResponse, &slot);
        self.pending_route = Some(slot);
        match response {
            Some((to, packet)) => RouteRequestOutcome::Installed(to, packet),
            None => RouteRequestOutcome::Ignored,
        }
    }

    /// Continue tokens must match the current version exactly.
    pub fn process_continue_request(
        &mut self,
        token: &ContinueToken,
        timestamp: u64,
    ) -> Option<(Address, Packet)> {
        if token.session_id != self.session_id || token.is_expired(timestamp) {
            return None;
        }
        let current = self.current_route.as_mut()?;
        if current.session_version != token.session_version {
            debug!(
                "Ignoring continue v{} for session {:016x}, current v{}",
                token.session_version, self.session_id, current.session_version
            );
            return None;
        }
        current.expire_timestamp = current.expire_timestamp.max(token.expire_timestamp);
        let slot = current.clone();
        self.previous_route = None;
        self.special_response(PacketType::ContinueResponse, &slot)
    }

    fn promote_pending(&mut self) {
        if let Some(pending) = self.pending_route.take() {
            info!(
                "Session {:016x} route v{} is now current",
                self.session_id, pending.session_version
            );
            self.previous_route = self.current_route.replace(pending);
        }
    }

    /// Verify a client-to-server header: current, then pending (which
    /// promotes it), then previous.
    pub fn verify_client_to_server(
        &mut self,
        packet_type: PacketType,
        header: &[u8],
    ) -> Option<HeaderFields> {
        let read = |slot: &Option<RouteSlot>| {
            slot.as_ref()
                .and_then(|s| s.read_header(Direction::ClientToServer, packet_type, header))
        };
        if let Some(fields) = read(&self.current_route) {
            return Some(fields);
        }
        if let Some(fields) = read(&self.pending_route) {
            self.promote_pending();
            return Some(fields);
        }
        read(&self.previous_route)
    }

    /// Header for a server-to-client packet over the current route.
    pub fn server_to_client_header(
        &self,
        packet_type: PacketType,
        sequence: u64,
    ) -> Option<(Address, [u8; crate::constants::HEADER_BYTES])> {
        let current = self.current_route.as_ref()?;
        let header = current.write_header(Direction::ServerToClient, packet_type, sequence)?;
        Some((current.next_address, header))
    }

    /// Record a payload packet that verified and passed replay protection.
    pub fn payload_received(&mut self, sequence: u64, now: f64) {
        self.packet_loss.packet_received(sequence);
        self.out_of_order.packet_received(sequence);
        self.jitter.packet_received(sequence, now);
        self.last_packet_time = now;
    }

    pub fn update_trackers(&mut self) {
        self.packets_lost_client_to_server += self.packet_loss.update();
    }

    // ------------------------------------------------------------------------
    // Route updates
    // ------------------------------------------------------------------------

    /// Queue a new route update. It is resent until acked.
    pub fn begin_route_update(&mut self, mut update: RouteUpdatePacket) -> u64 {
        self.update_sequence += 1;
        update.sequence = self.update_sequence;
        self.pending_update = Some(update);
        self.last_update_send_time = None;
        self.update_sequence
    }

    pub fn route_update_due(&mut self, now: f64) -> Option<RouteUpdatePacket> {
        let update = self.pending_update.as_ref()?;
        if let Some(last) = self.last_update_send_time {
            if now - last < ROUTE_UPDATE_RESEND_TIME {
                return None;
            }
        }
        self.last_update_send_time = Some(now);
        Some(update.clone())
    }

    pub fn has_pending_route_update(&self) -> bool {
        self.pending_update.is_some()
    }

    pub fn process_route_update_ack(&mut self, sequence: u64) -> bool {
        if sequence == self.update_sequence && self.pending_update.take().is_some() {
            debug!("Session {:016x} acked route update {}", self.session_id, sequence);
            return true;
        }
        false
    }
}

// ============================================================================
// Session Manager
// ============================================================================

#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<Address, SessionEntry>,
    by_session_id: HashMap<u64, Address>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. An existing session at the same address is replaced
    /// and returned.
    pub fn add(&mut self, entry: SessionEntry) -> Option<SessionEntry> {
        let previous = self.remove(&entry.address);
        self.by_session_id.insert(entry.session_id, entry.address);
        self.sessions.insert(entry.address, entry);
        previous
    }

    pub fn remove(&mut self, address: &Address) -> Option<SessionEntry> {
        let entry = self.sessions.remove(address)?;
        self.by_session_id.remove(&entry.session_id);
        Some(entry)
    }

    pub fn find(&self, address: &Address) -> Option<&SessionEntry> {
        self.sessions.get(address)
    }

    pub fn find_mut(&mut self, address: &Address) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(address)
    }

    pub fn find_by_session_id(&self, session_id: u64) -> Option<&SessionEntry> {
        self.sessions.get(self.by_session_id.get(&session_id)?)
    }

    pub fn find_by_session_id_mut(&mut self, session_id: u64) -> Option<&mut SessionEntry> {
        let address = self.by_session_id.get(&session_id)?;
        self.sessions.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionEntry> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionEntry> {
        self.sessions.values_mut()
    }

    /// Remove sessions that have not heard from their client in time.
    pub fn remove_timed_out(&mut self, now: f64) -> Vec<SessionEntry> {
        let expired: Vec<Address> = self
            .sessions
            .values()
            .filter(|entry| entry.is_timed_out(now))
            .map(|entry| entry.address)
            .collect();
        expired
            .iter()
            .filter_map(|address| self.remove(address))
            .collect()
    }
}
