//! Client Session
//!
//! [`ClientCore`] is the whole client side of one connection as a plain
//! synchronous state machine: the upgrade handshake, the route manager,
//! pings on both paths, near-relay pings, stats reporting and payload
//! delivery. It is driven by `process_packet` and a 10Hz `update`, and
//! queues everything it wants to send in an outbox.
//!
//! [`ClientWorker`] runs a core on a tokio task against a [`Transport`] and
//! talks to the application through bounded crossbeam queues. Game packets
//! are sent synchronously from the application thread through the shared
//! [`ClientSnapshot`].
//!
//! ```text
//!   Closed ──open──► Open ──upgrade request──► (response sent) ──confirm──► Upgraded
//!                     ▲                                                      │
//!                     └────────────────────── close ◄────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use crypto_box::aead::OsRng;
use crypto_box::{PublicKey, SecretKey};
use ed25519_dalek::VerifyingKey;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::address::Address;
use crate::constants::{
    CLIENT_STATS_SEND_TIME, COMMAND_QUEUE_SIZE, KEY_BYTES, MAX_CONNECTION_TYPE, MAX_PLATFORM_ID,
    MTU, NOTIFY_QUEUE_SIZE, PING_SAFETY, PING_STATS_WINDOW, PING_TIME, PING_TIMEOUT,
    PROTOCOL_VERSION, ROUTE_UPDATE_TIMEOUT, UPGRADE_REQUEST_SEND_TIME, UPGRADE_TIMEOUT,
};
use crate::crypto::{Direction, KxKeyPair, OpenError, SessionKeys};
use crate::metrics::Metrics;
use crate::near::NearRelayManager;
use crate::packets::{
    read_packet, write_packet, ClientStatsPacket, DirectPacket, DirectPingPacket, HeaderPacket,
    Packet, PacketType, ReadContext, RouteUpdateAckPacket, RouteUpdatePacket, SessionCipher,
    UpdateType, UpgradeConfirmPacket, UpgradeRequestPacket, UpgradeResponsePacket, WriteContext,
};
use crate::quality::{
    route_stats, JitterTracker, OutOfOrderTracker, PacketLossTracker, PathQuality, PingHistory,
};
use crate::replay::ReplayProtection;
use crate::route::{FallbackFlags, RouteManager, RouteState};
use crate::sender::PayloadSender;
use crate::tags::MagicSet;
use crate::tokens::current_timestamp;
use crate::transport::{send_all, Transport};

#[derive(Clone)]
pub struct ClientConfig {
    /// Verifies upgrade requests and confirms from the game server.
    pub customer_public_key: VerifyingKey,
    /// Control-plane key that seals route and continue tokens.
    pub backend_public_key: PublicKey,
    pub platform_id: u32,
    pub connection_type: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotify {
    PacketReceived(Vec<u8>),
    Upgraded { session_id: u64 },
    StatsUpdated(ClientStatsPacket),
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Closed,
    Open,
    Upgraded,
}

/// The part of the client the application thread touches directly.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub open: bool,
    pub sender: PayloadSender,
}

impl ClientSnapshot {
    fn closed() -> Self {
        Self {
            open: false,
            sender: PayloadSender::new(Direction::ClientToServer, Address::None, Address::None),
        }
    }

    pub fn prepare(&mut self, payload: &[u8], now: f64) -> Vec<(Address, Vec<u8>)> {
        if !self.open {
            return Vec::new();
        }
        self.sender.prepare(payload, now)
    }
}

struct UpgradeHandshake {
    kx: KxKeyPair,
    server_kx_public_key: [u8; KEY_BYTES],
    response: UpgradeResponsePacket,
    start_time: f64,
    last_send_time: f64,
}

// ============================================================================
// Client Core
// ============================================================================

pub struct ClientCore {
    config: ClientConfig,
    metrics: Arc<Metrics>,
    timestamp_base: u64,
    ready: bool,

    state: ClientState,
    server_address: Address,
    external_address: Address,
    magic: MagicSet,
    session_id: u64,
    open_session_sequence: u8,

    route: RouteManager,
    near_relays: NearRelayManager,
    upgrade: Option<UpgradeHandshake>,
    keys: Option<SessionKeys>,
    upgraded_time: f64,

    internal_sequence: u64,
    special_sequence: u64,
    internal_replay: ReplayProtection,
    payload_replay: ReplayProtection,
    special_replay: ReplayProtection,

    packet_loss: PacketLossTracker,
    out_of_order: OutOfOrderTracker,
    jitter: JitterTracker,
    packets_lost_server_to_client: u64,

    direct_pings: PingHistory,
    next_pings: PingHistory,
    direct_quality: PathQuality,
    next_quality: PathQuality,
    last_direct_ping_time: Option<f64>,
    last_next_ping_time: Option<f64>,
    route_start_time: f64,

    route_update_sequence: u64,
    last_route_update_time: f64,
    multipath: bool,

    last_stats_time: Option<f64>,
    stats: ClientStatsPacket,

    outbox: Vec<(Address, Vec<u8>)>,
    notifications: Vec<ClientNotify>,
    snapshot: Arc<Mutex<ClientSnapshot>>,
}

impl ClientCore {
    pub fn new(mut config: ClientConfig, metrics: Arc<Metrics>) -> Self {
        config.platform_id = config.platform_id.min(MAX_PLATFORM_ID);
        config.connection_type = config.connection_type.min(MAX_CONNECTION_TYPE);
        let route = RouteManager::new(
            SecretKey::generate(&mut OsRng),
            config.backend_public_key.clone(),
        );
        Self {
            config,
            metrics,
            timestamp_base: current_timestamp(),
            ready: false,
            state: ClientState::Closed,
            server_address: Address::None,
            external_address: Address::None,
            magic: MagicSet::default(),
            session_id: 0,
            open_session_sequence: 0,
            route,
            near_relays: NearRelayManager::new(),
            upgrade: None,
            keys: None,
            upgraded_time: 0.0,
            internal_sequence: 0,
            special_sequence: 0,
            internal_replay: ReplayProtection::new(),
            payload_replay: ReplayProtection::new(),
            special_replay: ReplayProtection::new(),
            packet_loss: PacketLossTracker::new(),
            out_of_order: OutOfOrderTracker::default(),
            jitter: JitterTracker::default(),
            packets_lost_server_to_client: 0,
            direct_pings: PingHistory::new(),
            next_pings: PingHistory::new(),
            direct_quality: PathQuality::default(),
            next_quality: PathQuality::default(),
            last_direct_ping_time: None,
            last_next_ping_time: None,
            route_start_time: 0.0,
            route_update_sequence: 0,
            last_route_update_time: 0.0,
            multipath: false,
            last_stats_time: None,
            stats: ClientStatsPacket::default(),
            outbox: Vec::new(),
            notifications: Vec::new(),
            snapshot: Arc::new(Mutex::new(ClientSnapshot::closed())),
        }
    }

    fn reset(&mut self) {
        self.external_address = Address::None;
        self.magic = MagicSet::default();
        self.session_id = 0;
        self.route = RouteManager::new(
            SecretKey::generate(&mut OsRng),
            self.config.backend_public_key.clone(),
        );
        self.near_relays.clear();
        self.upgrade = None;
        self.keys = None;
        self.internal_sequence = 0;
        self.special_sequence = 0;
        self.internal_replay.reset();
        self.payload_replay.reset();
        self.special_replay.reset();
        self.packet_loss = PacketLossTracker::new();
        self.out_of_order = OutOfOrderTracker::default();
        self.jitter = JitterTracker::default();
        self.packets_lost_server_to_client = 0;
        self.direct_pings.clear();
        self.next_pings.clear();
        self.direct_quality.reset();
        self.next_quality.reset();
        self.last_direct_ping_time = None;
        self.last_next_ping_time = None;
        self.route_update_sequence = 0;
        self.multipath = false;
        self.last_stats_time = None;
        self.stats = ClientStatsPacket::default();
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn route_state(&self) -> RouteState {
        self.route.state()
    }

    pub fn fallback_flags(&self) -> FallbackFlags {
        self.route.fallback_flags()
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn server_address(&self) -> Address {
        self.server_address
    }

    /// Last stats computed for the server.
    pub fn stats(&self) -> &ClientStatsPacket {
        &self.stats
    }

    pub fn snapshot(&self) -> Arc<Mutex<ClientSnapshot>> {
        self.snapshot.clone()
    }

    pub fn drain_outgoing(&mut self) -> Vec<(Address, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_notifications(&mut self) -> Vec<ClientNotify> {
        std::mem::take(&mut self.notifications)
    }

    fn timestamp(&self, now: f64) -> u64 {
        self.timestamp_base + now as u64
    }

    // ------------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------------

    pub fn open_session(&mut self, server_address: Address) {
        if self.state != ClientState::Closed {
            self.close_session();
        }
        self.reset();
        self.state = ClientState::Open;
        self.server_address = server_address;
        self.open_session_sequence = self.open_session_sequence.wrapping_add(1);

        let mut snapshot = self.snapshot.lock();
        snapshot.open = true;
        snapshot.sender = PayloadSender::new(Direction::ClientToServer, Address::None, server_address);
        info!("Client session opened to {}", server_address);
    }

    pub fn close_session(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        info!("Client session to {} closed", self.server_address);
        self.reset();
        self.state = ClientState::Closed;
        self.server_address = Address::None;
        *self.snapshot.lock() = ClientSnapshot::closed();
    }

    /// Queue a game packet. Direct, over next, or both, per the current route.
    pub fn send_packet(&mut self, payload: &[u8], now: f64) -> bool {
        if self.state == ClientState::Closed {
            warn!("send_packet called with no open session");
            return false;
        }
        if payload.is_empty() || payload.len() > MTU {
            warn!("Dropping {} byte payload, limit is {}", payload.len(), MTU);
            return false;
        }
        let datagrams = self.snapshot.lock().prepare(payload, now);
        let sent = !datagrams.is_empty();
        self.outbox.extend(datagrams);
        sent
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn send_plain(&mut self, to: Address, packet: Packet) {
        let ctx = WriteContext::new(self.external_address, to, self.magic.current);
        match write_packet(&packet, &ctx) {
            Some(bytes) => self.outbox.push((to, bytes)),
            None => debug!("Failed to write {:?} to {}", packet.packet_type(), to),
        }
    }

    fn send_encrypted(&mut self, packet: Packet) {
        let Some(keys) = &self.keys else {
            return;
        };
        self.internal_sequence += 1;
        let ctx = WriteContext::new(self.external_address, self.server_address, self.magic.current)
            .encrypted(&keys.send, self.internal_sequence);
        match write_packet(&packet, &ctx) {
            Some(bytes) => self.outbox.push((self.server_address, bytes)),
            None => debug!("Failed to write {:?}", packet.packet_type()),
        }
    }

    fn send_route_request(&mut self, now: f64) {
        if let Some((to, packet)) = self.route.update(now) {
            if packet.packet_type() == PacketType::RouteRequest {
                self.metrics.inc_route_requests();
            }
            self.send_plain(to, packet);
        }
    }

    fn note_fallback(&self, was_fallback: bool) {
        if !was_fallback && self.route.is_fallback() {
            self.metrics.inc_fallbacks();
        }
    }

    fn deliver(&mut self, payload: Vec<u8>) {
        self.metrics.inc_payloads_delivered();
        self.notifications.push(ClientNotify::PacketReceived(payload));
    }

    fn payload_received(&mut self, sequence: u64, now: f64) {
        self.packet_loss.packet_received(sequence);
        self.out_of_order.packet_received(sequence);
        self.jitter.packet_received(sequence, now);
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    pub fn process_packet(&mut self, from: &Address, data: &[u8], now: f64) {
        self.metrics.inc_packets_rx();
        if self.state == ClientState::Closed {
            return;
        }
        let mut ctx = ReadContext::new(*from, self.external_address, &self.magic)
            .verified_by(&self.config.customer_public_key);
        if let Some(keys) = &self.keys {
            ctx = ctx.with_session(SessionCipher {
                receive_key: &keys.receive,
                internal_replay: &mut self.internal_replay,
                payload_replay: &mut self.payload_replay,
            });
        }
        let packet = match read_packet(data, ctx) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping packet from {}: {:#}", from, e);
                match e.downcast_ref::<OpenError>() {
                    Some(OpenError::Replayed) => self.metrics.inc_dropped_replay(),
                    Some(_) => self.metrics.inc_dropped_auth(),
                    None => self.metrics.inc_dropped_filter(),
                }
                return;
            }
        };

        let from_server = *from == self.server_address;
        match packet {
            Packet::Passthrough(payload) if from_server => self.deliver(payload),
            Packet::UpgradeRequest(request) if from_server => {
                self.process_upgrade_request(request, now)
            }
            Packet::UpgradeConfirm(confirm) if from_server => {
                self.process_upgrade_confirm(confirm, now)
            }
            Packet::Direct(direct) if from_server => self.process_direct(direct, now),
            Packet::DirectPong(pong) if from_server => {
                self.direct_pings.received(pong.ping_sequence, now)
            }
            Packet::RouteUpdate(update) if from_server => self.process_route_update(update, now),
            Packet::RouteResponse(response) => self.process_route_response(response, now),
            Packet::ContinueResponse(response) => self.process_continue_response(response),
            Packet::ServerToClient(packet) => self.process_server_to_client(packet, now),
            Packet::Pong(pong) => self.process_next_pong(pong, now),
            Packet::RelayPong(pong) => {
                if !self.near_relays.process_pong(from, &pong, self.session_id, now) {
                    debug!("Relay pong from {} matched no near relay", from);
                }
            }
            other => debug!("Ignoring {:?} from {}", other.packet_type(), from),
        }
        self.sync_snapshot();
    }

    fn process_upgrade_request(&mut self, request: UpgradeRequestPacket, now: f64) {
        if self.state != ClientState::Open {
            debug!("Ignoring upgrade request for {:016x}, already upgraded", request.session_id);
            return;
        }
        if request.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Server speaks protocol version {}, expected {}",
                request.protocol_version, PROTOCOL_VERSION
            );
            return;
        }

        let resend = self
            .upgrade
            .as_ref()
            .filter(|_| request.session_id == self.session_id)
            .map(|upgrade| upgrade.response.clone());
        if let Some(response) = resend {
            self.send_plain(self.server_address, Packet::UpgradeResponse(response));
            return;
        }

        let kx = KxKeyPair::generate();
        let response = UpgradeResponsePacket {
            client_open_session_sequence: self.open_session_sequence,
            client_kx_public_key: kx.public,
            client_route_public_key: *self.route.route_public_key().as_bytes(),
            upgrade_token: request.upgrade_token,
            platform_id: self.config.platform_id,
            connection_type: self.config.connection_type,
        };
        self.session_id = request.session_id;
        self.external_address = request.client_address;
        self.magic = request.magic;
        info!(
            "Server requested upgrade of session {:016x}, external address {}",
            self.session_id, self.external_address
        );
        self.upgrade = Some(UpgradeHandshake {
            kx,
            server_kx_public_key: request.server_kx_public_key,
            response: response.clone(),
            start_time: now,
            last_send_time: now,
        });
        self.send_plain(self.server_address, Packet::UpgradeResponse(response));
    }

    fn process_upgrade_confirm(&mut self, confirm: UpgradeConfirmPacket, now: f64) {
        let Some(upgrade) = &self.upgrade else {
            debug!("Upgrade confirm with no upgrade in progress");
            return;
        };
        if confirm.session_id != self.session_id
            || confirm.client_kx_public_key != upgrade.kx.public
            || confirm.server_kx_public_key != upgrade.server_kx_public_key
        {
            debug!("Upgrade confirm does not match the handshake in progress");
            return;
        }
        let Some(keys) = upgrade.kx.client_session_keys(&confirm.server_kx_public_key) else {
            warn!("Key exchange with server failed");
            return;
        };

        self.upgrade = None;
        self.state = ClientState::Upgraded;
        self.upgraded_time = now;
        self.last_route_update_time = now;
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.sender.local_address = self.external_address;
            snapshot
                .sender
                .upgrade(keys.send, self.open_session_sequence, self.magic.current);
        }
        self.keys = Some(keys);
        self.metrics.inc_upgrades_completed();
        info!("Client session {:016x} upgraded", self.session_id);
        self.notifications.push(ClientNotify::Upgraded {
            session_id: self.session_id,
        });
    }

    fn process_direct(&mut self, direct: DirectPacket, now: f64) {
        if direct.open_session_sequence != self.open_session_sequence {
            debug!(
                "Direct packet for open session {}, current is {}",
                direct.open_session_sequence, self.open_session_sequence
            );
            return;
        }
        self.payload_received(direct.sequence, now);
        self.deliver(direct.payload);
    }

    fn process_server_to_client(&mut self, packet: HeaderPacket, now: f64) {
        let Some(fields) = self
            .route
            .process_server_to_client_packet(PacketType::ServerToClient, &packet)
        else {
            debug!("Server to client packet did not verify under any route");
            self.metrics.inc_dropped_auth();
            return;
        };
        if !self.payload_replay.accept(fields.sequence) {
            self.metrics.inc_dropped_replay();
            return;
        }
        self.payload_received(fields.sequence, now);
        self.deliver(packet.payload);
    }

    fn process_route_response(&mut self, response: HeaderPacket, now: f64) {
        let Some(fields) = self.route.verify_route_response(&response) else {
            return;
        };
        if !self.special_replay.accept(fields.sequence) {
            self.metrics.inc_dropped_replay();
            return;
        }
        self.route.confirm_pending_route(now);
        self.route_start_time = now;
        self.metrics.inc_routes_established();
    }

    fn process_continue_response(&mut self, response: HeaderPacket) {
        let Some(fields) = self.route.verify_continue_response(&response) else {
            return;
        };
        if !self.special_replay.accept(fields.sequence) {
            self.metrics.inc_dropped_replay();
            return;
        }
        self.route.confirm_continue_route();
    }

    fn process_next_pong(&mut self, pong: HeaderPacket, now: f64) {
        let Some(fields) = self.route.process_server_to_client_packet(PacketType::Pong, &pong) else {
            debug!("Pong did not verify under any route");
            return;
        };
        if !self.special_replay.accept(fields.sequence) {
            return;
        }
        if let Some(ping_sequence) = pong.ping_sequence() {
            self.next_pings.received(ping_sequence, now);
        }
    }

    fn process_route_update(&mut self, update: RouteUpdatePacket, now: f64) {
        if self.state != ClientState::Upgraded {
            return;
        }
        if update.sequence > self.route_update_sequence {
            self.route_update_sequence = update.sequence;
            self.last_route_update_time = now;
            self.magic = update.magic;
            self.multipath = update.multipath;

            let timestamp = self.timestamp(now);
            let num_tokens = update.num_tokens as usize;
            let was_fallback = self.route.is_fallback();
            match update.update_type {
                UpdateType::Direct => self.route.direct_route(),
                UpdateType::Route => {
                    self.route.begin_next_route(&update.tokens, num_tokens, timestamp, now)
                }
                UpdateType::Continue => {
                    self.route.continue_next_route(&update.tokens, num_tokens, timestamp, now)
                }
            }
            self.note_fallback(was_fallback);

            if let Some(set) = &update.near_relays {
                self.near_relays.update(set, now);
            }
            debug!(
                "Route update {} ({:?}, {} tokens), route state {:?}",
                update.sequence,
                update.update_type,
                update.num_tokens,
                self.route.state()
            );
        } else {
            debug!("Re-acking route update {}", update.sequence);
        }

        self.send_encrypted(Packet::RouteUpdateAck(RouteUpdateAckPacket {
            sequence: update.sequence,
        }));
        self.send_route_request(now);
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    pub fn update(&mut self, now: f64) {
        if !self.ready {
            self.ready = true;
            self.notifications.push(ClientNotify::Ready);
        }
        match self.state {
            ClientState::Closed => return,
            ClientState::Open => self.update_upgrade(now),
            ClientState::Upgraded => {
                self.check_timeouts(now);
                self.send_route_request(now);
                self.send_pings(now);
                self.packets_lost_server_to_client += self.packet_loss.update();
                self.send_stats(now);
            }
        }
        self.snapshot.lock().sender.poll(now);
        self.sync_snapshot();
    }

    fn update_upgrade(&mut self, now: f64) {
        let Some(upgrade) = &mut self.upgrade else {
            return;
        };
        if now - upgrade.start_time >= UPGRADE_TIMEOUT {
            self.upgrade = None;
            self.metrics.inc_upgrades_timed_out();
            let was_fallback = self.route.is_fallback();
            self.route
                .fallback_to_direct(FallbackFlags::UPGRADE_RESPONSE_TIMED_OUT);
            self.note_fallback(was_fallback);
            return;
        }
        if now - upgrade.last_send_time >= UPGRADE_REQUEST_SEND_TIME {
            upgrade.last_send_time = now;
            let response = upgrade.response.clone();
            self.send_plain(self.server_address, Packet::UpgradeResponse(response));
        }
    }

    fn check_timeouts(&mut self, now: f64) {
        let was_fallback = self.route.is_fallback();
        self.route.check_for_timeouts(now);

        if !self.route.is_fallback() {
            let last_direct_pong = self
                .direct_pings
                .last_pong_time()
                .map_or(self.upgraded_time, |t| t.max(self.upgraded_time));
            if now - last_direct_pong >= PING_TIMEOUT {
                self.route.fallback_to_direct(FallbackFlags::DIRECT_PONG_TIMED_OUT);
            } else if self.route.current_route().is_some() {
                let last_next_pong = self
                    .next_pings
                    .last_pong_time()
                    .map_or(self.route_start_time, |t| t.max(self.route_start_time));
                if now - last_next_pong >= PING_TIMEOUT {
                    self.route.fallback_to_direct(FallbackFlags::NEXT_PONG_TIMED_OUT);
                }
            }
        }
        if !self.route.is_fallback() && now - self.last_route_update_time >= ROUTE_UPDATE_TIMEOUT {
            self.route.fallback_to_direct(FallbackFlags::ROUTE_UPDATE_TIMED_OUT);
        }
        self.note_fallback(was_fallback);
    }

    fn send_pings(&mut self, now: f64) {
        if self.last_direct_ping_time.map_or(true, |t| now - t >= PING_TIME) {
            self.last_direct_ping_time = Some(now);
            let ping_sequence = self.direct_pings.send(now);
            self.send_encrypted(Packet::DirectPing(DirectPingPacket { ping_sequence }));
        }

        if self.route.current_route().is_some()
            && self.last_next_ping_time.map_or(true, |t| now - t >= PING_TIME)
        {
            self.last_next_ping_time = Some(now);
            let ping_sequence = self.next_pings.send(now);
            self.special_sequence += 1;
            let ping = self.route.prepare_send_packet(
                PacketType::Ping,
                self.special_sequence,
                ping_sequence.to_le_bytes().to_vec(),
            );
            if let Some((to, packet)) = ping {
                self.send_plain(to, packet);
            }
        }

        let timestamp = self.timestamp(now);
        for (to, ping) in self.near_relays.pings_due(now, timestamp, self.session_id) {
            self.send_plain(to, Packet::RelayPing(ping));
        }
    }

    fn send_stats(&mut self, now: f64) {
        if self
            .last_stats_time
            .is_some_and(|t| now - t < CLIENT_STATS_SEND_TIME)
        {
            return;
        }
        self.last_stats_time = Some(now);

        let window_start = now - PING_STATS_WINDOW;
        self.direct_quality
            .update(route_stats(&self.direct_pings, window_start, now, PING_SAFETY));
        let on_next = self.route.current_route().is_some();
        if on_next {
            self.next_quality
                .update(route_stats(&self.next_pings, window_start, now, PING_SAFETY));
        } else {
            self.next_quality.reset();
        }
        self.near_relays.update_stats(now);

        let (kbps_up, packets_sent) = {
            let snapshot = self.snapshot.lock();
            (snapshot.sender.usage_kbps(), snapshot.sender.packets_sent())
        };
        let direct = self.direct_quality.stats;
        let next = self.next_quality.stats;
        self.stats = ClientStatsPacket {
            fallback_flags: self.route.fallback_flags().bits(),
            next: on_next,
            multipath: self.multipath,
            platform_id: self.config.platform_id,
            connection_type: self.config.connection_type,
            direct_rtt: direct.rtt,
            direct_jitter: direct.jitter,
            direct_packet_loss: direct.packet_loss,
            next_rtt: next.rtt,
            next_jitter: next.jitter,
            next_packet_loss: next.packet_loss,
            next_kbps_up: kbps_up as f32,
            jitter_server_to_client: self.jitter.jitter(),
            packets_sent_client_to_server: packets_sent,
            packets_lost_server_to_client: self.packets_lost_server_to_client,
            packets_out_of_order_server_to_client: self.out_of_order.out_of_order(),
            near_relays: self.near_relays.stats(),
        };
        self.send_encrypted(Packet::ClientStats(self.stats.clone()));
        self.notifications
            .push(ClientNotify::StatsUpdated(self.stats.clone()));
    }

    fn sync_snapshot(&mut self) {
        let mut snapshot = self.snapshot.lock();
        if !snapshot.open {
            return;
        }
        let route = self.route.current_route().cloned();
        let over_next = route.is_some() && !self.route.is_fallback();
        snapshot.sender.magic = self.magic.current;
        snapshot.sender.set_route(route, over_next, self.multipath);
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    OpenSession(Address),
    CloseSession,
    Shutdown,
}

/// Handle to a client core running on a tokio task.
pub struct ClientWorker<T: Transport> {
    commands: Sender<ClientCommand>,
    notifications: Receiver<ClientNotify>,
    snapshot: Arc<Mutex<ClientSnapshot>>,
    transport: Arc<T>,
    metrics: Arc<Metrics>,
    start: Instant,
    task: JoinHandle<()>,
}

impl<T: Transport> ClientWorker<T> {
    /// Spawn onto the current tokio runtime.
    pub fn spawn(config: ClientConfig, transport: T, metrics: Arc<Metrics>, tick: Duration) -> Self {
        let (command_tx, command_rx) = bounded(COMMAND_QUEUE_SIZE);
        let (notify_tx, notify_rx) = bounded(NOTIFY_QUEUE_SIZE);
        let core = ClientCore::new(config, metrics.clone());
        let snapshot = core.snapshot();
        let transport = Arc::new(transport);
        let start = Instant::now();
        let task = tokio::spawn(run_client(
            core,
            transport.clone(),
            command_rx,
            notify_tx,
            metrics.clone(),
            start,
            tick,
        ));
        info!("Client worker started on {}", transport.local_address());
        Self {
            commands: command_tx,
            notifications: notify_rx,
            snapshot,
            transport,
            metrics,
            start,
            task,
        }
    }

    fn command(&self, command: ClientCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!("Client command queue full, dropping {:?}", command);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn open_session(&self, server_address: Address) -> bool {
        self.command(ClientCommand::OpenSession(server_address))
    }

    pub fn close_session(&self) -> bool {
        self.command(ClientCommand::CloseSession)
    }

    /// Send a game packet from the calling thread.
    pub fn send_packet(&self, payload: &[u8]) -> bool {
        if payload.is_empty() || payload.len() > MTU {
            warn!("Dropping {} byte payload, limit is {}", payload.len(), MTU);
            return false;
        }
        let now = self.start.elapsed().as_secs_f64();
        let datagrams = self.snapshot.lock().prepare(payload, now);
        send_all(&*self.transport, datagrams, &self.metrics) > 0
    }

    pub fn try_recv(&self) -> Option<ClientNotify> {
        self.notifications.try_recv().ok()
    }

    pub fn notifications(&self) -> &Receiver<ClientNotify> {
        &self.notifications
    }

    pub fn local_address(&self) -> Address {
        self.transport.local_address()
    }

    pub async fn shutdown(self) {
        self.command(ClientCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Client worker task failed: {}", e);
        }
    }
}

async fn run_client<T: Transport>(
    mut core: ClientCore,
    transport: Arc<T>,
    commands: Receiver<ClientCommand>,
    notify: Sender<ClientNotify>,
    metrics: Arc<Metrics>,
    start: Instant,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = start.elapsed().as_secs_f64();
                loop {
                    match commands.try_recv() {
                        Ok(ClientCommand::OpenSession(address)) => core.open_session(address),
                        Ok(ClientCommand::CloseSession) => core.close_session(),
                        Ok(ClientCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                            info!("Client worker stopping");
                            core.close_session();
                            return;
                        }
                        Err(TryRecvError::Empty) => break,
                    }
                }
                core.update(now);
            }
            received = transport.recv_from() => match received {
                Ok((from, data)) => {
                    core.process_packet(&from, &data, start.elapsed().as_secs_f64())
                }
                Err(e) => debug!("Receive failed: {:#}", e),
            },
        }

        send_all(&*transport, core.drain_outgoing(), &metrics);
        for notification in core.drain_notifications() {
            if notify.try_send(notification).is_err() {
                debug!("Client notify queue full, dropping notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ENCRYPTED_ROUTE_TOKEN_BYTES, SLICE_SECONDS};
    use crate::crypto::{self, random_key, HeaderFields, Key};
    use crate::tokens::{ContinueToken, RouteToken, UpgradeToken};
    use std::sync::atomic::Ordering;
    use ed25519_dalek::SigningKey;

    /// Just enough of a server to walk a client through the handshake.
    struct FakeServer {
        address: Address,
        client_address: Address,
        signing_key: SigningKey,
        backend_secret: SecretKey,
        kx: KxKeyPair,
        magic: MagicSet,
        keys: Option<SessionKeys>,
        sequence: u64,
    }

    impl FakeServer {
        fn new() -> Self {
            Self {
                address: "5.6.7.8:40000".parse().unwrap(),
                client_address: "1.2.3.4:50000".parse().unwrap(),
                signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
                backend_secret: SecretKey::generate(&mut OsRng),
                kx: KxKeyPair::generate(),
                magic: MagicSet::new([3u8; 8], [2u8; 8], [1u8; 8]),
                keys: None,
                sequence: 0,
            }
        }

        fn client(&self) -> ClientCore {
            let config = ClientConfig {
                customer_public_key: self.signing_key.verifying_key(),
                backend_public_key: self.backend_secret.public_key(),
                platform_id: 1,
                connection_type: 1,
            };
            ClientCore::new(config, Metrics::new())
        }

        fn signed(&self, packet: &Packet) -> Vec<u8> {
            let ctx = WriteContext::new(self.address, self.client_address, self.magic.current)
                .signed(&self.signing_key);
            write_packet(packet, &ctx).unwrap()
        }

        fn encrypted(&mut self, packet: &Packet) -> Vec<u8> {
            self.sequence += 1;
            let keys = self.keys.as_ref().unwrap();
            let ctx = WriteContext::new(self.address, self.client_address, self.magic.current)
                .encrypted(&keys.send, self.sequence);
            write_packet(packet, &ctx).unwrap()
        }

        fn upgrade_request(&self, session_id: u64) -> Packet {
            let token = UpgradeToken {
                session_id,
                expire_timestamp: 2_000_000_000,
                client_address: self.client_address,
                server_address: self.address,
            };
            Packet::UpgradeRequest(UpgradeRequestPacket {
                protocol_version: PROTOCOL_VERSION,
                session_id,
                client_address: self.client_address,
                server_address: self.address,
                server_kx_public_key: self.kx.public,
                upgrade_token: token.seal(&random_key()).unwrap(),
                upgrade_sequence: 1,
                magic: self.magic,
            })
        }

        fn read(&self, bytes: &[u8]) -> Packet {
            read_packet(bytes, ReadContext::new(self.client_address, self.address, &self.magic))
                .unwrap()
        }

        /// Upgrade `client` and return the response it sent.
        fn upgrade(&mut self, client: &mut ClientCore) -> UpgradeResponsePacket {
            let request = self.signed(&self.upgrade_request(77));
            client.process_packet(&self.address, &request, 0.1);
            let outgoing = client.drain_outgoing();
            let Packet::UpgradeResponse(response) = self.read(&outgoing[0].1) else {
                panic!("expected upgrade response");
            };

            let confirm = Packet::UpgradeConfirm(UpgradeConfirmPacket {
                upgrade_sequence: 1,
                session_id: 77,
                server_address: self.address,
                client_kx_public_key: response.client_kx_public_key,
                server_kx_public_key: self.kx.public,
            });
            client.process_packet(&self.address, &self.signed(&confirm), 0.2);
            self.keys = self.kx.server_session_keys(&response.client_kx_public_key);
            response
        }

        fn route_tokens(
            &self,
            client_route_key: &[u8; KEY_BYTES],
            version: u8,
            key: Key,
        ) -> Vec<u8> {
            let server_secret = SecretKey::generate(&mut OsRng);
            let mut tokens = Vec::new();
            for (next_address, receiver) in [
                (self.address, PublicKey::from(*client_route_key)),
                (self.client_address, server_secret.public_key()),
            ] {
                let token = RouteToken {
                    private_key: key,
                    expire_timestamp: 2_000_000_000,
                    session_id: 77,
                    session_version: version,
                    kbps_up: 256,
                    kbps_down: 256,
                    next_address,
                };
                tokens.extend(token.seal(&self.backend_secret, &receiver).unwrap());
            }
            tokens
        }

        fn continue_tokens(&self, client_route_key: &[u8; KEY_BYTES], version: u8) -> Vec<u8> {
            let token = ContinueToken {
                expire_timestamp: 2_000_000_000,
                session_id: 77,
                session_version: version,
            };
            let server_secret = SecretKey::generate(&mut OsRng);
            let mut tokens = token
                .seal(&self.backend_secret, &PublicKey::from(*client_route_key))
                .unwrap();
            tokens.extend(token.seal(&self.backend_secret, &server_secret.public_key()).unwrap());
            tokens
        }

        /// A route header packet as the first hop would send it back.
        fn route_reply(
            &self,
            packet: fn(HeaderPacket) -> Packet,
            packet_type: PacketType,
            sequence: u64,
            key: &Key,
        ) -> Vec<u8> {
            let fields = HeaderFields {
                sequence,
                session_id: 77,
                session_version: 1,
            };
            let header =
                crypto::write_header(Direction::ServerToClient, packet_type as u8, &fields, key).unwrap();
            let ctx = WriteContext::new(self.address, self.client_address, self.magic.current);
            write_packet(&packet(HeaderPacket::new(header, b"payload".to_vec())), &ctx).unwrap()
        }

        /// Upgrade `client` and put it on a route keyed by `key`.
        fn establish_route(&mut self, client: &mut ClientCore, key: Key) {
            client.open_session(self.address);
            let response = self.upgrade(client);
            let update = Packet::RouteUpdate(RouteUpdatePacket {
                sequence: 1,
                update_type: UpdateType::Route,
                num_tokens: 2,
                tokens: self.route_tokens(&response.client_route_public_key, 1, key),
                magic: self.magic,
                ..Default::default()
            });
            let bytes = self.encrypted(&update);
            client.process_packet(&self.address, &bytes, 1.0);
            let reply = self.route_reply(Packet::RouteResponse, PacketType::RouteResponse, 1, &key);
            client.process_packet(&self.address, &reply, 1.1);
            assert_eq!(client.route_state(), RouteState::CurrentRoute);
            client.drain_outgoing();
        }

        fn continue_update(&mut self, client: &mut ClientCore, sequence: u64, now: f64) {
            let client_route_key = *client.route.route_public_key().as_bytes();
            let update = Packet::RouteUpdate(RouteUpdatePacket {
                sequence,
                update_type: UpdateType::Continue,
                num_tokens: 2,
                tokens: self.continue_tokens(&client_route_key, 1),
                magic: self.magic,
                ..Default::default()
            });
            let bytes = self.encrypted(&update);
            client.process_packet(&self.address, &bytes, now);
            assert!(client.route.has_pending_continue());
        }
    }

    #[test]
    fn test_passthrough_before_upgrade() {
        let server = FakeServer::new();
        let mut client = server.client();
        assert!(!client.send_packet(b"early", 0.0));

        client.open_session(server.address);
        assert!(client.send_packet(b"hello", 0.0));
        let outgoing = client.drain_outgoing();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].1[0], PacketType::Passthrough as u8);

        client.process_packet(&server.address, &[0, 9, 9], 0.1);
        let stranger: Address = "9.9.9.9:1".parse().unwrap();
        client.process_packet(&stranger, &[0, 1], 0.1);
        let received: Vec<_> = client
            .drain_notifications()
            .into_iter()
            .filter(|n| matches!(n, ClientNotify::PacketReceived(_)))
            .collect();
        assert_eq!(received, vec![ClientNotify::PacketReceived(vec![9, 9])]);
    }

    #[test]
    fn test_upgrade_handshake() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);
        let response = server.upgrade(&mut client);

        assert_eq!(response.client_open_session_sequence, 1);
        assert_eq!(client.state(), ClientState::Upgraded);
        assert_eq!(client.session_id(), 77);
        assert!(client
            .drain_notifications()
            .contains(&ClientNotify::Upgraded { session_id: 77 }));

        // Payloads now go out encrypted on the direct path.
        assert!(client.send_packet(b"secure", 0.3));
        let outgoing = client.drain_outgoing();
        assert_eq!(outgoing[0].1[0], PacketType::Direct as u8);
    }

    #[test]
    fn test_forged_upgrade_request_ignored() {
        let server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);

        let forger = FakeServer::new();
        let forged = FakeServer {
            address: server.address,
            ..forger
        };
        client.process_packet(&server.address, &forged.signed(&forged.upgrade_request(5)), 0.1);
        assert!(client.drain_outgoing().is_empty());
        assert_eq!(client.state(), ClientState::Open);
    }

    #[test]
    fn test_upgrade_response_resent_then_times_out() {
        let server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);
        client.process_packet(&server.address, &server.signed(&server.upgrade_request(5)), 0.0);
        assert_eq!(client.drain_outgoing().len(), 1);

        client.update(0.1);
        assert!(client.drain_outgoing().is_empty());
        client.update(0.3);
        assert_eq!(client.drain_outgoing().len(), 1);

        client.update(5.0);
        assert!(client
            .fallback_flags()
            .contains(FallbackFlags::UPGRADE_RESPONSE_TIMED_OUT));
        assert_eq!(client.route_state(), RouteState::FallbackToDirect);
    }

    #[test]
    fn test_route_update_starts_route_and_acks() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);
        let response = server.upgrade(&mut client);

        let update = Packet::RouteUpdate(RouteUpdatePacket {
            sequence: 1,
            update_type: UpdateType::Route,
            num_tokens: 2,
            tokens: server.route_tokens(&response.client_route_public_key, 1, random_key()),
            magic: server.magic,
            ..Default::default()
        });
        let bytes = server.encrypted(&update);
        client.process_packet(&server.address, &bytes, 1.0);
        assert_eq!(client.route_state(), RouteState::PendingRoute);

        let outgoing = client.drain_outgoing();
        let types: Vec<u8> = outgoing.iter().map(|(_, bytes)| bytes[0]).collect();
        assert_eq!(
            types,
            vec![PacketType::RouteUpdateAck as u8, PacketType::RouteRequest as u8]
        );
        // The forwarded request carries only the server's token.
        let request = &outgoing[1].1;
        assert_eq!(request.len(), 16 + ENCRYPTED_ROUTE_TOKEN_BYTES + 2);

        // A replayed update is dropped; a fresh copy of the same sequence is re-acked.
        client.process_packet(&server.address, &bytes, 1.1);
        assert!(client.drain_outgoing().is_empty());
        let fresh = server.encrypted(&update);
        client.process_packet(&server.address, &fresh, 1.2);
        let outgoing = client.drain_outgoing();
        assert_eq!(outgoing[0].1[0], PacketType::RouteUpdateAck as u8);
        assert_eq!(client.route_state(), RouteState::PendingRoute);
    }

    #[test]
    fn test_replayed_continue_response_ignored() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        let key = random_key();
        server.establish_route(&mut client, key);
        let expire = client.route.route_expire_time();

        server.continue_update(&mut client, 2, 5.0);
        let first = server.route_reply(Packet::ContinueResponse, PacketType::ContinueResponse, 2, &key);
        client.process_packet(&server.address, &first, 5.1);
        assert!(!client.route.has_pending_continue());
        assert_eq!(client.route.route_expire_time(), expire + SLICE_SECONDS);

        // The next continue is not confirmed by the old response.
        server.continue_update(&mut client, 3, 15.0);
        client.process_packet(&server.address, &first, 15.1);
        assert!(client.route.has_pending_continue());
        assert_eq!(client.metrics.packets_dropped_replay.load(Ordering::Relaxed), 1);

        let second = server.route_reply(Packet::ContinueResponse, PacketType::ContinueResponse, 3, &key);
        client.process_packet(&server.address, &second, 15.2);
        assert!(!client.route.has_pending_continue());
        assert_eq!(client.route.route_expire_time(), expire + 2.0 * SLICE_SECONDS);
    }

    #[test]
    fn test_server_to_client_drops_counted_by_cause() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        let key = random_key();
        server.establish_route(&mut client, key);
        client.drain_notifications();

        let forged =
            server.route_reply(Packet::ServerToClient, PacketType::ServerToClient, 1, &random_key());
        client.process_packet(&server.address, &forged, 2.0);
        let genuine = server.route_reply(Packet::ServerToClient, PacketType::ServerToClient, 1, &key);
        client.process_packet(&server.address, &genuine, 2.0);
        client.process_packet(&server.address, &genuine, 2.1);

        let delivered = client
            .drain_notifications()
            .into_iter()
            .filter(|n| matches!(n, ClientNotify::PacketReceived(_)))
            .count();
        assert_eq!(delivered, 1);
        assert_eq!(client.metrics.packets_dropped_auth.load(Ordering::Relaxed), 1);
        assert_eq!(client.metrics.packets_dropped_replay.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bad_route_tokens_fall_back() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);
        server.upgrade(&mut client);

        let update = Packet::RouteUpdate(RouteUpdatePacket {
            sequence: 1,
            update_type: UpdateType::Route,
            num_tokens: 2,
            tokens: vec![7u8; 2 * ENCRYPTED_ROUTE_TOKEN_BYTES],
            magic: server.magic,
            ..Default::default()
        });
        let bytes = server.encrypted(&update);
        client.process_packet(&server.address, &bytes, 1.0);
        assert!(client.fallback_flags().contains(FallbackFlags::BAD_ROUTE_TOKEN));
    }

    #[test]
    fn test_pings_and_stats_after_upgrade() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);
        server.upgrade(&mut client);
        client.drain_notifications();

        client.update(0.5);
        let types: Vec<u8> = client
            .drain_outgoing()
            .iter()
            .map(|(_, bytes)| bytes[0])
            .collect();
        assert!(types.contains(&(PacketType::DirectPing as u8)));
        assert!(types.contains(&(PacketType::ClientStats as u8)));
        assert!(client
            .drain_notifications()
            .iter()
            .any(|n| matches!(n, ClientNotify::StatsUpdated(_))));

        // Nobody answers the direct pings.
        for step in 1..=60 {
            client.update(0.5 + step as f64 * 0.1);
        }
        assert!(client
            .fallback_flags()
            .contains(FallbackFlags::DIRECT_PONG_TIMED_OUT));
    }

    #[test]
    fn test_close_session_drops_everything() {
        let mut server = FakeServer::new();
        let mut client = server.client();
        client.open_session(server.address);
        server.upgrade(&mut client);
        client.close_session();

        assert_eq!(client.state(), ClientState::Closed);
        assert!(!client.send_packet(b"late", 1.0));
        assert!(!client.snapshot().lock().open);
    }
}
