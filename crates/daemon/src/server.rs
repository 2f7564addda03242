//! Server Session Host
//!
//! [`ServerCore`] accepts connections from many clients at once:
//!
//! 1. The application asks to upgrade a client address. The server seals an
//!    upgrade token and sends signed upgrade requests until the client answers.
//! 2. A valid upgrade response creates a [`SessionEntry`] keyed by address and
//!    session id, and a signed confirm lets the client derive the same keys.
//! 3. Once per slice each session's telemetry goes to the [`Backend`]; its
//!    decision is pushed to the client as an acked route update.
//! 4. Route and continue requests arriving from the last hop install routes;
//!    payloads and pings over next are verified against them.
//!
//! [`ServerWorker`] runs a core on a tokio task, mirroring the client worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use crypto_box::{PublicKey, SecretKey};
use ed25519_dalek::SigningKey;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::address::Address;
use crate::backend::{Backend, ClientStats, SessionUpdateRequest, SessionUpdateResponse};
use crate::constants::{
    BACKEND_MAX_FAILURES, BACKEND_UPDATE_INTERVAL, COMMAND_QUEUE_SIZE,
    ENCRYPTED_CONTINUE_TOKEN_BYTES, ENCRYPTED_ROUTE_TOKEN_BYTES, MTU, NOTIFY_QUEUE_SIZE,
    PROTOCOL_VERSION, UPGRADE_REQUEST_SEND_TIME, UPGRADE_TOKEN_EXPIRE_SECONDS,
};
use crate::crypto::{self, random_id, random_key, Direction, Key, KxKeyPair, OpenError};
use crate::metrics::Metrics;
use crate::packets::{
    read_packet, write_packet, DirectPacket, DirectPongPacket, HeaderPacket, Packet, PacketType,
    ReadContext, RouteUpdatePacket, SessionCipher, UpdateType, UpgradeConfirmPacket,
    UpgradeRequestPacket, UpgradeResponsePacket, WriteContext,
};
use crate::sender::PayloadSender;
use crate::session::{
    PendingSessionEntry, PendingSessionManager, RouteRequestOutcome, SessionEntry, SessionManager,
};
use crate::tags::MagicSet;
use crate::tokens::{current_timestamp, ContinueToken, RouteToken, UpgradeToken};
use crate::transport::{send_all, Transport};

#[derive(Clone)]
pub struct ServerConfig {
    /// Public address clients send to. Bound into upgrade tokens and tags.
    pub server_address: Address,
    /// Customer key that signs upgrade requests and confirms.
    pub signing_key: SigningKey,
    /// Opens the server's route and continue tokens.
    pub route_secret: SecretKey,
    /// Control-plane key that sealed them.
    pub backend_public_key: PublicKey,
    pub magic: MagicSet,
    pub backend_update_interval: f64,
}

impl ServerConfig {
    pub fn new(
        server_address: Address,
        signing_key: SigningKey,
        route_secret: SecretKey,
        backend_public_key: PublicKey,
    ) -> Self {
        Self {
            server_address,
            signing_key,
            route_secret,
            backend_public_key,
            magic: MagicSet::default(),
            backend_update_interval: BACKEND_UPDATE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotify {
    PacketReceived { address: Address, payload: Vec<u8> },
    SessionUpgraded { address: Address, session_id: u64, user_tag: u64 },
    PendingSessionTimedOut { address: Address, session_id: u64 },
    SessionTimedOut { address: Address, session_id: u64 },
    Ready,
}

/// Payload senders the application thread uses, one per client address.
pub type ServerSnapshot = Arc<Mutex<HashMap<Address, PayloadSender>>>;

// ============================================================================
// Server Core
// ============================================================================

pub struct ServerCore {
    config: ServerConfig,
    backend: Box<dyn Backend>,
    metrics: Arc<Metrics>,
    timestamp_base: u64,
    ready: bool,

    upgrade_key: Key,
    upgrade_sequence: u64,
    pending: PendingSessionManager,
    sessions: SessionManager,

    outbox: Vec<(Address, Vec<u8>)>,
    notifications: Vec<ServerNotify>,
    snapshot: ServerSnapshot,
}

impl ServerCore {
    pub fn new(config: ServerConfig, backend: Box<dyn Backend>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            backend,
            metrics,
            timestamp_base: current_timestamp(),
            ready: false,
            upgrade_key: random_key(),
            upgrade_sequence: 0,
            pending: PendingSessionManager::new(),
            sessions: SessionManager::new(),
            outbox: Vec::new(),
            notifications: Vec::new(),
            snapshot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn server_address(&self) -> Address {
        self.config.server_address
    }

    pub fn magic(&self) -> &MagicSet {
        &self.config.magic
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn pending_sessions(&self) -> &PendingSessionManager {
        &self.pending
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        self.snapshot.clone()
    }

    pub fn drain_outgoing(&mut self) -> Vec<(Address, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_notifications(&mut self) -> Vec<ServerNotify> {
        std::mem::take(&mut self.notifications)
    }

    fn timestamp(&self, now: f64) -> u64 {
        self.timestamp_base + now as u64
    }

    fn send_signed(&mut self, to: Address, packet: Packet) {
        let ctx = WriteContext::new(self.config.server_address, to, self.config.magic.current)
            .signed(&self.config.signing_key);
        match write_packet(&packet, &ctx) {
            Some(bytes) => self.outbox.push((to, bytes)),
            None => warn!("Failed to write {:?} to {}", packet.packet_type(), to),
        }
    }

    fn send_plain(&mut self, to: Address, packet: Packet) {
        let ctx = WriteContext::new(self.config.server_address, to, self.config.magic.current);
        match write_packet(&packet, &ctx) {
            Some(bytes) => self.outbox.push((to, bytes)),
            None => debug!("Failed to write {:?} to {}", packet.packet_type(), to),
        }
    }

    fn deliver(&mut self, address: Address, payload: Vec<u8>) {
        self.metrics.inc_payloads_delivered();
        self.notifications
            .push(ServerNotify::PacketReceived { address, payload });
    }

    // ------------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------------

    /// Start upgrading the client at `address`. Returns the new session id.
    pub fn upgrade_session(&mut self, address: Address, user_tag: u64, now: f64) -> Option<u64> {
        if address.is_none() {
            warn!("Cannot upgrade session without an address");
            return None;
        }
        if self.sessions.find(&address).is_some() {
            warn!("Session at {} is already upgraded", address);
            return None;
        }

        let session_id = random_id();
        let token = UpgradeToken {
            session_id,
            expire_timestamp: self.timestamp(now) + UPGRADE_TOKEN_EXPIRE_SECONDS,
            client_address: address,
            server_address: self.config.server_address,
        };
        let upgrade_token = token.seal(&self.upgrade_key)?;
        self.upgrade_sequence += 1;
        let entry = PendingSessionEntry {
            address,
            session_id,
            user_tag,
            kx: KxKeyPair::generate(),
            upgrade_token,
            upgrade_sequence: self.upgrade_sequence,
            create_time: now,
            last_send_time: Some(now),
        };
        let request = upgrade_request(&self.config, &entry);
        if self.pending.add(entry).is_some() {
            debug!("Replaced pending upgrade for {}", address);
        }
        info!("Upgrading session {:016x} for {}", session_id, address);
        self.send_signed(address, request);
        Some(session_id)
    }

    /// Attach an application tag to a pending or upgraded session.
    pub fn tag_session(&mut self, address: &Address, user_tag: u64) -> bool {
        if let Some(entry) = self.sessions.find_mut(address) {
            entry.user_tag = user_tag;
            return true;
        }
        if let Some(entry) = self.pending.find_mut(address) {
            entry.user_tag = user_tag;
            return true;
        }
        false
    }

    /// Queue a game packet for `address`. Passthrough until that client is upgraded.
    pub fn send_packet(&mut self, address: Address, payload: &[u8], now: f64) -> bool {
        if payload.is_empty() || payload.len() > MTU {
            warn!("Dropping {} byte payload, limit is {}", payload.len(), MTU);
            return false;
        }
        let datagrams = prepare_payload(&self.snapshot, self.config.server_address, address, payload, now);
        let sent = !datagrams.is_empty();
        self.outbox.extend(datagrams);
        sent
    }

    /// Run a backend update for every session now.
    pub fn flush(&mut self, now: f64) {
        for entry in self.sessions.iter_mut() {
            entry.next_backend_update_time = now;
        }
        self.update(now);
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    pub fn process_packet(&mut self, from: &Address, data: &[u8], now: f64) {
        self.metrics.inc_packets_rx();
        let decrypts = data
            .first()
            .and_then(|&byte| PacketType::try_from(byte).ok())
            .is_some_and(|t| t == PacketType::Direct || t.is_encrypted());

        let mut ctx = ReadContext::new(*from, self.config.server_address, &self.config.magic);
        if decrypts {
            if let Some(entry) = self.sessions.find_mut(from) {
                ctx = ctx.with_session(SessionCipher {
                    receive_key: &entry.keys.receive,
                    internal_replay: &mut entry.internal_replay,
                    payload_replay: &mut entry.payload_replay,
                });
            }
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

        match packet {
            Packet::Passthrough(payload) => self.deliver(*from, payload),
            Packet::UpgradeResponse(response) => self.process_upgrade_response(from, response, now),
            Packet::Direct(direct) => self.process_direct(from, direct, now),
            Packet::DirectPing(ping) => {
                let Some(entry) = self.sessions.find_mut(from) else {
                    return;
                };
                entry.last_packet_time = now;
                let sequence = entry.next_internal_sequence();
                let send_key = entry.keys.send;
                let pong = Packet::DirectPong(DirectPongPacket {
                    ping_sequence: ping.ping_sequence,
                });
                let ctx = WriteContext::new(self.config.server_address, *from, self.config.magic.current)
                    .encrypted(&send_key, sequence);
                if let Some(bytes) = write_packet(&pong, &ctx) {
                    self.outbox.push((*from, bytes));
                }
            }
            Packet::ClientStats(stats) => {
                if let Some(entry) = self.sessions.find_mut(from) {
                    entry.stats = stats;
                    entry.last_stats_time = Some(now);
                    entry.last_packet_time = now;
                }
            }
            Packet::RouteUpdateAck(ack) => {
                if let Some(entry) = self.sessions.find_mut(from) {
                    entry.last_packet_time = now;
                    entry.process_route_update_ack(ack.sequence);
                }
            }
            Packet::RouteRequest(tokens) => self.process_route_request(from, &tokens, now),
            Packet::ContinueRequest(tokens) => self.process_continue_request(from, &tokens, now),
            Packet::ClientToServer(packet) => self.process_client_to_server(packet, now),
            Packet::Ping(ping) => self.process_next_ping(from, ping, now),
            other => debug!("Ignoring {:?} from {}", other.packet_type(), from),
        }
    }

    fn process_upgrade_response(&mut self, from: &Address, response: UpgradeResponsePacket, now: f64) {
        if let Some(entry) = self.sessions.find(from) {
            let resend = entry
                .upgrade_confirm
                .clone()
                .filter(|confirm| confirm.client_kx_public_key == response.client_kx_public_key);
            if let Some(confirm) = resend {
                debug!("Resending upgrade confirm to {}", from);
                self.send_signed(*from, Packet::UpgradeConfirm(confirm));
            }
            return;
        }

        let Some(token) = UpgradeToken::open(&response.upgrade_token, &self.upgrade_key) else {
            debug!("Upgrade response from {} has an invalid token", from);
            return;
        };
        if token.is_expired(self.timestamp(now)) {
            debug!("Upgrade token for {:016x} expired", token.session_id);
            return;
        }
        if token.client_address != *from || token.server_address != self.config.server_address {
            debug!(
                "Upgrade token for {} presented by {} to {}",
                token.client_address, from, token.server_address
            );
            return;
        }
        let matches_pending = self
            .pending
            .find(from)
            .is_some_and(|pending| pending.session_id == token.session_id);
        if !matches_pending {
            debug!("No pending upgrade for {:016x} at {}", token.session_id, from);
            return;
        }
        let Some(pending) = self.pending.remove(from) else {
            return;
        };
        let Some(keys) = pending.kx.server_session_keys(&response.client_kx_public_key) else {
            warn!("Key exchange with {} failed", from);
            return;
        };

        let confirm = UpgradeConfirmPacket {
            upgrade_sequence: pending.upgrade_sequence,
            session_id: pending.session_id,
            server_address: self.config.server_address,
            client_kx_public_key: response.client_kx_public_key,
            server_kx_public_key: pending.kx.public,
        };
        let mut entry = SessionEntry::new(
            *from,
            pending.session_id,
            pending.user_tag,
            keys.clone(),
            response.client_open_session_sequence,
            response.client_route_public_key,
            response.platform_id,
            response.connection_type,
            now,
        );
        entry.upgrade_confirm = Some(confirm.clone());
        self.sessions.add(entry);

        {
            let mut senders = self.snapshot.lock();
            let mut sender = PayloadSender::new(Direction::ServerToClient, self.config.server_address, *from);
            sender.upgrade(keys.send, response.client_open_session_sequence, self.config.magic.current);
            senders.insert(*from, sender);
        }

        self.send_signed(*from, Packet::UpgradeConfirm(confirm));
        self.metrics.inc_upgrades_completed();
        info!("Session {:016x} upgraded for {}", pending.session_id, from);
        self.notifications.push(ServerNotify::SessionUpgraded {
            address: *from,
            session_id: pending.session_id,
            user_tag: pending.user_tag,
        });
    }

    fn process_direct(&mut self, from: &Address, direct: DirectPacket, now: f64) {
        let Some(entry) = self.sessions.find_mut(from) else {
            return;
        };
        if direct.open_session_sequence != entry.open_session_sequence {
            debug!(
                "Direct packet from {} for open session {}, expected {}",
                from, direct.open_session_sequence, entry.open_session_sequence
            );
            return;
        }
        entry.payload_received(direct.sequence, now);
        self.deliver(*from, direct.payload);
    }

    fn process_route_request(&mut self, from: &Address, tokens: &[u8], now: f64) {
        let timestamp = self.timestamp(now);
        let token = tokens
            .get(..ENCRYPTED_ROUTE_TOKEN_BYTES)
            .and_then(|ours| {
                RouteToken::open(ours, &self.config.backend_public_key, &self.config.route_secret)
            });
        let Some(token) = token else {
            debug!("Route request from {} has no valid token", from);
            self.metrics.inc_dropped_filter();
            return;
        };
        let Some(entry) = self.sessions.find_by_session_id_mut(token.session_id) else {
            debug!("Route request for unknown session {:016x}", token.session_id);
            return;
        };
        entry.last_packet_time = now;
        match entry.process_route_request(&token, timestamp) {
            RouteRequestOutcome::Installed(to, packet) | RouteRequestOutcome::Duplicate(to, packet) => {
                self.send_plain(to, packet)
            }
            RouteRequestOutcome::Ignored => {}
        }
    }

    fn process_continue_request(&mut self, from: &Address, tokens: &[u8], now: f64) {
        let timestamp = self.timestamp(now);
        let token = tokens
            .get(..ENCRYPTED_CONTINUE_TOKEN_BYTES)
            .and_then(|ours| {
                ContinueToken::open(ours, &self.config.backend_public_key, &self.config.route_secret)
            });
        let Some(token) = token else {
            debug!("Continue request from {} has no valid token", from);
            self.metrics.inc_dropped_filter();
            return;
        };
        let Some(entry) = self.sessions.find_by_session_id_mut(token.session_id) else {
            return;
        };
        entry.last_packet_time = now;
        if let Some((to, packet)) = entry.process_continue_request(&token, timestamp) {
            self.send_plain(to, packet);
        }
    }

    fn process_client_to_server(&mut self, packet: HeaderPacket, now: f64) {
        let Some(peeked) = crypto::peek_header(&packet.header) else {
            return;
        };
        let Some(entry) = self.sessions.find_by_session_id_mut(peeked.session_id) else {
            self.metrics.inc_dropped_filter();
            return;
        };
        let Some(fields) = entry.verify_client_to_server(PacketType::ClientToServer, &packet.header)
        else {
            self.metrics.inc_dropped_auth();
            return;
        };
        if !entry.payload_replay.accept(fields.sequence) {
            self.metrics.inc_dropped_replay();
            return;
        }
        entry.payload_received(fields.sequence, now);
        let address = entry.address;
        self.deliver(address, packet.payload);
    }

    fn process_next_ping(&mut self, from: &Address, ping: HeaderPacket, now: f64) {
        let Some(peeked) = crypto::peek_header(&ping.header) else {
            return;
        };
        let Some(entry) = self.sessions.find_by_session_id_mut(peeked.session_id) else {
            return;
        };
        let Some(fields) = entry.verify_client_to_server(PacketType::Ping, &ping.header) else {
            self.metrics.inc_dropped_auth();
            return;
        };
        if !entry.special_replay.accept(fields.sequence) {
            self.metrics.inc_dropped_replay();
            return;
        }
        entry.last_packet_time = now;

        let sequence = entry.next_special_sequence();
        let Some((_, header)) = entry.server_to_client_header(PacketType::Pong, sequence) else {
            return;
        };
        let payload = ping.payload.get(..8).map(<[u8]>::to_vec).unwrap_or_default();
        self.send_plain(*from, Packet::Pong(HeaderPacket::new(header, payload)));
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    pub fn update(&mut self, now: f64) {
        if !self.ready {
            self.ready = true;
            self.notifications.push(ServerNotify::Ready);
        }
        self.update_pending(now);
        self.update_timeouts(now);
        self.update_sessions(now);
        self.sync_snapshot(now);
    }

    fn update_pending(&mut self, now: f64) {
        for expired in self.pending.take_expired(now) {
            info!(
                "Upgrade of session {:016x} for {} timed out",
                expired.session_id, expired.address
            );
            self.metrics.inc_upgrades_timed_out();
            self.notifications.push(ServerNotify::PendingSessionTimedOut {
                address: expired.address,
                session_id: expired.session_id,
            });
        }

        let mut resend = Vec::new();
        for entry in self.pending.iter_mut() {
            if entry
                .last_send_time
                .is_some_and(|t| now - t < UPGRADE_REQUEST_SEND_TIME)
            {
                continue;
            }
            entry.last_send_time = Some(now);
            resend.push((entry.address, upgrade_request(&self.config, entry)));
        }
        for (to, request) in resend {
            self.send_signed(to, request);
        }
    }

    fn update_timeouts(&mut self, now: f64) {
        let timed_out = self.sessions.remove_timed_out(now);
        if timed_out.is_empty() {
            return;
        }
        let mut senders = self.snapshot.lock();
        for entry in timed_out {
            info!("Session {:016x} at {} timed out", entry.session_id, entry.address);
            senders.remove(&entry.address);
            self.metrics.inc_sessions_timed_out();
            self.notifications.push(ServerNotify::SessionTimedOut {
                address: entry.address,
                session_id: entry.session_id,
            });
        }
    }

    fn update_sessions(&mut self, now: f64) {
        let packets_sent: HashMap<Address, u64> = self
            .snapshot
            .lock()
            .iter()
            .map(|(address, sender)| (*address, sender.packets_sent()))
            .collect();
        let interval = self.config.backend_update_interval;
        let server_address = self.config.server_address;

        for entry in self.sessions.iter_mut() {
            entry.update_trackers();
            if now >= entry.next_backend_update_time {
                entry.next_backend_update_time = now + interval;
                let request = session_update_request(entry, server_address);
                entry.slice_number += 1;
                match self.backend.session_update(&request) {
                    Some(response) => {
                        let sent = packets_sent.get(&entry.address).copied().unwrap_or(0);
                        apply_session_update(entry, response, &mut self.config.magic, sent, now);
                    }
                    None => {
                        self.metrics.inc_backend_failures();
                        backend_update_failed(entry, &self.config.magic);
                    }
                }
            }

            if entry.send_over_next && entry.route_expiring(now) {
                warn!(
                    "Session {:016x} route lapses at {:.1}, going direct",
                    entry.session_id,
                    entry.route_expire_time()
                );
                go_direct(entry, &self.config.magic);
            }

            if let Some(update) = entry.route_update_due(now) {
                let sequence = entry.next_internal_sequence();
                let ctx = WriteContext::new(server_address, entry.address, self.config.magic.current)
                    .encrypted(&entry.keys.send, sequence);
                if let Some(bytes) = write_packet(&Packet::RouteUpdate(update), &ctx) {
                    self.outbox.push((entry.address, bytes));
                }
            }
        }
    }

    fn sync_snapshot(&mut self, now: f64) {
        let mut senders = self.snapshot.lock();
        for entry in self.sessions.iter() {
            let Some(sender) = senders.get_mut(&entry.address) else {
                continue;
            };
            sender.magic = self.config.magic.current;
            sender.set_route(entry.current_route().cloned(), entry.send_over_next, entry.multipath);
            sender.poll(now);
        }
        self.metrics.set_sessions_active(self.sessions.len() as u64);
    }
}

fn upgrade_request(config: &ServerConfig, entry: &PendingSessionEntry) -> Packet {
    Packet::UpgradeRequest(UpgradeRequestPacket {
        protocol_version: PROTOCOL_VERSION,
        session_id: entry.session_id,
        client_address: entry.address,
        server_address: config.server_address,
        server_kx_public_key: entry.kx.public,
        upgrade_token: entry.upgrade_token,
        upgrade_sequence: entry.upgrade_sequence,
        magic: config.magic,
    })
}

fn prepare_payload(
    snapshot: &ServerSnapshot,
    server_address: Address,
    address: Address,
    payload: &[u8],
    now: f64,
) -> Vec<(Address, Vec<u8>)> {
    snapshot
        .lock()
        .entry(address)
        .or_insert_with(|| PayloadSender::new(Direction::ServerToClient, server_address, address))
        .prepare(payload, now)
}

fn session_update_request(entry: &SessionEntry, server_address: Address) -> SessionUpdateRequest {
    SessionUpdateRequest {
        session_id: entry.session_id,
        client_address: entry.address.anonymize(),
        server_address,
        slice_number: entry.slice_number,
        client_route_public_key: entry.client_route_public_key,
        stats: ClientStats {
            reported: entry.stats.clone(),
            packets_lost_client_to_server: entry.packets_lost_client_to_server,
            packets_out_of_order_client_to_server: entry.out_of_order.out_of_order(),
            jitter_client_to_server: entry.jitter.jitter(),
        },
        next: entry.send_over_next,
    }
}

fn route_update_for(
    entry: &SessionEntry,
    response: SessionUpdateResponse,
    magic: &MagicSet,
    packets_sent: u64,
) -> RouteUpdatePacket {
    RouteUpdatePacket {
        sequence: 0,
        update_type: response.update_type,
        num_tokens: response.num_tokens,
        tokens: response.tokens,
        multipath: response.multipath,
        near_relays: response.near_relays,
        magic: *magic,
        packets_sent_server_to_client: packets_sent,
        packets_lost_client_to_server: entry.packets_lost_client_to_server,
        packets_out_of_order_client_to_server: entry.out_of_order.out_of_order(),
        jitter_client_to_server: entry.jitter.jitter(),
    }
}

fn apply_session_update(
    entry: &mut SessionEntry,
    response: SessionUpdateResponse,
    magic: &mut MagicSet,
    packets_sent: u64,
    now: f64,
) {
    entry.backend_failures = 0;
    if let Some(upcoming) = response.upcoming_magic {
        magic.rotate(upcoming);
    }
    entry.multipath = response.multipath;
    entry.send_over_next = response.committed && response.update_type != UpdateType::Direct;
    entry.extend_route_lifetime(response.update_type, now);
    debug!(
        "Session {:016x} slice {}: {:?}, committed {}",
        entry.session_id, entry.slice_number, response.update_type, response.committed
    );
    let update = route_update_for(entry, response, magic, packets_sent);
    entry.begin_route_update(update);
}

/// Keep the client's route updates flowing while the backend is unreachable.
/// A session on next stays there until its route would lapse on the client
/// or the backend has failed too many times in a row.
fn backend_update_failed(entry: &mut SessionEntry, magic: &MagicSet) {
    entry.backend_failures += 1;
    warn!(
        "Backend update failed for session {:016x} ({} in a row)",
        entry.session_id, entry.backend_failures
    );
    if entry.send_over_next && entry.backend_failures < BACKEND_MAX_FAILURES {
        return;
    }
    if entry.send_over_next {
        warn!("Session {:016x} giving up on next", entry.session_id);
    }
    go_direct(entry, magic);
}

fn go_direct(entry: &mut SessionEntry, magic: &MagicSet) {
    entry.send_over_next = false;
    entry.extend_route_lifetime(UpdateType::Direct, 0.0);
    entry.multipath = false;
    let update = route_update_for(entry, SessionUpdateResponse::direct(), magic, 0);
    entry.begin_route_update(update);
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    UpgradeSession { address: Address, user_tag: u64 },
    TagSession { address: Address, user_tag: u64 },
    Flush,
    Shutdown,
}

/// Handle to a server core running on a tokio task.
pub struct ServerWorker<T: Transport> {
    commands: Sender<ServerCommand>,
    notifications: Receiver<ServerNotify>,
    snapshot: ServerSnapshot,
    server_address: Address,
    transport: Arc<T>,
    metrics: Arc<Metrics>,
    start: Instant,
    task: JoinHandle<()>,
}

impl<T: Transport> ServerWorker<T> {
    pub fn spawn(
        config: ServerConfig,
        backend: Box<dyn Backend>,
        transport: T,
        metrics: Arc<Metrics>,
        tick: Duration,
    ) -> Self {
        let (command_tx, command_rx) = bounded(COMMAND_QUEUE_SIZE);
        let (notify_tx, notify_rx) = bounded(NOTIFY_QUEUE_SIZE);
        let server_address = config.server_address;
        let core = ServerCore::new(config, backend, metrics.clone());
        let snapshot = core.snapshot();
        let transport = Arc::new(transport);
        let start = Instant::now();
        let task = tokio::spawn(run_server(
            core,
            transport.clone(),
            command_rx,
            notify_tx,
            metrics.clone(),
            start,
            tick,
        ));
        info!(
            "Server worker for {} started on {}",
            server_address,
            transport.local_address()
        );
        Self {
            commands: command_tx,
            notifications: notify_rx,
            snapshot,
            server_address,
            transport,
            metrics,
            start,
            task,
        }
    }

    fn command(&self, command: ServerCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!("Server command queue full, dropping {:?}", command);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn upgrade_session(&self, address: Address, user_tag: u64) -> bool {
        self.command(ServerCommand::UpgradeSession { address, user_tag })
    }

    pub fn tag_session(&self, address: Address, user_tag: u64) -> bool {
        self.command(ServerCommand::TagSession { address, user_tag })
    }

    pub fn flush(&self) -> bool {
        self.command(ServerCommand::Flush)
    }

    /// Send a game packet to `address` from the calling thread.
    pub fn send_packet(&self, address: Address, payload: &[u8]) -> bool {
        if payload.is_empty() || payload.len() > MTU {
            warn!("Dropping {} byte payload, limit is {}", payload.len(), MTU);
            return false;
        }
        let now = self.start.elapsed().as_secs_f64();
        let datagrams = prepare_payload(&self.snapshot, self.server_address, address, payload, now);
        send_all(&*self.transport, datagrams, &self.metrics) > 0
    }

    pub fn try_recv(&self) -> Option<ServerNotify> {
        self.notifications.try_recv().ok()
    }

    pub fn notifications(&self) -> &Receiver<ServerNotify> {
        &self.notifications
    }

    pub fn local_address(&self) -> Address {
        self.transport.local_address()
    }

    pub async fn shutdown(self) {
        self.command(ServerCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Server worker task failed: {}", e);
        }
    }
}

async fn run_server<T: Transport>(
    mut core: ServerCore,
    transport: Arc<T>,
    commands: Receiver<ServerCommand>,
    notify: Sender<ServerNotify>,
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
                        Ok(ServerCommand::UpgradeSession { address, user_tag }) => {
                            core.upgrade_session(address, user_tag, now);
                        }
                        Ok(ServerCommand::TagSession { address, user_tag }) => {
                            if !core.tag_session(&address, user_tag) {
                                debug!("No session at {} to tag", address);
                            }
                        }
                        Ok(ServerCommand::Flush) => core.flush(now),
                        Ok(ServerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                            info!("Server worker stopping");
                            core.flush(now);
                            send_all(&*transport, core.drain_outgoing(), &metrics);
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
                debug!("Server notify queue full, dropping notification");
            }
        }
    }
}
