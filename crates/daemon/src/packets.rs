//! Wire Packets
//!
//! Every packet type is one variant of [`Packet`]. The static per-type table
//! on [`PacketType`] decides whether a body is signed, encrypted, carries a
//! route header, or is plain. `write_packet` and `read_packet` are the only
//! places that touch the envelope:
//!
//! ```text
//! [type:1][chonkle:15][body ...][pittle:2]
//! ```
//!
//! Passthrough packets (type 0) are the bare payload behind the type byte.

use anyhow::{bail, Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::address::Address;
use crate::constants::{
    ENCRYPTED_CONTINUE_TOKEN_BYTES, ENCRYPTED_PING_TOKEN_BYTES, ENCRYPTED_ROUTE_TOKEN_BYTES,
    ENCRYPTED_UPGRADE_TOKEN_BYTES, HEADER_BYTES, KEY_BYTES, MAX_CONNECTION_TYPE,
    MAX_NEAR_RELAYS, MAX_PACKET_BYTES, MAX_PLATFORM_ID, MAX_TOKENS, PACKET_PREFIX_BYTES,
    PACKET_SUFFIX_BYTES, SIGNATURE_BYTES,
};
use crate::crypto::{self, Key, OpenError};
use crate::replay::ReplayProtection;
use crate::stream::{ReadStream, Stream, WriteStream};
use crate::tags::{self, Magic, MagicSet};

// ============================================================================
// Packet Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Passthrough = 0,
    Direct = 1,
    DirectPing = 2,
    DirectPong = 3,
    UpgradeRequest = 4,
    UpgradeResponse = 5,
    UpgradeConfirm = 6,
    RouteRequest = 9,
    RouteResponse = 10,
    ClientToServer = 11,
    ServerToClient = 12,
    Ping = 13,
    Pong = 14,
    ContinueRequest = 15,
    ContinueResponse = 16,
    ClientStats = 17,
    RouteUpdate = 18,
    RouteUpdateAck = 19,
    RelayPing = 20,
    RelayPong = 21,
    BackendServerInitRequest = 50,
    BackendServerInitResponse = 51,
    BackendServerUpdateRequest = 52,
    BackendServerUpdateResponse = 53,
    BackendSessionUpdateRequest = 54,
    BackendSessionUpdateResponse = 55,
    BackendMatchDataRequest = 56,
    BackendMatchDataResponse = 57,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        use PacketType::*;
        Ok(match value {
            0 => Passthrough,
            1 => Direct,
            2 => DirectPing,
            3 => DirectPong,
            4 => UpgradeRequest,
            5 => UpgradeResponse,
            6 => UpgradeConfirm,
            9 => RouteRequest,
            10 => RouteResponse,
            11 => ClientToServer,
            12 => ServerToClient,
            13 => Ping,
            14 => Pong,
            15 => ContinueRequest,
            16 => ContinueResponse,
            17 => ClientStats,
            18 => RouteUpdate,
            19 => RouteUpdateAck,
            20 => RelayPing,
            21 => RelayPong,
            50 => BackendServerInitRequest,
            51 => BackendServerInitResponse,
            52 => BackendServerUpdateRequest,
            53 => BackendServerUpdateResponse,
            54 => BackendSessionUpdateRequest,
            55 => BackendSessionUpdateResponse,
            56 => BackendMatchDataRequest,
            57 => BackendMatchDataResponse,
            other => bail!("Unknown packet type {}", other),
        })
    }
}

impl PacketType {
    pub fn is_backend(self) -> bool {
        (self as u8) >= 50 && (self as u8) <= 57
    }

    /// Ed25519 signed over type + body.
    pub fn is_signed(self) -> bool {
        matches!(self, PacketType::UpgradeRequest | PacketType::UpgradeConfirm) || self.is_backend()
    }

    /// Sealed under the session keys negotiated by the upgrade.
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            PacketType::Direct
                | PacketType::DirectPing
                | PacketType::DirectPong
                | PacketType::ClientStats
                | PacketType::RouteUpdate
                | PacketType::RouteUpdateAck
        )
    }

    /// Starts with the 33 byte route header.
    pub fn has_header(self) -> bool {
        matches!(
            self,
            PacketType::RouteResponse
                | PacketType::ClientToServer
                | PacketType::ServerToClient
                | PacketType::Ping
                | PacketType::Pong
                | PacketType::ContinueResponse
        )
    }
}

// ============================================================================
// Bodies
// ============================================================================

/// A packet body described once for both directions of the codec.
pub trait PacketBody: Default + Clone {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool;
}

fn write_body<P: PacketBody>(body: &P) -> Option<Vec<u8>> {
    let mut copy = body.clone();
    let mut stream = WriteStream::new(MAX_PACKET_BYTES);
    if !copy.serialize(&mut stream) {
        return None;
    }
    stream.finish()
}

fn read_body<P: PacketBody>(data: &[u8]) -> Result<P> {
    let mut body = P::default();
    let mut stream = ReadStream::new(data);
    if !body.serialize(&mut stream) {
        bail!("Truncated or malformed body");
    }
    Ok(body)
}

fn serialize_magic_set<S: Stream>(stream: &mut S, magic: &mut MagicSet) -> bool {
    stream.serialize_bytes(&mut magic.upcoming)
        && stream.serialize_bytes(&mut magic.current)
        && stream.serialize_bytes(&mut magic.previous)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateType {
    #[default]
    Direct = 0,
    Route = 1,
    Continue = 2,
}

impl UpdateType {
    pub fn token_bytes(self) -> usize {
        match self {
            UpdateType::Direct => 0,
            UpdateType::Route => ENCRYPTED_ROUTE_TOKEN_BYTES,
            UpdateType::Continue => ENCRYPTED_CONTINUE_TOKEN_BYTES,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(UpdateType::Direct),
            1 => Some(UpdateType::Route),
            2 => Some(UpdateType::Continue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectPingPacket {
    pub ping_sequence: u64,
}

impl PacketBody for DirectPingPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u64(&mut self.ping_sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectPongPacket {
    pub ping_sequence: u64,
}

impl PacketBody for DirectPongPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u64(&mut self.ping_sequence)
    }
}

/// Server to client, signed. Sent until the client answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequestPacket {
    pub protocol_version: u8,
    pub session_id: u64,
    /// Client address as the server sees it.
    pub client_address: Address,
    pub server_address: Address,
    pub server_kx_public_key: [u8; KEY_BYTES],
    pub upgrade_token: [u8; ENCRYPTED_UPGRADE_TOKEN_BYTES],
    pub upgrade_sequence: u64,
    pub magic: MagicSet,
}

impl Default for UpgradeRequestPacket {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            session_id: 0,
            client_address: Address::None,
            server_address: Address::None,
            server_kx_public_key: [0u8; KEY_BYTES],
            upgrade_token: [0u8; ENCRYPTED_UPGRADE_TOKEN_BYTES],
            upgrade_sequence: 0,
            magic: MagicSet::default(),
        }
    }
}

impl PacketBody for UpgradeRequestPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u8(&mut self.protocol_version)
            && stream.serialize_u64(&mut self.session_id)
            && stream.serialize_address(&mut self.client_address)
            && stream.serialize_address(&mut self.server_address)
            && stream.serialize_bytes(&mut self.server_kx_public_key)
            && stream.serialize_bytes(&mut self.upgrade_token)
            && stream.serialize_u64(&mut self.upgrade_sequence)
            && serialize_magic_set(stream, &mut self.magic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponsePacket {
    pub client_open_session_sequence: u8,
    pub client_kx_public_key: [u8; KEY_BYTES],
    pub client_route_public_key: [u8; KEY_BYTES],
    pub upgrade_token: [u8; ENCRYPTED_UPGRADE_TOKEN_BYTES],
    pub platform_id: u32,
    pub connection_type: u32,
}

impl Default for UpgradeResponsePacket {
    fn default() -> Self {
        Self {
            client_open_session_sequence: 0,
            client_kx_public_key: [0u8; KEY_BYTES],
            client_route_public_key: [0u8; KEY_BYTES],
            upgrade_token: [0u8; ENCRYPTED_UPGRADE_TOKEN_BYTES],
            platform_id: 0,
            connection_type: 0,
        }
    }
}

impl PacketBody for UpgradeResponsePacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u8(&mut self.client_open_session_sequence)
            && stream.serialize_bytes(&mut self.client_kx_public_key)
            && stream.serialize_bytes(&mut self.client_route_public_key)
            && stream.serialize_bytes(&mut self.upgrade_token)
            && stream.serialize_range(&mut self.platform_id, 0, MAX_PLATFORM_ID)
            && stream.serialize_range(&mut self.connection_type, 0, MAX_CONNECTION_TYPE)
    }
}

/// Server to client, signed. Lets the client derive the session keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpgradeConfirmPacket {
    pub upgrade_sequence: u64,
    pub session_id: u64,
    pub server_address: Address,
    pub client_kx_public_key: [u8; KEY_BYTES],
    pub server_kx_public_key: [u8; KEY_BYTES],
}

impl PacketBody for UpgradeConfirmPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u64(&mut self.upgrade_sequence)
            && stream.serialize_u64(&mut self.session_id)
            && stream.serialize_address(&mut self.server_address)
            && stream.serialize_bytes(&mut self.client_kx_public_key)
            && stream.serialize_bytes(&mut self.server_kx_public_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NearRelayStats {
    pub relay_id: u64,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

/// Client to server every `CLIENT_STATS_SEND_TIME`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientStatsPacket {
    pub fallback_flags: u32,
    pub next: bool,
    pub multipath: bool,
    pub platform_id: u32,
    pub connection_type: u32,
    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,
    pub next_rtt: f32,
    pub next_jitter: f32,
    pub next_packet_loss: f32,
    pub next_kbps_up: f32,
    pub jitter_server_to_client: f32,
    pub packets_sent_client_to_server: u64,
    pub packets_lost_server_to_client: u64,
    pub packets_out_of_order_server_to_client: u64,
    pub near_relays: Vec<NearRelayStats>,
}

impl PacketBody for ClientStatsPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        let ok = stream.serialize_u32(&mut self.fallback_flags)
            && stream.serialize_bool(&mut self.next)
            && stream.serialize_bool(&mut self.multipath)
            && stream.serialize_range(&mut self.platform_id, 0, MAX_PLATFORM_ID)
            && stream.serialize_range(&mut self.connection_type, 0, MAX_CONNECTION_TYPE)
            && stream.serialize_f32(&mut self.direct_rtt)
            && stream.serialize_f32(&mut self.direct_jitter)
            && stream.serialize_f32(&mut self.direct_packet_loss)
            && stream.serialize_f32(&mut self.next_rtt)
            && stream.serialize_f32(&mut self.next_jitter)
            && stream.serialize_f32(&mut self.next_packet_loss)
            && stream.serialize_f32(&mut self.next_kbps_up)
            && stream.serialize_f32(&mut self.jitter_server_to_client)
            && stream.serialize_u64(&mut self.packets_sent_client_to_server)
            && stream.serialize_u64(&mut self.packets_lost_server_to_client)
            && stream.serialize_u64(&mut self.packets_out_of_order_server_to_client);
        if !ok {
            return false;
        }

        let mut count = self.near_relays.len() as u32;
        if !stream.serialize_range(&mut count, 0, MAX_NEAR_RELAYS as u32) {
            return false;
        }
        if stream.is_reading() {
            self.near_relays = vec![NearRelayStats::default(); count as usize];
        }
        self.near_relays.iter_mut().all(|relay| {
            stream.serialize_u64(&mut relay.relay_id)
                && stream.serialize_f32(&mut relay.rtt)
                && stream.serialize_f32(&mut relay.jitter)
                && stream.serialize_f32(&mut relay.packet_loss)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearRelay {
    pub relay_id: u64,
    pub address: Address,
    pub ping_token: [u8; ENCRYPTED_PING_TOKEN_BYTES],
}

impl Default for NearRelay {
    fn default() -> Self {
        Self {
            relay_id: 0,
            address: Address::None,
            ping_token: [0u8; ENCRYPTED_PING_TOKEN_BYTES],
        }
    }
}

/// A complete near-relay set issued by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NearRelaySet {
    pub expire_timestamp: u64,
    pub relays: Vec<NearRelay>,
}

/// Server to client. Carries one control-plane decision.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteUpdatePacket {
    pub sequence: u64,
    pub update_type: UpdateType,
    pub num_tokens: u32,
    pub tokens: Vec<u8>,
    pub multipath: bool,
    pub near_relays: Option<NearRelaySet>,
    pub magic: MagicSet,
    pub packets_sent_server_to_client: u64,
    pub packets_lost_client_to_server: u64,
    pub packets_out_of_order_client_to_server: u64,
    pub jitter_client_to_server: f32,
}

impl PacketBody for RouteUpdatePacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        let mut update_type = self.update_type as u32;
        if !stream.serialize_u64(&mut self.sequence)
            || !stream.serialize_range(&mut update_type, 0, UpdateType::Continue as u32)
        {
            return false;
        }
        let Some(kind) = UpdateType::from_u32(update_type) else {
            return false;
        };
        self.update_type = kind;

        if kind != UpdateType::Direct {
            if !stream.serialize_range(&mut self.num_tokens, 0, MAX_TOKENS as u32) {
                return false;
            }
            if stream.is_reading() {
                self.tokens = vec![0u8; self.num_tokens as usize * kind.token_bytes()];
            }
            debug_assert_eq!(self.tokens.len(), self.num_tokens as usize * kind.token_bytes());
            if !stream.serialize_bytes(&mut self.tokens) {
                return false;
            }
        }

        let mut has_near_relays = self.near_relays.is_some();
        if !stream.serialize_bool(&mut self.multipath)
            || !stream.serialize_bool(&mut has_near_relays)
        {
            return false;
        }
        if has_near_relays {
            let mut set = self.near_relays.take().unwrap_or_default();
            let mut count = set.relays.len() as u32;
            if !stream.serialize_u64(&mut set.expire_timestamp)
                || !stream.serialize_range(&mut count, 0, MAX_NEAR_RELAYS as u32)
            {
                return false;
            }
            if stream.is_reading() {
                set.relays = vec![NearRelay::default(); count as usize];
            }
            let ok = set.relays.iter_mut().all(|relay| {
                stream.serialize_u64(&mut relay.relay_id)
                    && stream.serialize_address(&mut relay.address)
                    && stream.serialize_bytes(&mut relay.ping_token)
            });
            self.near_relays = Some(set);
            if !ok {
                return false;
            }
        }

        serialize_magic_set(stream, &mut self.magic)
            && stream.serialize_u64(&mut self.packets_sent_server_to_client)
            && stream.serialize_u64(&mut self.packets_lost_client_to_server)
            && stream.serialize_u64(&mut self.packets_out_of_order_client_to_server)
            && stream.serialize_f32(&mut self.jitter_client_to_server)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteUpdateAckPacket {
    pub sequence: u64,
}

impl PacketBody for RouteUpdateAckPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u64(&mut self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPingPacket {
    pub ping_sequence: u64,
    pub session_id: u64,
    pub ping_token: [u8; ENCRYPTED_PING_TOKEN_BYTES],
}

impl Default for RelayPingPacket {
    fn default() -> Self {
        Self {
            ping_sequence: 0,
            session_id: 0,
            ping_token: [0u8; ENCRYPTED_PING_TOKEN_BYTES],
        }
    }
}

impl PacketBody for RelayPingPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u64(&mut self.ping_sequence)
            && stream.serialize_u64(&mut self.session_id)
            && stream.serialize_bytes(&mut self.ping_token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayPongPacket {
    pub ping_sequence: u64,
    pub session_id: u64,
}

impl PacketBody for RelayPongPacket {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> bool {
        stream.serialize_u64(&mut self.ping_sequence) && stream.serialize_u64(&mut self.session_id)
    }
}

/// Encrypted game payload on the direct path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectPacket {
    pub open_session_sequence: u8,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Route header plus whatever follows it. The header is verified by whoever
/// owns the route key, not by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPacket {
    pub header: [u8; HEADER_BYTES],
    pub payload: Vec<u8>,
}

impl HeaderPacket {
    pub fn new(header: [u8; HEADER_BYTES], payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Ping sequence carried by ping and pong bodies.
    pub fn ping_sequence(&self) -> Option<u64> {
        Some(u64::from_le_bytes(self.payload.get(..8)?.try_into().ok()?))
    }
}

// ============================================================================
// Packet Enum
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Passthrough(Vec<u8>),
    Direct(DirectPacket),
    DirectPing(DirectPingPacket),
    DirectPong(DirectPongPacket),
    UpgradeRequest(UpgradeRequestPacket),
    UpgradeResponse(UpgradeResponsePacket),
    UpgradeConfirm(UpgradeConfirmPacket),
    RouteRequest(Vec<u8>),
    RouteResponse(HeaderPacket),
    ClientToServer(HeaderPacket),
    ServerToClient(HeaderPacket),
    Ping(HeaderPacket),
    Pong(HeaderPacket),
    ContinueRequest(Vec<u8>),
    ContinueResponse(HeaderPacket),
    ClientStats(ClientStatsPacket),
    RouteUpdate(RouteUpdatePacket),
    RouteUpdateAck(RouteUpdateAckPacket),
    RelayPing(RelayPingPacket),
    RelayPong(RelayPongPacket),
    Backend { packet_type: PacketType, body: Vec<u8> },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Passthrough(_) => PacketType::Passthrough,
            Packet::Direct(_) => PacketType::Direct,
            Packet::DirectPing(_) => PacketType::DirectPing,
            Packet::DirectPong(_) => PacketType::DirectPong,
            Packet::UpgradeRequest(_) => PacketType::UpgradeRequest,
            Packet::UpgradeResponse(_) => PacketType::UpgradeResponse,
            Packet::UpgradeConfirm(_) => PacketType::UpgradeConfirm,
            Packet::RouteRequest(_) => PacketType::RouteRequest,
            Packet::RouteResponse(_) => PacketType::RouteResponse,
            Packet::ClientToServer(_) => PacketType::ClientToServer,
            Packet::ServerToClient(_) => PacketType::ServerToClient,
            Packet::Ping(_) => PacketType::Ping,
            Packet::Pong(_) => PacketType::Pong,
            Packet::ContinueRequest(_) => PacketType::ContinueRequest,
            Packet::ContinueResponse(_) => PacketType::ContinueResponse,
            Packet::ClientStats(_) => PacketType::ClientStats,
            Packet::RouteUpdate(_) => PacketType::RouteUpdate,
            Packet::RouteUpdateAck(_) => PacketType::RouteUpdateAck,
            Packet::RelayPing(_) => PacketType::RelayPing,
            Packet::RelayPong(_) => PacketType::RelayPong,
            Packet::Backend { packet_type, .. } => *packet_type,
        }
    }
}

/// Upgrade requests reach a client that knows neither the magic nor its own
/// external address yet, so they are tagged with zero magic and no destination.
const BOOTSTRAP_MAGIC: Magic = [0u8; 8];

fn tag_endpoints(packet_type: PacketType, to: &Address) -> Address {
    if packet_type == PacketType::UpgradeRequest {
        Address::None
    } else {
        *to
    }
}

// ============================================================================
// Writing
// ============================================================================

/// Everything needed to put one packet on the wire.
pub struct WriteContext<'a> {
    pub from: Address,
    pub to: Address,
    pub magic: Magic,
    pub signing_key: Option<&'a SigningKey>,
    pub send_key: Option<&'a Key>,
    /// Internal sequence for encrypted control packets, payload sequence for direct.
    pub sequence: u64,
}

impl<'a> WriteContext<'a> {
    pub fn new(from: Address, to: Address, magic: Magic) -> Self {
        Self {
            from,
            to,
            magic,
            signing_key: None,
            send_key: None,
            sequence: 0,
        }
    }

    pub fn signed(mut self, signing_key: &'a SigningKey) -> Self {
        self.signing_key = Some(signing_key);
        self
    }

    pub fn encrypted(mut self, send_key: &'a Key, sequence: u64) -> Self {
        self.send_key = Some(send_key);
        self.sequence = sequence;
        self
    }
}

fn header_body(packet: &HeaderPacket) -> Vec<u8> {
    let mut body = Vec::with_capacity(HEADER_BYTES + packet.payload.len());
    body.extend_from_slice(&packet.header);
    body.extend_from_slice(&packet.payload);
    body
}

fn plain_body(packet: &Packet) -> Option<Vec<u8>> {
    match packet {
        Packet::Passthrough(payload) => Some(payload.clone()),
        Packet::Direct(direct) => Some(direct.payload.clone()),
        Packet::DirectPing(body) => write_body(body),
        Packet::DirectPong(body) => write_body(body),
        Packet::UpgradeRequest(body) => write_body(body),
        Packet::UpgradeResponse(body) => write_body(body),
        Packet::UpgradeConfirm(body) => write_body(body),
        Packet::RouteRequest(tokens) | Packet::ContinueRequest(tokens) => Some(tokens.clone()),
        Packet::RouteResponse(header)
        | Packet::ClientToServer(header)
        | Packet::ServerToClient(header)
        | Packet::Ping(header)
        | Packet::Pong(header)
        | Packet::ContinueResponse(header) => Some(header_body(header)),
        Packet::ClientStats(body) => write_body(body),
        Packet::RouteUpdate(body) => write_body(body),
        Packet::RouteUpdateAck(body) => write_body(body),
        Packet::RelayPing(body) => write_body(body),
        Packet::RelayPong(body) => write_body(body),
        Packet::Backend { body, .. } => Some(body.clone()),
    }
}

/// Serialize, sign or encrypt, and tag a packet. `None` if a required key is
/// missing or the result would not fit in a datagram.
pub fn write_packet(packet: &Packet, ctx: &WriteContext<'_>) -> Option<Vec<u8>> {
    let packet_type = packet.packet_type();
    let type_byte = packet_type as u8;
    let plain = plain_body(packet)?;

    if packet_type == PacketType::Passthrough {
        let mut out = Vec::with_capacity(1 + plain.len());
        out.push(type_byte);
        out.extend_from_slice(&plain);
        return (out.len() <= MAX_PACKET_BYTES).then_some(out);
    }

    let body = if packet_type.is_signed() {
        let signing_key = ctx.signing_key?;
        let signature = crypto::sign_packet(signing_key, type_byte, &plain);
        let mut body = plain;
        body.extend_from_slice(&signature);
        body
    } else if let Packet::Direct(direct) = packet {
        let key = ctx.send_key?;
        let associated = [type_byte, direct.open_session_sequence];
        let sealed =
            crypto::encrypt_packet_body(key, type_byte, &associated, direct.sequence, &plain)?;
        let mut body = Vec::with_capacity(1 + sealed.len());
        body.push(direct.open_session_sequence);
        body.extend_from_slice(&sealed);
        body
    } else if packet_type.is_encrypted() {
        let key = ctx.send_key?;
        crypto::encrypt_packet_body(key, type_byte, &[type_byte], ctx.sequence, &plain)?
    } else {
        plain
    };

    let total = PACKET_PREFIX_BYTES + body.len() + PACKET_SUFFIX_BYTES;
    if total > MAX_PACKET_BYTES {
        return None;
    }
    let mut out = vec![0u8; total];
    out[0] = type_byte;
    out[PACKET_PREFIX_BYTES..total - PACKET_SUFFIX_BYTES].copy_from_slice(&body);

    let (magic, to) = if packet_type == PacketType::UpgradeRequest {
        (BOOTSTRAP_MAGIC, tag_endpoints(packet_type, &ctx.to))
    } else {
        (ctx.magic, ctx.to)
    };
    tags::stamp_tags(&mut out, &magic, &ctx.from, &to);
    Some(out)
}

// ============================================================================
// Reading
// ============================================================================

/// Session keys and replay windows for decrypting control and direct packets.
pub struct SessionCipher<'a> {
    pub receive_key: &'a Key,
    pub internal_replay: &'a mut ReplayProtection,
    pub payload_replay: &'a mut ReplayProtection,
}

pub struct ReadContext<'a> {
    pub from: Address,
    pub to: Address,
    pub magic: &'a MagicSet,
    pub verifying_key: Option<&'a VerifyingKey>,
    pub session: Option<SessionCipher<'a>>,
}

impl<'a> ReadContext<'a> {
    pub fn new(from: Address, to: Address, magic: &'a MagicSet) -> Self {
        Self {
            from,
            to,
            magic,
            verifying_key: None,
            session: None,
        }
    }

    pub fn verified_by(mut self, verifying_key: &'a VerifyingKey) -> Self {
        self.verifying_key = Some(verifying_key);
        self
    }

    pub fn with_session(mut self, session: SessionCipher<'a>) -> Self {
        self.session = Some(session);
        self
    }
}

fn header_packet(body: &[u8]) -> Result<HeaderPacket> {
    if body.len() < HEADER_BYTES {
        bail!("Packet too short for route header");
    }
    let mut header = [0u8; HEADER_BYTES];
    header.copy_from_slice(&body[..HEADER_BYTES]);
    Ok(HeaderPacket::new(header, body[HEADER_BYTES..].to_vec()))
}

/// Filter, authenticate and decode one datagram. Every error is a reason to
/// drop the packet; none of them is fatal.
pub fn read_packet(data: &[u8], ctx: ReadContext<'_>) -> Result<Packet> {
    let Some(&type_byte) = data.first() else {
        bail!("Empty packet");
    };
    let packet_type = PacketType::try_from(type_byte)?;
    if packet_type == PacketType::Passthrough {
        return Ok(Packet::Passthrough(data[1..].to_vec()));
    }
    if data.len() > MAX_PACKET_BYTES {
        bail!("Packet larger than {} bytes", MAX_PACKET_BYTES);
    }
    if !tags::basic_packet_filter(data) {
        bail!("Basic packet filter rejected {:?}", packet_type);
    }

    let tagged_ok = if packet_type == PacketType::UpgradeRequest {
        tags::advanced_packet_filter(
            data,
            &BOOTSTRAP_MAGIC,
            &ctx.from,
            &tag_endpoints(packet_type, &ctx.to),
        )
    } else {
        ctx.magic.accepts(data, &ctx.from, &ctx.to)
    };
    if !tagged_ok {
        bail!("Advanced packet filter rejected {:?} from {}", packet_type, ctx.from);
    }

    let body = &data[PACKET_PREFIX_BYTES..data.len() - PACKET_SUFFIX_BYTES];

    let plain: Vec<u8> = if packet_type.is_signed() {
        let verifying_key = ctx
            .verifying_key
            .context("No verifying key for signed packet")?;
        if body.len() < SIGNATURE_BYTES {
            bail!("Signed packet too short");
        }
        let (content, signature) = body.split_at(body.len() - SIGNATURE_BYTES);
        if !crypto::verify_packet(verifying_key, type_byte, content, signature) {
            return Err(OpenError::Unauthenticated)
                .with_context(|| format!("Bad signature on {:?}", packet_type));
        }
        content.to_vec()
    } else if packet_type == PacketType::Direct {
        let session = ctx.session.context("No session for direct packet")?;
        let Some((&open_session_sequence, sealed)) = body.split_first() else {
            bail!("Direct packet too short");
        };
        let associated = [type_byte, open_session_sequence];
        let (sequence, payload) = crypto::decrypt_packet_body(
            session.receive_key,
            type_byte,
            &associated,
            sealed,
            session.payload_replay,
        )
        .context("Direct packet rejected")?;
        return Ok(Packet::Direct(DirectPacket {
            open_session_sequence,
            sequence,
            payload,
        }));
    } else if packet_type.is_encrypted() {
        let session = ctx.session.context("No session for encrypted packet")?;
        let (_, plain) = crypto::decrypt_packet_body(
            session.receive_key,
            type_byte,
            &[type_byte],
            body,
            session.internal_replay,
        )
        .with_context(|| format!("{:?} rejected", packet_type))?;
        plain
    } else {
        body.to_vec()
    };

    let packet = match packet_type {
        PacketType::Passthrough | PacketType::Direct => unreachable!("handled above"),
        PacketType::DirectPing => Packet::DirectPing(read_body(&plain)?),
        PacketType::DirectPong => Packet::DirectPong(read_body(&plain)?),
        PacketType::UpgradeRequest => Packet::UpgradeRequest(read_body(&plain)?),
        PacketType::UpgradeResponse => Packet::UpgradeResponse(read_body(&plain)?),
        PacketType::UpgradeConfirm => Packet::UpgradeConfirm(read_body(&plain)?),
        PacketType::RouteRequest => Packet::RouteRequest(plain),
        PacketType::ContinueRequest => Packet::ContinueRequest(plain),
        PacketType::RouteResponse => Packet::RouteResponse(header_packet(&plain)?),
        PacketType::ClientToServer => Packet::ClientToServer(header_packet(&plain)?),
        PacketType::ServerToClient => Packet::ServerToClient(header_packet(&plain)?),
        PacketType::Ping => Packet::Ping(header_packet(&plain)?),
        PacketType::Pong => Packet::Pong(header_packet(&plain)?),
        PacketType::ContinueResponse => Packet::ContinueResponse(header_packet(&plain)?),
        PacketType::ClientStats => Packet::ClientStats(read_body(&plain)?),
        PacketType::RouteUpdate => Packet::RouteUpdate(read_body(&plain)?),
        PacketType::RouteUpdateAck => Packet::RouteUpdateAck(read_body(&plain)?),
        PacketType::RelayPing => Packet::RelayPing(read_body(&plain)?),
        PacketType::RelayPong => Packet::RelayPong(read_body(&plain)?),
        PacketType::BackendServerInitRequest
        | PacketType::BackendServerInitResponse
        | PacketType::BackendServerUpdateRequest
        | PacketType::BackendServerUpdateResponse
        | PacketType::BackendSessionUpdateRequest
        | PacketType::BackendSessionUpdateResponse
        | PacketType::BackendMatchDataRequest
        | PacketType::BackendMatchDataResponse => Packet::Backend {
            packet_type,
            body: plain,
        },
    };
    Ok(packet)
}
