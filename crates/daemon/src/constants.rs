//! Protocol constants shared by the client and server halves.
//!
//! Times are in seconds (`f64`) unless the name says otherwise.

/// Largest datagram the protocol will ever build or accept.
pub const MAX_PACKET_BYTES: usize = 4096;
/// Largest user payload accepted by `send_packet`.
pub const MTU: usize = 1200;

/// Packet type byte plus the 15 byte chonkle tag.
pub const PACKET_PREFIX_BYTES: usize = 16;
/// Trailing pittle tag.
pub const PACKET_SUFFIX_BYTES: usize = 2;
/// Smallest tagged packet: type, chonkle, pittle.
pub const MIN_TAGGED_PACKET_BYTES: usize = PACKET_PREFIX_BYTES + PACKET_SUFFIX_BYTES;

pub const CHONKLE_BYTES: usize = 15;
pub const PITTLE_BYTES: usize = 2;
pub const MAGIC_BYTES: usize = 8;

/// Sequence (8) + session id (8) + session version (1) + AEAD tag (16).
pub const HEADER_BYTES: usize = 33;
/// Part of the header that is authenticated as associated data.
pub const HEADER_AUTHENTICATED_BYTES: usize = 17;

pub const KEY_BYTES: usize = 32;
pub const MAC_BYTES: usize = 16;
pub const SIGNATURE_BYTES: usize = 64;
pub const ADDRESS_BYTES: usize = 19;

pub const ROUTE_TOKEN_BYTES: usize = 76;
pub const ENCRYPTED_ROUTE_TOKEN_BYTES: usize = 116;
pub const CONTINUE_TOKEN_BYTES: usize = 17;
pub const ENCRYPTED_CONTINUE_TOKEN_BYTES: usize = 57;
pub const PING_TOKEN_BYTES: usize = 46;
pub const ENCRYPTED_PING_TOKEN_BYTES: usize = 86;
pub const UPGRADE_TOKEN_BYTES: usize = 54;
pub const ENCRYPTED_UPGRADE_TOKEN_BYTES: usize = 94;

/// Client token plus up to five relays plus the server token.
pub const MAX_TOKENS: usize = 7;
pub const MAX_NEAR_RELAYS: usize = 32;

pub const REPLAY_PROTECTION_BUFFER_SIZE: usize = 1024;
pub const PING_HISTORY_ENTRY_COUNT: usize = 1024;
pub const PACKET_LOSS_TRACKER_HISTORY: usize = 1024;
pub const PACKET_LOSS_TRACKER_SAFETY: u64 = 30;

/// Route renewal unit issued by the control plane.
pub const SLICE_SECONDS: f64 = 10.0;
pub const ROUTE_REQUEST_SEND_TIME: f64 = 0.25;
pub const ROUTE_REQUEST_TIMEOUT: f64 = 5.0;
pub const CONTINUE_REQUEST_SEND_TIME: f64 = 0.25;
pub const CONTINUE_REQUEST_TIMEOUT: f64 = 5.0;
pub const UPGRADE_REQUEST_SEND_TIME: f64 = 0.25;
pub const UPGRADE_TIMEOUT: f64 = 5.0;
pub const UPGRADE_TOKEN_EXPIRE_SECONDS: u64 = 10;
pub const PING_TIME: f64 = 0.1;
pub const PING_TIMEOUT: f64 = 5.0;
pub const PING_SAFETY: f64 = 1.0;
pub const PING_STATS_WINDOW: f64 = 10.0;
pub const RELAY_PING_TIME: f64 = 0.1;
pub const CLIENT_STATS_SEND_TIME: f64 = 0.25;
pub const ROUTE_UPDATE_RESEND_TIME: f64 = 0.1;
pub const ROUTE_UPDATE_TIMEOUT: f64 = 3.0 * SLICE_SECONDS;
pub const BACKEND_UPDATE_INTERVAL: f64 = SLICE_SECONDS;
pub const BACKEND_MAX_FAILURES: u32 = 5;
/// The server stops sending over next this long before the client's route lapses.
pub const ROUTE_EXPIRE_SAFETY: f64 = 1.0;
pub const SESSION_TIMEOUT: f64 = SLICE_SECONDS;
pub const TICK_SECONDS: f64 = 0.1;

pub const BANDWIDTH_LIMITER_INTERVAL: f64 = 1.0;
pub const BANDWIDTH_SAMPLE_INTERVAL: f64 = 0.1;
/// Per-packet overhead used when converting payload bytes into wire bits.
pub const IPV4_UDP_HEADER_BYTES: usize = 28;

pub const PROTOCOL_VERSION: u8 = 5;
pub const MAX_PLATFORM_ID: u32 = 10;
pub const MAX_CONNECTION_TYPE: u32 = 3;

/// Top bit of the sequence field: set for server to client packets.
pub const SEQUENCE_DIRECTION_BIT: u64 = 1 << 63;
/// Second bit: set for ping, pong and route/continue responses.
pub const SEQUENCE_SPECIAL_BIT: u64 = 1 << 62;
pub const SEQUENCE_MASK: u64 = !(SEQUENCE_DIRECTION_BIT | SEQUENCE_SPECIAL_BIT);

/// Application to worker command queue.
pub const COMMAND_QUEUE_SIZE: usize = 256;
/// Worker to application notification queue.
pub const NOTIFY_QUEUE_SIZE: usize = 4096;
