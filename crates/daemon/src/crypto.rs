//! Packet Cryptography
//!
//! - Authenticated route header: 8 byte sequence with direction and class
//!   bits, session id, session version and a ChaCha20-Poly1305 tag over those
//!   17 bytes, keyed by the per-route private key.
//! - Ed25519 signatures over type + body for bootstrap packets.
//! - Encrypted framing (sequence + ChaCha20-Poly1305 ciphertext) for control
//!   packets once session keys exist.
//! - X25519 key exchange with HMAC-SHA256 directional key derivation.

use std::fmt;

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as AeadKey, Nonce, Tag};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as KxPublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::constants::{
    HEADER_AUTHENTICATED_BYTES, HEADER_BYTES, KEY_BYTES, MAC_BYTES, SEQUENCE_DIRECTION_BIT,
    SEQUENCE_MASK, SEQUENCE_SPECIAL_BIT, SIGNATURE_BYTES,
};
use crate::replay::ReplayProtection;

type HmacSha256 = Hmac<Sha256>;

pub type Key = [u8; KEY_BYTES];

pub fn random_key() -> Key {
    let mut key = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

/// Random non-zero 64-bit identifier.
pub fn random_id() -> u64 {
    loop {
        let id = OsRng.next_u64();
        if id != 0 {
            return id;
        }
    }
}

fn packet_nonce(packet_type: u8, sequence: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&(packet_type as u32).to_le_bytes());
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

// ============================================================================
// Route Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Ping, pong and route/continue responses travel in the special class.
/// Payload types 11 and 12 do not.
pub fn is_special_type(packet_type: u8) -> bool {
    !matches!(packet_type, 11 | 12)
}

fn tagged_sequence(sequence: u64, direction: Direction, packet_type: u8) -> u64 {
    let mut tagged = sequence & SEQUENCE_MASK;
    if direction == Direction::ServerToClient {
        tagged |= SEQUENCE_DIRECTION_BIT;
    }
    if is_special_type(packet_type) {
        tagged |= SEQUENCE_SPECIAL_BIT;
    }
    tagged
}

/// Header fields with the direction and class bits stripped from the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub sequence: u64,
    pub session_id: u64,
    pub session_version: u8,
}

pub fn write_header(
    direction: Direction,
    packet_type: u8,
    fields: &HeaderFields,
    key: &Key,
) -> Option<[u8; HEADER_BYTES]> {
    let sequence = tagged_sequence(fields.sequence, direction, packet_type);
    let mut header = [0u8; HEADER_BYTES];
    header[0..8].copy_from_slice(&sequence.to_le_bytes());
    header[8..16].copy_from_slice(&fields.session_id.to_le_bytes());
    header[16] = fields.session_version;

    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = packet_nonce(packet_type, sequence);
    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &header[..HEADER_AUTHENTICATED_BYTES],
            &mut [],
        )
        .ok()?;
    header[HEADER_AUTHENTICATED_BYTES..].copy_from_slice(&tag);
    Some(header)
}

/// Read the header fields without authenticating them. Only used to pick
/// the session whose keys will then verify the header.
pub fn peek_header(header: &[u8]) -> Option<HeaderFields> {
    if header.len() < HEADER_BYTES {
        return None;
    }
    let sequence = u64::from_le_bytes(header[0..8].try_into().ok()?);
    let session_id = u64::from_le_bytes(header[8..16].try_into().ok()?);
    Some(HeaderFields {
        sequence: sequence & SEQUENCE_MASK,
        session_id,
        session_version: header[16],
    })
}

pub fn read_header(
    direction: Direction,
    packet_type: u8,
    header: &[u8],
    key: &Key,
) -> Option<HeaderFields> {
    if header.len() < HEADER_BYTES {
        return None;
    }
    let sequence = u64::from_le_bytes(header[0..8].try_into().ok()?);

    let server_to_client = sequence & SEQUENCE_DIRECTION_BIT != 0;
    if server_to_client != (direction == Direction::ServerToClient) {
        return None;
    }
    let special = sequence & SEQUENCE_SPECIAL_BIT != 0;
    if special != is_special_type(packet_type) {
        return None;
    }

    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = packet_nonce(packet_type, sequence);
    let tag = Tag::from_slice(&header[HEADER_AUTHENTICATED_BYTES..HEADER_BYTES]);
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &header[..HEADER_AUTHENTICATED_BYTES],
            &mut [],
            tag,
        )
        .ok()?;

    peek_header(header)
}

// ============================================================================
// Signatures
// ============================================================================

pub fn sign_packet(signing_key: &SigningKey, packet_type: u8, body: &[u8]) -> [u8; SIGNATURE_BYTES] {
    let mut message = Vec::with_capacity(1 + body.len());
    message.push(packet_type);
    message.extend_from_slice(body);
    signing_key.sign(&message).to_bytes()
}

pub fn verify_packet(
    verifying_key: &VerifyingKey,
    packet_type: u8,
    body: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(signature) = <[u8; SIGNATURE_BYTES]>::try_from(signature) else {
        return false;
    };
    let mut message = Vec::with_capacity(1 + body.len());
    message.push(packet_type);
    message.extend_from_slice(body);
    verifying_key
        .verify(&message, &Signature::from_bytes(&signature))
        .is_ok()
}

// ============================================================================
// Encrypted Framing
// ============================================================================

/// `sequence (u64 LE) || ciphertext || tag`
pub fn encrypt_packet_body(
    key: &Key,
    packet_type: u8,
    associated_data: &[u8],
    sequence: u64,
    body: &[u8],
) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = packet_nonce(packet_type, sequence);
    let mut buffer = body.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), associated_data, &mut buffer)
        .ok()?;

    let mut out = Vec::with_capacity(8 + buffer.len() + MAC_BYTES);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&buffer);
    out.extend_from_slice(&tag);
    Some(out)
}

/// Why a sealed packet could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    Truncated,
    Replayed,
    /// Bad AEAD tag or signature.
    Unauthenticated,
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::Truncated => write!(f, "truncated"),
            OpenError::Replayed => write!(f, "sequence already received"),
            OpenError::Unauthenticated => write!(f, "failed authentication"),
        }
    }
}

impl std::error::Error for OpenError {}

/// Inverse of [`encrypt_packet_body`]. The replay window is checked before
/// decryption and advanced only after the tag verifies.
pub fn decrypt_packet_body(
    key: &Key,
    packet_type: u8,
    associated_data: &[u8],
    data: &[u8],
    replay: &mut ReplayProtection,
) -> Result<(u64, Vec<u8>), OpenError> {
    if data.len() < 8 + MAC_BYTES {
        return Err(OpenError::Truncated);
    }
    let mut sequence_bytes = [0u8; 8];
    sequence_bytes.copy_from_slice(&data[..8]);
    let sequence = u64::from_le_bytes(sequence_bytes);
    if replay.already_received(sequence) {
        return Err(OpenError::Replayed);
    }

    let (ciphertext, tag) = data[8..].split_at(data.len() - 8 - MAC_BYTES);
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(key));
    let nonce = packet_nonce(packet_type, sequence);
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            associated_data,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| OpenError::Unauthenticated)?;

    replay.advance(sequence);
    Ok((sequence, buffer))
}

// ============================================================================
// Key Exchange
// ============================================================================

/// Ephemeral X25519 key pair generated per session.
pub struct KxKeyPair {
    secret: StaticSecret,
    pub public: [u8; KEY_BYTES],
}

impl KxKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = KxPublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn from_secret(bytes: [u8; KEY_BYTES]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = KxPublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    fn shared_secret(&self, peer_public: &[u8; KEY_BYTES]) -> Option<[u8; KEY_BYTES]> {
        let shared = self.secret.diffie_hellman(&KxPublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return None;
        }
        Some(*shared.as_bytes())
    }

    /// Keys for the client side of a session: send is client-to-server.
    pub fn client_session_keys(&self, server_public: &[u8; KEY_BYTES]) -> Option<SessionKeys> {
        let shared = self.shared_secret(server_public)?;
        let (client_to_server, server_to_client) =
            directional_keys(&shared, &self.public, server_public);
        Some(SessionKeys {
            send: client_to_server,
            receive: server_to_client,
        })
    }

    /// Keys for the server side of a session: send is server-to-client.
    pub fn server_session_keys(&self, client_public: &[u8; KEY_BYTES]) -> Option<SessionKeys> {
        let shared = self.shared_secret(client_public)?;
        let (client_to_server, server_to_client) =
            directional_keys(&shared, client_public, &self.public);
        Some(SessionKeys {
            send: server_to_client,
            receive: client_to_server,
        })
    }
}

fn hmac_key(secret: &[u8], label: &[u8], client_public: &[u8], server_public: &[u8]) -> Key {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(label);
    mac.update(client_public);
    mac.update(server_public);
    mac.finalize().into_bytes().into()
}

fn directional_keys(shared: &[u8], client_public: &[u8], server_public: &[u8]) -> (Key, Key) {
    (
        hmac_key(shared, b"client-to-server", client_public, server_public),
        hmac_key(shared, b"server-to-client", client_public, server_public),
    )
}

#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send: Key,
    pub receive: Key,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}
