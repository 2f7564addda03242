//! Route Handoff Tokens
//!
//! Route, continue and ping tokens are issued by the control plane and sealed
//! with `crypto_box` (X25519 + XSalsa20-Poly1305) from the control-plane key
//! to the key of the hop that will open them. Each sealed token is a random
//! 24 byte nonce followed by the ciphertext.
//!
//! Upgrade tokens are sealed by the server to itself with XChaCha20-Poly1305
//! under a key that never leaves the server process.

use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use crypto_box::aead::{AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use crate::address::Address;
use crate::constants::{
    ADDRESS_BYTES, CONTINUE_TOKEN_BYTES, ENCRYPTED_CONTINUE_TOKEN_BYTES,
    ENCRYPTED_PING_TOKEN_BYTES, ENCRYPTED_ROUTE_TOKEN_BYTES, ENCRYPTED_UPGRADE_TOKEN_BYTES,
    KEY_BYTES, PING_TOKEN_BYTES, ROUTE_TOKEN_BYTES, UPGRADE_TOKEN_BYTES,
};
use crate::crypto::Key;

const NONCE_BYTES: usize = 24;

fn seal_box(plain: &[u8], sender_secret: &SecretKey, receiver_public: &PublicKey) -> Option<Vec<u8>> {
    let salsa_box = SalsaBox::new(receiver_public, sender_secret);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = salsa_box.encrypt(&nonce, plain).ok()?;
    let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Some(out)
}

fn open_box(
    data: &[u8],
    sealed_len: usize,
    sender_public: &PublicKey,
    receiver_secret: &SecretKey,
) -> Option<Vec<u8>> {
    if data.len() < sealed_len {
        return None;
    }
    let (nonce, ciphertext) = data[..sealed_len].split_at(NONCE_BYTES);
    let salsa_box = SalsaBox::new(sender_public, receiver_secret);
    salsa_box
        .decrypt(crypto_box::Nonce::from_slice(nonce), ciphertext)
        .ok()
}

fn read_address(data: &[u8]) -> Option<Address> {
    let bytes: [u8; ADDRESS_BYTES] = data.get(..ADDRESS_BYTES)?.try_into().ok()?;
    Address::from_bytes(&bytes)
}

fn read_u64(data: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(..8)?.try_into().ok()?))
}

fn read_u32(data: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(..4)?.try_into().ok()?))
}

/// Unix seconds. Token expiry is measured against this clock.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Iterate over the fixed size tokens packed in a buffer.
pub fn split_tokens(data: &[u8], token_bytes: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks_exact(token_bytes)
}

// ============================================================================
// Route Token
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteToken {
    pub private_key: Key,
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub next_address: Address,
}

impl RouteToken {
    pub fn to_bytes(&self) -> [u8; ROUTE_TOKEN_BYTES] {
        let mut out = [0u8; ROUTE_TOKEN_BYTES];
        out[0..32].copy_from_slice(&self.private_key);
        out[32..40].copy_from_slice(&self.expire_timestamp.to_le_bytes());
        out[40..48].copy_from_slice(&self.session_id.to_le_bytes());
        out[48] = self.session_version;
        out[49..53].copy_from_slice(&self.kbps_up.to_le_bytes());
        out[53..57].copy_from_slice(&self.kbps_down.to_le_bytes());
        out[57..76].copy_from_slice(&self.next_address.to_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ROUTE_TOKEN_BYTES {
            return None;
        }
        let mut private_key = [0u8; KEY_BYTES];
        private_key.copy_from_slice(&data[0..32]);
        Some(Self {
            private_key,
            expire_timestamp: read_u64(&data[32..])?,
            session_id: read_u64(&data[40..])?,
            session_version: data[48],
            kbps_up: read_u32(&data[49..])?,
            kbps_down: read_u32(&data[53..])?,
            next_address: read_address(&data[57..])?,
        })
    }

    pub fn seal(&self, sender_secret: &SecretKey, receiver_public: &PublicKey) -> Option<Vec<u8>> {
        let sealed = seal_box(&self.to_bytes(), sender_secret, receiver_public)?;
        debug_assert_eq!(sealed.len(), ENCRYPTED_ROUTE_TOKEN_BYTES);
        Some(sealed)
    }

    pub fn open(data: &[u8], sender_public: &PublicKey, receiver_secret: &SecretKey) -> Option<Self> {
        let plain = open_box(data, ENCRYPTED_ROUTE_TOKEN_BYTES, sender_public, receiver_secret)?;
        Self::from_bytes(&plain)
    }

    pub fn is_expired(&self, timestamp: u64) -> bool {
        self.expire_timestamp < timestamp
    }
}

// ============================================================================
// Continue Token
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueToken {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
}

impl ContinueToken {
    pub fn to_bytes(&self) -> [u8; CONTINUE_TOKEN_BYTES] {
        let mut out = [0u8; CONTINUE_TOKEN_BYTES];
        out[0..8].copy_from_slice(&self.expire_timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.session_id.to_le_bytes());
        out[16] = self.session_version;
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < CONTINUE_TOKEN_BYTES {
            return None;
        }
        Some(Self {
            expire_timestamp: read_u64(data)?,
            session_id: read_u64(&data[8..])?,
            session_version: data[16],
        })
    }

    pub fn seal(&self, sender_secret: &SecretKey, receiver_public: &PublicKey) -> Option<Vec<u8>> {
        let sealed = seal_box(&self.to_bytes(), sender_secret, receiver_public)?;
        debug_assert_eq!(sealed.len(), ENCRYPTED_CONTINUE_TOKEN_BYTES);
        Some(sealed)
    }

    pub fn open(data: &[u8], sender_public: &PublicKey, receiver_secret: &SecretKey) -> Option<Self> {
        let plain = open_box(data, ENCRYPTED_CONTINUE_TOKEN_BYTES, sender_public, receiver_secret)?;
        Self::from_bytes(&plain)
    }

    pub fn is_expired(&self, timestamp: u64) -> bool {
        self.expire_timestamp < timestamp
    }
}

// ============================================================================
// Ping Token
// ============================================================================

/// Lets a relay answer pings from one client address without any session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingToken {
    pub expire_timestamp: u64,
    pub client_address: Address,
    pub relay_address: Address,
}

impl PingToken {
    pub fn to_bytes(&self) -> [u8; PING_TOKEN_BYTES] {
        let mut out = [0u8; PING_TOKEN_BYTES];
        out[0..8].copy_from_slice(&self.expire_timestamp.to_le_bytes());
        out[8..27].copy_from_slice(&self.client_address.to_bytes());
        out[27..46].copy_from_slice(&self.relay_address.to_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < PING_TOKEN_BYTES {
            return None;
        }
        Some(Self {
            expire_timestamp: read_u64(data)?,
            client_address: read_address(&data[8..])?,
            relay_address: read_address(&data[27..])?,
        })
    }

    pub fn seal(&self, sender_secret: &SecretKey, receiver_public: &PublicKey) -> Option<Vec<u8>> {
        let sealed = seal_box(&self.to_bytes(), sender_secret, receiver_public)?;
        debug_assert_eq!(sealed.len(), ENCRYPTED_PING_TOKEN_BYTES);
        Some(sealed)
    }

    pub fn open(data: &[u8], sender_public: &PublicKey, receiver_secret: &SecretKey) -> Option<Self> {
        let plain = open_box(data, ENCRYPTED_PING_TOKEN_BYTES, sender_public, receiver_secret)?;
        Self::from_bytes(&plain)
    }
}

// ============================================================================
// Upgrade Token
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeToken {
    pub session_id: u64,
    pub expire_timestamp: u64,
    pub client_address: Address,
    pub server_address: Address,
}

impl UpgradeToken {
    pub fn to_bytes(&self) -> [u8; UPGRADE_TOKEN_BYTES] {
        let mut out = [0u8; UPGRADE_TOKEN_BYTES];
        out[0..8].copy_from_slice(&self.session_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.expire_timestamp.to_le_bytes());
        out[16..35].copy_from_slice(&self.client_address.to_bytes());
        out[35..54].copy_from_slice(&self.server_address.to_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UPGRADE_TOKEN_BYTES {
            return None;
        }
        Some(Self {
            session_id: read_u64(data)?,
            expire_timestamp: read_u64(&data[8..])?,
            client_address: read_address(&data[16..])?,
            server_address: read_address(&data[35..])?,
        })
    }

    pub fn seal(&self, key: &Key) -> Option<[u8; ENCRYPTED_UPGRADE_TOKEN_BYTES]> {
        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, self.to_bytes().as_slice()).ok()?;
        let mut out = [0u8; ENCRYPTED_UPGRADE_TOKEN_BYTES];
        out[..NONCE_BYTES].copy_from_slice(&nonce);
        out[NONCE_BYTES..].copy_from_slice(&ciphertext);
        Some(out)
    }

    pub fn open(data: &[u8], key: &Key) -> Option<Self> {
        if data.len() < ENCRYPTED_UPGRADE_TOKEN_BYTES {
            return None;
        }
        let (nonce, ciphertext) = data[..ENCRYPTED_UPGRADE_TOKEN_BYTES].split_at(NONCE_BYTES);
        let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key));
        let plain = cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()?;
        Self::from_bytes(&plain)
    }

    pub fn is_expired(&self, timestamp: u64) -> bool {
        self.expire_timestamp < timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_key;

    fn keys() -> (SecretKey, SecretKey) {
        (SecretKey::generate(&mut OsRng), SecretKey::generate(&mut OsRng))
    }

    fn route_token() -> RouteToken {
        RouteToken {
            private_key: [7u8; KEY_BYTES],
            expire_timestamp: 1_700_000_000,
            session_id: 0xfeed_beef,
            session_version: 250,
            kbps_up: 256,
            kbps_down: 1024,
            next_address: "10.0.0.1:40000".parse().unwrap(),
        }
    }

    #[test]
    fn test_route_token_seal_open() {
        let (backend, client) = keys();
        let token = route_token();
        let sealed = token.seal(&backend, &client.public_key()).unwrap();
        assert_eq!(sealed.len(), ENCRYPTED_ROUTE_TOKEN_BYTES);

        let opened = RouteToken::open(&sealed, &backend.public_key(), &client).unwrap();
        assert_eq!(opened, token);

        // Wrong receiver
        let (_, other) = keys();
        assert!(RouteToken::open(&sealed, &backend.public_key(), &other).is_none());
        // Truncated
        assert!(RouteToken::open(&sealed[..100], &backend.public_key(), &client).is_none());
    }

    #[test]
    fn test_route_token_tamper() {
        let (backend, client) = keys();
        let mut sealed = route_token().seal(&backend, &client.public_key()).unwrap();
        sealed[60] ^= 0x80;
        assert!(RouteToken::open(&sealed, &backend.public_key(), &client).is_none());
    }

    #[test]
    fn test_continue_and_ping_tokens() {
        let (backend, relay) = keys();
        let token = ContinueToken {
            expire_timestamp: 99,
            session_id: 5,
            session_version: 1,
        };
        let sealed = token.seal(&backend, &relay.public_key()).unwrap();
        assert_eq!(sealed.len(), ENCRYPTED_CONTINUE_TOKEN_BYTES);
        assert_eq!(
            ContinueToken::open(&sealed, &backend.public_key(), &relay),
            Some(token)
        );
        assert!(token.is_expired(100));
        assert!(!token.is_expired(99));

        let ping = PingToken {
            expire_timestamp: 99,
            client_address: "1.2.3.4:50000".parse().unwrap(),
            relay_address: "[2001:db8::1]:40000".parse().unwrap(),
        };
        let sealed = ping.seal(&backend, &relay.public_key()).unwrap();
        assert_eq!(sealed.len(), ENCRYPTED_PING_TOKEN_BYTES);
        assert_eq!(PingToken::open(&sealed, &backend.public_key(), &relay), Some(ping));
    }

    #[test]
    fn test_upgrade_token() {
        let key = random_key();
        let token = UpgradeToken {
            session_id: 77,
            expire_timestamp: 1000,
            client_address: "1.2.3.4:50000".parse().unwrap(),
            server_address: "5.6.7.8:40000".parse().unwrap(),
        };
        let sealed = token.seal(&key).unwrap();
        assert_eq!(UpgradeToken::open(&sealed, &key), Some(token));
        assert!(UpgradeToken::open(&sealed, &random_key()).is_none());

        // Fresh nonce per seal
        assert_ne!(token.seal(&key).unwrap(), sealed);
    }

    #[test]
    fn test_split_tokens() {
        let data = vec![0u8; ENCRYPTED_ROUTE_TOKEN_BYTES * 3 + 5];
        assert_eq!(split_tokens(&data, ENCRYPTED_ROUTE_TOKEN_BYTES).count(), 3);
    }
}
