//! Packet Obfuscation Tags
//!
//! Every tagged packet carries a 15 byte "chonkle" right after the type byte
//! and a 2 byte "pittle" at the very end. Both are derived from the source and
//! destination endpoints and the packet length; the chonkle is additionally
//! keyed by an 8 byte magic that rotates per epoch.
//!
//! The basic filter only checks the byte ranges the chonkle mapping can
//! produce, so it costs nothing and needs no key. The advanced filter
//! recomputes both tags against the upcoming, current and previous magic.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::address::Address;
use crate::constants::{CHONKLE_BYTES, MAGIC_BYTES, MIN_TAGGED_PACKET_BYTES, PITTLE_BYTES};

type HmacSha256 = Hmac<Sha256>;

pub type Magic = [u8; MAGIC_BYTES];

const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Bytes shared by both tags: addresses and ports of each endpoint, then
/// the packet length.
fn endpoint_bytes(from: &Address, to: &Address, packet_length: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(44);
    data.extend_from_slice(&from.address_bytes());
    data.extend_from_slice(&from.port().to_le_bytes());
    data.extend_from_slice(&to.address_bytes());
    data.extend_from_slice(&to.port().to_le_bytes());
    data.extend_from_slice(&(packet_length as u32).to_le_bytes());
    data
}

pub fn generate_pittle(from: &Address, to: &Address, packet_length: usize) -> [u8; PITTLE_BYTES] {
    let sum = endpoint_bytes(from, to, packet_length)
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(byte as u16));
    let [lo, hi] = sum.to_le_bytes();
    let first = 1 | (lo ^ hi ^ 193);
    let second = 1 | ((255 - first) ^ 113);
    [first, second]
}

pub fn generate_chonkle(
    magic: &Magic,
    from: &Address,
    to: &Address,
    packet_length: usize,
) -> [u8; CHONKLE_BYTES] {
    let mut data = magic.to_vec();
    data.extend_from_slice(&endpoint_bytes(from, to, packet_length));
    let hash = fnv1a_64(&data);
    let d = hash.to_le_bytes();
    [
        ((d[6] & 0xC0) >> 6) + 42,
        (d[3] & 0x1F) + 200,
        ((d[2] & 0xFC) >> 2) + 5,
        d[0],
        (d[2] & 0x03) + 78,
        (d[4] & 0x7F) + 96,
        ((d[1] & 0xFC) >> 2) + 100,
        if d[7] & 1 == 0 { 79 } else { 7 },
        if d[4] & 0x80 == 0 { 37 } else { 83 },
        (d[5] & 0x07) + 124,
        ((d[1] & 0xE0) >> 5) + 175,
        (d[6] & 0x3F) + 33,
        [97, 5, 43, 13][(d[1] & 0x03) as usize],
        ((d[5] & 0xF8) >> 3) + 210,
        ((d[7] & 0xFE) >> 1) + 17,
    ]
}

/// Write both tags into a packet whose type byte and body are already in place.
pub fn stamp_tags(packet: &mut [u8], magic: &Magic, from: &Address, to: &Address) {
    debug_assert!(packet.len() >= MIN_TAGGED_PACKET_BYTES);
    let length = packet.len();
    let chonkle = generate_chonkle(magic, from, to, length);
    let pittle = generate_pittle(from, to, length);
    packet[1..1 + CHONKLE_BYTES].copy_from_slice(&chonkle);
    packet[length - PITTLE_BYTES..].copy_from_slice(&pittle);
}

/// Structural check of the chonkle byte ranges and pittle parity.
pub fn basic_packet_filter(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    if data[0] == 0 {
        return true;
    }
    if data.len() < MIN_TAGGED_PACKET_BYTES {
        return false;
    }

    let c = &data[1..1 + CHONKLE_BYTES];
    let checks = [
        (0x2A..=0x2D).contains(&c[0]),
        (0xC8..=0xE7).contains(&c[1]),
        (0x05..=0x44).contains(&c[2]),
        (0x4E..=0x51).contains(&c[4]),
        (0x60..=0xDF).contains(&c[5]),
        (0x64..=0xA3).contains(&c[6]),
        c[7] == 0x4F || c[7] == 0x07,
        c[8] == 0x25 || c[8] == 0x53,
        (0x7C..=0x83).contains(&c[9]),
        (0xAF..=0xB6).contains(&c[10]),
        (0x21..=0x60).contains(&c[11]),
        matches!(c[12], 0x61 | 0x05 | 0x2B | 0x0D),
        (0xD2..=0xF1).contains(&c[13]),
        (0x11..=0x90).contains(&c[14]),
    ];
    if !checks.iter().all(|&ok| ok) {
        return false;
    }

    let pittle = &data[data.len() - PITTLE_BYTES..];
    pittle[0] & 1 == 1 && pittle[1] & 1 == 1
}

/// Recompute both tags for one magic value.
pub fn advanced_packet_filter(data: &[u8], magic: &Magic, from: &Address, to: &Address) -> bool {
    if data.is_empty() {
        return false;
    }
    if data[0] == 0 {
        return true;
    }
    if data.len() < MIN_TAGGED_PACKET_BYTES {
        return false;
    }
    let length = data.len();
    let chonkle = generate_chonkle(magic, from, to, length);
    if data[1..1 + CHONKLE_BYTES] != chonkle {
        return false;
    }
    let pittle = generate_pittle(from, to, length);
    data[length - PITTLE_BYTES..] == pittle
}

/// HMAC-SHA256 derived magic for a given epoch.
pub fn derive_magic(secret: &[u8], epoch: u64) -> Magic {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(b"magic");
    mac.update(&epoch.to_le_bytes());
    let digest = mac.finalize().into_bytes();
    let mut magic = [0u8; MAGIC_BYTES];
    magic.copy_from_slice(&digest[..MAGIC_BYTES]);
    magic
}

// ============================================================================
// Magic Rotation
// ============================================================================

/// The three magic values a receiver accepts at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MagicSet {
    pub upcoming: Magic,
    pub current: Magic,
    pub previous: Magic,
}

impl MagicSet {
    pub fn new(upcoming: Magic, current: Magic, previous: Magic) -> Self {
        Self {
            upcoming,
            current,
            previous,
        }
    }

    /// Shift the window forward when the control plane issues a new upcoming magic.
    /// Repeating the same upcoming value is a no-op.
    pub fn rotate(&mut self, upcoming: Magic) {
        if upcoming == self.upcoming {
            return;
        }
        self.previous = self.current;
        self.current = self.upcoming;
        self.upcoming = upcoming;
    }

    /// True if the packet was tagged under any of the three epochs.
    pub fn accepts(&self, data: &[u8], from: &Address, to: &Address) -> bool {
        [&self.current, &self.upcoming, &self.previous]
            .into_iter()
            .any(|magic| advanced_packet_filter(data, magic, from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    fn tagged_packet(magic: &Magic, from: &Address, to: &Address, len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; len];
        packet[0] = 11;
        for (i, byte) in packet.iter_mut().enumerate().skip(16) {
            *byte = i as u8;
        }
        stamp_tags(&mut packet, magic, from, to);
        packet
    }

    #[test]
    fn test_fnv_known_values() {
        assert_eq!(fnv1a_64(b""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(fnv1a_64(b"foo"), fnv1a_64(b"bar"));
    }

    #[test]
    fn test_pittle_bytes_are_odd() {
        let from: Address = "1.2.3.4:50000".parse().unwrap();
        let to: Address = "[::1]:40000".parse().unwrap();
        for len in 18..200 {
            let pittle = generate_pittle(&from, &to, len);
            assert_eq!(pittle[0] & 1, 1);
            assert_eq!(pittle[1] & 1, 1);
        }
    }

    #[test]
    fn test_generated_tags_pass_both_filters() {
        let mut rng = StdRng::seed_from_u64(7);
        let from: Address = "1.2.3.4:50000".parse().unwrap();
        let to: Address = "5.6.7.8:40000".parse().unwrap();
        for _ in 0..200 {
            let mut magic = [0u8; MAGIC_BYTES];
            rng.fill_bytes(&mut magic);
            let len = rng.gen_range(18..1200);
            let packet = tagged_packet(&magic, &from, &to, len);
            assert!(basic_packet_filter(&packet));
            assert!(advanced_packet_filter(&packet, &magic, &from, &to));
        }
    }

    #[test]
    fn test_random_buffers_fail_basic_filter() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut accepted = 0;
        for _ in 0..1000 {
            let len = rng.gen_range(18..256);
            let mut buffer = vec![0u8; len];
            rng.fill_bytes(&mut buffer);
            buffer[0] = rng.gen_range(1..=255);
            if basic_packet_filter(&buffer) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_advanced_filter_rejects_mismatch() {
        let magic = [1u8; MAGIC_BYTES];
        let from: Address = "1.2.3.4:50000".parse().unwrap();
        let to: Address = "5.6.7.8:40000".parse().unwrap();
        let packet = tagged_packet(&magic, &from, &to, 64);

        assert!(!advanced_packet_filter(&packet, &[2u8; MAGIC_BYTES], &from, &to));
        assert!(!advanced_packet_filter(&packet, &magic, &to, &from));
        assert!(!advanced_packet_filter(&packet[..63], &magic, &from, &to));

        let mut tampered = packet.clone();
        tampered[63] ^= 0x02;
        assert!(!advanced_packet_filter(&tampered, &magic, &from, &to));
    }

    #[test]
    fn test_short_and_passthrough() {
        assert!(!basic_packet_filter(&[]));
        assert!(basic_packet_filter(&[0]));
        assert!(basic_packet_filter(&[0, 1, 2, 3]));
        assert!(!basic_packet_filter(&[5; 17]));
        let from = Address::None;
        assert!(!advanced_packet_filter(&[9; 17], &[0; 8], &from, &from));
        assert!(advanced_packet_filter(&[0, 9, 9], &[0; 8], &from, &from));
    }

    #[test]
    fn test_magic_set_rotation() {
        let from: Address = "1.2.3.4:50000".parse().unwrap();
        let to: Address = "5.6.7.8:40000".parse().unwrap();
        let (m1, m2, m3, m4) = ([1u8; 8], [2u8; 8], [3u8; 8], [4u8; 8]);

        let mut set = MagicSet::new(m2, m1, [0u8; 8]);
        let old = tagged_packet(&m1, &from, &to, 40);
        let next = tagged_packet(&m2, &from, &to, 40);
        assert!(set.accepts(&old, &from, &to));
        assert!(set.accepts(&next, &from, &to));

        set.rotate(m3);
        assert_eq!(set, MagicSet::new(m3, m2, m1));
        assert!(set.accepts(&old, &from, &to));

        set.rotate(m3);
        assert_eq!(set, MagicSet::new(m3, m2, m1));

        set.rotate(m4);
        assert!(!set.accepts(&old, &from, &to));
        assert!(set.accepts(&next, &from, &to));
    }

    #[test]
    fn test_derive_magic_is_stable_per_epoch() {
        assert_eq!(derive_magic(b"secret", 1), derive_magic(b"secret", 1));
        assert_ne!(derive_magic(b"secret", 1), derive_magic(b"secret", 2));
        assert_ne!(derive_magic(b"secret", 1), derive_magic(b"other", 1));
    }
}
