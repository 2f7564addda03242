//! Bit-Packed Wire Codec
//!
//! Packets are described once through the [`Stream`] trait and the same
//! `serialize` body both writes and reads them. Bits are packed into 32-bit
//! little-endian words starting from the least significant bit.
//!
//! Writers return `false` once the output budget is exhausted. Readers return
//! `false` on truncated or out-of-range input and never touch the value being
//! filled unless the read succeeded.

use crate::address::{Address, ADDRESS_IPV4, ADDRESS_IPV6, ADDRESS_NONE};

/// Number of bits needed to carry any value in `min..=max`.
pub fn bits_required(min: u64, max: u64) -> u32 {
    debug_assert!(max >= min);
    let range = max - min;
    if range == 0 {
        0
    } else {
        64 - range.leading_zeros()
    }
}

/// Two-way serialization interface implemented by [`WriteStream`] and [`ReadStream`].
pub trait Stream {
    fn is_writing(&self) -> bool;

    fn is_reading(&self) -> bool {
        !self.is_writing()
    }

    /// Write or read the low `bits` bits of `value` (`bits <= 32`).
    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> bool;

    /// Pad with zero bits up to the next byte boundary.
    fn serialize_align(&mut self) -> bool;

    /// Raw byte copy; callers align first.
    fn serialize_raw(&mut self, data: &mut [u8]) -> bool;

    fn bits_processed(&self) -> usize;

    fn serialize_range(&mut self, value: &mut u32, min: u32, max: u32) -> bool {
        debug_assert!(min <= max);
        let bits = bits_required(min as u64, max as u64);
        let mut unsigned = 0u32;
        if self.is_writing() {
            debug_assert!(*value >= min && *value <= max, "value out of range");
            unsigned = value.wrapping_sub(min);
        }
        if !self.serialize_bits(&mut unsigned, bits) {
            return false;
        }
        if self.is_reading() {
            if unsigned > max - min {
                return false;
            }
            *value = unsigned + min;
        }
        true
    }

    fn serialize_int(&mut self, value: &mut i32, min: i32, max: i32) -> bool {
        debug_assert!(min <= max);
        let bits = bits_required(0, (max as i64 - min as i64) as u64);
        let mut unsigned = 0u32;
        if self.is_writing() {
            debug_assert!(*value >= min && *value <= max, "value out of range");
            unsigned = (*value as i64 - min as i64) as u32;
        }
        if !self.serialize_bits(&mut unsigned, bits) {
            return false;
        }
        if self.is_reading() {
            let read = min as i64 + unsigned as i64;
            if read > max as i64 {
                return false;
            }
            *value = read as i32;
        }
        true
    }

    fn serialize_bool(&mut self, value: &mut bool) -> bool {
        let mut bit = *value as u32;
        if !self.serialize_bits(&mut bit, 1) {
            return false;
        }
        if self.is_reading() {
            *value = bit != 0;
        }
        true
    }

    fn serialize_u8(&mut self, value: &mut u8) -> bool {
        let mut wide = *value as u32;
        if !self.serialize_bits(&mut wide, 8) {
            return false;
        }
        if self.is_reading() {
            *value = wide as u8;
        }
        true
    }

    fn serialize_u16(&mut self, value: &mut u16) -> bool {
        let mut wide = *value as u32;
        if !self.serialize_bits(&mut wide, 16) {
            return false;
        }
        if self.is_reading() {
            *value = wide as u16;
        }
        true
    }

    fn serialize_u32(&mut self, value: &mut u32) -> bool {
        self.serialize_bits(value, 32)
    }

    fn serialize_u64(&mut self, value: &mut u64) -> bool {
        let mut lo = *value as u32;
        let mut hi = (*value >> 32) as u32;
        if !self.serialize_bits(&mut lo, 32) || !self.serialize_bits(&mut hi, 32) {
            return false;
        }
        if self.is_reading() {
            *value = ((hi as u64) << 32) | lo as u64;
        }
        true
    }

    fn serialize_f32(&mut self, value: &mut f32) -> bool {
        let mut bits = value.to_bits();
        if !self.serialize_bits(&mut bits, 32) {
            return false;
        }
        if self.is_reading() {
            *value = f32::from_bits(bits);
        }
        true
    }

    fn serialize_f64(&mut self, value: &mut f64) -> bool {
        let mut bits = value.to_bits();
        if !self.serialize_u64(&mut bits) {
            return false;
        }
        if self.is_reading() {
            *value = f64::from_bits(bits);
        }
        true
    }

    /// Fixed size byte block.
    fn serialize_bytes(&mut self, data: &mut [u8]) -> bool {
        self.serialize_align() && self.serialize_raw(data)
    }

    /// Length-prefixed byte block of at most `max_len` bytes.
    fn serialize_vec(&mut self, data: &mut Vec<u8>, max_len: usize) -> bool {
        let mut len = data.len() as u32;
        if !self.serialize_range(&mut len, 0, max_len as u32) {
            return false;
        }
        if self.is_writing() {
            return self.serialize_bytes(data.as_mut_slice());
        }
        let mut buffer = vec![0u8; len as usize];
        if !self.serialize_bytes(&mut buffer) {
            return false;
        }
        *data = buffer;
        true
    }

    fn serialize_string(&mut self, value: &mut String, max_len: usize) -> bool {
        let mut bytes = value.as_bytes().to_vec();
        if !self.serialize_vec(&mut bytes, max_len) {
            return false;
        }
        if self.is_reading() {
            match String::from_utf8(bytes) {
                Ok(s) => *value = s,
                Err(_) => return false,
            }
        }
        true
    }

    fn serialize_address(&mut self, value: &mut Address) -> bool {
        let mut kind = u32::from(match value {
            Address::None => ADDRESS_NONE,
            Address::V4 { .. } => ADDRESS_IPV4,
            Address::V6 { .. } => ADDRESS_IPV6,
        });
        if !self.serialize_range(&mut kind, 0, ADDRESS_IPV6 as u32) {
            return false;
        }
        match kind as u8 {
            ADDRESS_IPV4 => {
                let (mut octets, mut port) = match *value {
                    Address::V4 { octets, port } => (octets, port),
                    _ => ([0u8; 4], 0),
                };
                for octet in octets.iter_mut() {
                    if !self.serialize_u8(octet) {
                        return false;
                    }
                }
                if !self.serialize_u16(&mut port) {
                    return false;
                }
                if self.is_reading() {
                    *value = Address::V4 { octets, port };
                }
            }
            ADDRESS_IPV6 => {
                let (mut groups, mut port) = match *value {
                    Address::V6 { groups, port } => (groups, port),
                    _ => ([0u16; 8], 0),
                };
                for group in groups.iter_mut() {
                    if !self.serialize_u16(group) {
                        return false;
                    }
                }
                if !self.serialize_u16(&mut port) {
                    return false;
                }
                if self.is_reading() {
                    *value = Address::V6 { groups, port };
                }
            }
            _ => {
                if self.is_reading() {
                    *value = Address::None;
                }
            }
        }
        true
    }

    /// Tiered delta from `previous`: 1, then 2..=6, 7..=23, 24..=280,
    /// 281..=4377, 4378..=69914, else a raw 32-bit value.
    fn serialize_int_relative(&mut self, previous: u32, current: &mut u32) -> bool {
        const TIERS: [(u32, u32); 5] = [(2, 6), (7, 23), (24, 280), (281, 4377), (4378, 69914)];

        let difference = current.wrapping_sub(previous);

        let mut one = difference == 1;
        if !self.serialize_bool(&mut one) {
            return false;
        }
        if one {
            if self.is_reading() {
                *current = previous.wrapping_add(1);
            }
            return true;
        }

        for (min, max) in TIERS {
            let mut in_tier = difference >= min && difference <= max;
            if !self.serialize_bool(&mut in_tier) {
                return false;
            }
            if in_tier {
                let mut delta = difference;
                if !self.serialize_range(&mut delta, min, max) {
                    return false;
                }
                if self.is_reading() {
                    *current = previous.wrapping_add(delta);
                }
                return true;
            }
        }

        self.serialize_u32(current)
    }

    /// 16-bit sequence relative to an earlier one, tolerant of wraparound.
    fn serialize_sequence_relative(&mut self, sequence1: u16, sequence2: &mut u16) -> bool {
        let a = sequence1 as u32;
        let mut b = *sequence2 as u32 + if sequence1 > *sequence2 { 65536 } else { 0 };
        if !self.serialize_int_relative(a, &mut b) {
            return false;
        }
        if self.is_reading() {
            if b >= 65536 {
                b -= 65536;
            }
            *sequence2 = b as u16;
        }
        true
    }

    /// Ack relative to a sequence: 6 bits when within 64 behind, else raw.
    fn serialize_ack_relative(&mut self, sequence: u16, ack: &mut u16) -> bool {
        let mut delta = 0u32;
        let mut in_range = false;
        if self.is_writing() {
            delta = if *ack < sequence {
                (sequence - *ack) as u32
            } else {
                sequence as u32 + 65536 - *ack as u32
            };
            in_range = delta <= 64;
        }
        if !self.serialize_bool(&mut in_range) {
            return false;
        }
        if in_range {
            if !self.serialize_range(&mut delta, 1, 64) {
                return false;
            }
            if self.is_reading() {
                *ack = sequence.wrapping_sub(delta as u16);
            }
            true
        } else {
            self.serialize_u16(ack)
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

pub struct WriteStream {
    data: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
    bits_written: usize,
    max_bits: usize,
    overflow: bool,
}

impl WriteStream {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_bytes.min(1500)),
            scratch: 0,
            scratch_bits: 0,
            bits_written: 0,
            max_bits: max_bytes * 8,
            overflow: false,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bits_written.div_ceil(8)
    }

    /// Flush partial words and return the packed bytes, or `None` if any
    /// write ran past the budget.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        if self.overflow {
            return None;
        }
        if self.scratch_bits > 0 {
            let word = (self.scratch as u32).to_le_bytes();
            self.data.extend_from_slice(&word);
        }
        self.data.truncate(self.bits_written.div_ceil(8));
        Some(self.data)
    }

    fn write_bits(&mut self, value: u32, bits: u32) -> bool {
        debug_assert!(bits <= 32);
        if self.overflow || self.bits_written + bits as usize > self.max_bits {
            self.overflow = true;
            return false;
        }
        if bits == 0 {
            return true;
        }
        let masked = (value as u64) & ((1u64 << bits) - 1);
        self.scratch |= masked << self.scratch_bits;
        self.scratch_bits += bits;
        if self.scratch_bits >= 32 {
            let word = (self.scratch as u32).to_le_bytes();
            self.data.extend_from_slice(&word);
            self.scratch >>= 32;
            self.scratch_bits -= 32;
        }
        self.bits_written += bits as usize;
        true
    }
}

impl Stream for WriteStream {
    fn is_writing(&self) -> bool {
        true
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> bool {
        self.write_bits(*value, bits)
    }

    fn serialize_align(&mut self) -> bool {
        let pad = ((8 - self.bits_written % 8) % 8) as u32;
        self.write_bits(0, pad)
    }

    fn serialize_raw(&mut self, data: &mut [u8]) -> bool {
        data.iter().all(|&byte| self.write_bits(byte as u32, 8))
    }

    fn bits_processed(&self) -> usize {
        self.bits_written
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct ReadStream<'a> {
    data: &'a [u8],
    scratch: u64,
    scratch_bits: u32,
    bits_read: usize,
    next_word: usize,
}

impl<'a> ReadStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            scratch: 0,
            scratch_bits: 0,
            bits_read: 0,
            next_word: 0,
        }
    }

    pub fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.bits_read
    }

    fn read_bits(&mut self, bits: u32) -> Option<u32> {
        debug_assert!(bits <= 32);
        if bits as usize > self.bits_remaining() {
            return None;
        }
        if bits == 0 {
            return Some(0);
        }
        if self.scratch_bits < bits {
            let start = self.next_word * 4;
            let end = (start + 4).min(self.data.len());
            let mut word = [0u8; 4];
            word[..end - start].copy_from_slice(&self.data[start..end]);
            self.scratch |= (u32::from_le_bytes(word) as u64) << self.scratch_bits;
            self.scratch_bits += 32;
            self.next_word += 1;
        }
        let value = (self.scratch & ((1u64 << bits) - 1)) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        self.bits_read += bits as usize;
        Some(value)
    }
}

impl Stream for ReadStream<'_> {
    fn is_writing(&self) -> bool {
        false
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> bool {
        match self.read_bits(bits) {
            Some(read) => {
                *value = read;
                true
            }
            None => false,
        }
    }

    fn serialize_align(&mut self) -> bool {
        let pad = ((8 - self.bits_read % 8) % 8) as u32;
        matches!(self.read_bits(pad), Some(0))
    }

    fn serialize_raw(&mut self, data: &mut [u8]) -> bool {
        if data.len() * 8 > self.bits_remaining() {
            return false;
        }
        let mut buffer = vec![0u8; data.len()];
        for byte in buffer.iter_mut() {
            match self.read_bits(8) {
                Some(value) => *byte = value as u8,
                None => return false,
            }
        }
        data.copy_from_slice(&buffer);
        true
    }

    fn bits_processed(&self) -> usize {
        self.bits_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_required() {
        assert_eq!(bits_required(0, 0), 0);
        assert_eq!(bits_required(0, 1), 1);
        assert_eq!(bits_required(0, 255), 8);
        assert_eq!(bits_required(0, 256), 9);
        assert_eq!(bits_required(10, 17), 3);
        assert_eq!(bits_required(0, u32::MAX as u64), 32);
    }

    #[test]
    fn test_mixed_fields() {
        let mut writer = WriteStream::new(256);
        let (mut a, mut b, mut c, mut d) = (true, -7i32, 123_456_789_012_345u64, 0.1f32);
        let mut e = String::from("héllo");
        let mut f: Address = "1.2.3.4:50000".parse().unwrap();
        let mut g: Address = "[2001:db8::1]:7".parse().unwrap();
        assert!(writer.serialize_bool(&mut a));
        assert!(writer.serialize_int(&mut b, -10, 10));
        assert!(writer.serialize_u64(&mut c));
        assert!(writer.serialize_f32(&mut d));
        assert!(writer.serialize_string(&mut e, 32));
        assert!(writer.serialize_address(&mut f));
        assert!(writer.serialize_address(&mut g));
        let bytes = writer.finish().unwrap();

        let mut reader = ReadStream::new(&bytes);
        let (mut a2, mut b2, mut c2, mut d2) = (false, 0i32, 0u64, 0f32);
        let mut e2 = String::new();
        let mut f2 = Address::None;
        let mut g2 = Address::None;
        assert!(reader.serialize_bool(&mut a2));
        assert!(reader.serialize_int(&mut b2, -10, 10));
        assert!(reader.serialize_u64(&mut c2));
        assert!(reader.serialize_f32(&mut d2));
        assert!(reader.serialize_string(&mut e2, 32));
        assert!(reader.serialize_address(&mut f2));
        assert!(reader.serialize_address(&mut g2));
        assert_eq!((a2, b2, c2, d2), (a, b, c, d));
        assert_eq!(e2, e);
        assert_eq!(f2, f);
        assert_eq!(g2, g);
    }

    #[test]
    fn test_range_costs_only_needed_bits() {
        let mut writer = WriteStream::new(16);
        let mut value = 5u32;
        assert!(writer.serialize_range(&mut value, 0, 7));
        assert_eq!(writer.bits_processed(), 3);
        let mut fixed = 42u32;
        assert!(writer.serialize_range(&mut fixed, 42, 42));
        assert_eq!(writer.bits_processed(), 3);
    }

    #[test]
    fn test_floats_are_bit_exact() {
        let mut writer = WriteStream::new(32);
        let mut nan = f32::from_bits(0x7fc0_1234);
        let mut tiny = f64::MIN_POSITIVE;
        assert!(writer.serialize_f32(&mut nan));
        assert!(writer.serialize_f64(&mut tiny));
        let bytes = writer.finish().unwrap();

        let mut reader = ReadStream::new(&bytes);
        let mut nan2 = 0f32;
        let mut tiny2 = 0f64;
        assert!(reader.serialize_f32(&mut nan2));
        assert!(reader.serialize_f64(&mut tiny2));
        assert_eq!(nan2.to_bits(), 0x7fc0_1234);
        assert_eq!(tiny2, tiny);
    }

    #[test]
    fn test_truncated_read_fails_without_side_effects() {
        let mut writer = WriteStream::new(16);
        let mut value = 0xdead_beef_u64;
        assert!(writer.serialize_u64(&mut value));
        let bytes = writer.finish().unwrap();

        let mut reader = ReadStream::new(&bytes[..5]);
        let mut target = 77u64;
        assert!(!reader.serialize_u64(&mut target));
        assert_eq!(target, 77);

        let mut reader = ReadStream::new(&bytes[..3]);
        let mut block = [9u8; 4];
        assert!(!reader.serialize_bytes(&mut block));
        assert_eq!(block, [9u8; 4]);
    }

    #[test]
    fn test_out_of_range_read_fails() {
        let mut writer = WriteStream::new(4);
        let mut raw = 7u32;
        assert!(writer.serialize_bits(&mut raw, 3));
        let bytes = writer.finish().unwrap();

        let mut reader = ReadStream::new(&bytes);
        let mut value = 1u32;
        assert!(!reader.serialize_range(&mut value, 0, 5));
        assert_eq!(value, 1);
    }

    #[test]
    fn test_writer_budget() {
        let mut writer = WriteStream::new(2);
        let mut value = 1u32;
        assert!(writer.serialize_u16(&mut 0xffff));
        assert!(!writer.serialize_bits(&mut value, 1));
        assert!(writer.finish().is_none());
    }

    #[test]
    fn test_align_rejects_nonzero_padding() {
        let mut writer = WriteStream::new(4);
        let mut value = 0b111u32;
        assert!(writer.serialize_bits(&mut value, 3));
        assert!(writer.serialize_bits(&mut value, 3));
        let bytes = writer.finish().unwrap();

        let mut reader = ReadStream::new(&bytes);
        let mut out = 0u32;
        assert!(reader.serialize_bits(&mut out, 3));
        assert!(!reader.serialize_align());
    }

    #[test]
    fn test_vec_limits() {
        let mut writer = WriteStream::new(64);
        let mut empty: Vec<u8> = Vec::new();
        let mut full = vec![0xab; 16];
        assert!(writer.serialize_vec(&mut empty, 16));
        assert!(writer.serialize_vec(&mut full, 16));
        let bytes = writer.finish().unwrap();

        let mut reader = ReadStream::new(&bytes);
        let mut a = vec![1u8];
        let mut b = Vec::new();
        assert!(reader.serialize_vec(&mut a, 16));
        assert!(reader.serialize_vec(&mut b, 16));
        assert!(a.is_empty());
        assert_eq!(b, full);

        // Truncated payload after a valid length prefix.
        let mut reader = ReadStream::new(&bytes[..bytes.len() - 1]);
        let mut c = vec![3u8];
        assert!(reader.serialize_vec(&mut c, 16));
        assert!(!reader.serialize_vec(&mut c, 16));
        assert!(c.is_empty());
    }

    #[test]
    fn test_int_relative_tiers() {
        let cases: [(u32, u32, usize); 7] = [
            (100, 101, 1),
            (100, 106, 2 + 3),
            (100, 123, 3 + 5),
            (100, 380, 4 + 9),
            (100, 4477, 5 + 13),
            (100, 70014, 6 + 17),
            (100, 5_000_000, 6 + 32),
        ];
        for (previous, current, expected_bits) in cases {
            let mut writer = WriteStream::new(16);
            let mut value = current;
            assert!(writer.serialize_int_relative(previous, &mut value));
            assert_eq!(writer.bits_processed(), expected_bits, "delta {}", current - previous);
            let bytes = writer.finish().unwrap();

            let mut reader = ReadStream::new(&bytes);
            let mut read = 0u32;
            assert!(reader.serialize_int_relative(previous, &mut read));
            assert_eq!(read, current);
        }
    }

    #[test]
    fn test_sequence_relative_wraps() {
        for (first, second) in [(65530u16, 3u16), (10, 11), (0, 40000)] {
            let mut writer = WriteStream::new(16);
            let mut value = second;
            assert!(writer.serialize_sequence_relative(first, &mut value));
            let bytes = writer.finish().unwrap();

            let mut reader = ReadStream::new(&bytes);
            let mut read = 0u16;
            assert!(reader.serialize_sequence_relative(first, &mut read));
            assert_eq!(read, second);
        }
    }

    #[test]
    fn test_ack_relative() {
        for (sequence, ack) in [(100u16, 90u16), (5, 65500), (1000, 10)] {
            let mut writer = WriteStream::new(16);
            let mut value = ack;
            assert!(writer.serialize_ack_relative(sequence, &mut value));
            let bytes = writer.finish().unwrap();

            let mut reader = ReadStream::new(&bytes);
            let mut read = 0u16;
            assert!(reader.serialize_ack_relative(sequence, &mut read));
            assert_eq!(read, ack);
        }

        let mut writer = WriteStream::new(16);
        let mut near = 99u16;
        assert!(writer.serialize_ack_relative(100, &mut near));
        assert_eq!(writer.bits_processed(), 7);
    }
}
