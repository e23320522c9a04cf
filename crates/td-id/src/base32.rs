//! RFC 4648 "base32hex" codec (`0123456789ABCDEFGHIJKLMNOPQRSTUV`), fixed to
//! exactly the 16-byte/26-character shape the identifier service needs.
//!
//! Structure follows the teacher's `value::base32` module: a static
//! alphabet table plus a derived decode lookup table, rather than reaching
//! for a general-purpose base32 crate.

use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

const DECODE_TABLE: [u8; 256] = {
    let mut table = [0xFFu8; 256];
    let mut i = 0;
    while i < 32 {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Canonical string length for a 16-byte (128-bit) identifier.
pub const ENCODED_LEN: usize = 26;
const DECODED_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidBase32Error {
    #[error("expected a {ENCODED_LEN}-character string, got length {0}")]
    WrongLength(usize),
    #[error("invalid base32hex character {0:?} at position {1}")]
    InvalidChar(char, usize),
}

/// Encodes exactly 16 bytes into the 26-character canonical form.
pub fn encode(bytes: &[u8; DECODED_LEN]) -> String {
    // 16 bytes = 128 bits = 25 full 5-bit groups + 3 leftover bits, padded
    // with zero bits to fill the last (26th) character.
    let mut out = Vec::with_capacity(ENCODED_LEN);
    let mut buffer: u32 = 0;
    let mut bits_in_buffer = 0u32;
    for &byte in bytes.iter() {
        buffer = (buffer << 8) | byte as u32;
        bits_in_buffer += 8;
        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let idx = (buffer >> bits_in_buffer) & 0x1F;
            out.push(ALPHABET[idx as usize]);
        }
    }
    if bits_in_buffer > 0 {
        let idx = (buffer << (5 - bits_in_buffer)) & 0x1F;
        out.push(ALPHABET[idx as usize]);
    }
    debug_assert_eq!(out.len(), ENCODED_LEN);
    // SAFETY-free: `ALPHABET` is all ASCII.
    String::from_utf8(out).expect("base32hex alphabet is ASCII")
}

/// Decodes a 26-character canonical string back into 16 bytes.
pub fn decode(s: &str) -> Result<[u8; DECODED_LEN], InvalidBase32Error> {
    if s.len() != ENCODED_LEN {
        return Err(InvalidBase32Error::WrongLength(s.len()));
    }
    let mut out = [0u8; DECODED_LEN];
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0u32;
    let mut out_pos = 0;
    for (i, c) in s.chars().enumerate() {
        if !c.is_ascii() {
            return Err(InvalidBase32Error::InvalidChar(c, i));
        }
        let v = DECODE_TABLE[c as u8 as usize];
        if v == 0xFF {
            return Err(InvalidBase32Error::InvalidChar(c, i));
        }
        buffer = (buffer << 5) | v as u64;
        bits_in_buffer += 5;
        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            if out_pos < DECODED_LEN {
                out[out_pos] = ((buffer >> bits_in_buffer) & 0xFF) as u8;
                out_pos += 1;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_bytes_round_trip() {
        let bytes = [0u8; 16];
        let encoded = encode(&bytes);
        assert_eq!(encoded.len(), ENCODED_LEN);
        assert_eq!(decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn max_bytes_round_trip() {
        let bytes = [0xFFu8; 16];
        let encoded = encode(&bytes);
        assert_eq!(decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(
            decode("ABC"),
            Err(InvalidBase32Error::WrongLength(3))
        ));
    }

    #[test]
    fn invalid_character_is_rejected() {
        let s = "!".repeat(ENCODED_LEN);
        assert!(matches!(decode(&s), Err(InvalidBase32Error::InvalidChar('!', 0))));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_bytes(bytes in prop::array::uniform16(any::<u8>())) {
            let encoded = encode(&bytes);
            prop_assert_eq!(encoded.len(), ENCODED_LEN);
            prop_assert_eq!(decode(&encoded).unwrap(), bytes);
        }
    }
}
