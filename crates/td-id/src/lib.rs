//! 128-bit time-ordered identifiers ("td ids").
//!
//! The high 48 bits are a millisecond Unix timestamp; the low 80 bits are
//! per-process randomness, incremented rather than re-rolled when two calls
//! land in the same millisecond so that identifiers produced in sequence
//! within one process are always strictly increasing — both lexicographically
//! (by their base32 string) and as raw bytes, matching the invariant that the
//! embedded timestamp order and the string order agree.

mod base32;

use std::sync::Mutex;

use rand::RngCore;
use thiserror::Error;

pub use crate::base32::{InvalidBase32Error, ENCODED_LEN};

const TIMESTAMP_BITS: u32 = 48;
const RANDOM_BYTES: usize = 10; // 80 bits

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid td id: {0}")]
    Base32(#[from] InvalidBase32Error),
}

/// A decoded identifier: its raw 16 bytes plus the embedded millisecond
/// timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id {
    bytes: [u8; 16],
}

impl Id {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.bytes
    }

    pub fn millis(&self) -> u64 {
        let mut ts = [0u8; 8];
        ts[2..8].copy_from_slice(&self.bytes[0..6]);
        u64::from_be_bytes(ts)
    }

    pub fn encode(&self) -> String {
        base32::encode(&self.bytes)
    }

    pub fn decode(s: &str) -> Result<Self, InvalidId> {
        let bytes = base32::decode(s)?;
        Ok(Self { bytes })
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Id {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::decode(s)
    }
}

struct MonotonicState {
    last_millis: u64,
    last_random: u128, // only the low 80 bits are meaningful
}

static STATE: Mutex<Option<MonotonicState>> = Mutex::new(None);

fn random_80() -> u128 {
    let mut buf = [0u8; RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut padded = [0u8; 16];
    padded[6..16].copy_from_slice(&buf);
    u128::from_be_bytes(padded)
}

/// Generates a new identifier. Calls made in sequence within one process are
/// guaranteed strictly increasing, including multiple calls within the same
/// millisecond.
pub fn new() -> Id {
    new_at(now_millis())
}

/// Generates a new identifier as if the current time were `millis`. Exposed
/// for deterministic tests; production callers should use [`new`].
pub fn new_at(millis: u64) -> Id {
    assert!(
        millis < (1u64 << TIMESTAMP_BITS),
        "timestamp does not fit in 48 bits"
    );
    let mut guard = STATE.lock().expect("td-id monotonic state poisoned");
    let random = match guard.as_mut() {
        Some(state) if state.last_millis == millis => {
            // Same millisecond as the previous call: bump the random part by
            // one so the next id is still strictly greater. This can only
            // wrap after 2^80 calls within the same millisecond, which never
            // happens in practice.
            state.last_random = state.last_random.wrapping_add(1) & MASK_80;
            state.last_random
        },
        _ => {
            let r = random_80();
            *guard = Some(MonotonicState {
                last_millis: millis,
                last_random: r,
            });
            r
        },
    };
    drop(guard);

    let mut bytes = [0u8; 16];
    bytes[0..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
    let random_bytes = random.to_be_bytes();
    bytes[6..16].copy_from_slice(&random_bytes[6..16]);
    Id::from_bytes(bytes)
}

const MASK_80: u128 = (1u128 << 80) - 1;

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip() {
        let id = new();
        let encoded = id.encode();
        assert_eq!(encoded.len(), ENCODED_LEN);
        let decoded = Id::decode(&encoded).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn millis_is_recovered() {
        let id = new_at(1_700_000_000_123);
        assert_eq!(id.millis(), 1_700_000_000_123);
    }

    #[test]
    fn sequence_is_strictly_increasing_same_millisecond() {
        let mut prev = new_at(42);
        for _ in 0..1000 {
            let next = new_at(42);
            assert!(next.bytes() > prev.bytes());
            assert!(next.encode() > prev.encode());
            prev = next;
        }
    }

    #[test]
    fn sequence_is_strictly_increasing_across_milliseconds() {
        let mut prev = new_at(1000);
        for t in 1001..1050 {
            let next = new_at(t);
            assert!(next.bytes() > prev.bytes());
            prev = next;
        }
    }

    #[test]
    fn invalid_length_is_rejected() {
        assert!(Id::decode("too-short").is_err());
    }

    #[test]
    fn decode_tolerates_missing_padding() {
        // The canonical form has no padding at all; verify a plain
        // round-tripped string decodes without needing any '=' padding.
        let id = new();
        assert_eq!(id.encode().len(), 26);
        assert!(!id.encode().contains('='));
    }

    proptest! {
        #[test]
        fn byte_round_trip_is_exact(bytes in prop::array::uniform16(any::<u8>())) {
            let id = Id::from_bytes(bytes);
            let decoded = Id::decode(&id.encode()).unwrap();
            prop_assert_eq!(decoded.bytes(), bytes);
        }
    }
}
