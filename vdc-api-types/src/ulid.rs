use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UlidError {
    #[error("invalid ulid length")]
    InvalidLength,
    #[error("invalid ulid encoding")]
    InvalidEncoding,
}

/// A 128 bit, lexicographically sortable identifier.
///
/// 48 bits of millisecond timestamp followed by 80 bits of entropy, rendered
/// as 26 characters of Crockford base32. Ordering by string equals ordering
/// by creation time, which keeps Store key listings chronological.
#[derive(
    Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct Ulid([u8; 16]);

impl Ulid {
    /// Generate a new id from the current time and fresh entropy.
    pub fn generate() -> Self {
        let millis = crate::time::epoch_millis() as u64;
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
        openssl::rand::rand_bytes(&mut bytes[6..]).expect("entropy source unavailable");
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The embedded creation time in milliseconds since the epoch.
    pub fn timestamp_millis(&self) -> u64 {
        let mut millis = [0u8; 8];
        millis[2..8].copy_from_slice(&self.0[..6]);
        u64::from_be_bytes(millis)
    }

    /// A short hex prefix of the entropy part, for deterministic derived
    /// names (bridge names, MAC addresses).
    pub fn short(&self) -> String {
        hex_lower(&self.0[6..10])
    }
}

impl From<[u8; 16]> for Ulid {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for Ulid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&base32::encode(base32::Alphabet::Crockford, &self.0))
    }
}

impl FromStr for Ulid {
    type Err = UlidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 26 {
            return Err(UlidError::InvalidLength);
        }
        let bytes =
            base32::decode(base32::Alphabet::Crockford, s).ok_or(UlidError::InvalidEncoding)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| UlidError::InvalidEncoding)?;
        Ok(Self(bytes))
    }
}

fn hex_lower(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let id = Ulid::generate();
        let parsed: Ulid = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 26);
    }

    #[test]
    fn ordering_follows_time() {
        let a = Ulid::from(*b"\x00\x00\x00\x00\x00\x01abcdefghij");
        let b = Ulid::from(*b"\x00\x00\x00\x00\x00\x02abcdefghij");
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-ulid".parse::<Ulid>().is_err());
        assert!("".parse::<Ulid>().is_err());
    }
}
