//! 2048-bit logs bloom filter, as carried in every EVM block header.
//!
//! Each input is hashed with keccak-256; the low 11 bits of the first three
//! byte pairs of the digest select the bits to set.

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

/// Size of a logs bloom in bytes.
pub const BLOOM_BYTES: usize = 256;

/// A logs bloom filter.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bloom(#[serde(with = "hex_bytes")] Vec<u8>);

impl Default for Bloom {
    fn default() -> Self {
        Self(vec![0u8; BLOOM_BYTES])
    }
}

impl std::fmt::Debug for Bloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bloom(0x{})", hex::encode(&self.0))
    }
}

impl Bloom {
    /// Build a bloom from raw bytes. Returns `None` unless exactly 256 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == BLOOM_BYTES).then(|| Self(bytes.to_vec()))
    }

    /// Parse a `0x`-prefixed (or bare) hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(s).ok().and_then(|b| Self::from_bytes(&b))
    }

    /// A bloom with every bit set. Matches any lookup, so a block whose real
    /// bloom is unknown is never ruled out.
    pub fn saturated() -> Self {
        Self(vec![0xff; BLOOM_BYTES])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Add `input` to the filter.
    pub fn accrue(&mut self, input: &[u8]) {
        for (byte, mask) in positions(input) {
            self.0[byte] |= mask;
        }
    }

    /// Returns `true` if `input` may be in the set (false positives possible).
    pub fn contains_input(&self, input: &[u8]) -> bool {
        positions(input)
            .into_iter()
            .all(|(byte, mask)| self.0[byte] & mask == mask)
    }

    /// Look up a textual hex address. Inputs that are not valid hex are
    /// looked up by their raw UTF-8 bytes.
    pub fn contains_address(&self, address: &str) -> bool {
        self.contains_input(&address_bytes(address))
    }

    /// Add a textual hex address.
    pub fn accrue_address(&mut self, address: &str) {
        self.accrue(&address_bytes(address));
    }
}

/// Decode a textual address into the bytes that feed the bloom.
pub fn address_bytes(address: &str) -> Vec<u8> {
    let trimmed = address.strip_prefix("0x").unwrap_or(address);
    hex::decode(trimmed).unwrap_or_else(|_| address.as_bytes().to_vec())
}

fn positions(input: &[u8]) -> [(usize, u8); 3] {
    let mut digest = [0u8; 32];
    let mut keccak = Keccak::v256();
    keccak.update(input);
    keccak.finalize(&mut digest);

    let mut out = [(0usize, 0u8); 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let bit = ((usize::from(digest[2 * i]) << 8) | usize::from(digest[2 * i + 1])) & 2047;
        *slot = (BLOOM_BYTES - 1 - bit / 8, 1u8 << (bit % 8));
    }
    out
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
