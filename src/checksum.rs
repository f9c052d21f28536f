//! Content fingerprints.
//!
//! A file's fingerprint is its CRC-32 (IEEE polynomial) masked to the three
//! low-order bits, so the value space is `0..=7`. Two files with different
//! content collide with probability 1/8, which is far too weak to prove
//! equality; it exists as a cheap drift detector, and both sides of the wire
//! must mask identically or they will never agree on "unchanged".

use crc32fast::Hasher;

/// Only the three low-order bits of the CRC are significant.
pub const CHECKSUM_MASK: u32 = 0x7;

/// Incremental fingerprint state, for content that arrives in chunks.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Hasher,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more content bytes into the fingerprint.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finish the CRC and mask it down to the significant bits.
    pub fn finish(self) -> u32 {
        self.hasher.finalize() & CHECKSUM_MASK
    }
}

/// Fingerprint a complete in-memory buffer.
pub fn masked_crc(bytes: &[u8]) -> u32 {
    let mut fp = Fingerprint::new();
    fp.update(bytes);
    fp.finish()
}
