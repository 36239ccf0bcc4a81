//! Fixed-seed hashing for reproducible map layout.
//!
//! The transactional map derives slot placement from key hashes. Using a
//! fixed seed keeps slot layout, growth points, and probe sequences identical
//! across runs, which deterministic tests rely on.

use std::hash::{BuildHasher, Hasher};

/// Non-cryptographic hasher with a fixed seed.
#[derive(Debug, Clone)]
pub struct DetHasher {
    state: u64,
}

impl DetHasher {
    const SEED: u64 = 0x9e37_79b9_7f4a_7c15;
    const MULTIPLIER: u64 = 0x2545_f491_4f6c_dd1d;
}

impl Default for DetHasher {
    fn default() -> Self {
        Self { state: Self::SEED }
    }
}

impl Hasher for DetHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = self.state.wrapping_mul(Self::MULTIPLIER);
            self.state ^= u64::from(byte);
        }
    }

    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes());
    }

    fn write_usize(&mut self, i: usize) {
        // Width-independent so 32- and 64-bit hosts agree.
        self.write_u64(i as u64);
    }

    fn finish(&self) -> u64 {
        // fmix64 tail for distribution.
        let mut h = self.state;
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        h ^= h >> 33;
        h
    }
}

/// `BuildHasher` for [`DetHasher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DetHashBuilder;

impl BuildHasher for DetHashBuilder {
    type Hasher = DetHasher;

    fn build_hasher(&self) -> DetHasher {
        DetHasher::default()
    }
}
