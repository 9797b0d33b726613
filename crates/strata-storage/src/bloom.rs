//! Bloom filter over run keys.
//!
//! Built while a run is written and consulted before descending the index on
//! point lookups. False positives are possible, false negatives are not.
//!
//! # Hash Functions
//!
//! Two CRC32 hashes over the raw key bytes with different initial values:
//! - h1 = crc32(key, init=0xcafebabe)
//! - h2 = crc32(key, init=0xdeadbeef)
//! - h_i = h1 + i * h2  (double hashing)

use crc32fast::Hasher;
use tracing::info;

/// Initial value of the first hash function.
const SEED_A: u32 = 0xcafe_babe;

/// Initial value of the second hash function.
const SEED_B: u32 = 0xdead_beef;

/// Bloom filter for fast membership testing.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Bit array stored as bytes
    bits: Vec<u8>,
    /// Number of hash functions (k)
    num_hash_functions: u32,
    /// Total number of bits (m)
    num_bits: u64,
    /// Keys inserted so far
    inserted: u64,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_keys` keys at a target false
    /// positive rate.
    ///
    /// m = -n * ln(p) / ln(2)^2 bits, k = (m / n) * ln(2) hash functions.
    pub fn with_rate(expected_keys: u64, fp_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hash_functions = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;

        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_hash_functions,
            num_bits,
            inserted: 0,
        }
    }

    /// Adds a key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash(key);
        for i in 0..self.num_hash_functions {
            let pos = self.bit_position(h1, h2, i);
            self.bits[(pos >> 3) as usize] |= 1 << (pos & 7);
        }
        self.inserted += 1;
    }

    /// Returns false if the key is definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash(key);
        (0..self.num_hash_functions).all(|i| {
            let pos = self.bit_position(h1, h2, i);
            self.bits[(pos >> 3) as usize] & (1 << (pos & 7)) != 0
        })
    }

    #[inline]
    fn bit_position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    /// Total number of bits (m).
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions (k).
    pub fn num_hash_functions(&self) -> u32 {
        self.num_hash_functions
    }

    /// Keys inserted so far.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Size of the bit array in bytes.
    pub fn size_bytes(&self) -> usize {
        self.bits.len()
    }

    /// Expected false positive rate for the keys inserted so far.
    pub fn estimated_fp_rate(&self) -> f64 {
        let k = self.num_hash_functions as f64;
        let fill = -k * self.inserted as f64 / self.num_bits as f64;
        (1.0 - fill.exp()).powf(k)
    }

    /// Logs the filter's sizing and load.
    pub fn log_stats(&self) {
        info!(
            bits = self.num_bits,
            hash_functions = self.num_hash_functions,
            bytes = self.size_bytes(),
            keys = self.inserted,
            estimated_fp_rate = self.estimated_fp_rate(),
            "bloom filter stats"
        );
    }
}

/// Computes both hash values for a key.
#[inline]
fn hash(key: &[u8]) -> (u64, u64) {
    let mut a = Hasher::new_with_initial(SEED_A);
    a.update(key);
    let mut b = Hasher::new_with_initial(SEED_B);
    b.update(key);
    (a.finalize() as u64, b.finalize() as u64)
}
