//! Bloom filter for fast "definitely new" checks on message ids
//!
//! Sizing follows the classic formulas for `n` expected items and target
//! false-positive rate `p`:
//!
//! - bits:   m = -n·ln(p) / ln(2)²
//! - hashes: k = (m / n)·ln(2)
//!
//! Indices come from one BLAKE3 digest split into two 64-bit halves
//! (Kirsch–Mitzenmacher double hashing: `h1 + i·h2 mod m`).
//!
//! Serialized form (little-endian):
//! [4 bytes] magic "RMBF"
//! [8 bytes] bit count
//! [4 bytes] hash count
//! [8 bytes] inserted count
//! [N bytes] bit array
//! [4 bytes] CRC32 over everything before it

use super::backend::StorageError;
use crc32fast::Hasher;

const MAGIC: &[u8; 4] = b"RMBF";
const HEADER_LEN: usize = 4 + 8 + 4 + 8;
const CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    inserted: u64,
}

impl BloomFilter {
    /// Size a filter for `capacity` items at false-positive rate `fp_rate`.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 32.0) as u32;
        let bytes = num_bits.div_ceil(8) as usize;

        Self {
            bits: vec![0u8; bytes],
            num_bits,
            num_hashes,
            inserted: 0,
        }
    }

    fn indices(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let digest = blake3::hash(item);
        let bytes = digest.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(lo);
        // Odd step so successive probes never collapse onto one bit
        let h2 = u64::from_le_bytes(hi) | 1;
        let m = self.num_bits;

        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn insert(&mut self, item: &[u8]) {
        let idx: Vec<u64> = self.indices(item).collect();
        for bit in idx {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        self.inserted += 1;
    }

    /// `false` is authoritative; `true` means "probably present".
    pub fn might_contain(&self, item: &[u8]) -> bool {
        self.indices(item)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Reset to empty without changing sizing.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
        self.inserted = 0;
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Fraction of bits set.
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.bits.iter().map(|b| b.count_ones() as u64).sum();
        set as f64 / self.num_bits as f64
    }

    /// Current false-positive estimate from the observed fill ratio.
    pub fn estimated_fp_rate(&self) -> f64 {
        self.fill_ratio().powi(self.num_hashes as i32)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.bits.len() + CRC_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&self.inserted.to_le_bytes());
        buf.extend_from_slice(&self.bits);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        let corrupt = |reason: &str| StorageError::Corrupt {
            key: "bloom".to_string(),
            reason: reason.to_string(),
        };

        if data.len() < HEADER_LEN + CRC_LEN {
            return Err(corrupt("truncated"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - CRC_LEN);
        let mut hasher = Hasher::new();
        hasher.update(body);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if hasher.finalize() != expected {
            return Err(corrupt("checksum mismatch"));
        }
        if &body[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }

        let read_u64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&body[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let num_bits = read_u64(4);
        let num_hashes = u32::from_le_bytes([body[12], body[13], body[14], body[15]]);
        let inserted = read_u64(16);
        let bits = body[HEADER_LEN..].to_vec();

        if num_bits == 0 || num_hashes == 0 || bits.len() as u64 != num_bits.div_ceil(8) {
            return Err(corrupt("inconsistent sizing"));
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            inserted,
        })
    }
}
