//! Bloom filter for fast existence checks

/// Bloom filter over raw key bytes, using double hashing on a CRC32 base hash
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: usize,
}

impl BloomFilter {
    /// Build a filter sized for `hashes.len()` keys
    pub fn build(hashes: &[u32], bits_per_key: usize) -> Self {
        // Optimal number of hash functions is bits_per_key * ln(2)
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        let num_bits = (hashes.len() * bits_per_key).max(64);
        let mut filter = Self {
            bits: vec![0u8; (num_bits + 7) / 8],
            num_hashes,
        };
        for &h in hashes {
            filter.insert_hash(h);
        }
        filter
    }

    /// Create from existing data
    pub fn from_bytes(data: Vec<u8>, num_hashes: usize) -> Self {
        Self {
            bits: data,
            num_hashes,
        }
    }

    /// Base hash of a key
    pub fn hash(key: &[u8]) -> u32 {
        crc32fast::hash(key)
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return true;
        }
        let num_bits = self.num_bits();
        let mut h = Self::hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.num_hashes {
            let bit = (h as usize) % num_bits;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    fn num_bits(&self) -> usize {
        self.bits.len() * 8
    }

    fn insert_hash(&mut self, mut h: u32) {
        let num_bits = self.num_bits();
        let delta = h.rotate_right(17);
        for _ in 0..self.num_hashes {
            let bit = (h as usize) % num_bits;
            self.bits[bit / 8] |= 1 << (bit % 8);
            h = h.wrapping_add(delta);
        }
    }
}
