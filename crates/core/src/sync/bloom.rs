//! Append-only bloom filter over entity ids.
//!
//! Sized once at construction from an expected item count and a target false
//! positive rate. Items can only be added; there is no removal or clearing, so
//! a member is never reported absent (no false negatives).

use sha2::{Digest, Sha256};

const MIN_BITS: u64 = 64;
const MAX_HASH_FNS: u32 = 30;

pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    count: u64,
}

impl BloomFilter {
    /// Create a filter for `expected_items` at `false_positive_rate`.
    ///
    /// Out-of-range inputs are clamped: at least one expected item and a rate
    /// within `(0, 1)`.
    pub fn with_rate(expected_items: u64, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = if false_positive_rate.is_finite() {
            false_positive_rate.clamp(1e-12, 0.5)
        } else {
            0.001
        };
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(MIN_BITS as f64) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2)
            .round()
            .clamp(1.0, MAX_HASH_FNS as f64) as u32;
        let num_words = num_bits.div_ceil(64) as usize;

        Self {
            words: vec![0u64; num_words],
            num_bits,
            num_hashes,
            count: 0,
        }
    }

    pub fn add(&mut self, item: &str) {
        let (h1, h2) = Self::base_hashes(item);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.count += 1;
    }

    /// `true` if the item may have been added, `false` if it definitely was not.
    pub fn contains(&self, item: &str) -> bool {
        let (h1, h2) = Self::base_hashes(item);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Number of `add` calls, including repeated items.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Estimated false positive rate at the current load.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = self.count as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    // Kirsch-Mitzenmacher double hashing over one SHA-256 digest.
    fn base_hashes(item: &str) -> (u64, u64) {
        let digest = Sha256::digest(item.as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[..8]);
        b.copy_from_slice(&digest[8..16]);
        (u64::from_le_bytes(a), u64::from_le_bytes(b) | 1)
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    fn random_id(rng: &mut impl Rng) -> String {
        (0..46).map(|_| rng.sample(Alphanumeric) as char).collect()
    }

    #[test]
    fn sizing_matches_expected_parameters() {
        let filter = BloomFilter::with_rate(2_000_000, 0.001);
        // m = -n ln p / (ln 2)^2 ~= 28.76M bits, k ~= 10
        assert!(filter.num_bits() > 28_000_000 && filter.num_bits() < 29_000_000);
        assert_eq!(filter.num_hashes(), 10);
    }

    #[test]
    fn add_then_contains() {
        let mut filter = BloomFilter::with_rate(1_000, 0.01);
        assert!(!filter.contains("bafyone"));
        filter.add("bafyone");
        assert!(filter.contains("bafyone"));
        assert_eq!(filter.count(), 1);
    }

    #[test]
    fn no_false_negatives_over_random_sample() {
        let mut rng = rand::thread_rng();
        let mut filter = BloomFilter::with_rate(50_000, 0.001);
        let ids: Vec<String> = (0..50_000).map(|_| random_id(&mut rng)).collect();
        for id in &ids {
            filter.add(id);
        }
        assert!(ids.iter().all(|id| filter.contains(id)));
    }

    #[test]
    fn false_positive_rate_stays_near_target() {
        let mut rng = rand::thread_rng();
        let mut filter = BloomFilter::with_rate(10_000, 0.01);
        for _ in 0..10_000 {
            filter.add(&random_id(&mut rng));
        }
        let samples = 20_000;
        let false_positives = (0..samples)
            .filter(|_| filter.contains(&format!("absent-{}", random_id(&mut rng))))
            .count();
        // Generous bound: target is 1%.
        assert!((false_positives as f64 / samples as f64) < 0.03);
        assert!(filter.estimated_false_positive_rate() < 0.02);
    }

    #[test]
    fn degenerate_parameters_are_clamped() {
        let mut filter = BloomFilter::with_rate(0, f64::NAN);
        filter.add("x");
        assert!(filter.contains("x"));
        assert!(filter.num_bits() >= MIN_BITS);
    }
}
