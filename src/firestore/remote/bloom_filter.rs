use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::remote::watch_change::BloomFilterPayload;

/// Membership test sent with existence filters.
///
/// Each value is hashed with MD5; the two little-endian 64-bit halves of the
/// digest seed `hash_count` bit positions `h1 + i * h2` modulo the bit
/// count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter hash count: {hash_count}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Bloom filter with bits needs a hash count"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument("Empty bloom filter cannot have padding"));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn from_payload(payload: &BloomFilterPayload) -> FirestoreResult<Self> {
        Self::new(payload.bitmap.clone(), payload.padding, payload.hash_count)
    }

    pub fn to_payload(&self) -> BloomFilterPayload {
        BloomFilterPayload {
            bitmap: self.bitmap.clone(),
            padding: (self.bitmap.len() as u64 * 8 - self.bit_count) as i32,
            hash_count: self.hash_count as i32,
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count as u64).all(|i| {
            let index = h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count;
            self.is_bit_set(index)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = md5::compute(value.as_bytes()).0;
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}

/// Builds a filter containing `values`. Used by tests and fake servers.
pub fn build_bloom_filter<'a>(
    values: impl IntoIterator<Item = &'a str>,
    bit_count: u64,
    hash_count: i32,
) -> FirestoreResult<BloomFilter> {
    let bytes = bit_count.div_ceil(8) as usize;
    let padding = (bytes as u64 * 8 - bit_count) as i32;
    let mut bitmap = vec![0u8; bytes];
    if bit_count > 0 {
        for value in values {
            let (h1, h2) = hash_halves(value);
            for i in 0..hash_count.max(0) as u64 {
                let index = h1.wrapping_add(i.wrapping_mul(h2)) % bit_count;
                bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }
    }
    BloomFilter::new(bitmap, padding, hash_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_parameters() {
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, -1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("anything"));
    }

    #[test]
    fn padding_reduces_bit_count() {
        let filter = BloomFilter::new(vec![0, 0], 3, 1).unwrap();
        assert_eq!(filter.bit_count(), 13);
    }

    #[test]
    fn contains_inserted_values() {
        let names = [
            "projects/p/databases/(default)/documents/rooms/a",
            "projects/p/databases/(default)/documents/rooms/b",
        ];
        let filter = build_bloom_filter(names, 512, 7).unwrap();
        for name in names {
            assert!(filter.might_contain(name));
        }
        let round_trip = BloomFilter::from_payload(&filter.to_payload()).unwrap();
        assert_eq!(round_trip, filter);
    }

    #[test]
    fn full_bitmap_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 4], 0, 3).unwrap();
        assert!(filter.might_contain("rooms/x"));
    }
}
