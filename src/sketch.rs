//! KLL quantile sketch.
//!
//! Compact streaming summary of a numeric distribution with bounded
//! memory: values enter an unsorted level-0 buffer; when a level
//! overflows it is sorted and every other item is promoted with doubled
//! weight. Compaction parity comes from a deterministic xorshift stream
//! so sketch contents are reproducible across runs.

const DEFAULT_K: u16 = 128;
const MIN_LEVEL_CAPACITY: usize = 2;

/// Streaming quantile sketch over i64 samples.
#[derive(Debug, Clone)]
pub struct KllSketch {
    k: u16,
    n: u64,
    min: i64,
    max: i64,
    /// `levels[l]` holds items of weight `2^l`; level 0 is unsorted.
    levels: Vec<Vec<i64>>,
    rng: u64,
}

impl KllSketch {
    pub fn new() -> Self {
        Self::with_k(DEFAULT_K)
    }

    pub fn with_k(k: u16) -> Self {
        let k = k.max(8);
        Self {
            k,
            n: 0,
            min: i64::MAX,
            max: i64::MIN,
            levels: vec![Vec::new()],
            rng: 0x9e37_79b9_7f4a_7c15 ^ u64::from(k),
        }
    }

    /// Number of samples absorbed.
    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn insert(&mut self, value: i64) {
        self.n += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.levels[0].push(value);
        while let Some(level) = self.overflowing_level() {
            self.compact(level);
        }
    }

    fn level_capacity(&self, level: usize) -> usize {
        // Geometric decay toward the highest level: capacity(l) ~ k * (2/3)^(top - l).
        let top = self.levels.len().saturating_sub(1);
        let mut cap = usize::from(self.k);
        for _ in 0..(top - level.min(top)) {
            cap = cap * 2 / 3;
        }
        cap.max(MIN_LEVEL_CAPACITY)
    }

    fn overflowing_level(&self) -> Option<usize> {
        (0..self.levels.len()).find(|&l| self.levels[l].len() > self.level_capacity(l))
    }

    fn compact(&mut self, level: usize) {
        if level + 1 == self.levels.len() {
            self.levels.push(Vec::new());
        }
        let mut items = std::mem::take(&mut self.levels[level]);
        items.sort_unstable();
        let keep_odd = self.next_bit();
        let promoted: Vec<i64> = items
            .into_iter()
            .enumerate()
            .filter(|(i, _)| (i % 2 == 1) == keep_odd)
            .map(|(_, v)| v)
            .collect();
        self.levels[level + 1].extend(promoted);
    }

    fn next_bit(&mut self) -> bool {
        // xorshift64
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        self.rng & 1 == 1
    }

    /// Estimated value at quantile `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> Option<i64> {
        if self.n == 0 {
            return None;
        }
        if q <= 0.0 {
            return Some(self.min);
        }
        if q >= 1.0 {
            return Some(self.max);
        }

        let mut weighted: Vec<(i64, u64)> = Vec::new();
        for (level, items) in self.levels.iter().enumerate() {
            let weight = 1u64 << level;
            weighted.extend(items.iter().map(|&v| (v, weight)));
        }
        weighted.sort_unstable_by_key(|&(v, _)| v);

        let total: u64 = weighted.iter().map(|&(_, w)| w).sum();
        let target = (q * total as f64).ceil() as u64;
        let mut seen = 0u64;
        for (v, w) in weighted {
            seen += w;
            if seen >= target {
                return Some(v);
            }
        }
        Some(self.max)
    }

    /// Serialized sketch state: k, n, min/max, then each level's items.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.stored_items() * 8);
        out.extend_from_slice(&self.k.to_le_bytes());
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        out.push(self.levels.len() as u8);
        for level in &self.levels {
            out.extend_from_slice(&(level.len() as u32).to_le_bytes());
            for v in level {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    fn stored_items(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Approximate in-memory footprint.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.stored_items() * std::mem::size_of::<i64>()
    }
}

impl Default for KllSketch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sketch() {
        let s = KllSketch::new();
        assert!(s.is_empty());
        assert_eq!(s.quantile(0.5), None);
    }

    #[test]
    fn test_small_stream_is_exact() {
        let mut s = KllSketch::new();
        for v in 1..=100 {
            s.insert(v);
        }
        assert_eq!(s.n(), 100);
        // Below k samples nothing has been compacted.
        assert_eq!(s.quantile(0.0), Some(1));
        assert_eq!(s.quantile(1.0), Some(100));
        assert_eq!(s.quantile(0.5), Some(50));
    }

    #[test]
    fn test_large_stream_bounded_and_close() {
        let mut s = KllSketch::new();
        for v in 0..100_000i64 {
            s.insert(v);
        }
        assert_eq!(s.n(), 100_000);
        // Bounded memory: far fewer stored items than inputs.
        assert!(s.stored_items() < 4_096, "stored {}", s.stored_items());

        let median = s.quantile(0.5).expect("median");
        let err = (median - 50_000).abs() as f64 / 100_000.0;
        assert!(err < 0.05, "median {median} relative error {err}");

        let p99 = s.quantile(0.99).expect("p99");
        let err = (p99 - 99_000).abs() as f64 / 100_000.0;
        assert!(err < 0.05, "p99 {p99} relative error {err}");
    }

    #[test]
    fn test_deterministic_across_runs() {
        let mut a = KllSketch::new();
        let mut b = KllSketch::new();
        for v in 0..10_000i64 {
            a.insert(v * 7 % 1000);
            b.insert(v * 7 % 1000);
        }
        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn test_serialize_layout() {
        let mut s = KllSketch::with_k(64);
        s.insert(5);
        let bytes = s.serialize();
        assert_eq!(&bytes[0..2], &64u16.to_le_bytes());
        assert_eq!(&bytes[2..10], &1u64.to_le_bytes());
    }
}
