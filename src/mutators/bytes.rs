//! Byte-level leaf mutators
//!
//! These all return `true` even when the concrete mutation was a no-op
//! (an empty sample, a block that did not fit); `false` from a leaf means
//! the sample is structurally unusable for the strategy, which only the
//! splice mutator can hit.

use std::sync::Arc;

use crate::mutators::{get_rand_block, Mutator, MutatorContext};
use crate::rng::Prng;
use crate::sample::Sample;

/// Overwrite one random byte with a random byte
pub struct ByteFlipMutator;

impl Mutator for ByteFlipMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        if sample.size() == 0 {
            return true;
        }
        let pos = prng.rand_range(0, sample.size() - 1);
        let value = prng.rand_range(0, 255) as u8;
        if let Some(bytes) = sample.bytes_mut() {
            bytes[pos] = value;
        }
        true
    }
}

/// Overwrite a random block with random bytes, optionally with one value
pub struct BlockFlipMutator {
    min_block_size: usize,
    max_block_size: usize,
    uniform: bool,
}

impl BlockFlipMutator {
    /// Flip blocks of `[min_block_size, max_block_size]` bytes; `uniform`
    /// fills the whole block with a single random byte
    #[must_use]
    pub fn new(min_block_size: usize, max_block_size: usize, uniform: bool) -> Self {
        BlockFlipMutator {
            min_block_size,
            max_block_size,
            uniform,
        }
    }
}

impl Mutator for BlockFlipMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        let Some((start, size)) =
            get_rand_block(sample.size(), self.min_block_size, self.max_block_size, prng)
        else {
            return true;
        };

        if self.uniform {
            let value = prng.rand_range(0, 255) as u8;
            if let Some(bytes) = sample.bytes_mut() {
                bytes[start..start + size].fill(value);
            }
        } else {
            for i in 0..size {
                let value = prng.rand_range(0, 255) as u8;
                if let Some(bytes) = sample.bytes_mut() {
                    bytes[start + i] = value;
                }
            }
        }
        true
    }
}

/// Grow the sample with random tail bytes
pub struct AppendMutator {
    min_append: usize,
    max_append: usize,
    max_sample_size: usize,
}

impl AppendMutator {
    /// Append `[min_append, max_append]` random bytes, never exceeding
    /// `max_sample_size`
    #[must_use]
    pub fn new(min_append: usize, max_append: usize, max_sample_size: usize) -> Self {
        AppendMutator {
            min_append,
            max_append,
            max_sample_size,
        }
    }
}

impl Mutator for AppendMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        let old_size = sample.size();
        if old_size >= self.max_sample_size {
            return true;
        }
        let mut append = prng.rand_range(self.min_append, self.max_append);
        if old_size + append > self.max_sample_size {
            append = self.max_sample_size - old_size;
        }
        if append == 0 {
            return true;
        }

        let mut tail = vec![0_u8; append];
        for byte in &mut tail {
            *byte = prng.rand_range(0, 255) as u8;
        }
        sample.append(&tail);
        true
    }
}

/// Insert random bytes at a random offset
pub struct BlockInsertMutator {
    min_insert: usize,
    max_insert: usize,
    max_sample_size: usize,
}

impl BlockInsertMutator {
    /// Insert `[min_insert, max_insert]` random bytes
    #[must_use]
    pub fn new(min_insert: usize, max_insert: usize, max_sample_size: usize) -> Self {
        BlockInsertMutator {
            min_insert,
            max_insert,
            max_sample_size,
        }
    }
}

impl Mutator for BlockInsertMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        let old_size = sample.size();
        if old_size >= self.max_sample_size {
            return true;
        }
        let mut to_insert = prng.rand_range(self.min_insert, self.max_insert);
        if old_size + to_insert > self.max_sample_size {
            to_insert = self.max_sample_size - old_size;
        }
        if to_insert == 0 {
            return true;
        }
        let at = prng.rand_range(0, old_size);

        let mut block = vec![0_u8; to_insert];
        for byte in &mut block {
            *byte = prng.rand_range(0, 255) as u8;
        }

        let old = sample.bytes().unwrap_or(&[]);
        let mut rebuilt = Vec::with_capacity(old_size + to_insert);
        rebuilt.extend_from_slice(&old[..at]);
        rebuilt.extend_from_slice(&block);
        rebuilt.extend_from_slice(&old[at..]);
        sample.init(&rebuilt);
        true
    }
}

/// Duplicate a random block N times in place
pub struct BlockDuplicateMutator {
    min_block_size: usize,
    max_block_size: usize,
    min_duplicate_cnt: usize,
    max_duplicate_cnt: usize,
    max_sample_size: usize,
}

impl BlockDuplicateMutator {
    /// Duplicate a `[min_block_size, max_block_size]` block
    /// `[min_duplicate_cnt, max_duplicate_cnt]` times
    #[must_use]
    pub fn new(
        min_block_size: usize,
        max_block_size: usize,
        min_duplicate_cnt: usize,
        max_duplicate_cnt: usize,
        max_sample_size: usize,
    ) -> Self {
        BlockDuplicateMutator {
            min_block_size,
            max_block_size,
            min_duplicate_cnt,
            max_duplicate_cnt,
            max_sample_size,
        }
    }
}

impl Mutator for BlockDuplicateMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        if sample.size() >= self.max_sample_size {
            return true;
        }
        let Some((start, size)) =
            get_rand_block(sample.size(), self.min_block_size, self.max_block_size, prng)
        else {
            return true;
        };

        let mut count = prng.rand_range(self.min_duplicate_cnt, self.max_duplicate_cnt);
        if sample.size() + count * size > self.max_sample_size {
            count = (self.max_sample_size - sample.size()) / size;
        }
        if count == 0 {
            return true;
        }

        let old = sample.bytes().unwrap_or(&[]);
        let mut rebuilt = Vec::with_capacity(old.len() + count * size);
        rebuilt.extend_from_slice(&old[..start + size]);
        for _ in 0..count {
            rebuilt.extend_from_slice(&old[start..start + size]);
        }
        rebuilt.extend_from_slice(&old[start + size..]);
        sample.init(&rebuilt);
        true
    }
}

/// Overwrite a length-matching slice with a known-interesting value
pub struct InterestingValueMutator {
    /// Candidate byte strings, native little-endian
    interesting_values: Vec<Vec<u8>>,
}

impl InterestingValueMutator {
    /// Create the mutator; `use_default_values` populates the boundary
    /// and single-bit values for 16/32/64-bit widths
    #[must_use]
    pub fn new(use_default_values: bool) -> Self {
        let mut mutator = InterestingValueMutator {
            interesting_values: Vec::new(),
        };
        if !use_default_values {
            return mutator;
        }

        mutator.add_interesting_value(&0_u16.to_le_bytes());
        mutator.add_interesting_value(&u16::MAX.to_le_bytes());
        for i in 0..16 {
            mutator.add_interesting_value(&(1_u16 << i).to_le_bytes());
        }

        mutator.add_interesting_value(&0_u32.to_le_bytes());
        mutator.add_interesting_value(&u32::MAX.to_le_bytes());
        for i in 0..16 {
            mutator.add_interesting_value(&(1_u32 << i).to_le_bytes());
        }

        mutator.add_interesting_value(&0_u64.to_le_bytes());
        mutator.add_interesting_value(&u64::MAX.to_le_bytes());
        for i in 0..16 {
            mutator.add_interesting_value(&(1_u64 << i).to_le_bytes());
        }

        mutator
    }

    /// Add a custom value (e.g. a magic number for the target format)
    pub fn add_interesting_value(&mut self, value: &[u8]) {
        self.interesting_values.push(value.to_vec());
    }
}

impl Mutator for InterestingValueMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        if self.interesting_values.is_empty() {
            return true;
        }
        let value =
            &self.interesting_values[prng.rand_range(0, self.interesting_values.len() - 1)];
        let Some((start, _)) = get_rand_block(sample.size(), value.len(), value.len(), prng)
        else {
            return true;
        };
        if let Some(bytes) = sample.bytes_mut() {
            bytes[start..start + value.len()].copy_from_slice(value);
        }
        true
    }
}

/// Treat a random slice as an integer and nudge it by a small delta
pub struct ArithmeticMutator;

impl Mutator for ArithmeticMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        let width = [2_usize, 4, 8][prng.rand_range(0, 2)];
        if sample.size() < width {
            return true;
        }
        let offset = prng.rand_range(0, sample.size() - width);
        let swap = prng.rand_range(0, 1) == 1;
        let delta = prng.rand_range(0, 512) as i64 - 256;

        let Some(bytes) = sample.bytes_mut() else {
            return true;
        };

        macro_rules! arith {
            ($ty:ty) => {{
                let mut buf = [0_u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[offset..offset + width]);
                let mut val = <$ty>::from_le_bytes(buf);
                if swap {
                    val = val.swap_bytes();
                }
                val = val.wrapping_add(delta as $ty);
                if swap {
                    val = val.swap_bytes();
                }
                bytes[offset..offset + width].copy_from_slice(&val.to_le_bytes());
            }};
        }

        match width {
            2 => arith!(u16),
            4 => arith!(u32),
            8 => arith!(u64),
            _ => unreachable!(),
        }
        true
    }
}

/// Recombine the sample with another corpus sample
pub struct SpliceMutator {
    /// Number of splice points, 1 or 2
    points: usize,

    /// Probability of splicing at displaced (unequal) offsets
    displacement_p: f64,

    max_sample_size: usize,
}

impl SpliceMutator {
    /// Create a splice mutator with `points` cut points
    ///
    /// # Panics
    ///
    /// `points` must be 1 or 2.
    #[must_use]
    pub fn new(points: usize, displacement_p: f64, max_sample_size: usize) -> Self {
        assert!(
            points == 1 || points == 2,
            "Splice mutator can only work with 1 or 2 splice points"
        );
        SpliceMutator {
            points,
            displacement_p,
            max_sample_size,
        }
    }

    fn splice_one_point(
        &self,
        sample: &mut Sample,
        other: &[u8],
        displace: bool,
        prng: &mut dyn Prng,
    ) -> bool {
        let size = sample.size();
        let (point1, point2) = if displace {
            (
                prng.rand_range(0, size - 1),
                prng.rand_range(0, other.len() - 1),
            )
        } else {
            let min_size = size.min(other.len());
            let point = prng.rand_range(0, min_size - 1);
            (point, point)
        };

        let new_size = point1 + (other.len() - point2);
        if new_size == size {
            if let Some(bytes) = sample.bytes_mut() {
                bytes[point1..].copy_from_slice(&other[point2..]);
            }
        } else {
            let bytes = sample.bytes().unwrap_or(&[]);
            let mut rebuilt = Vec::with_capacity(new_size);
            rebuilt.extend_from_slice(&bytes[..point1]);
            rebuilt.extend_from_slice(&other[point2..]);
            sample.init(&rebuilt);
            sample.trim(self.max_sample_size);
        }
        true
    }

    fn splice_two_points(
        &self,
        sample: &mut Sample,
        other: &[u8],
        displace: bool,
        prng: &mut dyn Prng,
    ) -> bool {
        if displace {
            // Replace a block of the sample with a block of the other,
            // shifting the tail
            let Some((start1, size1)) = get_rand_block(sample.size(), 1, sample.size(), prng)
            else {
                return true;
            };
            let Some((start2, size2)) = get_rand_block(other.len(), 1, other.len(), prng) else {
                return true;
            };

            let bytes = sample.bytes().unwrap_or(&[]);
            let mut rebuilt = Vec::with_capacity(start1 + size2 + (bytes.len() - start1 - size1));
            rebuilt.extend_from_slice(&bytes[..start1]);
            rebuilt.extend_from_slice(&other[start2..start2 + size2]);
            rebuilt.extend_from_slice(&bytes[start1 + size1..]);
            rebuilt.truncate(self.max_sample_size);
            sample.init(&rebuilt);
        } else {
            // Overwrite a block with the other sample's bytes at the same
            // offset
            let Some((mut start, mut size)) = get_rand_block(other.len(), 2, other.len(), prng)
            else {
                return true;
            };
            if start > sample.size() {
                size += start - sample.size();
                start = sample.size();
            }

            if start + size <= sample.size() {
                if let Some(bytes) = sample.bytes_mut() {
                    bytes[start..start + size].copy_from_slice(&other[start..start + size]);
                }
            } else {
                let bytes = sample.bytes().unwrap_or(&[]);
                let mut rebuilt = Vec::with_capacity(start + size);
                rebuilt.extend_from_slice(&bytes[..start]);
                rebuilt.extend_from_slice(&other[start..start + size]);
                rebuilt.truncate(self.max_sample_size);
                sample.init(&rebuilt);
            }
        }
        true
    }
}

impl Mutator for SpliceMutator {
    fn mutate(
        &mut self,
        sample: &mut Sample,
        _ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        if all_samples.is_empty() {
            return true;
        }

        let displace = prng.rand_real() < self.displacement_p;
        let other = &all_samples[prng.rand_range(0, all_samples.len() - 1)];

        if sample.size() == 0 || other.size() == 0 {
            return false;
        }
        // Evicted partner: nothing to splice from this round
        let Some(other_bytes) = other.bytes() else {
            return true;
        };

        match self.points {
            1 => self.splice_one_point(sample, other_bytes, displace, prng),
            _ => self.splice_two_points(sample, other_bytes, displace, prng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Mt19937;
    use rand::SeedableRng;

    fn ctx() -> MutatorContext {
        MutatorContext::None
    }

    #[test]
    fn byte_flip_preserves_size() {
        let mut mutator = ByteFlipMutator;
        let mut rng = Mt19937::from_seed([0; 16]);
        let mut sample = Sample::from_bytes(b"abcdef");
        for _ in 0..100 {
            assert!(mutator.mutate(&mut sample, &mut ctx(), &mut rng, &[]));
            assert_eq!(sample.size(), 6);
        }

        // Empty samples are a no-op, not an error
        let mut empty = Sample::default();
        assert!(mutator.mutate(&mut empty, &mut ctx(), &mut rng, &[]));
    }

    #[test]
    fn uniform_block_flip_fills_with_one_value() {
        let mut mutator = BlockFlipMutator::new(4, 4, true);
        let mut rng = Mt19937::from_seed([2; 16]);
        let mut sample = Sample::from_bytes(&[0xAA; 16]);
        mutator.mutate(&mut sample, &mut ctx(), &mut rng, &[]);

        let bytes = sample.bytes().unwrap();
        let changed: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0xAA).collect();
        // The flipped block is uniform (or happened to hit 0xAA)
        assert!(changed.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn append_respects_max_sample_size() {
        let mut mutator = AppendMutator::new(1, 100, 20);
        let mut rng = Mt19937::from_seed([3; 16]);
        let mut sample = Sample::from_bytes(&[0; 10]);
        for _ in 0..50 {
            mutator.mutate(&mut sample, &mut ctx(), &mut rng, &[]);
            assert!(sample.size() <= 20);
        }
        assert_eq!(sample.size(), 20);
    }

    #[test]
    fn block_insert_grows_at_offset() {
        let mut mutator = BlockInsertMutator::new(4, 4, 1_000_000);
        let mut rng = Mt19937::from_seed([4; 16]);
        let mut sample = Sample::from_bytes(b"abcd");
        mutator.mutate(&mut sample, &mut ctx(), &mut rng, &[]);
        assert_eq!(sample.size(), 8);

        // The original bytes survive in order
        let bytes = sample.bytes().unwrap();
        let kept: Vec<u8> = bytes
            .iter()
            .copied()
            .filter(|b| b"abcd".contains(b))
            .collect();
        assert!(kept.len() >= 4);
    }

    #[test]
    fn block_duplicate_repeats_a_block() {
        let mut mutator = BlockDuplicateMutator::new(2, 2, 1, 1, 1_000_000);
        let mut rng = Mt19937::from_seed([5; 16]);
        let mut sample = Sample::from_bytes(b"abcdef");
        mutator.mutate(&mut sample, &mut ctx(), &mut rng, &[]);
        assert_eq!(sample.size(), 8);
    }

    #[test]
    fn interesting_value_table_has_default_entries() {
        let mutator = InterestingValueMutator::new(true);
        // 2 boundary + 16 single-bit values per width
        assert_eq!(mutator.interesting_values.len(), 3 * 18);

        let mut with_custom = InterestingValueMutator::new(false);
        with_custom.add_interesting_value(b"MAGIC");
        assert_eq!(with_custom.interesting_values.len(), 1);
    }

    #[test]
    fn arithmetic_changes_at_most_width_bytes() {
        let mut mutator = ArithmeticMutator;
        let mut rng = Mt19937::from_seed([6; 16]);
        for _ in 0..100 {
            let mut sample = Sample::from_bytes(&[0x41; 32]);
            mutator.mutate(&mut sample, &mut ctx(), &mut rng, &[]);
            assert_eq!(sample.size(), 32);
            let changed = sample
                .bytes()
                .unwrap()
                .iter()
                .filter(|&&b| b != 0x41)
                .count();
            assert!(changed <= 8);
        }
    }

    #[test]
    fn splice_one_point_same_offsets() {
        // A=0123, B=abcd, point 2, non-displacement: prefix of A, suffix
        // of B, size unchanged
        let mut mutator = SpliceMutator::new(1, 0.0, 1_000_000);
        let corpus = vec![Arc::new(Sample::from_bytes(b"abcd"))];

        // Hunt for a seed draw where the point lands on 2
        let mut rng = Mt19937::from_seed([8; 16]);
        for _ in 0..200 {
            let mut sample = Sample::from_bytes(b"0123");
            assert!(mutator.mutate(&mut sample, &mut ctx(), &mut rng, &corpus));
            assert_eq!(sample.size(), 4);
            let bytes = sample.bytes().unwrap();
            let point = bytes.iter().take_while(|&&b| b.is_ascii_digit()).count();
            assert_eq!(&bytes[..point], &b"0123"[..point]);
            assert_eq!(&bytes[point..], &b"abcd"[point..]);
            if point == 2 {
                assert_eq!(bytes, b"01cd");
                return;
            }
        }
        panic!("splice point 2 never drawn");
    }

    #[test]
    fn splice_never_exceeds_max_sample_size() {
        let max = 64;
        let corpus = vec![
            Arc::new(Sample::from_bytes(&[0x61; 64])),
            Arc::new(Sample::from_bytes(&[0x62; 33])),
        ];
        let mut rng = Mt19937::from_seed([9; 16]);

        for points in [1, 2] {
            for displacement_p in [0.0, 1.0] {
                let mut mutator = SpliceMutator::new(points, displacement_p, max);
                for _ in 0..500 {
                    let mut sample = Sample::from_bytes(&[0x63; 60]);
                    mutator.mutate(&mut sample, &mut ctx(), &mut rng, &corpus);
                    assert!(sample.size() <= max);
                }
            }
        }
    }

    #[test]
    fn splice_with_empty_sample_reports_unusable() {
        let mut mutator = SpliceMutator::new(1, 0.0, 1_000_000);
        let corpus = vec![Arc::new(Sample::from_bytes(b"abcd"))];
        let mut rng = Mt19937::from_seed([1; 16]);
        let mut empty = Sample::default();
        assert!(!mutator.mutate(&mut empty, &mut ctx(), &mut rng, &corpus));
    }
}
