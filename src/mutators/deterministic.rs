//! Deterministic hot-offset exploration
//!
//! When a mutation at some byte produced new coverage, that byte position
//! becomes a hot offset and the surrounding region is worth exhaustive
//! exploration. The per-sample context keeps a sorted list of regions and
//! a progress cursor; the deterministic mutators drain it one
//! (position, progress) pair per mutation until nothing is left.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Result;

use crate::mutators::{Mutator, MutatorContext};
use crate::rng::Prng;
use crate::sample::Sample;
use crate::utils::{read_u64, write_u64};

/// Bytes included before a hot offset
const REGION_BACKWARD: usize = 3;

/// Bytes included after a hot offset
const REGION_FORWARD: usize = 20;

/// One region of bytes scheduled for deterministic mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateRegion {
    /// First byte of the region
    pub start: usize,

    /// One past the last byte of the region
    pub end: usize,

    /// Next position to mutate
    pub cur: usize,

    /// Progress within the current position
    pub cur_progress: usize,
}

/// Hot-offset region state shared by the deterministic mutators
#[derive(Debug, Default, Clone)]
pub struct DeterministicContext {
    /// Regions sorted by start offset
    regions: Vec<MutateRegion>,

    /// Index of the region currently being drained
    cur_region: usize,
}

impl DeterministicContext {
    /// Schedule the region around `offset` for deterministic mutation.
    /// Overlapping or touching regions merge; the cursor rewinds so the
    /// earliest unfinished region is visited next.
    pub fn add_hot_offset(&mut self, offset: usize) {
        let new = MutateRegion {
            start: offset.saturating_sub(REGION_BACKWARD),
            end: offset + REGION_FORWARD,
            cur: offset.saturating_sub(REGION_BACKWARD),
            cur_progress: 0,
        };

        let at = self
            .regions
            .iter()
            .position(|r| r.start > new.start)
            .unwrap_or(self.regions.len());
        self.regions.insert(at, new);

        // Merge neighbors by extension
        let mut merged: Vec<MutateRegion> = Vec::with_capacity(self.regions.len());
        for region in self.regions.drain(..) {
            match merged.last_mut() {
                Some(last) if region.start <= last.end => {
                    last.end = last.end.max(region.end);
                    if region.cur < last.cur {
                        last.cur = region.cur;
                        last.cur_progress = region.cur_progress;
                    }
                }
                _ => merged.push(region),
            }
        }
        self.regions = merged;

        self.cur_region = 0;
    }

    /// The next `(position, progress)` pair, with progress iterated in
    /// `[0, max_progress)` before the position advances. `None` when all
    /// regions are drained.
    pub fn next_byte_to_mutate(&mut self, max_progress: usize) -> Option<(usize, usize)> {
        while self.cur_region < self.regions.len() {
            let region = &mut self.regions[self.cur_region];
            if region.cur >= region.end {
                self.cur_region += 1;
                continue;
            }

            let result = (region.cur, region.cur_progress);
            region.cur_progress += 1;
            if region.cur_progress >= max_progress {
                region.cur_progress = 0;
                region.cur += 1;
            }
            return Some(result);
        }
        None
    }

    /// The scheduled regions, for inspection
    #[must_use]
    pub fn regions(&self) -> &[MutateRegion] {
        &self.regions
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_u64(w, self.regions.len() as u64)?;
        for region in &self.regions {
            write_u64(w, region.start as u64)?;
            write_u64(w, region.end as u64)?;
            write_u64(w, region.cur as u64)?;
            write_u64(w, region.cur_progress as u64)?;
        }
        write_u64(w, self.cur_region as u64)?;
        Ok(())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        let num_regions = read_u64(r)?;
        self.regions.clear();
        for _ in 0..num_regions {
            self.regions.push(MutateRegion {
                start: usize::try_from(read_u64(r)?)?,
                end: usize::try_from(read_u64(r)?)?,
                cur: usize::try_from(read_u64(r)?)?,
                cur_progress: usize::try_from(read_u64(r)?)?,
            });
        }
        self.cur_region = usize::try_from(read_u64(r)?)?;
        Ok(())
    }
}

/// Context plumbing shared by the deterministic leaf mutators
macro_rules! deterministic_common {
    () => {
        fn create_context(&self, _sample: &Sample) -> Result<MutatorContext> {
            Ok(MutatorContext::Deterministic(DeterministicContext::default()))
        }

        fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
            if let MutatorContext::Deterministic(det) = ctx {
                det.add_hot_offset(offset);
            }
        }

        fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
            if let MutatorContext::Deterministic(det) = ctx {
                det.save(w)?;
            }
            Ok(())
        }

        fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
            if let MutatorContext::Deterministic(det) = ctx {
                det.load(r)?;
            }
            Ok(())
        }
    };
}

/// Sets every hot-region byte to every value in `[0, 256)`
pub struct DeterministicByteFlipMutator;

impl Mutator for DeterministicByteFlipMutator {
    deterministic_common!();

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        _prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        let MutatorContext::Deterministic(det) = ctx else {
            return false;
        };
        let Some((pos, value)) = det.next_byte_to_mutate(256) else {
            return false;
        };

        if pos >= sample.size() {
            sample.resize(pos + 1);
        }
        if let Some(bytes) = sample.bytes_mut() {
            bytes[pos] = value as u8;
        }
        true
    }
}

/// Overwrites every hot-region position with every interesting value
pub struct DeterministicInterestingValueMutator {
    /// Candidate byte strings, native little-endian
    interesting_values: Vec<Vec<u8>>,
}

impl DeterministicInterestingValueMutator {
    /// Create the mutator with the default boundary/single-bit values
    #[must_use]
    pub fn new(use_default_values: bool) -> Self {
        let mut values = Vec::new();
        if use_default_values {
            values.push(0_u16.to_le_bytes().to_vec());
            values.push(u16::MAX.to_le_bytes().to_vec());
            for i in 0..16 {
                values.push((1_u16 << i).to_le_bytes().to_vec());
            }
            values.push(0_u32.to_le_bytes().to_vec());
            values.push(u32::MAX.to_le_bytes().to_vec());
            for i in 0..16 {
                values.push((1_u32 << i).to_le_bytes().to_vec());
            }
            values.push(0_u64.to_le_bytes().to_vec());
            values.push(u64::MAX.to_le_bytes().to_vec());
            for i in 0..16 {
                values.push((1_u64 << i).to_le_bytes().to_vec());
            }
        }
        DeterministicInterestingValueMutator {
            interesting_values: values,
        }
    }
}

impl Mutator for DeterministicInterestingValueMutator {
    deterministic_common!();

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        _prng: &mut dyn Prng,
        _all_samples: &[Arc<Sample>],
    ) -> bool {
        if self.interesting_values.is_empty() {
            return false;
        }
        let MutatorContext::Deterministic(det) = ctx else {
            return false;
        };
        let Some((pos, index)) = det.next_byte_to_mutate(self.interesting_values.len()) else {
            return false;
        };

        let value = &self.interesting_values[index];
        if pos + value.len() > sample.size() {
            sample.resize(pos + value.len());
        }
        if let Some(bytes) = sample.bytes_mut() {
            bytes[pos..pos + value.len()].copy_from_slice(value);
        }
        true
    }
}
