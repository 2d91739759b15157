//! Corpus entries and the fuzzing priority queue
//!
//! Every accepted sample gets a [`CorpusEntry`]. Entries are appended to
//! the engine's entry list and never removed; a discarded entry is only
//! flagged so its index and checkpoint slot stay stable. The queue itself
//! is a max-heap of [`QueueKey`]s snapshotted at push time: priorities
//! only ever change while a worker has the entry checked out, so the
//! snapshots cannot go stale.

use std::cmp::Ordering;
use std::io::{Read, Write};

use anyhow::Result;

use crate::mutators::MutatorContext;
use crate::range_tracker::Range;
use crate::sample::Sample;
use crate::utils::{read_f64, read_string, read_u64, write_f64, write_string, write_u64};

/// One accepted sample and its fuzzing statistics
pub struct CorpusEntry {
    /// The sample bytes (possibly evicted to disk)
    pub sample: Sample,

    /// Per-sample mutator state
    pub context: MutatorContext,

    /// Scheduling priority; reset to 0 on new coverage, decremented
    /// otherwise
    pub priority: f64,

    /// Monotonic creation index
    pub sample_index: u64,

    /// Stable filename under the samples directory
    pub sample_filename: String,

    /// Times this entry was the base of a fuzz job iteration
    pub num_runs: u64,

    /// Mutations of this entry that crashed
    pub num_crashes: u64,

    /// Mutations of this entry that hung
    pub num_hangs: u64,

    /// Mutations of this entry that found new coverage
    pub num_new_coverage: u64,

    /// Entry dropped from scheduling (still on disk and in the list)
    pub discarded: bool,

    /// Consumed-byte ranges reported by the target, if tracked
    pub ranges: Vec<Range>,
}

impl CorpusEntry {
    /// Create an entry for a freshly accepted sample
    pub fn new(sample: Sample, context: MutatorContext, sample_index: u64) -> Self {
        CorpusEntry {
            sample,
            context,
            priority: 0.0,
            sample_index,
            sample_filename: crate::utils::sample_filename(sample_index),
            num_runs: 0,
            num_crashes: 0,
            num_hangs: 0,
            num_new_coverage: 0,
            discarded: false,
            ranges: Vec::new(),
        }
    }

    /// Serialize the checkpoint fields (sample bytes and mutator context
    /// are persisted separately)
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        write_string(w, &self.sample_filename)?;
        write_f64(w, self.priority)?;
        write_u64(w, self.sample_index)?;
        write_u64(w, self.num_runs)?;
        write_u64(w, self.num_crashes)?;
        write_u64(w, self.num_hangs)?;
        write_u64(w, self.num_new_coverage)?;
        write_u64(w, u64::from(self.discarded))?;
        write_u64(w, self.ranges.len() as u64)?;
        for range in &self.ranges {
            write_u64(w, range.from as u64)?;
            write_u64(w, range.to as u64)?;
        }
        Ok(())
    }

    /// Deserialize the checkpoint fields; the caller reloads the sample
    /// and rebuilds the mutator context
    pub fn load<R: Read>(r: &mut R) -> Result<Self> {
        let sample_filename = read_string(r)?;
        let priority = read_f64(r)?;
        let sample_index = read_u64(r)?;
        let num_runs = read_u64(r)?;
        let num_crashes = read_u64(r)?;
        let num_hangs = read_u64(r)?;
        let num_new_coverage = read_u64(r)?;
        let discarded = read_u64(r)? != 0;

        let num_ranges = read_u64(r)?;
        let mut ranges = Vec::with_capacity(num_ranges.min(4096) as usize);
        for _ in 0..num_ranges {
            let from = usize::try_from(read_u64(r)?)?;
            let to = usize::try_from(read_u64(r)?)?;
            ranges.push(Range { from, to });
        }

        Ok(CorpusEntry {
            sample: Sample::default(),
            context: MutatorContext::None,
            priority,
            sample_index,
            sample_filename,
            num_runs,
            num_crashes,
            num_hangs,
            num_new_coverage,
            discarded,
            ranges,
        })
    }
}

/// Heap key for the sample queue: higher priority wins, ties prefer the
/// newer entry
#[derive(Debug, Clone, Copy)]
pub struct QueueKey {
    /// Entry priority at push time
    pub priority: f64,

    /// Entry creation index (tiebreaker, newer first)
    pub sample_index: u64,

    /// Index into the engine's entry list
    pub entry: usize,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Priorities are never NaN
        self.priority
            .partial_cmp(&other.priority)
            .unwrap_or(Ordering::Equal)
            .then(self.sample_index.cmp(&other.sample_index))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}
