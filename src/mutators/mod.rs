//! Mutation strategies and their composition
//!
//! A mutator is one node in a strategy tree: leaves change bytes (or
//! grammar trees), composites schedule their children. Per-sample state
//! lives in a [`MutatorContext`] paired 1:1 with the mutator that created
//! it; composites hold one child context per child mutator so no mutator
//! ever has to downcast.

pub mod bytes;
pub mod deterministic;
pub mod grammar;

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Result;

use crate::range_tracker::Range;
use crate::rng::Prng;
use crate::sample::Sample;
use crate::utils::{read_u64, write_u64};
use crate::RunResult;

use deterministic::DeterministicContext;
use grammar::GrammarContext;

/// Per-sample mutator state, shaped by the mutator that created it
pub enum MutatorContext {
    /// Stateless mutators
    None,

    /// One child context per child mutator
    Vector(Vec<MutatorContext>),

    /// Sequence position plus child contexts; the position is persisted
    /// in checkpoints so deterministic progress survives restarts
    Sequence {
        /// Index of the child currently being drained
        index: usize,
        /// One context per child
        children: Vec<MutatorContext>,
    },

    /// Hot-offset exploration state
    Deterministic(DeterministicContext),

    /// The decoded derivation tree of a grammar sample
    Grammar(GrammarContext),
}

impl MutatorContext {
    /// The child context slots of a `Vector` context
    pub fn children_mut(&mut self) -> &mut [MutatorContext] {
        match self {
            MutatorContext::Vector(children)
            | MutatorContext::Sequence { children, .. } => children,
            _ => &mut [],
        }
    }
}

/// One node of the mutation strategy tree.
///
/// All `mutate` implementations return `true` even when the concrete
/// mutation was a no-op; `false` means the strategy is exhausted for this
/// round (composites use it to advance).
pub trait Mutator: Send {
    /// Build the per-sample context for this mutator
    fn create_context(&self, _sample: &Sample) -> Result<MutatorContext> {
        Ok(MutatorContext::None)
    }

    /// Called once before a round of mutations on `sample`
    fn init_round(&mut self, _sample: &Sample, _ctx: &mut MutatorContext) {}

    /// Record a byte offset that recently produced new coverage
    fn add_hot_offset(&mut self, _ctx: &mut MutatorContext, _offset: usize) {}

    /// Mutate `sample` in place
    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool;

    /// Outcome of running the mutated sample
    fn notify_result(&mut self, _result: RunResult, _had_new_coverage: bool) {}

    /// True when this mutator can synthesize samples from nothing
    fn can_generate(&self) -> bool {
        false
    }

    /// Synthesize a fresh sample
    fn generate(&mut self, _sample: &mut Sample, _prng: &mut dyn Prng) -> bool {
        false
    }

    /// Persist cross-sample mutator state into a checkpoint
    fn save_global_state(&self, _w: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Restore cross-sample mutator state from a checkpoint
    fn load_global_state(&mut self, _r: &mut dyn Read) -> Result<()> {
        Ok(())
    }

    /// Persist a per-sample context into a checkpoint
    fn save_context(&self, _ctx: &MutatorContext, _w: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Restore a per-sample context created by [`Mutator::create_context`]
    fn load_context(&self, _ctx: &mut MutatorContext, _r: &mut dyn Read) -> Result<()> {
        Ok(())
    }

    /// Restrict mutations to the given sample ranges, where supported
    fn set_ranges(&mut self, _ranges: &[Range]) {}
}

/// Pick a random block of `[min_size, max_size]` bytes inside a sample of
/// `sample_size` bytes. Returns `(start, size)`.
pub(crate) fn get_rand_block(
    sample_size: usize,
    min_size: usize,
    max_size: usize,
    prng: &mut dyn Prng,
) -> Option<(usize, usize)> {
    if sample_size == 0 || sample_size < min_size {
        return None;
    }
    let max_size = max_size.min(sample_size);
    let size = prng.rand_range(min_size, max_size);
    let start = prng.rand_range(0, sample_size - size);
    Some((start, size))
}

/// Runs its child N times per round
pub struct NRoundMutator {
    child: Box<dyn Mutator>,
    num_rounds: usize,
    current_round: usize,
}

impl NRoundMutator {
    /// Run `child` for `num_rounds` mutations per round
    pub fn new(child: Box<dyn Mutator>, num_rounds: usize) -> Self {
        NRoundMutator {
            child,
            num_rounds,
            current_round: 0,
        }
    }
}

impl Mutator for NRoundMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        self.child.create_context(sample)
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        self.child.init_round(sample, ctx);
        self.current_round = 0;
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        self.child.add_hot_offset(ctx, offset);
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        if self.current_round == self.num_rounds {
            return false;
        }
        self.child.mutate(sample, ctx, prng, all_samples);
        self.current_round += 1;
        true
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        self.child.notify_result(result, had_new_coverage);
    }

    fn can_generate(&self) -> bool {
        self.child.can_generate()
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        self.child.generate(sample, prng)
    }

    fn save_global_state(&self, w: &mut dyn Write) -> Result<()> {
        self.child.save_global_state(w)
    }

    fn load_global_state(&mut self, r: &mut dyn Read) -> Result<()> {
        self.child.load_global_state(r)
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        self.child.save_context(ctx, w)
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        self.child.load_context(ctx, r)
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        self.child.set_ranges(ranges);
    }
}

/// Picks a child uniformly at random for each mutation
pub struct SelectMutator {
    children: Vec<Box<dyn Mutator>>,
    last_index: usize,
}

impl SelectMutator {
    /// Create an empty selection
    #[must_use]
    pub fn new() -> Self {
        SelectMutator {
            children: Vec::new(),
            last_index: 0,
        }
    }

    /// Add a child strategy
    pub fn add_mutator(&mut self, mutator: Box<dyn Mutator>) {
        self.children.push(mutator);
    }
}

impl Default for SelectMutator {
    fn default() -> Self {
        SelectMutator::new()
    }
}

/// Build a `Vector` context with one slot per child
fn vector_context(children: &[Box<dyn Mutator>], sample: &Sample) -> Result<MutatorContext> {
    let mut contexts = Vec::with_capacity(children.len());
    for child in children {
        contexts.push(child.create_context(sample)?);
    }
    Ok(MutatorContext::Vector(contexts))
}

impl Mutator for SelectMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        vector_context(&self.children, sample)
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        for (child, slot) in self.children.iter_mut().zip(ctx.children_mut()) {
            child.init_round(sample, slot);
        }
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        for (child, slot) in self.children.iter_mut().zip(ctx.children_mut()) {
            child.add_hot_offset(slot, offset);
        }
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        let index = prng.rand_u32() as usize % self.children.len();
        self.last_index = index;
        let slot = &mut ctx.children_mut()[index];
        self.children[index].mutate(sample, slot, prng, all_samples)
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        self.children[self.last_index].notify_result(result, had_new_coverage);
    }

    fn can_generate(&self) -> bool {
        self.children.iter().any(|c| c.can_generate())
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        let start = prng.rand_u32() as usize % self.children.len();
        for i in 0..self.children.len() {
            let index = (start + i) % self.children.len();
            if self.children[index].can_generate() {
                return self.children[index].generate(sample, prng);
            }
        }
        false
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        if let MutatorContext::Vector(slots) = ctx {
            for (child, slot) in self.children.iter().zip(slots) {
                child.save_context(slot, w)?;
            }
        }
        Ok(())
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        if let MutatorContext::Vector(slots) = ctx {
            for (child, slot) in self.children.iter().zip(slots) {
                child.load_context(slot, r)?;
            }
        }
        Ok(())
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        for child in &mut self.children {
            child.set_ranges(ranges);
        }
    }
}

/// Like [`SelectMutator`], but each child carries a selection weight
pub struct PSelectMutator {
    children: Vec<(Box<dyn Mutator>, f64)>,
    psum: f64,
    last_index: usize,
}

impl PSelectMutator {
    /// Create an empty weighted selection
    #[must_use]
    pub fn new() -> Self {
        PSelectMutator {
            children: Vec::new(),
            psum: 0.0,
            last_index: 0,
        }
    }

    /// Add a child with selection weight `p`
    pub fn add_mutator(&mut self, mutator: Box<dyn Mutator>, p: f64) {
        self.psum += p;
        self.children.push((mutator, p));
    }
}

impl Default for PSelectMutator {
    fn default() -> Self {
        PSelectMutator::new()
    }
}

impl Mutator for PSelectMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        let mut contexts = Vec::with_capacity(self.children.len());
        for (child, _) in &self.children {
            contexts.push(child.create_context(sample)?);
        }
        Ok(MutatorContext::Vector(contexts))
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        for ((child, _), slot) in self.children.iter_mut().zip(ctx.children_mut()) {
            child.init_round(sample, slot);
        }
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        for ((child, _), slot) in self.children.iter_mut().zip(ctx.children_mut()) {
            child.add_hot_offset(slot, offset);
        }
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        // Inverse-CDF draw over the child weights
        let p = prng.rand_real() * self.psum;
        let mut sum = 0.0;
        let last = self.children.len() - 1;
        for i in 0..self.children.len() {
            sum += self.children[i].1;
            if p < sum || i == last {
                self.last_index = i;
                let slot = &mut ctx.children_mut()[i];
                return self.children[i].0.mutate(sample, slot, prng, all_samples);
            }
        }
        false
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        self.children[self.last_index]
            .0
            .notify_result(result, had_new_coverage);
    }

    fn can_generate(&self) -> bool {
        self.children.iter().any(|(c, _)| c.can_generate())
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        // Weighted draw over only the generate-capable children
        let mut psum = 0.0;
        let mut last_generator = None;
        for (i, (child, p)) in self.children.iter().enumerate() {
            if child.can_generate() {
                psum += p;
                last_generator = Some(i);
            }
        }
        let Some(last_generator) = last_generator else {
            return false;
        };

        let p = prng.rand_real() * psum;
        let mut sum = 0.0;
        for (i, (child, weight)) in self.children.iter_mut().enumerate() {
            if !child.can_generate() {
                continue;
            }
            sum += *weight;
            if p < sum || i == last_generator {
                return child.generate(sample, prng);
            }
        }
        false
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        if let MutatorContext::Vector(slots) = ctx {
            for ((child, _), slot) in self.children.iter().zip(slots) {
                child.save_context(slot, w)?;
            }
        }
        Ok(())
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        if let MutatorContext::Vector(slots) = ctx {
            for ((child, _), slot) in self.children.iter().zip(slots) {
                child.load_context(slot, r)?;
            }
        }
        Ok(())
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        for (child, _) in &mut self.children {
            child.set_ranges(ranges);
        }
    }
}

/// Runs its child once, then again while a biased coin keeps landing
pub struct RepeatMutator {
    child: Box<dyn Mutator>,
    repeat_p: f64,
}

impl RepeatMutator {
    /// Repeat `child` with continuation probability `repeat_p`
    pub fn new(child: Box<dyn Mutator>, repeat_p: f64) -> Self {
        RepeatMutator { child, repeat_p }
    }
}

impl Mutator for RepeatMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        self.child.create_context(sample)
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        self.child.init_round(sample, ctx);
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        self.child.add_hot_offset(ctx, offset);
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        // Run the mutator at least once
        if !self.child.mutate(sample, ctx, prng, all_samples) {
            return false;
        }
        while prng.rand_real() < self.repeat_p {
            self.child.mutate(sample, ctx, prng, all_samples);
        }
        true
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        self.child.notify_result(result, had_new_coverage);
    }

    fn can_generate(&self) -> bool {
        self.child.can_generate()
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        self.child.generate(sample, prng)
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        self.child.save_context(ctx, w)
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        self.child.load_context(ctx, r)
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        self.child.set_ranges(ranges);
    }
}

/// Drains its children one at a time: when a child reports exhaustion the
/// sequence advances to the next one. The position lives in the sample
/// context so a checkpointed run resumes where it left off.
pub struct SequenceMutator {
    children: Vec<Box<dyn Mutator>>,
    restart_each_round: bool,
    restart_on_hot_offset: bool,
    last_index: usize,
}

impl SequenceMutator {
    /// Create an empty sequence
    #[must_use]
    pub fn new(restart_each_round: bool, restart_on_hot_offset: bool) -> Self {
        SequenceMutator {
            children: Vec::new(),
            restart_each_round,
            restart_on_hot_offset,
            last_index: 0,
        }
    }

    /// Append a child strategy
    pub fn add_mutator(&mut self, mutator: Box<dyn Mutator>) {
        self.children.push(mutator);
    }
}

impl Mutator for SequenceMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        let mut contexts = Vec::with_capacity(self.children.len());
        for child in &self.children {
            contexts.push(child.create_context(sample)?);
        }
        Ok(MutatorContext::Sequence {
            index: 0,
            children: contexts,
        })
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        for (child, slot) in self.children.iter_mut().zip(ctx.children_mut()) {
            child.init_round(sample, slot);
        }
        if self.restart_each_round {
            if let MutatorContext::Sequence { index, .. } = ctx {
                *index = 0;
            }
        }
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        for (child, slot) in self.children.iter_mut().zip(ctx.children_mut()) {
            child.add_hot_offset(slot, offset);
        }
        if self.restart_on_hot_offset {
            if let MutatorContext::Sequence { index, .. } = ctx {
                *index = 0;
            }
        }
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        let MutatorContext::Sequence { index, children } = ctx else {
            return false;
        };
        while *index < self.children.len() {
            self.last_index = *index;
            if self.children[*index].mutate(sample, &mut children[*index], prng, all_samples) {
                return true;
            }
            *index += 1;
        }
        false
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        self.children[self.last_index].notify_result(result, had_new_coverage);
    }

    fn can_generate(&self) -> bool {
        self.children.iter().any(|c| c.can_generate())
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        for child in &mut self.children {
            if child.can_generate() {
                return child.generate(sample, prng);
            }
        }
        false
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        if let MutatorContext::Sequence { index, children } = ctx {
            write_u64(w, *index as u64)?;
            for (child, slot) in self.children.iter().zip(children) {
                child.save_context(slot, w)?;
            }
        }
        Ok(())
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        if let MutatorContext::Sequence { index, children } = ctx {
            *index = usize::try_from(read_u64(r)?)?;
            for (child, slot) in self.children.iter().zip(children) {
                child.load_context(slot, r)?;
            }
        }
        Ok(())
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        for child in &mut self.children {
            child.set_ranges(ranges);
        }
    }
}

/// Runs a deterministic strategy for a bounded number of rounds, then a
/// nondeterministic one for the remainder. An exhausted deterministic
/// phase falls through to the nondeterministic child immediately.
pub struct DeterministicNondeterministicMutator {
    det: Box<dyn Mutator>,
    num_det_rounds: usize,
    nondet: Box<dyn Mutator>,
    num_nondet_rounds: usize,
    current_round: usize,
    in_det: bool,
}

impl DeterministicNondeterministicMutator {
    /// Run `det` for up to `num_det_rounds` mutations, then `nondet` for
    /// `num_nondet_rounds`
    pub fn new(
        det: Box<dyn Mutator>,
        num_det_rounds: usize,
        nondet: Box<dyn Mutator>,
        num_nondet_rounds: usize,
    ) -> Self {
        DeterministicNondeterministicMutator {
            det,
            num_det_rounds,
            nondet,
            num_nondet_rounds,
            current_round: 0,
            in_det: true,
        }
    }
}

impl Mutator for DeterministicNondeterministicMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        Ok(MutatorContext::Vector(vec![
            self.det.create_context(sample)?,
            self.nondet.create_context(sample)?,
        ]))
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        let slots = ctx.children_mut();
        self.det.init_round(sample, &mut slots[0]);
        self.nondet.init_round(sample, &mut slots[1]);
        self.current_round = 0;
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        let slots = ctx.children_mut();
        self.det.add_hot_offset(&mut slots[0], offset);
        self.nondet.add_hot_offset(&mut slots[1], offset);
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        if self.current_round < self.num_det_rounds {
            self.current_round += 1;
            let slot = &mut ctx.children_mut()[0];
            if self.det.mutate(sample, slot, prng, all_samples) {
                self.in_det = true;
                return true;
            }
            // Deterministic work drained early; hand the rest of the
            // round to the nondeterministic child
            self.current_round = self.num_det_rounds;
        }

        if self.current_round < self.num_det_rounds + self.num_nondet_rounds {
            self.current_round += 1;
            self.in_det = false;
            let slot = &mut ctx.children_mut()[1];
            return self.nondet.mutate(sample, slot, prng, all_samples);
        }

        false
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        if self.in_det {
            self.det.notify_result(result, had_new_coverage);
        } else {
            self.nondet.notify_result(result, had_new_coverage);
        }
    }

    fn can_generate(&self) -> bool {
        self.det.can_generate() || self.nondet.can_generate()
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        if self.det.can_generate() {
            return self.det.generate(sample, prng);
        }
        self.nondet.generate(sample, prng)
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        if let MutatorContext::Vector(slots) = ctx {
            self.det.save_context(&slots[0], w)?;
            self.nondet.save_context(&slots[1], w)?;
        }
        Ok(())
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        if let MutatorContext::Vector(slots) = ctx {
            self.det.load_context(&mut slots[0], r)?;
            self.nondet.load_context(&mut slots[1], r)?;
        }
        Ok(())
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        self.det.set_ranges(ranges);
        self.nondet.set_ranges(ranges);
    }
}

/// Restricts mutation to the byte ranges the target actually consumed:
/// crops the sample to one random range, mutates the crop, splices it back
pub struct RangeMutator {
    child: Box<dyn Mutator>,
    ranges: Vec<Range>,
}

impl RangeMutator {
    /// Wrap `child` with range restriction
    pub fn new(child: Box<dyn Mutator>) -> Self {
        RangeMutator {
            child,
            ranges: Vec::new(),
        }
    }
}

impl Mutator for RangeMutator {
    fn create_context(&self, sample: &Sample) -> Result<MutatorContext> {
        self.child.create_context(sample)
    }

    fn init_round(&mut self, sample: &Sample, ctx: &mut MutatorContext) {
        self.child.init_round(sample, ctx);
    }

    fn add_hot_offset(&mut self, ctx: &mut MutatorContext, offset: usize) {
        self.child.add_hot_offset(ctx, offset);
    }

    fn mutate(
        &mut self,
        sample: &mut Sample,
        ctx: &mut MutatorContext,
        prng: &mut dyn Prng,
        all_samples: &[Arc<Sample>],
    ) -> bool {
        if self.ranges.is_empty() {
            return self.child.mutate(sample, ctx, prng, all_samples);
        }

        let range = self.ranges[prng.rand_u32() as usize % self.ranges.len()];
        let size = sample.size();
        let from = range.from.min(size);
        let to = range.to.min(size);
        if from >= to {
            return self.child.mutate(sample, ctx, prng, all_samples);
        }

        let mut cropped = Sample::default();
        sample.crop(from, to, &mut cropped);

        let ret = self.child.mutate(&mut cropped, ctx, prng, all_samples);

        // Splice the mutated crop back between the untouched ends
        let bytes = sample.bytes().unwrap_or(&[]);
        let mut rebuilt = Vec::with_capacity(from + cropped.size() + (size - to));
        rebuilt.extend_from_slice(&bytes[..from]);
        rebuilt.extend_from_slice(cropped.bytes().unwrap_or(&[]));
        rebuilt.extend_from_slice(&bytes[to..]);
        sample.init(&rebuilt);

        ret
    }

    fn notify_result(&mut self, result: RunResult, had_new_coverage: bool) {
        self.child.notify_result(result, had_new_coverage);
    }

    fn can_generate(&self) -> bool {
        self.child.can_generate()
    }

    fn generate(&mut self, sample: &mut Sample, prng: &mut dyn Prng) -> bool {
        self.child.generate(sample, prng)
    }

    fn save_context(&self, ctx: &MutatorContext, w: &mut dyn Write) -> Result<()> {
        self.child.save_context(ctx, w)
    }

    fn load_context(&self, ctx: &mut MutatorContext, r: &mut dyn Read) -> Result<()> {
        self.child.load_context(ctx, r)
    }

    fn set_ranges(&mut self, ranges: &[Range]) {
        self.ranges = ranges.to_vec();
        self.child.set_ranges(ranges);
    }
}

#[cfg(test)]
mod tests {
    use super::bytes::ByteFlipMutator;
    use super::*;
    use crate::rng::Mt19937;
    use rand::SeedableRng;

    /// Counts calls and reports exhaustion after a fixed budget
    struct CountingMutator {
        calls: usize,
        budget: usize,
    }

    impl Mutator for CountingMutator {
        fn mutate(
            &mut self,
            sample: &mut Sample,
            _ctx: &mut MutatorContext,
            _prng: &mut dyn Prng,
            _all_samples: &[Arc<Sample>],
        ) -> bool {
            if self.calls == self.budget {
                return false;
            }
            self.calls += 1;
            if let Some(bytes) = sample.bytes_mut() {
                if !bytes.is_empty() {
                    bytes[0] = bytes[0].wrapping_add(1);
                }
            }
            true
        }
    }

    #[test]
    fn nround_stops_after_n_mutations() {
        let child = Box::new(CountingMutator {
            calls: 0,
            budget: usize::MAX,
        });
        let mut nround = NRoundMutator::new(child, 3);

        let mut sample = Sample::from_bytes(b"x");
        let mut ctx = nround.create_context(&sample).unwrap();
        nround.init_round(&sample, &mut ctx);

        let mut rng = Mt19937::from_seed([0; 16]);
        let mut count = 0;
        while nround.mutate(&mut sample, &mut ctx, &mut rng, &[]) {
            count += 1;
        }
        assert_eq!(count, 3);

        // A new round resets the budget
        nround.init_round(&sample, &mut ctx);
        assert!(nround.mutate(&mut sample, &mut ctx, &mut rng, &[]));
    }

    #[test]
    fn sequence_advances_past_exhausted_children() {
        let mut sequence = SequenceMutator::new(true, false);
        sequence.add_mutator(Box::new(CountingMutator { calls: 0, budget: 2 }));
        sequence.add_mutator(Box::new(CountingMutator { calls: 0, budget: 1 }));

        let sample = Sample::from_bytes(b"x");
        let mut ctx = sequence.create_context(&sample).unwrap();
        sequence.init_round(&sample, &mut ctx);

        let mut rng = Mt19937::from_seed([0; 16]);
        let mut work = Sample::from_bytes(b"x");
        let mut count = 0;
        while sequence.mutate(&mut work, &mut ctx, &mut rng, &[]) {
            count += 1;
        }
        // Two mutations from the first child, one from the second
        assert_eq!(count, 3);

        if let MutatorContext::Sequence { index, .. } = &ctx {
            assert_eq!(*index, 2);
        } else {
            panic!("sequence context expected");
        }
    }

    #[test]
    fn select_runs_every_child_eventually() {
        let mut select = SelectMutator::new();
        select.add_mutator(Box::new(CountingMutator {
            calls: 0,
            budget: usize::MAX,
        }));
        select.add_mutator(Box::new(ByteFlipMutator));

        let mut sample = Sample::from_bytes(b"abcd");
        let mut ctx = select.create_context(&sample).unwrap();
        select.init_round(&sample, &mut ctx);

        let mut rng = Mt19937::from_seed([2; 16]);
        for _ in 0..50 {
            assert!(select.mutate(&mut sample, &mut ctx, &mut rng, &[]));
            select.notify_result(crate::RunResult::Ok, false);
        }
    }

    #[test]
    fn pselect_only_picks_weighted_children() {
        // A zero-weight child should effectively never be chosen
        let mut pselect = PSelectMutator::new();
        pselect.add_mutator(Box::new(ByteFlipMutator), 1.0);
        pselect.add_mutator(
            Box::new(CountingMutator {
                calls: 0,
                budget: 0,
            }),
            0.0,
        );

        let mut sample = Sample::from_bytes(b"abcdefgh");
        let mut ctx = pselect.create_context(&sample).unwrap();
        let mut rng = Mt19937::from_seed([5; 16]);
        for _ in 0..50 {
            assert!(pselect.mutate(&mut sample, &mut ctx, &mut rng, &[]));
        }
    }

    #[test]
    fn det_nondet_falls_through_on_exhaustion() {
        let det = Box::new(CountingMutator { calls: 0, budget: 2 });
        let nondet = Box::new(CountingMutator {
            calls: 0,
            budget: usize::MAX,
        });
        let mut combined = DeterministicNondeterministicMutator::new(det, 10, nondet, 5);

        let sample = Sample::from_bytes(b"x");
        let mut ctx = combined.create_context(&sample).unwrap();
        combined.init_round(&sample, &mut ctx);

        let mut rng = Mt19937::from_seed([0; 16]);
        let mut work = Sample::from_bytes(b"x");
        let mut count = 0;
        while combined.mutate(&mut work, &mut ctx, &mut rng, &[]) {
            count += 1;
        }
        // 2 deterministic mutations, then the fall-through call plus the
        // remaining nondeterministic budget
        assert_eq!(count, 2 + 5);
    }

    #[test]
    fn range_mutator_touches_only_the_range() {
        let mut ranged = RangeMutator::new(Box::new(ByteFlipMutator));
        ranged.set_ranges(&[Range { from: 4, to: 8 }]);

        let mut rng = Mt19937::from_seed([1; 16]);
        for _ in 0..20 {
            let mut sample = Sample::from_bytes(b"0123456789");
            let mut ctx = ranged.create_context(&sample).unwrap();
            assert!(ranged.mutate(&mut sample, &mut ctx, &mut rng, &[]));
            let bytes = sample.bytes().unwrap();
            assert_eq!(&bytes[..4], b"0123");
            assert_eq!(&bytes[8..], b"89");
        }
    }
}
