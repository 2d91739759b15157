//! # Magpie
//!
//! A coverage-guided mutational fuzzing engine with corpus federation.
//!
//! Magpie evolves a corpus of input samples that drive a target program
//! toward new code coverage and records the crashes found along the way.
//! A pool of worker threads pulls jobs from a shared priority queue,
//! mutates corpus entries, runs the target, and admits samples whose
//! *stable* coverage (reproduced across retries) is new to the whole
//! engine. Admitted samples are minimized, persisted, scheduled for
//! further mutation, and optionally shared fleet-wide through a TCP
//! coverage server.
//!
//! Target execution is not part of the engine: the embedding binary
//! implements the [`FuzzTarget`] trait to supply an [`Executor`]
//! (process spawning and coverage readout), and the engine handles
//! everything else.
//!
//! # Example
//!
//! ```no_run
//! use magpie::prelude::*;
//!
//! struct MyTarget;
//!
//! impl FuzzTarget for MyTarget {
//!     fn create_executor(
//!         &self,
//!         args: &CommandLineArgs,
//!         thread_id: usize,
//!     ) -> Result<Box<dyn Executor>> {
//!         // Wire up your instrumentation backend here
//!         todo!()
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     magpie_main(MyTarget)
//! }
//! ```
//!
//! ```console
//! $ my_fuzzer --in corpus --out findings --nthreads 8 -- ./target @@
//! ```
//!
//! ## Roadmap of the repo:
//!
//! * [`Fuzzer`] - The engine: scheduler state machine, worker pool,
//!   run-sample pipeline, checkpointing
//! * [`mutators`] - The mutation strategy tree, from byte flips to
//!   grammar-aware tree splicing
//! * [`Coverage`] - The (module, offset-set) algebra behind novelty
//!   decisions
//! * [`CoverageServer`] / [`CoverageClient`] - The many-clients-to-one-
//!   server federation protocol
//! * [`Minimizer`] - Coverage-preserving sample shrinking

#![deny(missing_docs)]

pub use anyhow;
pub use rand;

pub mod client;
pub mod cmdline;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod delivery;
pub mod error;
pub mod executor;
pub mod fuzzer;
pub mod grammar;
pub mod minimizer;
pub mod mutators;
pub mod protocol;
pub mod range_tracker;
pub mod rng;
pub mod sample;
pub mod sample_trie;
pub mod server;
pub mod utils;

pub use client::CoverageClient;
pub use cmdline::CommandLineArgs;
pub use config::Config;
pub use coverage::{Coverage, ModuleCoverage};
pub use delivery::SampleDelivery;
pub use error::Error;
pub use executor::Executor;
pub use fuzzer::{magpie_main, FuzzTarget, Fuzzer, GrammarBundle};
pub use grammar::Grammar;
pub use minimizer::Minimizer;
pub use range_tracker::{Range, RangeSource};
pub use rng::{Mt19937, Prng};
pub use sample::Sample;
pub use sample_trie::SampleTrie;
pub use server::CoverageServer;

/// Outcome of one target execution. These are first-class values; a
/// crashing or hanging target never unwinds a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The target ran to completion
    Ok,

    /// The target crashed
    Crash,

    /// The target exceeded its timeout and was killed
    Hang,

    /// The execution backend failed
    OtherError,
}

/// Import the most important engine types and traits.
/// ```
/// use magpie::prelude::*;
/// ```
pub mod prelude {
    pub use super::anyhow::Result;
    pub use super::{
        magpie_main, CommandLineArgs, Config, Coverage, Executor, FuzzTarget, Fuzzer, Minimizer,
        Mt19937, Prng, RunResult, Sample, SampleDelivery,
    };
    pub use super::fuzzer::magic_output_filter;
    pub use super::mutators::{Mutator, MutatorContext};
}
