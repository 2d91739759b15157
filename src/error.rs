//! Fatal engine errors
//!
//! Target-run outcomes ([`RunResult`](crate::RunResult)) are first-class
//! values, never errors. This enum covers the small set of conditions that
//! abort the engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that terminate the engine
#[derive(Error, Debug)]
pub enum Error {
    /// A saved state file did not end with the expected sentinel
    #[error("State file {0:?} is corrupt (bad sentinel)")]
    CorruptStateFile(PathBuf),

    /// A state file was requested for restore but could not be opened
    #[error(
        "Error restoring state from {0:?}. \
         Did the previous session run long enough for state to be saved?"
    )]
    MissingStateFile(PathBuf),

    /// The grammar file failed to parse
    #[error("Error parsing grammar on line {line}: {text}")]
    MalformedGrammar {
        /// Line number of the offending rule
        line: usize,
        /// The offending line
        text: String,
    },

    /// A grammar symbol has no way to produce output
    #[error("No generators for grammar symbol <{0}>")]
    EmptyGrammarSymbol(String),

    /// A symbol was referenced that the grammar never defines
    #[error("Unknown grammar symbol <{0}>")]
    UnknownGrammarSymbol(String),

    /// Sample delivery kept failing even against a cleaned target
    #[error("Repeatedly failed to deliver sample after {0} retries")]
    SampleDeliveryFailed(usize),

    /// Unknown `-delivery` mode on the command line
    #[error("Unknown sample delivery mode {0:?} (expected \"file\" or \"shmem\")")]
    UnknownDeliveryMode(String),

    /// The corpus is empty and the mutator cannot generate samples
    #[error("No interesting input files")]
    NoInterestingInputs,
}
