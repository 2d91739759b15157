//! The target execution contract
//!
//! Spawning the target, instrumenting it, and reading coverage back are
//! backend concerns supplied by the embedding binary. The engine only
//! needs the operations below; every worker thread owns one executor.

use std::time::Duration;

use crate::coverage::Coverage;
use crate::RunResult;

/// One instrumented target owned by a worker thread.
///
/// `run` executes the target against the most recently delivered sample.
/// `init_timeout` bounds the time to the first target rendezvous,
/// `timeout` bounds the measured iteration. On a hang the executor kills
/// the target; the next `run` restarts it. Backend failures are reported
/// as [`RunResult::OtherError`], never as panics.
pub trait Executor: Send {
    /// Run the target once and classify the outcome
    fn run(&mut self, target_args: &[String], init_timeout: Duration, timeout: Duration)
        -> RunResult;

    /// Run the target with extra crash analysis enabled (used when
    /// reproducing crashes for a better crash description). Defaults to a
    /// plain run.
    fn run_with_crash_analysis(
        &mut self,
        target_args: &[String],
        init_timeout: Duration,
        timeout: Duration,
    ) -> RunResult {
        self.run(target_args, init_timeout, timeout)
    }

    /// Read the coverage recorded by the last run and clear the
    /// instrumentation buffer
    fn take_coverage(&mut self) -> Coverage;

    /// Discard any recorded coverage without reading it
    fn clear_coverage(&mut self);

    /// Tell the instrumentation to stop reporting the given offsets.
    /// Subsequent [`Executor::take_coverage`] calls return deltas only.
    fn ignore_coverage(&mut self, coverage: &Coverage);

    /// Tear the target down so the next run starts from a clean process
    fn clean_target(&mut self);

    /// Short description of the last crash, used for deduplication
    /// (e.g. anonymized crash PC or signal)
    fn crash_name(&mut self) -> String;

    /// Target return value from the last run
    fn return_value(&mut self) -> u64 {
        0
    }
}
