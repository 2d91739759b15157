//! Command line arguments
//!
//! Engine flags come first; everything after `--` is the target command
//! line. The literal `@@` in target arguments is substituted with the
//! per-thread input path (or shared memory name), `@@ranges` with the
//! per-thread range buffer name.

use std::path::PathBuf;

use clap::builder::ArgAction;
use clap::Parser;

use crate::config::Config;

/// Coverage-guided fuzzing engine
#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct CommandLineArgs {
    /// Directory with the initial input corpus, or `-` to resume from a
    /// saved state
    #[clap(long = "in")]
    pub in_dir: Option<String>,

    /// Output directory for samples, crashes, hangs and state
    #[clap(long = "out")]
    pub out_dir: PathBuf,

    /// Number of worker threads
    #[clap(long, default_value_t = 1)]
    pub nthreads: usize,

    /// Target run timeout in milliseconds
    #[clap(long = "t")]
    pub timeout: Option<u64>,

    /// Target init timeout (to first rendezvous) in milliseconds;
    /// defaults to the run timeout
    #[clap(long = "t1")]
    pub init_timeout: Option<u64>,

    /// Per-input timeout in milliseconds used while ingesting the corpus;
    /// defaults to the run timeout
    #[clap(long = "t_corpus")]
    pub corpus_timeout: Option<u64>,

    /// Federation server to report to, as host[:port]
    #[clap(long)]
    pub server: Option<String>,

    /// Run as the federation server on host[:port] instead of fuzzing
    #[clap(long = "start_server")]
    pub start_server: Option<String>,

    /// Restore a previously saved session from the output directory
    #[clap(long)]
    pub restore: bool,

    /// Same as --restore
    #[clap(long)]
    pub resume: bool,

    /// Save hanging samples into the hangs directory
    #[clap(long = "save_hangs")]
    pub save_hangs: bool,

    /// Process the inputs, then exit once the fuzzing state is reached
    #[clap(long = "dry_run")]
    pub dry_run: bool,

    /// Minimize samples before adding them to the corpus
    #[clap(
        long = "minimize_samples",
        default_value("true"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub minimize_samples: bool,

    /// Keep corpus sample bytes resident instead of reloading from disk
    #[clap(
        long = "keep_samples_in_memory",
        default_value("true"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub keep_samples_in_memory: bool,

    /// Read consumed-byte ranges from the target and focus mutations on
    /// them
    #[clap(long = "track_ranges")]
    pub track_ranges: bool,

    /// Let the instrumentation suppress already-seen coverage so runs
    /// report deltas
    #[clap(
        long = "incremental_coverage",
        default_value("true"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub incremental_coverage: bool,

    /// Add every input file to the corpus even without new coverage
    #[clap(long = "add_all_inputs")]
    pub add_all_inputs: bool,

    /// Restart the target before re-running a sample for the stability
    /// check
    #[clap(
        long = "clean_target_on_coverage",
        default_value("true"),
        default_missing_value("true"),
        num_args(0..=1),
        require_equals(true),
        action = ArgAction::Set,
    )]
    pub clean_target_on_coverage: bool,

    /// Reruns used to separate stable from variable coverage
    #[clap(long = "coverage_retry")]
    pub coverage_retry: Option<usize>,

    /// Reruns used to confirm a crash before naming it
    #[clap(long = "crash_retry")]
    pub crash_retry: Option<usize>,

    /// Largest sample the engine will mutate or deliver
    #[clap(long = "max_sample_size")]
    pub max_sample_size: Option<usize>,

    /// Run the deterministic hot-offset stage before random mutation
    #[clap(long = "deterministic_mutations")]
    pub deterministic_mutations: bool,

    /// Only run the deterministic stage
    #[clap(long = "deterministic_only")]
    pub deterministic_only: bool,

    /// Mutations tried per fuzz job
    #[clap(long = "iterations_per_round")]
    pub iterations_per_round: Option<usize>,

    /// Grammar file describing the target input format
    #[clap(long)]
    pub grammar: Option<PathBuf>,

    /// How samples reach the target
    #[clap(long, default_value = "file")]
    pub delivery: String,

    /// Extension for the per-thread input files
    #[clap(long = "file_extension")]
    pub file_extension: Option<String>,

    /// Target command line; `@@` is replaced with the input path
    #[clap(last = true)]
    pub target_args: Vec<String>,
}

impl CommandLineArgs {
    /// True when the engine should restore `state.dat` instead of reading
    /// the input directory
    #[must_use]
    pub fn should_restore(&self) -> bool {
        self.restore || self.resume || self.in_dir.as_deref() == Some("-")
    }

    /// Fold the explicit command line overrides into `config`
    pub fn apply_to_config(&self, config: &mut Config) {
        if let Some(retries) = self.coverage_retry {
            config.coverage_reproduce_retries = retries;
        }
        if let Some(retries) = self.crash_retry {
            config.crash_reproduce_retries = retries;
        }
        if let Some(size) = self.max_sample_size {
            config.max_sample_size = size;
        }
        if let Some(iterations) = self.iterations_per_round {
            config.iterations_per_round = iterations;
        }
    }
}

/// Replace every occurrence of `search` in the target argv
#[must_use]
pub fn replace_target_arg(target_args: &[String], search: &str, replace: &str) -> Vec<String> {
    target_args
        .iter()
        .map(|arg| {
            if arg == search {
                replace.to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_args_follow_separator() {
        let args = CommandLineArgs::parse_from([
            "magpie", "--in", "in", "--out", "out", "--nthreads", "4", "--", "./target", "-f",
            "@@",
        ]);
        assert_eq!(args.nthreads, 4);
        assert_eq!(args.target_args, vec!["./target", "-f", "@@"]);
        assert!(args.minimize_samples);
        assert!(args.incremental_coverage);
    }

    #[test]
    fn default_true_flags_can_be_disabled() {
        let args = CommandLineArgs::parse_from([
            "magpie",
            "--out",
            "out",
            "--minimize_samples=false",
            "--incremental_coverage=false",
        ]);
        assert!(!args.minimize_samples);
        assert!(!args.incremental_coverage);
    }

    #[test]
    fn stdin_in_dir_means_restore() {
        let args = CommandLineArgs::parse_from(["magpie", "--in", "-", "--out", "out"]);
        assert!(args.should_restore());

        let args = CommandLineArgs::parse_from(["magpie", "--in", "in", "--out", "out"]);
        assert!(!args.should_restore());

        let args = CommandLineArgs::parse_from(["magpie", "--out", "out", "--resume"]);
        assert!(args.should_restore());
    }

    #[test]
    fn argv_substitution() {
        let argv = vec!["./target".to_string(), "@@".to_string(), "-x".to_string()];
        let replaced = replace_target_arg(&argv, "@@", "/tmp/input_1");
        assert_eq!(replaced, vec!["./target", "/tmp/input_1", "-x"]);
    }

    #[test]
    fn config_overrides() {
        let args = CommandLineArgs::parse_from([
            "magpie",
            "--out",
            "out",
            "--coverage_retry",
            "7",
            "--max_sample_size",
            "4096",
        ]);
        let mut config = Config::default();
        args.apply_to_config(&mut config);
        assert_eq!(config.coverage_reproduce_retries, 7);
        assert_eq!(config.max_sample_size, 4096);
        assert_eq!(config.crash_reproduce_retries, 10);
    }
}
