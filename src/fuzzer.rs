//! The fuzzing engine: worker scheduling, the run-sample pipeline,
//! novelty admission and checkpointing
//!
//! One orchestrator thread starts `nthreads` workers. Each worker loops:
//! synchronize with the engine state machine to get a job, execute it
//! against its own executor, report back. All shared state is behind a
//! small set of named locks; none of them is ever held across a target
//! execution.

use std::collections::{BinaryHeap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustc_hash::FxHashMap;

use crate::client::CoverageClient;
use crate::cmdline::{replace_target_arg, CommandLineArgs};
use crate::config::Config;
use crate::corpus::{CorpusEntry, QueueKey};
use crate::coverage::Coverage;
use crate::delivery::{FileDelivery, SampleDelivery, ShmDelivery};
use crate::error::Error;
use crate::executor::Executor;
use crate::grammar::Grammar;
use crate::minimizer::{GrammarMinimizer, Minimizer, SimpleTrimmer};
use crate::mutators::bytes::{
    AppendMutator, ArithmeticMutator, BlockDuplicateMutator, BlockFlipMutator, BlockInsertMutator,
    ByteFlipMutator, InterestingValueMutator, SpliceMutator,
};
use crate::mutators::deterministic::{
    DeterministicByteFlipMutator, DeterministicInterestingValueMutator,
};
use crate::mutators::grammar::{GrammarMutator, TreeRegistry};
use crate::mutators::{
    DeterministicNondeterministicMutator, Mutator, NRoundMutator, PSelectMutator, RangeMutator,
    RepeatMutator, SequenceMutator,
};
use crate::range_tracker::{RangeSource, ShmRangeSource, RANGE_SHM_SIZE};
use crate::rng::Mt19937;
use crate::sample::Sample;
use crate::sample_trie::SampleTrie;
use crate::server::CoverageServer;
use crate::utils::{ensure_dir, files_in_dir, read_u64, sample_filename, write_u64};
use crate::RunResult;

/// State file terminator, hex("fuzzstat")
const STATE_SENTINEL: u64 = 0x6675_7a7a_7374_6174;

/// The engine-wide scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuzzerState {
    /// One thread must restore `state.dat` before anything else runs
    RestoreNeeded,

    /// Draining the `-in` directory
    InputSampleProcessing,

    /// Draining samples fetched from the federation server
    ServerSampleProcessing,

    /// Corpus empty; the mutator is synthesizing starting samples
    GeneratingSamples,

    /// Steady state: mutating queue entries
    Fuzzing,
}

/// One unit of worker work
enum Job {
    /// Mutate and run the given corpus entry
    Fuzz {
        /// Index into the entry list
        entry_index: usize,
    },

    /// Run a candidate sample once and admit it if interesting
    ProcessSample {
        /// The candidate (input file, server sample, or generated)
        sample: Sample,
    },

    /// Nothing to do; sleep and retry
    Wait,
}

/// State guarded by the queue mutex
struct QueueState {
    all_samples: Vec<Arc<Sample>>,
    all_entries: Vec<Arc<Mutex<CorpusEntry>>>,
    sample_queue: BinaryHeap<QueueKey>,
    input_files: VecDeque<PathBuf>,
    server_samples: VecDeque<Sample>,
    state: FuzzerState,
    samples_pending: usize,
    num_samples_discarded: u64,
    last_save_time: Instant,
    last_server_update_time: Instant,
}

/// State guarded by the crash mutex
#[derive(Default)]
struct CrashStats {
    num_crashes: u64,
    num_unique_crashes: u64,
    unique_crashes: FxHashMap<String, usize>,
}

/// Grammar support shared by mutators, minimizers and the output filter
pub struct GrammarBundle {
    /// The parsed grammar
    pub grammar: Arc<Grammar>,

    /// Interesting derivation trees for splicing
    pub trees: Arc<TreeRegistry>,
}

/// Target-specific behavior supplied by the embedding binary.
///
/// The engine drives everything else; implementations provide the
/// execution backend and may override the mutation stack or filtering.
pub trait FuzzTarget: Send + Sync + 'static {
    /// Create the executor for one worker thread
    fn create_executor(
        &self,
        args: &CommandLineArgs,
        thread_id: usize,
    ) -> Result<Box<dyn Executor>>;

    /// Create the mutation stack for one worker thread
    fn create_mutator(
        &self,
        args: &CommandLineArgs,
        config: &Config,
        grammar: Option<&GrammarBundle>,
    ) -> Result<Box<dyn Mutator>> {
        default_mutator(args, config, grammar)
    }

    /// Create the minimizer for one worker thread
    fn create_minimizer(
        &self,
        _args: &CommandLineArgs,
        config: &Config,
        grammar: Option<&GrammarBundle>,
    ) -> Box<dyn Minimizer> {
        match grammar {
            Some(bundle) => Box::new(GrammarMinimizer::new(
                bundle.grammar.clone(),
                config.grammar_minimization_limit,
            )),
            None => Box::new(SimpleTrimmer),
        }
    }

    /// Rewrite a sample just before delivery; `None` delivers the
    /// original bytes
    fn output_filter(&self, _sample: &Sample) -> Option<Sample> {
        None
    }

    /// Gate admission on the target's return value
    fn is_return_value_interesting(&self, _return_value: u64) -> bool {
        true
    }

    /// Track first-diff offsets of accepted samples as hot offsets even
    /// without `-deterministic_mutations`
    fn track_hot_offsets(&self) -> bool {
        false
    }
}

/// Force a magic prefix onto delivered samples. Returns `None` when the
/// sample already starts with the magic.
#[must_use]
pub fn magic_output_filter(sample: &Sample, magic: &[u8]) -> Option<Sample> {
    let bytes = sample.bytes().unwrap_or(&[]);
    if bytes.len() >= magic.len() && &bytes[..magic.len()] == magic {
        return None;
    }

    let mut filtered = sample.clone();
    if let Some(out) = filtered.bytes_mut() {
        let len = out.len().min(magic.len());
        out[..len].copy_from_slice(&magic[..len]);
    }
    Some(filtered)
}

/// Build the engine's standard mutation stack
pub fn default_mutator(
    args: &CommandLineArgs,
    config: &Config,
    grammar: Option<&GrammarBundle>,
) -> Result<Box<dyn Mutator>> {
    let iterations = config.iterations_per_round;

    if let Some(bundle) = grammar {
        let mutator = GrammarMutator::new(bundle.grammar.clone(), bundle.trees.clone())?;
        return Ok(Box::new(NRoundMutator::new(Box::new(mutator), iterations)));
    }

    let max = config.max_sample_size;

    let mut select = PSelectMutator::new();
    select.add_mutator(Box::new(ByteFlipMutator), 0.8);
    select.add_mutator(Box::new(BlockFlipMutator::new(2, 16, false)), 0.1);
    select.add_mutator(Box::new(BlockFlipMutator::new(1, 64, true)), 0.1);
    select.add_mutator(Box::new(AppendMutator::new(1, 128, max)), 0.05);
    select.add_mutator(Box::new(BlockInsertMutator::new(1, 128, max)), 0.05);
    select.add_mutator(Box::new(BlockDuplicateMutator::new(1, 128, 1, 8, max)), 0.05);
    select.add_mutator(Box::new(InterestingValueMutator::new(true)), 0.1);
    select.add_mutator(Box::new(ArithmeticMutator), 0.1);
    select.add_mutator(Box::new(SpliceMutator::new(1, 0.5, max)), 0.05);
    select.add_mutator(Box::new(SpliceMutator::new(2, 0.5, max)), 0.05);

    let nondet: Box<dyn Mutator> = Box::new(RepeatMutator::new(Box::new(select), 0.5));

    let stack: Box<dyn Mutator> = if args.deterministic_mutations {
        let mut sequence = SequenceMutator::new(false, true);
        sequence.add_mutator(Box::new(DeterministicByteFlipMutator));
        sequence.add_mutator(Box::new(DeterministicInterestingValueMutator::new(true)));

        let nondet_rounds = if args.deterministic_only { 0 } else { iterations };
        Box::new(DeterministicNondeterministicMutator::new(
            Box::new(sequence),
            iterations,
            nondet,
            nondet_rounds,
        ))
    } else {
        Box::new(NRoundMutator::new(nondet, iterations))
    };

    if args.track_ranges {
        return Ok(Box::new(RangeMutator::new(stack)));
    }
    Ok(stack)
}

/// Everything one worker thread owns
struct ThreadContext {
    thread_id: usize,
    executor: Box<dyn Executor>,
    delivery: Box<dyn SampleDelivery>,
    prng: Mt19937,
    mutator: Box<dyn Mutator>,
    minimizer: Box<dyn Minimizer>,
    range_source: Option<Box<dyn RangeSource>>,

    /// Target argv with `@@`/`@@ranges` substituted for this thread
    target_args: Vec<String>,

    /// Copy-on-grow replica of the shared sample list, used by splice
    all_samples_local: Vec<Arc<Sample>>,

    /// Cumulative coverage gate used when incremental coverage is off
    thread_coverage: Coverage,

    /// The restored ignore-set has been pushed to the executor
    coverage_initialized: bool,
}

/// The fuzzing engine
pub struct Fuzzer<T: FuzzTarget> {
    target: T,
    args: CommandLineArgs,
    config: Config,

    sample_dir: PathBuf,
    crash_dir: PathBuf,
    hangs_dir: PathBuf,
    state_file: PathBuf,

    queue: Mutex<QueueState>,
    coverage: Mutex<Coverage>,
    output: Mutex<()>,
    crashes: Mutex<CrashStats>,
    server: Option<Mutex<CoverageClient>>,

    num_samples: AtomicU64,
    num_hangs: AtomicU64,
    total_execs: AtomicU64,

    sample_trie: SampleTrie,
    grammar: Option<GrammarBundle>,

    timeout: Duration,
    init_timeout: Duration,
    corpus_timeout: Duration,
}

impl<T: FuzzTarget> Fuzzer<T> {
    /// Set up directories, configuration and the initial state machine
    pub fn new(target: T, args: CommandLineArgs) -> Result<Self> {
        ensure_dir(&args.out_dir)?;

        let mut config = Config::from_output_dir(&args.out_dir)?;
        args.apply_to_config(&mut config);

        let sample_dir = args.out_dir.join("samples");
        let crash_dir = args.out_dir.join("crashes");
        let hangs_dir = args.out_dir.join("hangs");
        ensure_dir(&sample_dir)?;
        ensure_dir(&crash_dir)?;
        ensure_dir(&hangs_dir)?;

        let timeout = Duration::from_millis(args.timeout.unwrap_or(0x7FFF_FFFF));
        let init_timeout = args.init_timeout.map_or(timeout, Duration::from_millis);
        let corpus_timeout = args.corpus_timeout.map_or(timeout, Duration::from_millis);

        // A malformed grammar is fatal at startup
        let grammar = match &args.grammar {
            Some(path) => Some(GrammarBundle {
                grammar: Arc::new(Grammar::from_file(path)?),
                trees: Arc::new(TreeRegistry::new()),
            }),
            None => None,
        };

        let server = args.server.as_deref().map(|addr| Mutex::new(CoverageClient::new(addr)));

        let (state, input_files) = if args.should_restore() {
            (FuzzerState::RestoreNeeded, VecDeque::new())
        } else {
            let in_dir = args
                .in_dir
                .as_deref()
                .context("No input directory given (use --in)")?;
            let files: VecDeque<PathBuf> = files_in_dir(Path::new(in_dir))?.into();
            if files.is_empty() {
                log::warn!("Input directory is empty");
            } else {
                log::info!("{} input files read", files.len());
            }
            (FuzzerState::InputSampleProcessing, files)
        };

        let state_file = args.out_dir.join("state.dat");

        Ok(Fuzzer {
            target,
            config,
            sample_dir,
            crash_dir,
            hangs_dir,
            state_file,
            queue: Mutex::new(QueueState {
                all_samples: Vec::new(),
                all_entries: Vec::new(),
                sample_queue: BinaryHeap::new(),
                input_files,
                server_samples: VecDeque::new(),
                state,
                samples_pending: 0,
                num_samples_discarded: 0,
                last_save_time: Instant::now(),
                last_server_update_time: Instant::now(),
            }),
            coverage: Mutex::new(Coverage::new()),
            output: Mutex::new(()),
            crashes: Mutex::new(CrashStats::default()),
            server,
            num_samples: AtomicU64::new(0),
            num_hangs: AtomicU64::new(0),
            total_execs: AtomicU64::new(0),
            sample_trie: SampleTrie::new(),
            grammar,
            timeout,
            init_timeout,
            corpus_timeout,
            args,
        })
    }

    /// Whether accepted samples feed the hot-offset machinery
    fn track_hot_offsets(&self) -> bool {
        self.args.deterministic_mutations || self.target.track_hot_offsets()
    }

    /// Build the per-thread context: executor, delivery, PRNG, mutators
    fn create_thread_context(&self, thread_id: usize) -> Result<ThreadContext> {
        let mut target_args = self.args.target_args.clone();

        let delivery: Box<dyn SampleDelivery> = match self.args.delivery.as_str() {
            "file" => {
                let extension = self
                    .args
                    .file_extension
                    .as_deref()
                    .map(|ext| format!(".{ext}"))
                    .unwrap_or_default();
                let path = self
                    .args
                    .out_dir
                    .join(format!("input_{thread_id}{extension}"));
                target_args =
                    replace_target_arg(&target_args, "@@", &path.to_string_lossy());
                Box::new(FileDelivery::new(path))
            }
            "shmem" => {
                let name = format!("/shm_fuzz_{}_{}", std::process::id(), thread_id);
                target_args = replace_target_arg(&target_args, "@@", &name);
                Box::new(ShmDelivery::new(&name, self.config.max_sample_size)?)
            }
            other => bail!(Error::UnknownDeliveryMode(other.to_string())),
        };

        let range_source: Option<Box<dyn RangeSource>> = if self.args.track_ranges {
            let name = format!("/shm_ranges_{}_{}", std::process::id(), thread_id);
            target_args = replace_target_arg(&target_args, "@@ranges", &name);
            Some(Box::new(ShmRangeSource::new(&name, RANGE_SHM_SIZE)?))
        } else {
            None
        };

        Ok(ThreadContext {
            thread_id,
            executor: self.target.create_executor(&self.args, thread_id)?,
            delivery,
            prng: Mt19937::new(),
            mutator: self
                .target
                .create_mutator(&self.args, &self.config, self.grammar.as_ref())?,
            minimizer: self
                .target
                .create_minimizer(&self.args, &self.config, self.grammar.as_ref()),
            range_source,
            target_args,
            all_samples_local: Vec::new(),
            thread_coverage: Coverage::new(),
            coverage_initialized: false,
        })
    }

    /// Start the workers and run the orchestrator loop
    pub fn run(self) -> Result<()> {
        let nthreads = self.args.nthreads.max(1);
        let dry_run = self.args.dry_run;
        let fuzzer = Arc::new(self);

        log::info!("Starting {} worker threads", nthreads);

        let mut workers = Vec::new();
        for thread_id in 1..=nthreads {
            let fuzzer = fuzzer.clone();
            workers.push(std::thread::spawn(move || -> Result<()> {
                let mut tc = fuzzer.create_thread_context(thread_id)?;
                fuzzer.run_fuzzer_thread(&mut tc)
            }));
        }

        let mut last_execs = 0_u64;
        loop {
            std::thread::sleep(Duration::from_secs(1));

            let num_offsets = fuzzer.coverage.lock().unwrap().num_offsets();
            let total_execs = fuzzer.total_execs.load(Ordering::Relaxed);
            let (num_discarded, state) = {
                let qs = fuzzer.queue.lock().unwrap();
                (qs.num_samples_discarded, qs.state)
            };
            let (num_crashes, num_unique) = {
                let crashes = fuzzer.crashes.lock().unwrap();
                (crashes.num_crashes, crashes.num_unique_crashes)
            };

            log::info!(
                "Total execs: {} | Unique samples: {} ({} discarded) | \
                 Crashes: {} ({} unique) | Hangs: {} | Offsets: {} | Execs/s: {}",
                total_execs,
                fuzzer.num_samples.load(Ordering::Relaxed),
                num_discarded,
                num_crashes,
                num_unique,
                fuzzer.num_hangs.load(Ordering::Relaxed),
                num_offsets,
                total_execs - last_execs,
            );
            last_execs = total_execs;

            if state == FuzzerState::Fuzzing && dry_run {
                log::info!("Dry run done");
                std::process::exit(0);
            }

            // A worker death is fatal for the whole engine
            if let Some(index) = workers.iter().position(|w| w.is_finished()) {
                let worker = workers.swap_remove(index);
                match worker.join() {
                    Ok(Ok(())) => bail!("Worker thread exited unexpectedly"),
                    Ok(Err(err)) => return Err(err.context("Worker thread failed")),
                    Err(_) => bail!("Worker thread panicked"),
                }
            }
        }
    }

    /// The worker main loop
    fn run_fuzzer_thread(&self, tc: &mut ThreadContext) -> Result<()> {
        log::debug!("Worker {} starting", tc.thread_id);

        loop {
            let job = self.synchronize_and_get_job(tc)?;

            match job {
                Job::Wait => std::thread::sleep(Duration::from_secs(1)),
                Job::ProcessSample { mut sample } => {
                    self.process_sample(tc, &mut sample)?;
                    self.queue.lock().unwrap().samples_pending -= 1;
                }
                Job::Fuzz { entry_index } => {
                    let discard = self.fuzz_job(tc, entry_index)?;
                    self.fuzz_job_done(entry_index, discard);
                }
            }
        }
    }

    /// Evaluate state transitions and pick this worker's next job.
    /// Runs under the queue lock.
    fn synchronize_and_get_job(&self, tc: &mut ThreadContext) -> Result<Job> {
        let mut qs = self.queue.lock().unwrap();

        // The first thread in restores saved state
        if qs.state == FuzzerState::RestoreNeeded {
            self.restore_state(tc, &mut qs)?;
            qs.state = FuzzerState::InputSampleProcessing;
        }

        // Only checkpoint while fuzzing
        if qs.state == FuzzerState::Fuzzing
            && qs.last_save_time.elapsed() >= self.config.save_interval
        {
            self.save_state(tc, &qs)?;
            qs.last_save_time = Instant::now();
        }

        // After restore, tell the executor to ignore everything already
        // seen so runs report deltas
        if !tc.coverage_initialized {
            if self.args.incremental_coverage {
                let coverage = self.coverage.lock().unwrap();
                tc.executor.ignore_coverage(&coverage);
            }
            tc.coverage_initialized = true;
        }

        // Grow the thread-local sample replica
        if qs.all_samples.len() > tc.all_samples_local.len() {
            tc.all_samples_local
                .extend_from_slice(&qs.all_samples[tc.all_samples_local.len()..]);
        }

        // Periodic federation sync while fuzzing
        if qs.state == FuzzerState::Fuzzing {
            if let Some(server) = &self.server {
                if qs.last_server_update_time.elapsed() >= self.config.server_update_interval {
                    qs.last_server_update_time = Instant::now();
                    let mut fetched = Vec::new();
                    let result = server.lock().unwrap().get_updates(
                        &mut fetched,
                        self.total_execs.load(Ordering::Relaxed),
                    );
                    if let Err(err) = result {
                        log::warn!("Server update failed: {err:#}");
                    }
                    qs.server_samples.extend(fetched);
                    qs.state = FuzzerState::ServerSampleProcessing;
                }
            }
        }

        if qs.state == FuzzerState::InputSampleProcessing
            && qs.input_files.is_empty()
            && qs.samples_pending == 0
        {
            if let Some(server) = &self.server {
                // Seed the server with everything found so far, then pull
                // what the rest of the fleet has
                let mut server = server.lock().unwrap();
                {
                    let coverage = self.coverage.lock().unwrap();
                    if let Err(err) = server.report_new_coverage(&coverage, None) {
                        log::warn!("Coverage report failed: {err:#}");
                    }
                }
                qs.last_server_update_time = Instant::now();
                let mut fetched = Vec::new();
                if let Err(err) =
                    server.get_updates(&mut fetched, self.total_execs.load(Ordering::Relaxed))
                {
                    log::warn!("Server update failed: {err:#}");
                }
                qs.server_samples.extend(fetched);
                qs.state = FuzzerState::ServerSampleProcessing;
            } else {
                qs.state = FuzzerState::Fuzzing;
            }
        }

        if qs.state == FuzzerState::ServerSampleProcessing
            && qs.server_samples.is_empty()
            && qs.samples_pending == 0
        {
            qs.state = FuzzerState::Fuzzing;
        }

        if qs.state == FuzzerState::Fuzzing && self.num_samples.load(Ordering::Relaxed) == 0 {
            if tc.mutator.can_generate() {
                log::info!(
                    "Sample queue is empty, but the mutator supports sample generation"
                );
                log::info!("Will try to generate initial samples");
                qs.state = FuzzerState::GeneratingSamples;
            } else {
                bail!(Error::NoInterestingInputs);
            }
        }

        if qs.state == FuzzerState::GeneratingSamples
            && qs.sample_queue.len() >= self.config.min_samples_to_generate
            && qs.samples_pending == 0
        {
            qs.state = FuzzerState::Fuzzing;
        }

        // Hand out a job according to the state
        let job = match qs.state {
            FuzzerState::Fuzzing if !self.args.dry_run => match qs.sample_queue.pop() {
                Some(key) => Job::Fuzz {
                    entry_index: key.entry,
                },
                None => Job::Wait,
            },
            FuzzerState::InputSampleProcessing => match qs.input_files.pop_front() {
                Some(filename) => {
                    log::info!("Running input sample {filename:?}");
                    let mut sample = Sample::default();
                    sample.load(&filename)?;
                    if sample.size() > self.config.max_sample_size {
                        log::warn!(
                            "Input sample larger than maximum sample size. Will be trimmed"
                        );
                        sample.trim(self.config.max_sample_size);
                    }
                    qs.samples_pending += 1;
                    Job::ProcessSample { sample }
                }
                None => Job::Wait,
            },
            FuzzerState::ServerSampleProcessing => match qs.server_samples.pop_front() {
                Some(sample) => {
                    qs.samples_pending += 1;
                    Job::ProcessSample { sample }
                }
                None => Job::Wait,
            },
            FuzzerState::GeneratingSamples
                if qs.sample_queue.len() < self.config.min_samples_to_generate =>
            {
                let mut sample = Sample::default();
                if tc.mutator.generate(&mut sample, &mut tc.prng) {
                    qs.samples_pending += 1;
                    Job::ProcessSample { sample }
                } else {
                    Job::Wait
                }
            }
            _ => Job::Wait,
        };

        Ok(job)
    }

    /// Requeue or discard a fuzzed entry
    fn fuzz_job_done(&self, entry_index: usize, discard: bool) {
        let mut qs = self.queue.lock().unwrap();
        let entry_arc = qs.all_entries[entry_index].clone();
        let mut entry = entry_arc.lock().unwrap();

        if discard {
            entry.discarded = true;
            qs.num_samples_discarded += 1;
        } else {
            qs.sample_queue.push(QueueKey {
                priority: entry.priority,
                sample_index: entry.sample_index,
                entry: entry_index,
            });
        }
    }

    /// Run one round of mutations against a corpus entry. Returns whether
    /// the entry should be discarded.
    fn fuzz_job(&self, tc: &mut ThreadContext, entry_index: usize) -> Result<bool> {
        let entry_arc = self.queue.lock().unwrap().all_entries[entry_index].clone();

        let base_sample = {
            let mut entry = entry_arc.lock().unwrap();
            entry.sample.ensure_loaded()?;
            let base = entry.sample.clone();

            log::info!("Fuzzing sample {:05}", entry.sample_index);

            let entry = &mut *entry;
            tc.mutator.init_round(&entry.sample, &mut entry.context);
            if self.args.track_ranges {
                tc.mutator.set_ranges(&entry.ranges);
            }
            base
        };

        let mut discard = false;

        loop {
            let mut mutated = base_sample.clone();

            let more = {
                let mut entry = entry_arc.lock().unwrap();
                tc.mutator.mutate(
                    &mut mutated,
                    &mut entry.context,
                    &mut tc.prng,
                    &tc.all_samples_local,
                )
            };
            if !more {
                break;
            }

            if mutated.size() > self.config.max_sample_size {
                continue;
            }

            let (result, has_new_coverage) = self.run_sample(
                tc,
                &mut mutated,
                true,
                true,
                self.init_timeout,
                self.timeout,
                Some(&base_sample),
            )?;

            let mut entry = entry_arc.lock().unwrap();

            // Entries that keep producing float; stale ones sink
            if has_new_coverage {
                entry.priority = 0.0;
            } else {
                entry.priority -= 1.0;
            }
            tc.mutator.notify_result(result, has_new_coverage);

            entry.num_runs += 1;
            if has_new_coverage {
                entry.num_new_coverage += 1;
                if self.track_hot_offsets() {
                    let diff_offset = base_sample.find_first_diff(&mutated);
                    let entry = &mut *entry;
                    tc.mutator.add_hot_offset(&mut entry.context, diff_offset);
                }
            }

            if result == RunResult::Hang {
                entry.num_hangs += 1;
            }
            if result == RunResult::Crash {
                entry.num_crashes += 1;
            }

            if entry.num_hangs > 10
                && entry.num_hangs as f64
                    > entry.num_runs as f64 * self.config.acceptable_hang_ratio
            {
                log::warn!(
                    "Sample {} produces too many hangs. Discarding",
                    entry.sample_index
                );
                discard = true;
                break;
            }
            if entry.num_crashes > 100
                && entry.num_crashes as f64
                    > entry.num_runs as f64 * self.config.acceptable_crash_ratio
            {
                log::warn!(
                    "Sample {} produces too many crashes. Discarding",
                    entry.sample_index
                );
                discard = true;
                break;
            }
        }

        if !self.args.keep_samples_in_memory {
            entry_arc.lock().unwrap().sample.free_memory();
        }

        Ok(discard)
    }

    /// Run a candidate sample once, without trimming or server reporting,
    /// and warn when it contributes nothing
    fn process_sample(&self, tc: &mut ThreadContext, sample: &mut Sample) -> Result<()> {
        sample.ensure_loaded()?;
        let (result, has_new_coverage) = self.run_sample(
            tc,
            sample,
            false,
            false,
            self.init_timeout,
            self.corpus_timeout,
            None,
        )?;

        if result == RunResult::Crash {
            log::warn!("Input sample resulted in a crash");
        } else if result == RunResult::Hang {
            log::warn!("Input sample resulted in a hang");
        } else if !has_new_coverage {
            if self.args.add_all_inputs {
                self.save_sample(tc, sample, self.init_timeout, self.corpus_timeout, None)?;
            } else if self.queue.lock().unwrap().state != FuzzerState::GeneratingSamples {
                log::warn!("Input sample has no new stable coverage");
            }
        }

        Ok(())
    }

    /// Deliver and execute one sample, returning the raw coverage.
    /// Crashes and hangs are persisted here, as soon as they are seen.
    fn run_sample_and_get_coverage(
        &self,
        tc: &mut ThreadContext,
        sample: &Sample,
        coverage: &mut Coverage,
        init_timeout: Duration,
        timeout: Duration,
    ) -> Result<RunResult> {
        // From this point on the sample may be rewritten for delivery;
        // grammar samples are flattened so the target never sees the
        // encoded tree
        let filtered: Option<Sample> = if self.grammar.is_some() {
            Some(Sample::from_bytes(&Grammar::flattened_from_sample(sample)?))
        } else {
            self.target.output_filter(sample)
        };
        let delivered = filtered.as_ref().unwrap_or(sample);

        // Not mutex protected; eventual accuracy is enough here
        self.total_execs.fetch_add(1, Ordering::Relaxed);

        if tc.delivery.deliver(delivered).is_err() {
            log::warn!("Error delivering sample, retrying with a clean target");
            tc.executor.clean_target();
            let mut delivered_ok = false;
            for retry in 0..self.config.delivery_retry_times {
                if tc.delivery.deliver(delivered).is_ok() {
                    log::warn!(
                        "Sample delivery completed successfully after {} retries",
                        retry + 1
                    );
                    delivered_ok = true;
                    break;
                }
                log::warn!("Repeatedly failed to deliver sample, retrying after delay");
                std::thread::sleep(Duration::from_secs(1));
            }
            if !delivered_ok {
                bail!(Error::SampleDeliveryFailed(self.config.delivery_retry_times));
            }
        }

        let result = tc.executor.run(&tc.target_args, init_timeout, timeout);
        *coverage = tc.executor.take_coverage();

        if result == RunResult::Crash {
            self.handle_crash(tc, delivered, init_timeout, timeout)?;
        }

        if result == RunResult::Hang {
            let _output = self.output.lock().unwrap();
            let hang_index = self.num_hangs.fetch_add(1, Ordering::Relaxed);
            if self.args.save_hangs {
                delivered.save(&self.hangs_dir.join(format!("hang_{hang_index}")))?;
            }
        }

        Ok(result)
    }

    /// Reproduce, name, deduplicate and persist a crash
    fn handle_crash(
        &self,
        tc: &mut ThreadContext,
        delivered: &Sample,
        init_timeout: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let mut crash_desc = tc.executor.crash_name();

        if self.config.crash_reproduce_retries > 0
            && self.try_reproduce_crash(tc, delivered, init_timeout, timeout)?
                == RunResult::Crash
        {
            // A reproduced crash gets a hopefully better name
            crash_desc = tc.executor.crash_name();
        } else {
            crash_desc = format!("flaky_{crash_desc}");
        }

        let mut should_save = false;
        let mut duplicates = 0;
        {
            let mut crashes = self.crashes.lock().unwrap();
            let crashes = &mut *crashes;
            crashes.num_crashes += 1;

            let count = crashes.unique_crashes.entry(crash_desc.clone()).or_insert(0);
            if *count == 0 {
                crashes.num_unique_crashes += 1;
            }
            if *count < self.config.max_identical_crashes {
                *count += 1;
                duplicates = *count;
                should_save = true;
            }
        }

        if should_save {
            {
                let _output = self.output.lock().unwrap();
                delivered.save(&self.crash_dir.join(format!("{crash_desc}_{duplicates}")))?;
            }

            if let Some(server) = &self.server {
                let result = server.lock().unwrap().report_crash(delivered, &crash_desc);
                if let Err(err) = result {
                    log::warn!("Crash report failed: {err:#}");
                }
            }
        }

        Ok(())
    }

    /// Re-run a crashing sample under crash analysis until it reproduces
    fn try_reproduce_crash(
        &self,
        tc: &mut ThreadContext,
        sample: &Sample,
        init_timeout: Duration,
        timeout: Duration,
    ) -> Result<RunResult> {
        let mut result = RunResult::OtherError;

        for _ in 0..self.config.crash_reproduce_retries {
            self.total_execs.fetch_add(1, Ordering::Relaxed);

            if tc.delivery.deliver(sample).is_err() {
                log::warn!("Error delivering sample, retrying with a clean target");
                tc.executor.clean_target();
                if tc.delivery.deliver(sample).is_err() {
                    bail!(Error::SampleDeliveryFailed(1));
                }
            }

            result = tc
                .executor
                .run_with_crash_analysis(&tc.target_args, init_timeout, timeout);
            tc.executor.clear_coverage();

            if result == RunResult::Crash {
                return Ok(result);
            }
        }

        Ok(result)
    }

    /// The central pipeline: run, stability-filter, admit, minimize,
    /// save, report. Returns the run result and whether the sample was
    /// admitted for new stable coverage.
    #[allow(clippy::too_many_lines)]
    fn run_sample(
        &self,
        tc: &mut ThreadContext,
        sample: &mut Sample,
        trim: bool,
        report_to_server: bool,
        init_timeout: Duration,
        timeout: Duration,
        original_sample: Option<&Sample>,
    ) -> Result<(RunResult, bool)> {
        let mut initial_coverage = Coverage::new();
        let result = self.run_sample_and_get_coverage(
            tc,
            sample,
            &mut initial_coverage,
            init_timeout,
            timeout,
        )?;

        if result != RunResult::Ok {
            return Ok((result, false));
        }

        if !self
            .target
            .is_return_value_interesting(tc.executor.return_value())
        {
            return Ok((result, false));
        }

        if initial_coverage.is_empty() {
            return Ok((result, false));
        }

        // Secondary gate when the instrumentation reports absolute
        // coverage instead of deltas
        if !self.args.incremental_coverage
            && tc.thread_coverage.difference(&initial_coverage).is_empty()
        {
            return Ok((result, false));
        }

        // The sample produced coverage this thread has not seen; verify
        // how much of it is reproducible
        let mut stable_coverage = initial_coverage.clone();
        let mut total_coverage = initial_coverage;

        if self.args.clean_target_on_coverage {
            tc.executor.clean_target();
        }

        for _ in 0..self.config.coverage_reproduce_retries {
            let mut retry_coverage = Coverage::new();
            let retry_result = self.run_sample_and_get_coverage(
                tc,
                sample,
                &mut retry_coverage,
                init_timeout,
                timeout,
            )?;
            if retry_result != RunResult::Ok {
                return Ok((retry_result, false));
            }

            total_coverage.merge(&retry_coverage);
            stable_coverage = stable_coverage.intersection(&retry_coverage);
        }

        let variable_coverage = stable_coverage.difference(&total_coverage);

        // Linearizable novelty admission: diff and merge atomically
        let (new_stable, new_variable) = {
            let mut fuzzer_coverage = self.coverage.lock().unwrap();
            let new_stable = fuzzer_coverage.difference(&stable_coverage);
            let new_variable = fuzzer_coverage.difference(&variable_coverage);
            fuzzer_coverage.merge(&new_stable);
            fuzzer_coverage.merge(&new_variable);
            (new_stable, new_variable)
        };

        let has_new_coverage = !new_stable.is_empty();

        if has_new_coverage {
            if trim && self.args.minimize_samples {
                self.minimize_sample(tc, sample, &new_stable, init_timeout, timeout)?;
            }

            if report_to_server {
                if let Some(server) = &self.server {
                    let result = server
                        .lock()
                        .unwrap()
                        .report_new_coverage(&new_stable, Some(sample));
                    if let Err(err) = result {
                        log::warn!("Coverage report failed: {err:#}");
                    }
                }
            }

            self.save_sample(tc, sample, init_timeout, timeout, original_sample)?;
        }

        if !new_variable.is_empty() && report_to_server {
            if let Some(server) = &self.server {
                let result = server.lock().unwrap().report_new_coverage(&new_variable, None);
                if let Err(err) = result {
                    log::warn!("Coverage report failed: {err:#}");
                }
            }
        }

        if self.args.incremental_coverage {
            tc.executor.ignore_coverage(&total_coverage);
        } else {
            tc.thread_coverage.merge(&total_coverage);
        }

        Ok((result, has_new_coverage))
    }

    /// Shrink a sample while it keeps reproducing `stable_coverage`
    fn minimize_sample(
        &self,
        tc: &mut ThreadContext,
        sample: &mut Sample,
        stable_coverage: &Coverage,
        init_timeout: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let mut context = tc.minimizer.create_context(sample)?;
        let mut test_sample = sample.clone();

        loop {
            if !tc.minimizer.minimize_step(&mut test_sample, &mut context) {
                break;
            }

            let mut test_coverage = Coverage::new();
            let result = self.run_sample_and_get_coverage(
                tc,
                &test_sample,
                &mut test_coverage,
                init_timeout,
                timeout,
            )?;
            if result != RunResult::Ok {
                break;
            }

            let keeps_coverage = self
                .target
                .is_return_value_interesting(tc.executor.return_value())
                && test_coverage.contains(stable_coverage);

            if keeps_coverage {
                tc.minimizer.report_success(&mut test_sample, &mut context);
                *sample = test_sample.clone();
            } else {
                tc.minimizer.report_fail(&mut test_sample, &mut context);
                test_sample = sample.clone();
            }
        }

        Ok(())
    }

    /// Persist an accepted sample, build its corpus entry, and enqueue it
    fn save_sample(
        &self,
        tc: &mut ThreadContext,
        sample: &Sample,
        init_timeout: Duration,
        timeout: Duration,
        original_sample: Option<&Sample>,
    ) -> Result<()> {
        // The minimizer may have changed which bytes the target reads, so
        // ranges are re-extracted from a fresh run
        let mut ranges = Vec::new();
        if self.args.track_ranges {
            let mut tmp_coverage = Coverage::new();
            let result = self.run_sample_and_get_coverage(
                tc,
                sample,
                &mut tmp_coverage,
                init_timeout,
                timeout,
            )?;
            // A failure here just means the whole sample gets mutated
            if result == RunResult::Ok {
                if let Some(source) = tc.range_source.as_mut() {
                    ranges = source.extract_ranges();
                }
            }
        }

        let (sample_index, outfile) = {
            let _output = self.output.lock().unwrap();
            let sample_index = self.num_samples.fetch_add(1, Ordering::SeqCst);
            let outfile = self.sample_dir.join(sample_filename(sample_index));
            sample.save(&outfile)?;
            (sample_index, outfile)
        };

        let mut new_sample = sample.clone();
        let mut context = tc.mutator.create_context(&new_sample)?;

        if self.track_hot_offsets() {
            if self.args.keep_samples_in_memory {
                let mutation_offset = self.sample_trie.add_sample(&new_sample);
                tc.mutator.add_hot_offset(&mut context, mutation_offset);
            } else if let Some(original) = original_sample {
                let mutation_offset = original.find_first_diff(&new_sample);
                tc.mutator.add_hot_offset(&mut context, mutation_offset);
            }
        }

        new_sample.file_path = Some(outfile);
        if !self.args.keep_samples_in_memory {
            new_sample.free_memory();
        }

        let mut entry = CorpusEntry::new(new_sample, context, sample_index);
        entry.ranges = ranges;

        let snapshot = Arc::new(entry.sample.clone());

        let mut qs = self.queue.lock().unwrap();
        let entry_index = qs.all_entries.len();
        qs.all_samples.push(snapshot);
        qs.all_entries.push(Arc::new(Mutex::new(entry)));
        qs.sample_queue.push(QueueKey {
            priority: 0.0,
            sample_index,
            entry: entry_index,
        });

        Ok(())
    }

    /// Checkpoint the engine into `state.dat`. Runs under the queue lock.
    fn save_state(&self, tc: &ThreadContext, qs: &QueueState) -> Result<()> {
        // Input processing has unprocessed files that a checkpoint would
        // silently drop
        if qs.state == FuzzerState::InputSampleProcessing {
            return Ok(());
        }

        let _output = self.output.lock().unwrap();
        let coverage = self.coverage.lock().unwrap();

        let tmp_file = self.state_file.with_extension("dat.tmp");
        let mut w = std::io::BufWriter::new(
            std::fs::File::create(&tmp_file).context("Error saving state")?,
        );

        write_u64(&mut w, self.num_samples.load(Ordering::SeqCst))?;
        write_u64(&mut w, qs.num_samples_discarded)?;
        write_u64(&mut w, self.total_execs.load(Ordering::Relaxed))?;

        coverage.write_binary(&mut w)?;

        tc.mutator.save_global_state(&mut w)?;

        write_u64(&mut w, qs.all_entries.len() as u64)?;
        for entry_arc in &qs.all_entries {
            let entry = entry_arc.lock().unwrap();
            entry.save(&mut w)?;
            tc.mutator.save_context(&entry.context, &mut w)?;
        }

        if let Some(server) = &self.server {
            server.lock().unwrap().save_state(&mut w)?;
        }

        write_u64(&mut w, STATE_SENTINEL)?;

        std::io::Write::flush(&mut w)?;
        drop(w);
        std::fs::rename(&tmp_file, &self.state_file)?;

        log::debug!("State saved");
        Ok(())
    }

    /// Rebuild the corpus, queue, trie and coverage from `state.dat`
    fn restore_state(&self, tc: &mut ThreadContext, qs: &mut QueueState) -> Result<()> {
        let _output = self.output.lock().unwrap();

        let file = std::fs::File::open(&self.state_file)
            .map_err(|_| Error::MissingStateFile(self.state_file.clone()))?;
        let mut r = std::io::BufReader::new(file);

        self.num_samples.store(read_u64(&mut r)?, Ordering::SeqCst);
        qs.num_samples_discarded = read_u64(&mut r)?;
        self.total_execs.store(read_u64(&mut r)?, Ordering::Relaxed);

        *self.coverage.lock().unwrap() = Coverage::read_binary(&mut r)?;

        tc.mutator.load_global_state(&mut r)?;

        let num_entries = read_u64(&mut r)?;
        for entry_index in 0..num_entries {
            let mut entry = CorpusEntry::load(&mut r)?;

            let outfile = self.sample_dir.join(&entry.sample_filename);
            entry.sample.load(&outfile)?;
            entry.sample.file_path = Some(outfile);

            entry.context = tc.mutator.create_context(&entry.sample)?;
            tc.mutator.load_context(&mut entry.context, &mut r)?;

            if self.track_hot_offsets() && self.args.keep_samples_in_memory {
                self.sample_trie.add_sample(&entry.sample);
            }

            if !self.args.keep_samples_in_memory {
                entry.sample.free_memory();
            }

            qs.all_samples.push(Arc::new(entry.sample.clone()));
            if !entry.discarded {
                qs.sample_queue.push(QueueKey {
                    priority: entry.priority,
                    sample_index: entry.sample_index,
                    entry: usize::try_from(entry_index)?,
                });
            }
            qs.all_entries.push(Arc::new(Mutex::new(entry)));
        }

        if let Some(server) = &self.server {
            server.lock().unwrap().load_state(&mut r)?;
        }

        if read_u64(&mut r)? != STATE_SENTINEL {
            bail!(Error::CorruptStateFile(self.state_file.clone()));
        }

        log::info!(
            "Restored {} samples, {} total execs",
            self.num_samples.load(Ordering::SeqCst),
            self.total_execs.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

/// Library entrypoint: parse the command line and run either the
/// federation server or the fuzzing engine for `target`
pub fn magpie_main<T: FuzzTarget>(target: T) -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = CommandLineArgs::parse();

    if let Some(addr) = args.start_server.clone() {
        log::info!("Running as server");
        let server = CoverageServer::new(&args.out_dir, &addr, args.restore || args.resume)?;
        return server.run();
    }

    Fuzzer::new(target, args)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::Coverage;
    use std::sync::Mutex as StdMutex;

    /// Scripted executor: returns a fixed sequence of coverages, then
    /// repeats the last one forever
    struct ScriptedExecutor {
        script: VecDeque<Coverage>,
        last: Coverage,
        result: RunResult,
        pending: Coverage,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Coverage>, result: RunResult) -> Self {
            ScriptedExecutor {
                script: script.into(),
                last: Coverage::new(),
                result,
                pending: Coverage::new(),
            }
        }
    }

    impl Executor for ScriptedExecutor {
        fn run(
            &mut self,
            _target_args: &[String],
            _init_timeout: Duration,
            _timeout: Duration,
        ) -> RunResult {
            if let Some(coverage) = self.script.pop_front() {
                self.last = coverage;
            }
            self.pending = self.last.clone();
            self.result
        }

        fn take_coverage(&mut self) -> Coverage {
            std::mem::take(&mut self.pending)
        }

        fn clear_coverage(&mut self) {
            self.pending = Coverage::new();
        }

        fn ignore_coverage(&mut self, _coverage: &Coverage) {}

        fn clean_target(&mut self) {}

        fn crash_name(&mut self) -> String {
            "AS_AN_123".to_string()
        }
    }

    struct ScriptedTarget {
        scripts: StdMutex<Vec<(Vec<Coverage>, RunResult)>>,
    }

    impl FuzzTarget for ScriptedTarget {
        fn create_executor(
            &self,
            _args: &CommandLineArgs,
            _thread_id: usize,
        ) -> Result<Box<dyn Executor>> {
            let (script, result) = self.scripts.lock().unwrap().remove(0);
            Ok(Box::new(ScriptedExecutor::new(script, result)))
        }
    }

    fn cov(offsets: &[u64]) -> Coverage {
        let mut coverage = Coverage::new();
        for offset in offsets {
            coverage.insert("t", *offset);
        }
        coverage
    }

    fn test_args(in_dir: &Path, out_dir: &Path) -> CommandLineArgs {
        CommandLineArgs::parse_from([
            "magpie",
            "--in",
            in_dir.to_str().unwrap(),
            "--out",
            out_dir.to_str().unwrap(),
            "--iterations_per_round",
            "3",
            "--minimize_samples=false",
            "--",
            "./target",
            "@@",
        ])
    }

    fn test_dirs(tag: &str) -> (PathBuf, PathBuf) {
        let base = std::env::temp_dir().join(format!("magpie_fuzzer_{tag}_{}", std::process::id()));
        let in_dir = base.join("in");
        let out_dir = base.join("out");
        std::fs::create_dir_all(&in_dir).unwrap();
        std::fs::create_dir_all(&out_dir).unwrap();
        (in_dir, out_dir)
    }

    /// Drive one worker until it would wait, bounded by `max_jobs`
    fn drive<T: FuzzTarget>(fuzzer: &Fuzzer<T>, tc: &mut ThreadContext, max_jobs: usize) {
        for _ in 0..max_jobs {
            match fuzzer.synchronize_and_get_job(tc).unwrap() {
                Job::Wait => return,
                Job::ProcessSample { mut sample } => {
                    fuzzer.process_sample(tc, &mut sample).unwrap();
                    fuzzer.queue.lock().unwrap().samples_pending -= 1;
                }
                Job::Fuzz { entry_index } => {
                    let discard = fuzzer.fuzz_job(tc, entry_index).unwrap();
                    fuzzer.fuzz_job_done(entry_index, discard);
                }
            }
        }
    }

    #[test]
    fn ingest_admits_sample_and_reaches_fuzzing() {
        let (in_dir, out_dir) = test_dirs("ingest");
        std::fs::write(in_dir.join("hello"), b"hello").unwrap();

        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![(vec![cov(&[42])], RunResult::Ok)]),
        };
        let fuzzer = Fuzzer::new(target, test_args(&in_dir, &out_dir)).unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();

        drive(&fuzzer, &mut tc, 10);

        // The input was admitted with its stable coverage
        let saved = std::fs::read(out_dir.join("samples").join("sample_00000")).unwrap();
        assert_eq!(saved, b"hello");
        assert_eq!(*fuzzer.coverage.lock().unwrap(), cov(&[42]));
        assert_eq!(fuzzer.num_samples.load(Ordering::SeqCst), 1);
        assert_eq!(fuzzer.queue.lock().unwrap().state, FuzzerState::Fuzzing);

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn flaky_offsets_become_variable_coverage() {
        let (in_dir, out_dir) = test_dirs("flaky");
        std::fs::write(in_dir.join("hello"), b"hello").unwrap();

        // Initial run sees {42}; one retry adds a flaky {43}
        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![(
                vec![cov(&[42]), cov(&[42, 43]), cov(&[42]), cov(&[42])],
                RunResult::Ok,
            )]),
        };
        let fuzzer = Fuzzer::new(target, test_args(&in_dir, &out_dir)).unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();

        let mut sample = Sample::from_bytes(b"hello");
        let (result, has_new) = fuzzer
            .run_sample(
                &mut tc,
                &mut sample,
                false,
                false,
                fuzzer.init_timeout,
                fuzzer.timeout,
                None,
            )
            .unwrap();

        // Stable {42} admits the sample; flaky {43} is merged but does
        // not admit anything
        assert_eq!(result, RunResult::Ok);
        assert!(has_new);
        assert_eq!(*fuzzer.coverage.lock().unwrap(), cov(&[42, 43]));

        // A second sample re-reporting only the variable offset is not
        // admitted
        let (_, has_new) = fuzzer
            .run_sample(
                &mut tc,
                &mut Sample::from_bytes(b"again"),
                false,
                false,
                fuzzer.init_timeout,
                fuzzer.timeout,
                None,
            )
            .unwrap();
        assert!(!has_new);
        assert_eq!(fuzzer.num_samples.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn identical_crashes_are_deduplicated_on_disk() {
        let (in_dir, out_dir) = test_dirs("crashdedup");

        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![(vec![], RunResult::Crash)]),
        };
        let mut args = test_args(&in_dir, &out_dir);
        args.crash_retry = Some(1);
        let fuzzer = Fuzzer::new(target, args).unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();

        for i in 0..6_u8 {
            let mut sample = Sample::from_bytes(&[i]);
            let (result, has_new) = fuzzer
                .run_sample(
                    &mut tc,
                    &mut sample,
                    false,
                    false,
                    fuzzer.init_timeout,
                    fuzzer.timeout,
                    None,
                )
                .unwrap();
            assert_eq!(result, RunResult::Crash);
            assert!(!has_new);
        }

        // Four files at most, the rest only counted
        for i in 1..=4 {
            assert!(out_dir.join("crashes").join(format!("AS_AN_123_{i}")).exists());
        }
        assert!(!out_dir.join("crashes").join("AS_AN_123_5").exists());

        let crashes = fuzzer.crashes.lock().unwrap();
        assert_eq!(crashes.num_crashes, 6);
        assert_eq!(crashes.num_unique_crashes, 1);
        assert_eq!(crashes.unique_crashes["AS_AN_123"], 4);

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn oversized_inputs_are_trimmed_before_delivery() {
        let (in_dir, out_dir) = test_dirs("oversize");
        std::fs::write(in_dir.join("big"), vec![0x41_u8; 256]).unwrap();

        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![(vec![cov(&[1])], RunResult::Ok)]),
        };
        let mut args = test_args(&in_dir, &out_dir);
        args.max_sample_size = Some(100);
        let fuzzer = Fuzzer::new(target, args).unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();

        let job = fuzzer.synchronize_and_get_job(&mut tc).unwrap();
        match job {
            Job::ProcessSample { sample } => assert_eq!(sample.size(), 100),
            _ => panic!("expected a process-sample job"),
        }

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn checkpoint_roundtrip_restores_queue_and_coverage() {
        let (in_dir, out_dir) = test_dirs("checkpoint");
        std::fs::write(in_dir.join("a"), b"aaaa").unwrap();
        std::fs::write(in_dir.join("b"), b"bbbb").unwrap();

        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![
                // Two executors: one for the saving engine, one for the
                // restoring engine
                (vec![cov(&[1]), cov(&[1]), cov(&[1]), cov(&[1]), cov(&[2])], RunResult::Ok),
                (vec![], RunResult::Ok),
            ]),
        };
        let target = Arc::new(target);

        struct SharedTarget(Arc<ScriptedTarget>);
        impl FuzzTarget for SharedTarget {
            fn create_executor(
                &self,
                args: &CommandLineArgs,
                thread_id: usize,
            ) -> Result<Box<dyn Executor>> {
                self.0.create_executor(args, thread_id)
            }
        }

        let fuzzer = Fuzzer::new(
            SharedTarget(target.clone()),
            test_args(&in_dir, &out_dir),
        )
        .unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();
        drive(&fuzzer, &mut tc, 4);

        let num_samples = fuzzer.num_samples.load(Ordering::SeqCst);
        assert_eq!(num_samples, 2);
        let saved_coverage = fuzzer.coverage.lock().unwrap().clone();

        // Checkpoint, then restore into a fresh engine
        {
            let qs = fuzzer.queue.lock().unwrap();
            fuzzer.save_state(&tc, &qs).unwrap();
        }

        let mut restore_args = test_args(&in_dir, &out_dir);
        restore_args.resume = true;
        let restored = Fuzzer::new(SharedTarget(target), restore_args).unwrap();
        let mut tc2 = restored.create_thread_context(1).unwrap();

        {
            let mut qs = restored.queue.lock().unwrap();
            restored.restore_state(&mut tc2, &mut qs).unwrap();
            assert_eq!(qs.all_entries.len(), 2);
            assert_eq!(qs.sample_queue.len(), 2);
        }
        assert_eq!(restored.num_samples.load(Ordering::SeqCst), num_samples);
        assert_eq!(*restored.coverage.lock().unwrap(), saved_coverage);

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let (in_dir, out_dir) = test_dirs("corrupt");
        std::fs::write(out_dir.join("state.dat"), b"not a state file").unwrap();

        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![(vec![], RunResult::Ok)]),
        };
        let mut args = test_args(&in_dir, &out_dir);
        args.restore = true;
        let fuzzer = Fuzzer::new(target, args).unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();

        assert!(fuzzer.synchronize_and_get_job(&mut tc).is_err());

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn queue_never_holds_discarded_entries() {
        let (in_dir, out_dir) = test_dirs("discard");
        std::fs::write(in_dir.join("seed"), b"seed").unwrap();

        let target = ScriptedTarget {
            scripts: StdMutex::new(vec![(vec![cov(&[9])], RunResult::Ok)]),
        };
        let fuzzer = Fuzzer::new(target, test_args(&in_dir, &out_dir)).unwrap();
        let mut tc = fuzzer.create_thread_context(1).unwrap();
        drive(&fuzzer, &mut tc, 3);

        // Check the entry out of the queue and discard it, as a worker
        // would after too many hangs
        let key = fuzzer.queue.lock().unwrap().sample_queue.pop().unwrap();
        fuzzer.fuzz_job_done(key.entry, true);

        let qs = fuzzer.queue.lock().unwrap();
        assert!(qs.all_entries[0].lock().unwrap().discarded);
        assert!(qs
            .sample_queue
            .iter()
            .all(|key| !qs.all_entries[key.entry].lock().unwrap().discarded));
        assert_eq!(qs.num_samples_discarded, 1);

        let _ = std::fs::remove_dir_all(in_dir.parent().unwrap());
    }

    #[test]
    fn magic_filter_forces_prefix() {
        let sample = Sample::from_bytes(b"XXXXdata");
        let filtered = magic_output_filter(&sample, b"MAGI").unwrap();
        assert_eq!(filtered.bytes().unwrap(), b"MAGIdata");

        // Already-magic samples pass through untouched
        assert!(magic_output_filter(&filtered, b"MAGI").is_none());
    }
}
