//! The coverage server: fleet-wide deduplication of coverage, samples,
//! and crashes
//!
//! One server holds the union of everything its clients have seen. A
//! client RPC is one short-lived TCP connection carrying a single command
//! byte: `'U'` (pull corpus updates since a timestamp), `'S'` (probe and
//! report new coverage plus the samples that produced it), or `'X'`
//! (report crashes). The server admits at most [`MAX_CONNECTIONS`]
//! concurrent handlers; excess connections are told to back off with
//! `'W'`.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;

use crate::coverage::Coverage;
use crate::error::Error;
use crate::protocol::{
    recv_byte, recv_coverage, recv_sample, recv_string, send_byte, send_sample, MSG_NONE, MSG_OK,
    MSG_SAMPLE, MSG_WAIT, MSG_YES,
};
use crate::sample::Sample;
use crate::utils::{ensure_dir, read_u64, sample_filename, write_u64};

/// Maximum concurrently served connections
pub const MAX_CONNECTIONS: usize = 8;

/// Default TCP port when the address has none
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Crash files kept per unique crash description
pub const MAX_SERVER_IDENTICAL_CRASHES: usize = 4;

/// Per-connection receive timeout
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between periodic server state saves
const SERVER_SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval between status lines
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Sorted index entry: samples from `index` on arrived at `timestamp`
#[derive(Debug, Clone, Copy)]
struct TimestampIndex {
    timestamp: u64,
    index: u64,
}

/// The append-only server corpus plus its timestamp index
#[derive(Default)]
struct ServerCorpus {
    samples: Vec<Sample>,
    timestamps: Vec<TimestampIndex>,
}

/// Reader-writer disciplined server state
#[derive(Default)]
struct ServerState {
    total_coverage: Coverage,
    corpus: ServerCorpus,
    server_timestamp: u64,
}

/// Crash bookkeeping, separate from the corpus lock
#[derive(Default)]
struct CrashState {
    num_crashes: u64,
    num_unique_crashes: u64,
    unique_crashes: FxHashMap<String, usize>,
}

/// Parse `host[:port]`, falling back to [`DEFAULT_SERVER_PORT`]
pub fn parse_host_port(host_port: &str) -> (String, u16) {
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host_port.to_string(), DEFAULT_SERVER_PORT),
        },
        None => (host_port.to_string(), DEFAULT_SERVER_PORT),
    }
}

/// The coverage server
pub struct CoverageServer {
    state: RwLock<ServerState>,
    crashes: Mutex<CrashState>,
    num_connections: Mutex<usize>,
    num_samples: AtomicU64,

    out_dir: PathBuf,
    crash_dir: PathBuf,
    sample_dir: PathBuf,

    host: String,
    port: u16,
}

impl CoverageServer {
    /// Create a server writing its state under `out_dir`, optionally
    /// restoring a previous session
    pub fn new(out_dir: &Path, host_port: &str, restore: bool) -> Result<Arc<Self>> {
        let (host, port) = parse_host_port(host_port);

        let crash_dir = out_dir.join("server_crashes");
        let sample_dir = out_dir.join("server_samples");
        ensure_dir(out_dir)?;
        ensure_dir(&crash_dir)?;
        ensure_dir(&sample_dir)?;

        let server = Arc::new(CoverageServer {
            state: RwLock::new(ServerState::default()),
            crashes: Mutex::new(CrashState::default()),
            num_connections: Mutex::new(0),
            num_samples: AtomicU64::new(0),
            out_dir: out_dir.to_path_buf(),
            crash_dir,
            sample_dir,
            host,
            port,
        });

        if restore {
            server.restore_state()?;
        }

        Ok(server)
    }

    /// Bind the listen socket and serve forever
    pub fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .with_context(|| format!("Failed to bind {}:{}", self.host, self.port))?;
        log::info!("Server listening on {}", listener.local_addr()?);

        let status_server = self.clone();
        std::thread::spawn(move || status_server.status_thread());

        self.serve(listener)
    }

    /// Accept loop; public so tests can bind an ephemeral port
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().context("accept failed")?;
            stream.set_read_timeout(Some(RECV_TIMEOUT))?;

            let server = self.clone();
            std::thread::spawn(move || {
                if let Err(err) = server.handle_connection(stream) {
                    log::debug!("Connection from {peer} failed: {err:#}");
                }
            });
        }
    }

    /// Serve one client RPC
    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let command = recv_byte(&mut stream)?;

        let admitted = {
            let mut connections = self.num_connections.lock().unwrap();
            *connections += 1;
            *connections <= MAX_CONNECTIONS
        };

        let result = if admitted {
            send_byte(&mut stream, MSG_OK)?;
            match command {
                b'X' => self.report_crash(&mut stream),
                b'S' => self.report_new_coverage(&mut stream),
                b'U' => self.serve_updates(&mut stream),
                other => {
                    log::warn!("Unknown client command {other:#x}");
                    Ok(())
                }
            }
        } else {
            // Tell the client to wait and retry
            send_byte(&mut stream, MSG_WAIT)?;
            Ok(())
        };

        *self.num_connections.lock().unwrap() -= 1;
        result
    }

    /// First corpus index whose stored timestamp is newer than
    /// `timestamp`; `last_index` when nothing is newer
    fn get_index(timestamps: &[TimestampIndex], timestamp: u64, last_index: u64) -> u64 {
        if timestamp == 0 || timestamps.is_empty() {
            return 0;
        }
        let pos = timestamps.partition_point(|t| t.timestamp <= timestamp);
        match timestamps.get(pos) {
            Some(entry) => entry.index,
            None => last_index,
        }
    }

    /// `'U'`: stream every corpus sample the client has not seen yet
    fn serve_updates(&self, stream: &mut TcpStream) -> Result<()> {
        let client_id = read_u64(stream)?;
        let client_execs = read_u64(stream)?;
        let timestamp = read_u64(stream)?;

        log::info!("Client {client_id:016x} reported {client_execs} total execs");

        let state = self.state.read().unwrap();

        write_u64(stream, state.server_timestamp)?;

        if timestamp >= state.server_timestamp {
            send_byte(stream, MSG_NONE)?;
            return Ok(());
        }

        let first_index = Self::get_index(
            &state.corpus.timestamps,
            timestamp,
            state.corpus.samples.len() as u64,
        );
        if first_index >= state.corpus.samples.len() as u64 {
            send_byte(stream, MSG_NONE)?;
            return Ok(());
        }

        for sample in &state.corpus.samples[usize::try_from(first_index)?..] {
            send_byte(stream, MSG_SAMPLE)?;
            send_sample(stream, sample)?;
        }
        send_byte(stream, MSG_NONE)?;
        Ok(())
    }

    /// `'S'`: probe a coverage set against the union; if novel, pull the
    /// samples behind it and commit under the write lock
    fn report_new_coverage(&self, stream: &mut TcpStream) -> Result<()> {
        let client_coverage = recv_coverage(stream)?;

        // Cheap read-locked probe first
        let new_coverage = {
            let state = self.state.read().unwrap();
            state.total_coverage.difference(&client_coverage)
        };
        if new_coverage.is_empty() {
            send_byte(stream, MSG_NONE)?;
            return Ok(());
        }

        send_byte(stream, MSG_YES)?;

        let mut new_samples = Vec::new();
        loop {
            let marker = recv_byte(stream)?;
            if marker == MSG_NONE {
                break;
            }
            if marker != MSG_SAMPLE {
                anyhow::bail!("Unexpected marker {marker:#x} in sample stream");
            }
            new_samples.push(recv_sample(stream)?);
        }

        let mut state = self.state.write().unwrap();

        // Another client may have reported the same coverage between the
        // probe and this lock, so check again
        let still_new = state.total_coverage.difference(&new_coverage);
        if still_new.is_empty() {
            return Ok(());
        }
        state.server_timestamp += 1;
        let merged = still_new;
        state.total_coverage.merge(&merged);

        if !new_samples.is_empty() {
            let timestamp = state.server_timestamp;
            let index = state.corpus.samples.len() as u64;
            state.corpus.timestamps.push(TimestampIndex { timestamp, index });
        }

        for sample in new_samples {
            let file = self
                .sample_dir
                .join(sample_filename(state.corpus.samples.len() as u64));
            if let Err(err) = sample.save(&file) {
                log::warn!("Failed to persist server sample: {err:#}");
            }
            state.corpus.samples.push(sample);
        }

        self.num_samples
            .store(state.corpus.samples.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Crash descriptions become filenames; anything outside
    /// `[A-Za-z0-9_-]` is dropped
    fn check_filename(desc: &str) -> bool {
        !desc.is_empty()
            && desc
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    /// `'X'`: receive (sample, crash description) pairs and persist the
    /// deduplicated ones
    fn report_crash(&self, stream: &mut TcpStream) -> Result<()> {
        loop {
            let marker = recv_byte(stream)?;
            if marker == MSG_NONE {
                break;
            }
            if marker != MSG_SAMPLE {
                anyhow::bail!("Unexpected marker {marker:#x} in crash stream");
            }

            let sample = recv_sample(stream)?;
            let crash_desc = recv_string(stream)?;

            if !Self::check_filename(&crash_desc) {
                log::warn!("Invalid characters in crash filename");
                continue;
            }

            let mut crashes = self.crashes.lock().unwrap();
            let crashes = &mut *crashes;
            crashes.num_crashes += 1;

            let count = crashes.unique_crashes.entry(crash_desc.clone()).or_insert(0);
            if *count == 0 {
                crashes.num_unique_crashes += 1;
            }
            let duplicates = if *count < MAX_SERVER_IDENTICAL_CRASHES {
                *count += 1;
                Some(*count)
            } else {
                None
            };

            if let Some(duplicates) = duplicates {
                let file = self.crash_dir.join(format!("{crash_desc}_{duplicates}"));
                if let Err(err) = sample.save(&file) {
                    log::warn!("Failed to persist crash sample: {err:#}");
                }
            }
        }
        Ok(())
    }

    /// Persist the corpus index and coverage union to `server_state.dat`
    pub fn save_state(&self) -> Result<()> {
        let state = self.state.read().unwrap();

        let tmp_file = self.out_dir.join("server_state.dat.tmp");
        let out_file = self.out_dir.join("server_state.dat");
        let mut w = std::io::BufWriter::new(std::fs::File::create(&tmp_file)?);

        write_u64(&mut w, state.corpus.samples.len() as u64)?;
        write_u64(&mut w, state.server_timestamp)?;
        state.total_coverage.write_binary(&mut w)?;

        write_u64(&mut w, state.corpus.samples.len() as u64)?;
        write_u64(&mut w, state.corpus.timestamps.len() as u64)?;
        for entry in &state.corpus.timestamps {
            write_u64(&mut w, entry.timestamp)?;
            write_u64(&mut w, entry.index)?;
        }

        drop(w);
        std::fs::rename(&tmp_file, &out_file)?;
        Ok(())
    }

    /// Restore `server_state.dat`, reloading corpus samples from disk
    fn restore_state(&self) -> Result<()> {
        let state_file = self.out_dir.join("server_state.dat");
        let file = std::fs::File::open(&state_file)
            .map_err(|_| Error::MissingStateFile(state_file.clone()))?;
        let mut r = std::io::BufReader::new(file);

        let mut state = self.state.write().unwrap();

        let num_samples = read_u64(&mut r)?;
        state.server_timestamp = read_u64(&mut r)?;
        state.total_coverage = Coverage::read_binary(&mut r)?;

        let corpus_size = read_u64(&mut r)?;
        for i in 0..corpus_size {
            let mut sample = Sample::default();
            sample.load(&self.sample_dir.join(sample_filename(i)))?;
            state.corpus.samples.push(sample);
        }

        let num_timestamps = read_u64(&mut r)?;
        for _ in 0..num_timestamps {
            let timestamp = read_u64(&mut r)?;
            let index = read_u64(&mut r)?;
            state.corpus.timestamps.push(TimestampIndex { timestamp, index });
        }

        self.num_samples.store(num_samples, Ordering::Relaxed);
        log::info!(
            "Restored server state: {} samples, timestamp {}",
            corpus_size,
            state.server_timestamp
        );
        Ok(())
    }

    /// Periodic status line and state save
    fn status_thread(&self) {
        let mut since_last_save = Duration::ZERO;
        loop {
            std::thread::sleep(STATUS_INTERVAL);
            since_last_save += STATUS_INTERVAL;

            {
                let crashes = self.crashes.lock().unwrap();
                log::info!(
                    "Num connections: {}",
                    *self.num_connections.lock().unwrap()
                );
                log::info!("Num samples: {}", self.num_samples.load(Ordering::Relaxed));
                log::info!(
                    "Num crashes: {} ({} unique)",
                    crashes.num_crashes,
                    crashes.num_unique_crashes
                );
            }

            if since_last_save >= SERVER_SAVE_INTERVAL {
                if let Err(err) = self.save_state() {
                    log::warn!("Error saving server state: {err:#}");
                }
                since_last_save = Duration::ZERO;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(parse_host_port("127.0.0.1:9000"), ("127.0.0.1".into(), 9000));
        assert_eq!(
            parse_host_port("10.0.0.1"),
            ("10.0.0.1".into(), DEFAULT_SERVER_PORT)
        );
    }

    #[test]
    fn crash_filenames_are_validated() {
        assert!(CoverageServer::check_filename("AS_AN_123"));
        assert!(CoverageServer::check_filename("sig-11"));
        assert!(!CoverageServer::check_filename("../../etc/passwd"));
        assert!(!CoverageServer::check_filename("a b"));
        assert!(!CoverageServer::check_filename(""));
    }

    #[test]
    fn get_index_finds_first_newer_batch() {
        let timestamps = [
            TimestampIndex { timestamp: 1, index: 0 },
            TimestampIndex { timestamp: 3, index: 2 },
            TimestampIndex { timestamp: 7, index: 5 },
        ];

        // Timestamp zero means everything
        assert_eq!(CoverageServer::get_index(&timestamps, 0, 9), 0);
        // Mid-stream: the first batch strictly newer
        assert_eq!(CoverageServer::get_index(&timestamps, 1, 9), 2);
        assert_eq!(CoverageServer::get_index(&timestamps, 2, 9), 2);
        assert_eq!(CoverageServer::get_index(&timestamps, 3, 9), 5);
        // Fully caught up
        assert_eq!(CoverageServer::get_index(&timestamps, 7, 9), 9);
        assert_eq!(CoverageServer::get_index(&timestamps, 100, 9), 9);
        // No batches at all
        assert_eq!(CoverageServer::get_index(&[], 5, 9), 0);
    }
}
