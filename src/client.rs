//! The coverage client: one engine's view of the federation server
//!
//! Every RPC is a fresh short-lived connection. The server can answer the
//! connect handshake with `'W'` (over capacity), in which case the client
//! backs off exponentially, starting at ten seconds and capping at five
//! minutes. I/O failures inside an RPC close the socket and fail the RPC
//! silently; the next periodic sync retries.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::coverage::Coverage;
use crate::protocol::{
    recv_byte, recv_sample, send_byte, send_coverage, send_sample, send_string, MSG_NONE, MSG_OK,
    MSG_SAMPLE,
};
use crate::rng::secure_random;
use crate::sample::Sample;
use crate::server::parse_host_port;
use crate::utils::{read_u64, write_u64};

/// Initial reconnect backoff
const BACKOFF_INITIAL: Duration = Duration::from_secs(10);

/// Reconnect backoff cap
const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Client command: pull corpus updates
const CMD_UPDATES: u8 = b'U';

/// Client command: report new coverage
const CMD_COVERAGE: u8 = b'S';

/// Client command: report crashes
const CMD_CRASH: u8 = b'X';

/// Client side of the federation protocol
pub struct CoverageClient {
    host: String,
    port: u16,

    /// Random identity reported with update requests
    client_id: u64,

    /// Newest server timestamp this client has fully consumed
    last_timestamp: u64,
}

impl CoverageClient {
    /// Create a client for the server at `host[:port]`
    #[must_use]
    pub fn new(host_port: &str) -> Self {
        let (host, port) = parse_host_port(host_port);

        let mut id_bytes = [0_u8; 8];
        secure_random(&mut id_bytes);

        CoverageClient {
            host,
            port,
            client_id: u64::from_le_bytes(id_bytes),
            last_timestamp: 0,
        }
    }

    /// Open a connection and complete the admission handshake, backing
    /// off while the server is over capacity or unreachable
    fn connect(&self, command: u8) -> TcpStream {
        let mut sleep_time = BACKOFF_INITIAL;
        loop {
            match TcpStream::connect((self.host.as_str(), self.port)) {
                Ok(mut stream) => {
                    let admitted = send_byte(&mut stream, command)
                        .and_then(|()| recv_byte(&mut stream))
                        .map(|reply| reply == MSG_OK);
                    if admitted.unwrap_or(false) {
                        return stream;
                    }
                }
                Err(_) => {
                    log::info!("Connecting to server.");
                }
            }

            std::thread::sleep(sleep_time);
            sleep_time = (sleep_time * 2).min(BACKOFF_MAX);
        }
    }

    /// Report a crashing sample with its deduplication description
    pub fn report_crash(&mut self, crash: &Sample, crash_desc: &str) -> Result<()> {
        let mut stream = self.connect(CMD_CRASH);
        send_byte(&mut stream, MSG_SAMPLE)?;
        send_sample(&mut stream, crash)?;
        send_string(&mut stream, crash_desc)?;
        send_byte(&mut stream, MSG_NONE)?;
        Ok(())
    }

    /// Probe `new_coverage` against the server union; if the server finds
    /// it novel, send the sample that produced it (when there is one)
    pub fn report_new_coverage(
        &mut self,
        new_coverage: &Coverage,
        new_sample: Option<&Sample>,
    ) -> Result<()> {
        let mut stream = self.connect(CMD_COVERAGE);

        send_coverage(&mut stream, new_coverage)?;

        let reply = recv_byte(&mut stream)?;
        if reply == MSG_NONE {
            // Nothing novel fleet-wide
            return Ok(());
        }

        if let Some(sample) = new_sample {
            send_byte(&mut stream, MSG_SAMPLE)?;
            send_sample(&mut stream, sample)?;
        }
        send_byte(&mut stream, MSG_NONE)?;
        Ok(())
    }

    /// Fetch every corpus sample newer than our last sync into
    /// `new_samples`
    pub fn get_updates(&mut self, new_samples: &mut Vec<Sample>, total_execs: u64) -> Result<()> {
        let mut stream = self.connect(CMD_UPDATES);

        write_u64(&mut stream, self.client_id)?;
        write_u64(&mut stream, total_execs)?;
        write_u64(&mut stream, self.last_timestamp)?;

        let server_timestamp = read_u64(&mut stream)?;

        loop {
            let reply = recv_byte(&mut stream)?;
            match reply {
                MSG_NONE => break,
                MSG_SAMPLE => new_samples.push(recv_sample(&mut stream)?),
                other => bail!("Unexpected marker {other:#x} in update stream"),
            }
        }

        self.last_timestamp = server_timestamp;
        Ok(())
    }

    /// Persist the sync position into the engine checkpoint
    pub fn save_state<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.client_id)?;
        write_u64(w, self.last_timestamp)?;
        Ok(())
    }

    /// Restore the sync position from the engine checkpoint
    pub fn load_state<R: Read>(&mut self, r: &mut R) -> Result<()> {
        self.client_id = read_u64(r)?;
        self.last_timestamp = read_u64(r)?;
        Ok(())
    }
}
