//! Wire framing shared by the federation client and server
//!
//! Every value is little-endian. Samples are `size:u64` plus raw bytes,
//! strings are `size:u64` plus UTF-8, and a coverage set is a stream of
//! `'C' <module_name> <num_offsets:u64> <offsets>` records terminated by
//! `'N'`. Reads and writes always transfer the full size.

use std::io::{Read, Write};

use anyhow::{bail, Result};

use crate::coverage::Coverage;
use crate::sample::Sample;
use crate::utils::{read_bytes, read_string, read_u64, write_bytes, write_string, write_u64};

/// Record marker: a coverage module follows
pub const MSG_COVERAGE: u8 = b'C';

/// Record marker: a sample follows
pub const MSG_SAMPLE: u8 = b'S';

/// Stream terminator / negative reply
pub const MSG_NONE: u8 = b'N';

/// Positive reply to a coverage probe
pub const MSG_YES: u8 = b'Y';

/// Admission reply: proceed
pub const MSG_OK: u8 = b'K';

/// Admission reply: server over capacity, back off and retry
pub const MSG_WAIT: u8 = b'W';

/// Send a single command or marker byte
pub fn send_byte<W: Write>(w: &mut W, byte: u8) -> Result<()> {
    w.write_all(&[byte])?;
    Ok(())
}

/// Receive a single command or marker byte
pub fn recv_byte<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0_u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Send a length-framed sample
pub fn send_sample<W: Write>(w: &mut W, sample: &Sample) -> Result<()> {
    let bytes = sample.bytes().unwrap_or(&[]);
    write_bytes(w, bytes)
}

/// Receive a length-framed sample
pub fn recv_sample<R: Read>(r: &mut R) -> Result<Sample> {
    let bytes = read_bytes(r)?;
    Ok(Sample::from_bytes(&bytes))
}

/// Send a length-framed string
pub fn send_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_string(w, s)
}

/// Receive a length-framed string
pub fn recv_string<R: Read>(r: &mut R) -> Result<String> {
    read_string(r)
}

/// Send a coverage set as a terminated stream of module records
pub fn send_coverage<W: Write>(w: &mut W, coverage: &Coverage) -> Result<()> {
    for module in &coverage.modules {
        send_byte(w, MSG_COVERAGE)?;
        write_string(w, &module.module_name)?;
        write_u64(w, module.offsets.len() as u64)?;
        for offset in &module.offsets {
            write_u64(w, *offset)?;
        }
    }
    send_byte(w, MSG_NONE)?;
    Ok(())
}

/// Receive a coverage set, merging repeated module records
pub fn recv_coverage<R: Read>(r: &mut R) -> Result<Coverage> {
    let mut coverage = Coverage::new();
    loop {
        let marker = recv_byte(r)?;
        if marker == MSG_NONE {
            break;
        }
        if marker != MSG_COVERAGE {
            bail!("Unexpected marker {marker:#x} in coverage stream");
        }

        let module_name = read_string(r)?;
        let num_offsets = read_u64(r)?;
        let module = coverage.module_mut(&module_name);
        for _ in 0..num_offsets {
            module.offsets.insert(read_u64(r)?);
        }
    }
    Ok(coverage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sample_framing_roundtrip() {
        let mut buf = Vec::new();
        send_sample(&mut buf, &Sample::from_bytes(b"hello")).unwrap();
        assert_eq!(&buf[..8], &5_u64.to_le_bytes());

        let sample = recv_sample(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(sample.bytes().unwrap(), b"hello");
    }

    #[test]
    fn coverage_framing_roundtrip() {
        let mut coverage = Coverage::new();
        coverage.insert("target.so", 0x1000);
        coverage.insert("target.so", 0x2000);
        coverage.insert("helper.so", 3);

        let mut buf = Vec::new();
        send_coverage(&mut buf, &coverage).unwrap();
        assert_eq!(*buf.last().unwrap(), MSG_NONE);

        let restored = recv_coverage(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(restored, coverage);
    }

    #[test]
    fn empty_coverage_is_just_a_terminator() {
        let mut buf = Vec::new();
        send_coverage(&mut buf, &Coverage::new()).unwrap();
        assert_eq!(buf, vec![MSG_NONE]);
    }

    #[test]
    fn bad_marker_is_rejected() {
        let buf = vec![b'X'];
        assert!(recv_coverage(&mut Cursor::new(&buf)).is_err());
    }
}
