//! Small utilities: little-endian binary field I/O and directory helpers
//!
//! The checkpoint files and the wire protocol share the same primitive
//! framing: `u64` fields and length-prefixed byte strings, all
//! little-endian.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Write a little-endian `u64` field
pub fn write_u64<W: Write + ?Sized>(w: &mut W, val: u64) -> Result<()> {
    w.write_all(&val.to_le_bytes())?;
    Ok(())
}

/// Read a little-endian `u64` field
pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    let mut buf = [0_u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write a little-endian `f64` field
pub fn write_f64<W: Write + ?Sized>(w: &mut W, val: f64) -> Result<()> {
    w.write_all(&val.to_le_bytes())?;
    Ok(())
}

/// Read a little-endian `f64` field
pub fn read_f64<R: Read + ?Sized>(r: &mut R) -> Result<f64> {
    let mut buf = [0_u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Write a length-prefixed byte string
pub fn write_bytes<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read a length-prefixed byte string
pub fn read_bytes<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let size = read_u64(r)?;
    let mut buf = vec![0_u8; usize::try_from(size)?];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a length-prefixed UTF-8 string
pub fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> Result<()> {
    write_bytes(w, s.as_bytes())
}

/// Read a length-prefixed UTF-8 string
pub fn read_string<R: Read + ?Sized>(r: &mut R) -> Result<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).context("Invalid UTF-8 in string field")
}

/// Create `dir` if it does not already exist
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {dir:?}"))?;
    }
    Ok(())
}

/// List the regular files in `dir`, ignoring subdirectories
pub fn files_in_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {dir:?}"))? {
        let path = entry?.path();
        if path.is_dir() {
            log::debug!("Ignoring directory found in input dir: {path:?}");
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Zero-padded corpus filename for the given sample index
#[must_use]
pub fn sample_filename(index: u64) -> String {
    format!("sample_{index:05}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn u64_field_roundtrip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(buf, [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(read_u64(&mut Cursor::new(&buf)).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn string_field_roundtrip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "sample_00001").unwrap();
        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_string(&mut cursor).unwrap(), "sample_00001");
    }

    #[test]
    fn sample_filenames_are_zero_padded() {
        assert_eq!(sample_filename(0), "sample_00000");
        assert_eq!(sample_filename(123), "sample_00123");
        assert_eq!(sample_filename(123_456), "sample_123456");
    }
}
