//! A sample is the byte buffer handed to the target for one execution
//!
//! Samples accepted into the corpus always have a stable on-disk file; the
//! in-memory bytes can be evicted with [`Sample::free_memory`] and brought
//! back with [`Sample::ensure_loaded`] so large corpora do not have to stay
//! resident.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A byte buffer that is in memory, on disk, or both
#[derive(Debug, Default, Clone)]
pub struct Sample {
    /// The sample bytes; `None` when evicted to disk
    bytes: Option<Vec<u8>>,

    /// Size in bytes, valid even while the bytes are evicted
    size: usize,

    /// Backing file for evicted samples
    pub file_path: Option<PathBuf>,
}

impl Sample {
    /// Create a sample from the given bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Sample {
            bytes: Some(data.to_vec()),
            size: data.len(),
            file_path: None,
        }
    }

    /// Size of the sample in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The sample bytes, if currently loaded
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// Mutable access to the loaded bytes
    pub fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.bytes.as_mut()
    }

    /// Replace the contents with the given bytes
    pub fn init(&mut self, data: &[u8]) {
        self.bytes = Some(data.to_vec());
        self.size = data.len();
    }

    /// Append bytes to the end of the sample
    pub fn append(&mut self, data: &[u8]) {
        let bytes = self.bytes.get_or_insert_with(Vec::new);
        bytes.extend_from_slice(data);
        self.size = bytes.len();
    }

    /// Shrink the sample to `new_size` bytes. Requests larger than the
    /// current size are ignored.
    pub fn trim(&mut self, new_size: usize) {
        if new_size > self.size {
            return;
        }
        if let Some(bytes) = self.bytes.as_mut() {
            bytes.truncate(new_size);
        }
        self.size = new_size;
    }

    /// Resize the sample; growth zero-fills
    pub fn resize(&mut self, new_size: usize) {
        let bytes = self.bytes.get_or_insert_with(Vec::new);
        bytes.resize(new_size, 0);
        self.size = new_size;
    }

    /// Copy the `[from, to)` byte range into `out`
    pub fn crop(&self, from: usize, to: usize, out: &mut Sample) {
        let bytes = self.bytes.as_deref().unwrap_or(&[]);
        let to = to.min(bytes.len());
        let from = from.min(to);
        out.init(&bytes[from..to]);
    }

    /// First index at which this sample and `other` differ, or the
    /// smaller of the two sizes when one is a prefix of the other
    #[must_use]
    pub fn find_first_diff(&self, other: &Sample) -> usize {
        let a = self.bytes.as_deref().unwrap_or(&[]);
        let b = other.bytes.as_deref().unwrap_or(&[]);
        let max = a.len().min(b.len());
        for i in 0..max {
            if a[i] != b[i] {
                return i;
            }
        }
        max
    }

    /// Write the sample bytes to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.bytes.as_deref().unwrap_or(&[]);
        fs::write(path, bytes).with_context(|| format!("Failed to save sample to {path:?}"))
    }

    /// Load the sample bytes from `path`
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to load sample from {path:?}"))?;
        self.size = bytes.len();
        self.bytes = Some(bytes);
        Ok(())
    }

    /// Bring the bytes back into memory if they were evicted
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.bytes.is_some() {
            return Ok(());
        }
        let path = self
            .file_path
            .clone()
            .context("Sample has no backing file to reload from")?;
        self.load(&path)
    }

    /// Drop the in-memory bytes, keeping the recorded size
    pub fn free_memory(&mut self) {
        self.bytes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_only_shrinks() {
        let mut sample = Sample::from_bytes(b"abcdef");
        sample.trim(10);
        assert_eq!(sample.size(), 6);
        sample.trim(3);
        assert_eq!(sample.bytes().unwrap(), b"abc");
    }

    #[test]
    fn resize_zero_fills() {
        let mut sample = Sample::from_bytes(b"ab");
        sample.resize(4);
        assert_eq!(sample.bytes().unwrap(), b"ab\0\0");
    }

    #[test]
    fn crop_clamps_to_bounds() {
        let sample = Sample::from_bytes(b"0123456789");
        let mut out = Sample::default();
        sample.crop(4, 7, &mut out);
        assert_eq!(out.bytes().unwrap(), b"456");

        sample.crop(8, 100, &mut out);
        assert_eq!(out.bytes().unwrap(), b"89");
    }

    #[test]
    fn first_diff_offsets() {
        let a = Sample::from_bytes(b"AAAA");
        let b = Sample::from_bytes(b"AABA");
        assert_eq!(a.find_first_diff(&b), 2);

        let prefix = Sample::from_bytes(b"AA");
        assert_eq!(a.find_first_diff(&prefix), 2);
        assert_eq!(prefix.find_first_diff(&a), 2);
    }

    #[test]
    fn save_load_evict_reload() {
        let path = std::env::temp_dir().join(format!("magpie_sample_{}", std::process::id()));
        let mut sample = Sample::from_bytes(b"hello");
        sample.save(&path).unwrap();
        sample.file_path = Some(path.clone());

        sample.free_memory();
        assert!(sample.bytes().is_none());
        assert_eq!(sample.size(), 5);

        sample.ensure_loaded().unwrap();
        assert_eq!(sample.bytes().unwrap(), b"hello");

        std::fs::remove_file(path).unwrap();
    }
}
