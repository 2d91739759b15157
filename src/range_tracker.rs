//! Range readout from the instrumented target
//!
//! A target can report which byte ranges of the delivered sample it
//! actually consumed. The ranges end up on the corpus entry and let the
//! range-restricting mutator focus mutations on consumed bytes.

use std::ffi::CString;

use anyhow::{bail, Context, Result};

/// A half-open byte range `[from, to)` within a sample
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Range {
    /// First byte of the range
    pub from: usize,

    /// One past the last byte of the range
    pub to: usize,
}

/// Reads consumed-byte ranges after a target run
pub trait RangeSource: Send {
    /// The ranges recorded by the last run, consolidated and sorted
    fn extract_ranges(&mut self) -> Vec<Range>;
}

/// A source that always reports one fixed range
pub struct ConstantRangeSource {
    range: Range,
}

impl ConstantRangeSource {
    /// Report `[from, to)` for every run
    #[must_use]
    pub fn new(from: usize, to: usize) -> Self {
        ConstantRangeSource {
            range: Range { from, to },
        }
    }
}

impl RangeSource for ConstantRangeSource {
    fn extract_ranges(&mut self) -> Vec<Range> {
        vec![self.range]
    }
}

/// Merge overlapping or touching ranges; the result is sorted and disjoint
#[must_use]
pub fn consolidate_ranges(mut ranges: Vec<Range>) -> Vec<Range> {
    if ranges.is_empty() {
        return ranges;
    }

    ranges.sort();

    let mut out: Vec<Range> = vec![ranges[0]];
    for range in &ranges[1..] {
        let last = out.last_mut().unwrap();
        if range.from <= last.to {
            if range.to > last.to {
                last.to = range.to;
            }
        } else {
            out.push(*range);
        }
    }
    out
}

/// Shared-memory range buffer written by the target: a `u32` count
/// followed by `(from:u32, to:u32)` pairs
pub struct ShmRangeSource {
    /// Region name, unlinked on drop
    name: CString,

    /// Mapping size in bytes
    size: usize,

    /// Base of the mapping
    ptr: *mut u32,

    /// Backing descriptor
    fd: libc::c_int,

    /// Largest pair count the buffer can hold
    max_ranges: usize,
}

unsafe impl Send for ShmRangeSource {}

/// Buffer size sufficient for 1000 ranges
pub const RANGE_SHM_SIZE: usize = 4096 * 2;

impl ShmRangeSource {
    /// Create and map the range buffer under `name`
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let cname = CString::new(name).context("Shared memory name contains a NUL byte")?;

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd == -1 {
            bail!("shm_open({name}) failed: {}", std::io::Error::last_os_error());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            bail!("ftruncate({name}) failed: {err}");
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            bail!("mmap({name}) failed: {err}");
        }

        let ptr = ptr.cast::<u32>();
        unsafe { ptr.write(0) };

        Ok(ShmRangeSource {
            name: cname,
            size,
            ptr,
            fd,
            max_ranges: (size - 4) / 8,
        })
    }
}

impl RangeSource for ShmRangeSource {
    fn extract_ranges(&mut self) -> Vec<Range> {
        let mut num_ranges = unsafe { self.ptr.read() } as usize;
        if num_ranges == 0 {
            return Vec::new();
        }
        if num_ranges > self.max_ranges {
            log::warn!("Number of ranges exceeds buffer size");
            num_ranges = self.max_ranges;
        }

        let mut ranges = Vec::with_capacity(num_ranges);
        for i in 0..num_ranges {
            let from = unsafe { self.ptr.add(1 + i * 2).read() } as usize;
            let to = unsafe { self.ptr.add(2 + i * 2).read() } as usize;
            ranges.push(Range { from, to });
        }

        consolidate_ranges(ranges)
    }
}

impl Drop for ShmRangeSource {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
            libc::close(self.fd);
            libc::shm_unlink(self.name.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidation_merges_overlaps_and_touches() {
        let ranges = vec![
            Range { from: 10, to: 20 },
            Range { from: 0, to: 5 },
            Range { from: 18, to: 25 },
            Range { from: 5, to: 7 },
            Range { from: 40, to: 50 },
        ];
        assert_eq!(
            consolidate_ranges(ranges),
            vec![
                Range { from: 0, to: 7 },
                Range { from: 10, to: 25 },
                Range { from: 40, to: 50 },
            ]
        );
    }

    #[test]
    fn consolidation_of_empty_input() {
        assert!(consolidate_ranges(Vec::new()).is_empty());
    }

    #[test]
    fn constant_source_always_reports_its_range() {
        let mut source = ConstantRangeSource::new(4, 32);
        assert_eq!(source.extract_ranges(), vec![Range { from: 4, to: 32 }]);
        assert_eq!(source.extract_ranges(), vec![Range { from: 4, to: 32 }]);
    }
}
