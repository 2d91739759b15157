//! Sample delivery: handing the mutated bytes to the target
//!
//! Two mechanisms, selected with `-delivery`: a plain file drop (the
//! target reads the per-thread input file named by `@@`), or a POSIX
//! shared-memory region the target maps by name. Region layout is a
//! `u32` size prefix followed by the raw bytes.

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::sample::Sample;

/// Hands one sample to the target per call
pub trait SampleDelivery: Send {
    /// Make `sample` visible to the target. Failures are retried by the
    /// engine against a cleaned target before becoming fatal.
    fn deliver(&mut self, sample: &Sample) -> Result<()>;
}

/// Delivery by writing the per-thread input file
pub struct FileDelivery {
    /// The file the target reads, substituted for `@@` in its argv
    path: PathBuf,
}

impl FileDelivery {
    /// Create a delivery writing to `path`
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        FileDelivery { path }
    }
}

impl SampleDelivery for FileDelivery {
    fn deliver(&mut self, sample: &Sample) -> Result<()> {
        sample.save(&self.path)
    }
}

/// Delivery through a POSIX shared-memory region
pub struct ShmDelivery {
    /// Region name, pid- and thread-keyed, unlinked on drop
    name: CString,

    /// Mapping size: `u32` size prefix plus the maximum sample size
    size: usize,

    /// Base of the mapping
    ptr: *mut u8,

    /// Backing descriptor
    fd: libc::c_int,
}

// The raw mapping is owned exclusively by one worker thread
unsafe impl Send for ShmDelivery {}

impl ShmDelivery {
    /// Create and map a shared-memory region of `max_sample_size + 4`
    /// bytes under `name`
    pub fn new(name: &str, max_sample_size: usize) -> Result<Self> {
        let size = max_sample_size + 4;
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

        Ok(ShmDelivery {
            name: cname,
            size,
            ptr: ptr.cast::<u8>(),
            fd,
        })
    }
}

impl SampleDelivery for ShmDelivery {
    fn deliver(&mut self, sample: &Sample) -> Result<()> {
        let bytes = sample.bytes().context("Cannot deliver an unloaded sample")?;
        if bytes.len() + 4 > self.size {
            bail!("Sample of {} bytes does not fit the shared memory region", bytes.len());
        }

        // u32 size prefix, then the raw bytes
        unsafe {
            let len = u32::try_from(bytes.len())?;
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), self.ptr, 4);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(4), bytes.len());
        }
        Ok(())
    }
}

impl Drop for ShmDelivery {
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
    fn file_delivery_writes_exact_bytes() {
        let path = std::env::temp_dir().join(format!("magpie_delivery_{}", std::process::id()));
        let mut delivery = FileDelivery::new(path.clone());
        delivery.deliver(&Sample::from_bytes(b"payload")).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn shm_delivery_writes_size_prefix() {
        let name = format!("/magpie_shm_test_{}", std::process::id());
        let mut delivery = ShmDelivery::new(&name, 64).unwrap();
        delivery.deliver(&Sample::from_bytes(b"abcd")).unwrap();

        unsafe {
            let mut len_bytes = [0_u8; 4];
            std::ptr::copy_nonoverlapping(delivery.ptr, len_bytes.as_mut_ptr(), 4);
            assert_eq!(u32::from_le_bytes(len_bytes), 4);

            let mut data = [0_u8; 4];
            std::ptr::copy_nonoverlapping(delivery.ptr.add(4), data.as_mut_ptr(), 4);
            assert_eq!(&data, b"abcd");
        }
    }

    #[test]
    fn shm_delivery_rejects_oversized_samples() {
        let name = format!("/magpie_shm_big_{}", std::process::id());
        let mut delivery = ShmDelivery::new(&name, 8).unwrap();
        assert!(delivery.deliver(&Sample::from_bytes(&[0; 16])).is_err());
    }
}
