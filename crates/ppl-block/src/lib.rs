#![forbid(unsafe_code)]
//! Member device I/O for the partial parity log.
//!
//! Provides the byte-addressed `MemberDevice` trait with file and in-memory
//! backends, the asynchronous `LogSink` the submission pipeline writes
//! through, and the `CompletionQueue` that carries finished I/O back to the
//! log registry.

pub mod completion;
pub mod sink;

pub use completion::{CompletionHandle, CompletionQueue, IoEvent};
pub use sink::{
    InlineLogSink, LogPage, LogRequest, LogSink, LogWriteBatch, MemberSet, ThreadedLogSink,
};

use parking_lot::Mutex;
use ppl_error::{PplError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Byte-addressed member disk (pread/pwrite semantics).
pub trait MemberDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush the device write cache to stable storage.
    fn flush(&self) -> Result<()>;
}

fn check_range(op: &str, offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| PplError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| PplError::Format(format!("{op} range overflows u64")))?;
    if end > dev_len {
        return Err(PplError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed member device (disk image or block device node).
#[derive(Debug, Clone)]
pub struct FileMemberDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileMemberDevice {
    /// Open read-write, falling back to read-only when the file is not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl MemberDevice for FileMemberDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PplError::Io(std::io::Error::from_raw_os_error(
                libc::EROFS,
            )));
        }
        check_range("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory member device with fault injection, used by tests and tooling.
#[derive(Debug)]
pub struct MemoryMemberDevice {
    bytes: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_flushes: AtomicBool,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryMemberDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            fail_writes: AtomicBool::new(false),
            fail_flushes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Make subsequent writes fail with `EIO`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Make subsequent cache flushes fail with `EIO`.
    pub fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::Release);
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }
}

impl MemberDevice for MemoryMemberDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(
            "read",
            offset,
            buf.len(),
            u64::try_from(bytes.len()).unwrap_or(u64::MAX),
        )?;
        let start = usize::try_from(offset)
            .map_err(|_| PplError::Format("read offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(PplError::Io(std::io::Error::other("injected write failure")));
        }
        let mut bytes = self.bytes.lock();
        check_range(
            "write",
            offset,
            buf.len(),
            u64::try_from(bytes.len()).unwrap_or(u64::MAX),
        )?;
        let start = usize::try_from(offset)
            .map_err(|_| PplError::Format("write offset does not fit usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.fail_flushes.load(Ordering::Acquire) {
            return Err(PplError::Io(std::io::Error::other("injected flush failure")));
        }
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl<D: MemberDevice + ?Sized> MemberDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}
