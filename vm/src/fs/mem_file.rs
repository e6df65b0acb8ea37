use super::{BackingFile, FileError, Result};
use crate::sync::Mutex;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicBool, Ordering};

/// A file held entirely in kernel memory.
#[derive(Debug, Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    /// Writes may not grow the file past this many bytes.
    capacity: Option<usize>,
    failing: AtomicBool,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Mutex::new(bytes.into()),
            ..Self::default()
        }
    }

    /// An empty file that refuses to grow past `capacity` bytes.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Make every subsequent transfer fail with [`FileError::Device`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check_device(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(FileError::Device);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_device()?;
        let data = self.data.lock();
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= data.len() {
            // can't read any data
            return Ok(0);
        }
        let read_len = min(buf.len(), data.len() - offset);
        buf[..read_len].copy_from_slice(&data[offset..offset + read_len]);
        Ok(read_len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check_device()?;
        let offset = usize::try_from(offset).map_err(|_| FileError::OutOfBounds)?;
        let end = offset.checked_add(buf.len()).ok_or(FileError::OutOfBounds)?;

        let mut data = self.data.lock();
        let end = match self.capacity {
            Some(capacity) if offset >= capacity => return Err(FileError::NoSpace),
            Some(capacity) => min(end, capacity),
            None => end,
        };
        if end > data.len() {
            data.resize(end, 0);
        }
        let write_len = end - offset;
        data[offset..end].copy_from_slice(&buf[..write_len]);
        Ok(write_len)
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
