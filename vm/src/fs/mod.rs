pub mod mem_file;

pub use mem_file::MemFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// fewer bytes were transferred than requested
    ShortTransfer { expected: usize, actual: usize },
    /// offset lies past the end of the file
    OutOfBounds,
    /// no space left on device
    NoSpace,
    /// the underlying device reported an error
    Device,
}

impl core::fmt::Display for FileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ShortTransfer { expected, actual } => {
                write!(f, "short transfer ({actual} of {expected} bytes)")
            }
            Self::OutOfBounds => write!(f, "offset out of bounds"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::Device => write!(f, "device error"),
        }
    }
}

impl core::error::Error for FileError {}

pub type Result<T> = core::result::Result<T, FileError>;

/// A positioned byte store, used for both program images and the swap area.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read, which is less than requested only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset`, growing the file if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Size in bytes.
    fn size(&self) -> u64;

    /// Like [`BackingFile::read_at`], but anything short of a full buffer is an error.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let actual = self.read_at(offset, buf)?;
        if actual != buf.len() {
            return Err(FileError::ShortTransfer {
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Like [`BackingFile::write_at`], but anything short of a full buffer is an error.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let actual = self.write_at(offset, buf)?;
        if actual != buf.len() {
            return Err(FileError::ShortTransfer {
                expected: buf.len(),
                actual,
            });
        }
        Ok(())
    }
}
