use crate::fs::FileError;
use core::fmt;

/// How far a [`VmError`] reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The faulting process has been torn down and its thread must exit.
    Process,
    /// The kernel cannot continue.
    Kernel,
    /// The faulting operation failed. The process may still be running.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// write through a read-only mapping
    ProtectionViolation,
    /// the address is not in any region
    SegmentationFault,
    /// the process owns no resident page to evict
    NoVictim,
    /// every swap slot is in use
    SwapExhausted,
    /// the swap file could not be grown to its configured size
    SwapTooSmall,
    /// the subsystem could not be brought up
    BootstrapFailed,
    /// the victim frame changed hands while it was being swapped out
    VictimLost,
    Io(FileError),
}

impl VmError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::ProtectionViolation | Self::SegmentationFault | Self::NoVictim => {
                Severity::Process
            }
            Self::SwapExhausted | Self::SwapTooSmall | Self::BootstrapFailed => Severity::Kernel,
            Self::VictimLost | Self::Io(_) => Severity::Fault,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtectionViolation => write!(f, "write to read-only page"),
            Self::SegmentationFault => write!(f, "segmentation fault"),
            Self::NoVictim => write!(f, "no resident page to evict"),
            Self::SwapExhausted => write!(f, "out of swap space"),
            Self::SwapTooSmall => write!(f, "swap file smaller than configured size"),
            Self::BootstrapFailed => write!(f, "virtual memory bootstrap failed"),
            Self::VictimLost => write!(f, "eviction victim was released concurrently"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<FileError> for VmError {
    fn from(err: FileError) -> Self {
        Self::Io(err)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
