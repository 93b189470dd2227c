//! Kernel-wide error types
//!
//! One stable taxonomy shared by every layer. Lower layers surface their
//! own group (`IoError` for storage, `FsError` for the VFS and its
//! drivers); `KernelError` is the top type that `?` converges on.

use core::fmt;

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Top-level kernel error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Kernel heap exhausted
    OutOfMemory,
    /// Physical frame bitmap exhausted
    OutOfFrames,
    /// A fixed-capacity resource (cache slots, table entries) ran out
    ResourcesExhausted,
    /// An offset or length fell outside the addressed object
    OutOfBounds,
    /// Storage-level failure
    Io(IoError),
    /// Filesystem-level failure
    Fs(FsError),
    /// Caller passed an argument the operation cannot accept
    BadArgument,
    /// An internal value was not what the invariant promises
    BadValue,
    /// The backing implementation does not provide this operation
    NotSupported,
    /// Recognized but unfinished code path
    NotImplemented,
    /// Sequential read reached the end of its source
    NoMoreContent,
}

/// Storage and device errors, decoded from controller status where the
/// hardware reports a cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// Read failed without a more specific cause
    ReadError,
    /// Write failed without a more specific cause
    WriteError,
    /// No medium present (or the medium changed under us)
    NoMedia,
    /// Bad block / bad sector reported by the device
    BadSector,
    /// Data read back but failed the device's correction
    UncorrectableData,
    /// Address mark not found
    AddressMarkNotFound,
    /// Device aborted the command
    CommandAborted,
    /// Device signalled an internal fault
    DeviceFault,
    /// Sector address outside the device or not representable
    InvalidAddress,
    /// Requested sector id not found on the medium
    IdNotFound,
}

/// Filesystem errors, produced by the VFS and its back-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component does not exist
    NotFound,
    /// Path component used as a directory is not one
    NotADirectory,
    /// Operation needs a regular file
    NotAFile,
    /// rmdir on a directory that still has entries
    DirNotEmpty,
    /// No registered driver claimed the partition
    NoDriverFound,
    /// Operation requires a root mount and none exists
    NoFsMounted,
    /// Referenced storage device is not registered
    NoDevice,
    /// Referenced partition was not discovered
    NoPartition,
    /// Write on a read-only filesystem
    ReadOnly,
    /// File content could not be read back
    ReadingFile,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of kernel heap memory"),
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::ResourcesExhausted => write!(f, "fixed resource pool exhausted"),
            Self::OutOfBounds => write!(f, "offset or length out of bounds"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Fs(e) => write!(f, "filesystem error: {}", e),
            Self::BadArgument => write!(f, "bad argument"),
            Self::BadValue => write!(f, "unexpected internal value"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NotImplemented => write!(f, "operation not implemented"),
            Self::NoMoreContent => write!(f, "no more content"),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::NoMedia => "no media",
            Self::BadSector => "bad sector",
            Self::UncorrectableData => "uncorrectable data",
            Self::AddressMarkNotFound => "address mark not found",
            Self::CommandAborted => "command aborted",
            Self::DeviceFault => "device fault",
            Self::InvalidAddress => "invalid address",
            Self::IdNotFound => "id not found",
        };
        write!(f, "{}", msg)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "not found",
            Self::NotADirectory => "not a directory",
            Self::NotAFile => "not a file",
            Self::DirNotEmpty => "directory not empty",
            Self::NoDriverFound => "no filesystem driver claimed the partition",
            Self::NoFsMounted => "no filesystem mounted",
            Self::NoDevice => "no such storage device",
            Self::NoPartition => "no such partition",
            Self::ReadOnly => "filesystem is read-only",
            Self::ReadingFile => "error reading file content",
        };
        write!(f, "{}", msg)
    }
}

impl From<IoError> for KernelError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}
