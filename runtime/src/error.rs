//! Runtime error taxonomy.
//!
//! Errors are classified, not stringified: every failure carries a kind from
//! the table below and enough context to act on. Nothing is recovered inside
//! the runtime --- errors propagate to the application. The two deliberate
//! exceptions are handled silently where they occur: a matching logic UUID
//! short-circuits reprogramming, and a clock request above the fabric
//! maximum is clamped with a warning.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified runtime failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The bundle archive is missing or could not be extracted.
    #[error("invalid bundle {path}: {reason}")]
    BundleInvalid {
        /// Path to the offending archive.
        path: PathBuf,
        /// What failed.
        reason: String,
    },

    /// `version.json` is missing or holds no `logic_uuid`.
    #[error("could not read logic UUID from {0}")]
    UuidUnreadable(PathBuf),

    /// The system map names a platform outside the known set.
    #[error(transparent)]
    PlatformUnknown(#[from] slash_sysmap::ParseError),

    /// Another process holds the per-BDF device lock.
    #[error("device {0} is locked by another instance")]
    DeviceBusy(String),

    /// No PCIe device answers to the BDF.
    #[error("no device found at {0}")]
    HardwareNotFound(String),

    /// Elevated access to the device could not be obtained.
    #[error("access to device {bdf} denied: {source}")]
    AccessDenied {
        /// Device address.
        bdf: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// PDI download or JTAG script returned non-zero.
    #[error("programming failed: {0}")]
    ProgramFailed(String),

    /// Device boot returned non-OK while running as root.
    #[error("boot failed: {0}")]
    BootFailed(String),

    /// The queue-setup script returned non-zero.
    #[error("QDMA queue setup failed: {0}")]
    QueueSetupFailed(String),

    /// The clock wizard found no divisor triple or never locked.
    #[error("clock not locked at {requested_hz} Hz")]
    ClockNotLocked {
        /// The requested output frequency.
        requested_hz: u64,
    },

    /// The device allocator is exhausted.
    #[error(transparent)]
    OutOfMemory(#[from] slash_alloc::AllocError),

    /// More arguments than the kernel's register file can hold.
    #[error("kernel {kernel}: {args} arguments exceed the register budget")]
    TooManyArguments {
        /// Kernel name.
        kernel: String,
        /// Number of arguments supplied.
        args: usize,
    },

    /// Buffer index beyond the element count.
    #[error("index {index} out of range for buffer of {len} elements")]
    OutOfRange {
        /// Offending index.
        index: usize,
        /// Buffer length in elements.
        len: usize,
    },

    /// A transfer larger than the device allocation backing it.
    #[error("transfer of {requested:#x} bytes exceeds allocation of {allocated:#x}")]
    SizeMismatch {
        /// Bytes the caller asked to move.
        requested: u64,
        /// Bytes backing the buffer on the device.
        allocated: u64,
    },

    /// Short read/write or seek failure on a DMA character device.
    #[error("I/O error on {path}: {reason}")]
    IoError {
        /// Device node involved.
        path: PathBuf,
        /// What failed.
        reason: String,
    },

    /// The messenger could not reach or converse with the sim/emu peer.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The operation has no implementation on this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The system map declares no kernel with this name.
    #[error("no kernel named `{0}` in the system map")]
    KernelNotFound(String),

    /// No QDMA connection matches the kernel/port pair.
    #[error("no QDMA connection for kernel `{kernel}` and port `{port}`")]
    StreamNotFound {
        /// Kernel name looked up.
        kernel: String,
        /// Port (interface) name looked up.
        port: String,
    },

    /// Any other operating-system failure.
    #[error("{context}: {source}")]
    Os {
        /// What the runtime was doing.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wraps an I/O error with a description of the failed operation.
    pub(crate) fn os(context: impl Into<String>, source: io::Error) -> Self {
        Self::Os {
            context: context.into(),
            source,
        }
    }
}
