//! Unified error type for nbdloop operations.

use thiserror::Error;

/// Errors surfaced by engine construction and the loopback multiplexer.
///
/// Per-command failures never appear here: they travel in-band as the
/// errno field of the NBD reply. Connection-fatal conditions are reported
/// through the engine's shutdown reason instead.
#[derive(Debug, Error)]
pub enum NbdError {
    /// An OS call failed; the wrapped error carries the errno.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No `/dev/nbd*` devices exist (is the nbd module loaded?).
    #[error("no NBD devices present")]
    NoDevices,

    /// Every NBD device is already attached.
    #[error("no free NBD device")]
    NoFreeDevice,

    /// The requested NBD device number is in use or unknown.
    #[error("NBD device {0} is not available")]
    DeviceBusy(u32),

    /// Block size must be a power of two in 512..=65536.
    #[error("invalid block size {0}")]
    InvalidBlockSize(u32),

    /// The kernel-side attach thread failed before entering service.
    #[error("kernel NBD attach failed (errno {0})")]
    KernelAttach(i32),

    /// No attachment registered under the given device path.
    #[error("unknown NBD device {0}")]
    UnknownDevice(String),
}

/// Result type alias for nbdloop operations.
pub type NbdResult<T> = Result<T, NbdError>;
