//! Error types for kernel compilation, dispatch and buffer management.

use thiserror::Error;

use crate::diagnostic::Diagnostic;
use crate::kernel::Method;

/// Errors surfaced by this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// No compatible GPU adapter was found.
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    /// Failed to request the GPU device.
    #[error("failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// The kernel source violates the authoring rules.
    #[error("kernel failed to compile\n{rendered}")]
    Authoring {
        diagnostics: Vec<Diagnostic>,
        rendered: String,
    },

    /// A kernel was dispatched through a primitive other than its entrypoint.
    #[error("expected kernel to be invoked via \"{expected}\", but it was invoked via \"{found}\"")]
    MethodMismatch { expected: Method, found: Method },

    /// The read buffer's attributes report different element counts.
    #[error(
        "read buffer attributes incomplete, all sub-buffers must be of the same length. \
         Found {found}. You can mix sub-buffer lengths inside scope buffers."
    )]
    IncompleteRead { found: String },

    /// A buffer operation needs attributes of equal length.
    #[error("sub-buffer {index} has attributes of unequal length. Found {found}")]
    UnequalLengths { index: usize, found: String },

    /// A program samples an input slot that was not bound.
    #[error("kernel reads from the {slot} buffer, but none was bound")]
    MissingInput { slot: &'static str },

    /// A bound buffer lacks an attribute the kernel reads.
    #[error("bound {slot} buffer has no attribute named {name:?}")]
    MissingAttribute { slot: &'static str, name: Option<String> },

    /// Only ranges starting at zero can be dispatched.
    #[error("ranges must start at 0, got [{start}, {end})")]
    UnsupportedRange { start: usize, end: usize },

    /// A flag token that the primitive does not recognise.
    #[error("flag \"{flag}\" is not supported by {method}")]
    UnsupportedFlag { flag: String, method: Method },

    /// A method or flag name that does not exist.
    #[error("unknown {kind} \"{token}\"")]
    UnknownToken { kind: &'static str, token: String },

    /// Pooled resources must have power-of-two sizes.
    #[error("size must be a power of 2, got {0}")]
    NotPowerOfTwo(u64),

    /// Data or buffers whose formats do not fit the operation.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    /// A textual format description could not be parsed.
    #[error("invalid format \"{0}\"")]
    InvalidFormat(String),

    /// The device rejected a generated program.
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Mapping a staging buffer for readback failed.
    #[error("buffer mapping failed: {0}")]
    BufferMapping(String),

    /// Waiting for the device to go idle failed twice in a row.
    #[error("device sync failed: {0}")]
    SyncFailed(String),

    /// Invalid configuration file or environment override.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
