//! Unified error type for muaccrs operations.
//!
//! All public functions return `Result<T, Error>` so callers can use `?`
//! freely across modules. `Error::Os` preserves the OS errno verbatim, as
//! every native-syscall fallback promises the caller the same error number
//! they would have gotten without the library in the way.

use thiserror::Error as ThisError;

/// Codec-layer failure: a buffer was too short to hold a record, or a
/// decoded record described more bytes than were actually present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum CodecError {
    #[error("buffer overflow: {needed} bytes needed, {available} available")]
    BufferOverflow { needed: usize, available: usize },
    #[error("truncated record: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("malformed record length")]
    MalformedLength,
}

/// Daemon-channel failure: connect, write, or read against the local
/// stream socket did not complete.
#[derive(Debug, ThisError)]
pub enum ChannelError {
    #[error("daemon channel not connected")]
    NotConnected,
    #[error("daemon channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon response was unparseable")]
    Protocol,
}

/// Unified error type for muaccrs operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A POSIX errno from a failed native syscall. Surfaced verbatim.
    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    /// A null context, empty handle, or other invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The context's refcount was zero or its handle was already released.
    #[error("context is unusable (released or refcount exhausted)")]
    ContextUnusable,

    /// `try_lock` failed; the caller must fall back without mutating the
    /// context. Operations that permit fallback never surface this variant
    /// to their own callers -- it is consumed internally.
    #[error("context is busy")]
    ContextBusy,

    /// The daemon channel could not be used for this request.
    #[error("daemon channel failure: {0}")]
    Channel(#[from] ChannelError),

    /// TLV pack/unpack failure.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    /// An intent-layer `getsockopt` found no matching `(level, name)` entry.
    #[error("intent option not present")]
    OptionMissing,

    /// A native `getaddrinfo` call failed. Carries the raw `EAI_*` return
    /// code so the fallback path surfaces exactly what the caller would
    /// have gotten calling `getaddrinfo` directly, per the fallback-
    /// equivalence requirement. Use [`gai_strerror`] for a human-readable
    /// message.
    #[error("name resolution failed: {0} ({})", gai_strerror(*.0))]
    Resolve(i32),
}

/// Wraps `libc::gai_strerror` for logging and `Error::Resolve`'s `Display`.
pub fn gai_strerror(code: i32) -> String {
    unsafe {
        let msg = libc::gai_strerror(code);
        if msg.is_null() {
            return format!("unknown resolver error {code}");
        }
        std::ffi::CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

pub type Result<T> = core::result::Result<T, Error>;
