//! Common types used across muaccrs.

use std::os::unix::io::RawFd;

/// A file descriptor. Lightweight and copyable; wrap in [`OwnedFd`] for
/// automatic close-on-drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Fd(RawFd);

impl Fd {
    /// Sentinel for "no descriptor yet" -- mirrors the caller's fd-slot
    /// convention in `socketconnect` (a negative slot means "open a new
    /// socket").
    pub const NONE: Fd = Fd(-1);

    pub const fn from_raw(raw: RawFd) -> Self {
        Fd(raw)
    }

    pub const fn raw(self) -> RawFd {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 < 0
    }
}

/// A file descriptor with RAII close-on-drop semantics.
#[derive(Debug)]
pub struct OwnedFd(Fd);

impl OwnedFd {
    pub fn new(fd: Fd) -> Self {
        OwnedFd(fd)
    }

    pub fn fd(&self) -> Fd {
        self.0
    }

    /// Consume self and return the raw `Fd` without closing it.
    pub fn into_raw(self) -> Fd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if !self.0.is_none() {
            let _ = nix::unistd::close(self.0.raw());
        }
    }
}

/// Process-unique opaque context identifier. 128 bits, generated from a
/// process-local counter plus the process id so two contexts in the same
/// process never collide, without pulling in a UUID dependency for a value
/// that is never compared across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u128);

impl ContextId {
    pub fn fresh() -> ContextId {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id() as u128;
        ContextId((pid << 64) | seq as u128)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// Reconstruct a `ContextId` from its wire representation (the `ctxid`
    /// TLV value). Used only when decoding a daemon response that echoes a
    /// context id back; never used to mint a fresh id.
    pub const fn from_u128(raw: u128) -> ContextId {
        ContextId(raw)
    }
}
