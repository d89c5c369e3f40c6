//! The per-flow context: the aggregate every intercepted call mutates and
//! every daemon round trip serializes.
//!
//! A [`Context`] is a shared handle (`Rc`) around a [`ContextData`] value.
//! Rust's own `Rc` strong count *is* the `refcount` invariant from the
//! specification -- there is no separate manual counter to keep in sync, so
//! [`Context::refcount`] reads `Rc::strong_count` directly. The non-
//! reentrancy flag sits outside the `RefCell` as a plain `AtomicBool` so
//! `try_lock` is the exchange-and-test primitive the design calls for,
//! independent of whatever borrow is in flight on the data.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::addr::Address;
use crate::addrinfo::AddrInfo;
use crate::channel::DaemonChannel;
use crate::sockopt::SocketOptionList;
use crate::types::ContextId;

bitflags! {
    /// Bitset over which intercepted calls this context has seen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallsPerformed: u8 {
        const SOCKET      = 0b00001;
        const BIND        = 0b00010;
        const CONNECT     = 0b00100;
        const CLOSE       = 0b01000;
        const GETADDRINFO = 0b10000;
    }
}

/// The mutable data a [`Context`] owns. Every nested value here (addresses,
/// addrinfo chains, strings, option lists) is uniquely owned by this
/// struct; `clone_deep` is the only way to duplicate it.
#[derive(Debug, Default)]
pub struct ContextData {
    pub id: Option<ContextId>,
    pub calls_performed: CallsPerformed,

    pub domain: i32,
    pub socktype: i32,
    pub protocol: i32,

    pub remote_hostname: Option<String>,
    pub remote_service: Option<String>,
    pub remote_port: u16,

    pub remote_addrinfo_hint: Option<AddrInfo>,
    pub remote_addrinfo_res: Option<AddrInfo>,

    pub bind_sa_req: Option<Address>,
    pub bind_sa_suggested: Option<Address>,

    /// The caller's requested remote address (`remote_sa_req` on the
    /// wire). Never overwritten by a daemon response -- see
    /// `remote_sa_suggested` for the daemon's rewrite.
    pub remote_sa: Option<Address>,
    /// The daemon's suggested remote address (`remote_sa_res` on the
    /// wire), paired with `remote_sa` the same way `bind_sa_suggested`
    /// pairs with `bind_sa_req`. `connect` dials this when present,
    /// falling back to `remote_sa` otherwise.
    pub remote_sa_suggested: Option<Address>,

    pub sockopts_current: SocketOptionList,
    pub sockopts_suggested: SocketOptionList,

    pub inode: u64,

    /// The daemon channel is not part of the deep-clone graph: `clone`
    /// always produces a context with a fresh, absent channel, and the
    /// channel is never serialized.
    #[allow(clippy::type_complexity)]
    pub mamsock: Option<DaemonChannel>,
}

impl Clone for ContextData {
    /// The daemon channel never survives a clone -- see the field comment
    /// on `mamsock` -- so this is the one field a derived `Clone` would get
    /// wrong, and the reason this impl is written by hand.
    fn clone(&self) -> Self {
        ContextData {
            id: self.id,
            calls_performed: self.calls_performed,
            domain: self.domain,
            socktype: self.socktype,
            protocol: self.protocol,
            remote_hostname: self.remote_hostname.clone(),
            remote_service: self.remote_service.clone(),
            remote_port: self.remote_port,
            remote_addrinfo_hint: self.remote_addrinfo_hint.clone(),
            remote_addrinfo_res: self.remote_addrinfo_res.clone(),
            bind_sa_req: self.bind_sa_req.clone(),
            bind_sa_suggested: self.bind_sa_suggested.clone(),
            remote_sa: self.remote_sa.clone(),
            remote_sa_suggested: self.remote_sa_suggested.clone(),
            sockopts_current: self.sockopts_current.clone(),
            sockopts_suggested: self.sockopts_suggested.clone(),
            inode: self.inode,
            mamsock: None,
        }
    }
}

impl ContextData {
    /// Record a natively-resolved addrinfo chain, mirroring the original
    /// client's behavior of writing the result into the context even when
    /// the resolution happened locally rather than via the daemon.
    pub fn record_resolved_addrinfo(&mut self, res: AddrInfo) {
        self.remote_addrinfo_res = Some(res);
    }

    /// Validates the invariant that, once `remote_sa` is set for an inet
    /// domain, its family matches `domain`.
    pub fn remote_sa_family_matches_domain(&self) -> bool {
        match (&self.remote_sa, self.domain) {
            (Some(addr), d) if d == libc::AF_INET || d == libc::AF_INET6 => {
                addr.family() as i32 == d
            }
            _ => true,
        }
    }
}

struct ContextShared {
    lock: AtomicBool,
    data: RefCell<ContextData>,
}

/// Shared, reference-counted handle to a [`ContextData`]. Two `Context`
/// values produced by [`Context::retain`] point at the same data and are
/// identity-equal (see [`Context::ptr_eq`], used by the socket-set registry
/// to find duplicates); a value produced by [`Context::clone_deep`] owns an
/// independent copy.
#[derive(Clone)]
pub struct Context(Rc<ContextShared>);

impl Context {
    /// Fresh context: refcount 1, lock clear, no daemon channel, fresh id.
    pub fn init() -> Context {
        let mut data = ContextData::default();
        data.id = Some(ContextId::fresh());
        Context(Rc::new(ContextShared { lock: AtomicBool::new(false), data: RefCell::new(data) }))
    }

    /// Deep copy: independent data, refcount 1, fresh (absent) channel.
    pub fn clone_deep(&self) -> Context {
        let mut data = self.0.data.borrow().clone();
        data.id = Some(ContextId::fresh());
        data.mamsock = None;
        Context(Rc::new(ContextShared { lock: AtomicBool::new(false), data: RefCell::new(data) }))
    }

    /// Share this context: bumps the `Rc` strong count. Returns the new
    /// handle; `refcount()` reflects the bump.
    pub fn retain(&self) -> Context {
        Context(Rc::clone(&self.0))
    }

    /// Drop one reference. Returns the strong count that remains after this
    /// handle is gone. When that count reaches zero the owned graph (and
    /// the daemon channel, if any) is freed by `ContextData`'s ordinary
    /// `Drop` glue -- there is no separate free pass to write.
    pub fn release(self) -> usize {
        let remaining = Rc::strong_count(&self.0) - 1;
        drop(self);
        remaining
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Identity comparison: do two handles refer to the same context?
    /// This is what the socket-set registry's `find_duplicate` uses.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Acquire the non-reentrancy flag. `false` means the caller must fall
    /// back without mutating the context; this never blocks.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.0
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.0.lock.store(false, Ordering::Release);
    }

    /// Run `f` with a shared borrow of the context data. Side-effect-free
    /// with respect to the context itself.
    pub fn with_data<R>(&self, f: impl FnOnce(&ContextData) -> R) -> R {
        f(&self.0.data.borrow())
    }

    /// Run `f` with a mutable borrow. Callers must hold the lock (see
    /// `try_lock`) before calling this from the call surface.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut ContextData) -> R) -> R {
        f(&mut self.0.data.borrow_mut())
    }

    /// Human-readable rendering. Side-effect-free.
    pub fn print(&self) -> String {
        let data = self.0.data.borrow();
        format!(
            "Context {{ id: {:?}, calls: {:?}, domain: {}, socktype: {}, protocol: {}, \
             remote_hostname: {:?}, remote_port: {}, remote_sa: {:?}, remote_sa_suggested: {:?}, \
             bind_sa_req: {:?}, sockopts_current: {} entries, sockopts_suggested: {} entries, \
             refcount: {} }}",
            data.id,
            data.calls_performed,
            data.domain,
            data.socktype,
            data.protocol,
            data.remote_hostname,
            data.remote_port,
            data.remote_sa,
            data.remote_sa_suggested,
            data.bind_sa_req,
            data.sockopts_current.len(),
            data.sockopts_suggested.len(),
            self.refcount(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_retain_release_matches_the_refcount_lifecycle() {
        let c = Context::init();
        assert_eq!(c.refcount(), 1);
        let r = c.retain();
        assert_eq!(r.refcount(), 2);
        assert_eq!(r.release(), 1);
        assert_eq!(c.refcount(), 1);
        assert_eq!(c.release(), 0);
    }

    #[test]
    fn clone_deep_is_independent_and_unlocked() {
        let c = Context::init();
        c.with_data_mut(|d| d.remote_port = 8080);
        let cloned = c.clone_deep();
        assert_eq!(cloned.refcount(), 1);
        cloned.with_data_mut(|d| d.remote_port = 1234);
        assert_eq!(c.with_data(|d| d.remote_port), 8080);
        assert!(!cloned.ptr_eq(&c));
    }

    #[test]
    fn try_lock_is_exclusive() {
        let c = Context::init();
        assert!(c.try_lock());
        assert!(!c.try_lock());
        c.unlock();
        assert!(c.try_lock());
    }

    #[test]
    fn retain_shares_identity_release_drops_the_handle() {
        let c = Context::init();
        let shared = c.retain();
        assert!(c.ptr_eq(&shared));
        let other = Context::init();
        assert!(!c.ptr_eq(&other));
    }
}
