//! Process-wide socket-set registry.
//!
//! `socketconnect`'s "choose an existing socket over a fresh one" branch
//! needs to find every open descriptor whose context already talks to an
//! equivalent destination. This module is that index: a flat list of
//! `(fd, Context)` pairs, searched by [`Address::equivalent`] rather than
//! kept in some family/protocol-keyed tree, since a process rarely has more
//! than a handful of concurrently open sockets.
//!
//! The registry is thread-local, not a shared global: [`Context`] is an
//! `Rc`, not `Send`, so it can only ever be at home on the thread that
//! created it -- exactly like the rest of this crate's state.

use std::cell::RefCell;

use crate::addr::Address;
use crate::context::Context;
use crate::types::Fd;

struct Entry {
    fd: Fd,
    domain: i32,
    socktype: i32,
    protocol: i32,
    remote: Option<Address>,
    ctx: Context,
}

/// The socket-set index itself. Use [`with_global`] to reach the
/// thread-local instance every intercepted call shares.
#[derive(Default)]
pub struct SocketSetRegistry {
    entries: Vec<Entry>,
}

impl SocketSetRegistry {
    pub fn new() -> SocketSetRegistry {
        SocketSetRegistry { entries: Vec::new() }
    }

    /// Register `fd`/`ctx` as an open socket, recording the
    /// `(domain, type, protocol)` triple and remote address the set
    /// equivalence rule keys on.
    pub fn add(&mut self, fd: Fd, ctx: Context) {
        let (domain, socktype, protocol, remote) = ctx.with_data(|d| {
            (d.domain, d.socktype, d.protocol, d.remote_sa.clone())
        });
        self.entries.push(Entry { fd, domain, socktype, protocol, remote, ctx });
    }

    pub fn find_by_fd(&self, fd: Fd) -> Option<&Context> {
        self.entries.iter().find(|e| e.fd == fd).map(|e| &e.ctx)
    }

    /// Every open descriptor whose `(domain, type, protocol)` matches and
    /// whose remote address is [`Address::equivalent`] to `remote` (ports
    /// ignored). This is the candidate list `socketconnect`'s
    /// `socketchoose` branch picks from.
    pub fn find_set_for_ctx(&self, domain: i32, socktype: i32, protocol: i32, remote: &Address) -> Vec<Fd> {
        self.entries
            .iter()
            .filter(|e| {
                e.domain == domain
                    && e.socktype == socktype
                    && e.protocol == protocol
                    && e.remote.as_ref().is_some_and(|r| r.equivalent(remote))
            })
            .map(|e| e.fd)
            .collect()
    }

    /// The descriptor, if any, whose context is identity-equal (same `Rc`)
    /// to `ctx` -- used to detect a context that is already registered
    /// under another fd before adding it again.
    pub fn find_duplicate(&self, ctx: &Context) -> Option<Fd> {
        self.entries.iter().find(|e| e.ctx.ptr_eq(ctx)).map(|e| e.fd)
    }

    pub fn remove(&mut self, fd: Fd) -> Option<Context> {
        let pos = self.entries.iter().position(|e| e.fd == fd)?;
        Some(self.entries.remove(pos).ctx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

thread_local! {
    static GLOBAL: RefCell<SocketSetRegistry> = RefCell::new(SocketSetRegistry::new());
}

/// Run `f` against the thread-local registry every intercepted call shares.
pub fn with_global<R>(f: impl FnOnce(&mut SocketSetRegistry) -> R) -> R {
    GLOBAL.with(|cell| f(&mut cell.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_remote(domain: i32, addr: Address) -> Context {
        let ctx = Context::init();
        ctx.with_data_mut(|d| {
            d.domain = domain;
            d.socktype = libc::SOCK_STREAM;
            d.remote_sa = Some(addr);
        });
        ctx
    }

    #[test]
    fn find_set_for_ctx_ignores_port_and_matches_by_family() {
        let mut reg = SocketSetRegistry::new();
        let a = ctx_with_remote(libc::AF_INET, Address::inet4([93, 184, 216, 34], 80));
        reg.add(Fd::from_raw(3), a);

        let matches = reg.find_set_for_ctx(
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            &Address::inet4([93, 184, 216, 34], 443),
        );
        assert_eq!(matches, vec![Fd::from_raw(3)]);
    }

    #[test]
    fn find_duplicate_uses_identity_not_value_equality() {
        let mut reg = SocketSetRegistry::new();
        let ctx = ctx_with_remote(libc::AF_INET, Address::inet4([127, 0, 0, 1], 80));
        let other = ctx.clone_deep();
        reg.add(Fd::from_raw(4), ctx.retain());

        assert_eq!(reg.find_duplicate(&ctx), Some(Fd::from_raw(4)));
        assert_eq!(reg.find_duplicate(&other), None);
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut reg = SocketSetRegistry::new();
        let ctx = ctx_with_remote(libc::AF_INET, Address::inet4([10, 0, 0, 1], 22));
        reg.add(Fd::from_raw(5), ctx);
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(Fd::from_raw(5)).is_some());
        assert!(reg.is_empty());
    }
}
