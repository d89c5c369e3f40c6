//! The intercepted call surface.
//!
//! Every operation here follows the same shape: acquire the context's
//! non-reentrancy flag, mutate the context from the caller's arguments,
//! consult the daemon if the operation has one, then perform the native
//! call using whatever the daemon rewrote (or the caller's original values
//! if it didn't answer). Every failure edge that has a native equivalent
//! falls back to it transparently; `socketconnect` is the one operation
//! with no native equivalent to fall back to.

use std::ffi::{c_void, CString};
use std::os::unix::io::RawFd;

use crate::addr::{Address, Family};
use crate::addrinfo::AddrInfo;
use crate::channel::DaemonChannel;
use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::registry;
use crate::sockopt::{SockOptFlags, SocketOption, SocketOptionList, INTENTS};
use crate::tlv::Action;
use crate::types::Fd;

fn os_result(ret: i32) -> Result<i32> {
    if ret < 0 {
        Err(Error::Os(nix::errno::Errno::last()))
    } else {
        Ok(ret)
    }
}

fn fd_inode(fd: RawFd) -> u64 {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } == 0 {
        st.st_ino
    } else {
        0
    }
}

/// Create a socket, recording the `(domain, type, protocol)` triple and the
/// resulting descriptor's inode in `ctx`. Always performs the native call;
/// there is no daemon round trip for `socket` itself.
pub fn socket(ctx: &Context, domain: i32, socktype: i32, protocol: i32) -> Result<Fd> {
    if !ctx.try_lock() {
        let raw = os_result(unsafe { libc::socket(domain, socktype, protocol) })?;
        return Ok(Fd::from_raw(raw));
    }
    let result = (|| {
        let raw = os_result(unsafe { libc::socket(domain, socktype, protocol) })?;
        ctx.with_data_mut(|d| {
            d.domain = domain;
            d.socktype = socktype;
            d.protocol = protocol;
            d.inode = fd_inode(raw);
            d.calls_performed.insert(crate::context::CallsPerformed::SOCKET);
        });
        Ok(Fd::from_raw(raw))
    })();
    ctx.unlock();
    result
}

fn native_resolve(host: Option<&str>, service: Option<&str>, hints: Option<&AddrInfo>) -> Result<AddrInfo> {
    let node = host.map(|h| CString::new(h).map_err(|_| Error::InvalidArgument("host contains NUL"))).transpose()?;
    let serv = service.map(|s| CString::new(s).map_err(|_| Error::InvalidArgument("service contains NUL"))).transpose()?;

    let mut native_hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    if let Some(h) = hints {
        native_hints.ai_family = h.family;
        native_hints.ai_socktype = h.socktype;
        native_hints.ai_protocol = h.protocol;
        native_hints.ai_flags = h.flags;
    }

    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(
            node.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
            serv.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null()),
            hints.map(|_| &native_hints as *const libc::addrinfo).unwrap_or(std::ptr::null()),
            &mut res,
        )
    };
    if rc != 0 {
        return Err(Error::Resolve(rc));
    }

    let mut nodes = Vec::new();
    unsafe {
        let mut cur = res;
        while !cur.is_null() {
            let ai = &*cur;
            let mut node = AddrInfo::new(ai.ai_family, ai.ai_socktype, ai.ai_protocol);
            node.flags = ai.ai_flags;
            if !ai.ai_addr.is_null() && ai.ai_addrlen > 0 {
                let bytes = std::slice::from_raw_parts(ai.ai_addr as *const u8, ai.ai_addrlen as usize);
                if let Some(family) = Family::from_raw(ai.ai_family) {
                    node.addr = Address::from_raw(family, bytes).ok();
                }
            }
            if !ai.ai_canonname.is_null() {
                node.canonname = Some(std::ffi::CStr::from_ptr(ai.ai_canonname).to_string_lossy().into_owned());
            }
            nodes.push(node);
            cur = ai.ai_next;
        }
        libc::freeaddrinfo(res);
    }
    AddrInfo::from_nodes(nodes).ok_or(Error::Resolve(libc::EAI_NODATA))
}

/// Resolve `host`/`service`, consulting the daemon first. If the daemon
/// names a resolved chain, that chain is cloned into the return value;
/// otherwise a native resolve runs and its result is recorded in the
/// context exactly as if the daemon had supplied it.
pub fn getaddrinfo(ctx: &Context, host: Option<&str>, service: Option<&str>, hints: Option<&AddrInfo>) -> Result<AddrInfo> {
    if !ctx.try_lock() {
        return native_resolve(host, service, hints);
    }
    let result = (|| {
        ctx.with_data_mut(|d| {
            d.remote_hostname = host.map(str::to_string);
            d.remote_service = service.map(str::to_string);
            d.remote_addrinfo_hint = hints.cloned();
            d.remote_addrinfo_res = None;
            d.calls_performed.insert(crate::context::CallsPerformed::GETADDRINFO);
        });

        let response = daemon_roundtrip(ctx, Action::GetaddrinfoResolveReq);
        match response {
            Ok(resp) if resp.remote_addrinfo.is_some() => Ok(resp.remote_addrinfo.unwrap()),
            _ => {
                let resolved = native_resolve(host, service, hints)?;
                ctx.with_data_mut(|d| d.record_resolved_addrinfo(resolved.clone()));
                Ok(resolved)
            }
        }
    })();
    ctx.unlock();
    result
}

/// Native `bind`, recording the request address on success. No daemon
/// round trip -- `bind` alone never consults the policy engine.
pub fn bind(ctx: &Context, fd: Fd, addr: &Address) -> Result<()> {
    native_bind(fd.raw(), addr)?;
    if ctx.try_lock() {
        ctx.with_data_mut(|d| {
            d.bind_sa_req = Some(addr.clone());
            d.calls_performed.insert(crate::context::CallsPerformed::BIND);
        });
        ctx.unlock();
    }
    Ok(())
}

fn native_bind(fd: RawFd, addr: &Address) -> Result<()> {
    match addr {
        Address::Inet4 { .. } => nix::sys::socket::bind(fd, &addr.to_nix_inet4().unwrap()).map_err(Error::Os),
        Address::Inet6 { .. } => nix::sys::socket::bind(fd, &addr.to_nix_inet6().unwrap()).map_err(Error::Os),
        Address::Unix { .. } => nix::sys::socket::bind(fd, &addr.to_nix_unix().ok_or(Error::InvalidArgument("unix path"))?).map_err(Error::Os),
    }
}

fn native_connect(fd: RawFd, addr: &Address) -> Result<()> {
    match addr {
        Address::Inet4 { .. } => nix::sys::socket::connect(fd, &addr.to_nix_inet4().unwrap()).map_err(Error::Os),
        Address::Inet6 { .. } => nix::sys::socket::connect(fd, &addr.to_nix_inet6().unwrap()).map_err(Error::Os),
        Address::Unix { .. } => nix::sys::socket::connect(fd, &addr.to_nix_unix().ok_or(Error::InvalidArgument("unix path"))?).map_err(Error::Os),
    }
}

fn native_setsockopt(fd: RawFd, level: i32, name: i32, value: &[u8]) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(fd, level, name, value.as_ptr() as *const c_void, value.len() as libc::socklen_t)
    };
    os_result(ret).map(|_| ())
}

fn native_getsockopt(fd: RawFd, level: i32, name: i32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 128];
    let mut len = buf.len() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(fd, level, name, buf.as_mut_ptr() as *mut c_void, &mut len)
    };
    os_result(ret)?;
    buf.truncate(len as usize);
    Ok(buf)
}

/// `level == INTENTS` stores the value purely in the context; any other
/// level reaches the kernel and, on success, is also mirrored into
/// `sockopts_current` by name.
pub fn setsockopt(ctx: &Context, fd: Fd, level: i32, name: i32, value: &[u8]) -> Result<()> {
    if level == INTENTS {
        if !ctx.try_lock() {
            return Err(Error::ContextBusy);
        }
        ctx.with_data_mut(|d| {
            d.sockopts_current.set(SocketOption::new(level, name, value.to_vec(), SockOptFlags::IS_SET));
        });
        ctx.unlock();
        return Ok(());
    }

    native_setsockopt(fd.raw(), level, name, value)?;
    if ctx.try_lock() {
        ctx.with_data_mut(|d| {
            d.sockopts_current.set(SocketOption::new(level, name, value.to_vec(), SockOptFlags::IS_SET));
        });
        ctx.unlock();
    }
    Ok(())
}

/// `level == INTENTS` looks the option up in `sockopts_current` without
/// touching the kernel, failing with `OptionMissing` when absent. Any
/// other level performs a native `getsockopt`.
pub fn getsockopt(ctx: &Context, fd: Fd, level: i32, name: i32) -> Result<Vec<u8>> {
    if level == INTENTS {
        return ctx.with_data(|d| d.sockopts_current.find(level, name).map(|o| o.value.clone()).ok_or(Error::OptionMissing));
    }
    native_getsockopt(fd.raw(), level, name)
}

fn daemon_roundtrip(ctx: &Context, action: Action) -> Result<crate::channel::DaemonResponse> {
    // Taken out of `ctx` for the duration of the call so `request` can
    // borrow the rest of the context mutably without aliasing `mamsock`
    // itself; put back regardless of outcome so the connection survives
    // to the next request.
    let mut channel = ctx.with_data_mut(|d| d.mamsock.take()).unwrap_or_else(|| DaemonChannel::new(Config::from_env()));
    let result = ctx.with_data_mut(|d| channel.request(action, d));
    ctx.with_data_mut(|d| d.mamsock = Some(channel));
    result
}

/// Records `remote_sa` and `domain`, asks the daemon for a connect
/// decision, applies any suggested bind and socket options, then connects
/// to `remote_sa_suggested` if the daemon rewrote the destination, falling
/// back to the caller's original `remote_sa` if it was silent.
pub fn connect(ctx: &Context, fd: Fd, addr: &Address) -> Result<()> {
    if !ctx.try_lock() {
        return native_connect(fd.raw(), addr);
    }
    let result = (|| {
        ctx.with_data_mut(|d| {
            d.remote_sa = Some(addr.clone());
            d.domain = addr.family() as i32;
        });

        if let Err(e) = daemon_roundtrip(ctx, Action::ConnectReq) {
            log::warn!("connect: daemon round trip failed, continuing natively: {e}");
        }

        let (bind_req_absent, bind_suggested) = ctx.with_data(|d| (d.bind_sa_req.is_none(), d.bind_sa_suggested.clone()));
        if bind_req_absent {
            if let Some(suggested) = bind_suggested {
                if let Err(e) = native_bind(fd.raw(), &suggested) {
                    log::warn!("connect: suggested bind failed, continuing: {e}");
                }
            }
        }

        let suggested_opts = ctx.with_data(|d| d.sockopts_suggested.clone());
        for opt in suggested_opts.iter().filter(|o| o.level != INTENTS) {
            if let Err(e) = native_setsockopt(fd.raw(), opt.level, opt.name, &opt.value) {
                if !opt.is_optional() {
                    return Err(e);
                }
                log::warn!("connect: optional suggested sockopt failed: {e}");
            }
        }

        let final_addr = ctx
            .with_data(|d| d.remote_sa_suggested.clone().or_else(|| d.remote_sa.clone()))
            .unwrap_or_else(|| addr.clone());
        native_connect(fd.raw(), &final_addr)?;
        ctx.with_data_mut(|d| d.calls_performed.insert(crate::context::CallsPerformed::CONNECT));
        Ok(())
    })();
    ctx.unlock();
    result
}

/// Native `close`, then release the context handle. Callers should treat
/// `ctx` as consumed afterward; the returned refcount is for diagnostics.
pub fn close(ctx: Context, fd: Fd) -> Result<usize> {
    os_result(unsafe { libc::close(fd.raw()) })?;
    ctx.with_data_mut(|d| d.calls_performed.insert(crate::context::CallsPerformed::CLOSE));
    Ok(ctx.release())
}

/// The all-in-one call: resolve-less connect driven entirely by a URL.
/// Unlike every other call here, there is no native equivalent to fall
/// back to -- a daemon that never answers makes this call fail outright,
/// with the fresh context released.
pub fn socketconnect(
    fd_slot: Fd,
    url: &str,
    sockopts: &SocketOptionList,
    domain: i32,
    socktype: i32,
    protocol: i32,
) -> Result<(Fd, Context)> {
    let ctx = Context::init();
    ctx.with_data_mut(|d| {
        d.domain = domain;
        d.socktype = socktype;
        d.protocol = protocol;
        d.sockopts_current = sockopts.clone();
    });

    let parsed = url::Url::parse(url).map_err(|_| Error::InvalidArgument("socketconnect: unparseable URL"))?;
    let host = parsed.host_str().ok_or(Error::InvalidArgument("socketconnect: URL has no host"))?.to_string();
    let port = parsed.port_or_known_default().ok_or(Error::InvalidArgument("socketconnect: URL has no resolvable port"))?;
    ctx.with_data_mut(|d| {
        d.remote_hostname = Some(host);
        d.remote_port = port;
    });

    if !fd_slot.is_none() {
        let response = daemon_roundtrip(&ctx, Action::SocketchooseReq);
        match response {
            Ok(resp) if resp.action == Some(Action::SocketchooseRespExisting) => {
                if let Some(existing) = resp.socketset_fd {
                    return Ok((Fd::from_raw(existing), ctx));
                }
            }
            Ok(resp) if resp.action == Some(Action::SocketchooseRespNew) => {
                // fall through to opening a new socket below.
            }
            _ => {
                let _ = ctx.release();
                return Err(Error::Channel(crate::error::ChannelError::NotConnected));
            }
        }
    }

    let response = daemon_roundtrip(&ctx, Action::SocketconnectReq);
    let response = match response {
        Ok(r) => r,
        Err(e) => {
            let _ = ctx.release();
            return Err(e);
        }
    };

    let (domain, socktype, protocol) = ctx.with_data(|d| (d.domain, d.socktype, d.protocol));
    let raw = unsafe { libc::socket(domain, socktype, protocol) };
    if raw < 0 {
        let _ = ctx.release();
        return Err(Error::Os(nix::errno::Errno::last()));
    }
    let fd = Fd::from_raw(raw);

    let suggested = response.sockopts_suggested.clone().unwrap_or_default();
    for opt in suggested.iter() {
        if let Err(e) = native_setsockopt(fd.raw(), opt.level, opt.name, &opt.value) {
            if !opt.is_optional() {
                let _ = unsafe { libc::close(fd.raw()) };
                let _ = ctx.release();
                return Err(e);
            }
            log::warn!("socketconnect: optional suggested sockopt failed: {e}");
        }
    }

    if let Some(bind_addr) = ctx.with_data(|d| d.bind_sa_suggested.clone()) {
        if let Err(e) = native_bind(fd.raw(), &bind_addr) {
            log::warn!("socketconnect: suggested bind failed, continuing: {e}");
        }
    }

    let port = ctx.with_data(|d| d.remote_port);
    let remote = ctx.with_data(|d| d.remote_sa_suggested.clone().or_else(|| d.remote_sa.clone()));
    let remote = match remote {
        Some(addr) => addr.with_port(port),
        None => {
            let _ = unsafe { libc::close(fd.raw()) };
            let _ = ctx.release();
            return Err(Error::Channel(crate::error::ChannelError::Protocol));
        }
    };
    ctx.with_data_mut(|d| d.remote_sa_suggested = Some(remote.clone()));

    if let Err(e) = native_connect(fd.raw(), &remote) {
        let _ = unsafe { libc::close(fd.raw()) };
        let _ = ctx.release();
        return Err(e);
    }

    registry::with_global(|reg| reg.add(fd, ctx.retain()));
    Ok((fd, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getsockopt_on_missing_intent_fails_with_option_missing() {
        let ctx = Context::init();
        let err = getsockopt(&ctx, Fd::from_raw(3), INTENTS, 99).unwrap_err();
        assert!(matches!(err, Error::OptionMissing));
    }

    #[test]
    fn setsockopt_then_getsockopt_on_intent_round_trips_without_touching_the_kernel() {
        let ctx = Context::init();
        setsockopt(&ctx, Fd::from_raw(3), INTENTS, 7, &[2, 0, 0, 0]).unwrap();
        let value = getsockopt(&ctx, Fd::from_raw(3), INTENTS, 7).unwrap();
        assert_eq!(value, vec![2, 0, 0, 0]);
    }

    #[test]
    fn socket_records_the_triple_and_inode() {
        let ctx = Context::init();
        let fd = socket(&ctx, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert!(!fd.is_none());
        ctx.with_data(|d| {
            assert_eq!(d.domain, libc::AF_INET);
            assert_eq!(d.socktype, libc::SOCK_STREAM);
        });
        unsafe { libc::close(fd.raw()) };
    }

    #[test]
    fn bind_records_the_request_address_after_a_successful_native_bind() {
        let ctx = Context::init();
        let fd = socket(&ctx, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let addr = Address::inet4([127, 0, 0, 1], 0);
        bind(&ctx, fd, &addr).unwrap();
        ctx.with_data(|d| assert_eq!(d.bind_sa_req, Some(addr)));
        unsafe { libc::close(fd.raw()) };
    }
}
