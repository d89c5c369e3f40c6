//! The daemon channel: a lazily-established Unix domain stream connection
//! to the local multi-access manager, and the strict request/response round
//! trip every intercepted call drives it through.
//!
//! There is no pipelining: a [`DaemonChannel`] sends exactly one request,
//! then reads records until [`crate::tlv::Tag::Eof`], before the next send
//! is permitted. This mirrors the original client, which never has more
//! than one outstanding request per context.

use std::io::Write;
use std::os::unix::net::UnixStream;

use crate::addr::Address;
use crate::addrinfo::AddrInfo;
use crate::config::Config;
use crate::context::ContextData;
use crate::error::{ChannelError, Error, Result};
use crate::sockopt::SocketOptionList;
use crate::tlv::{self, Action, ProcResult, Tag};

/// Lazily-connected handle to the daemon's control socket. Cloning a
/// `Context` never clones an open connection -- see `ContextData::mamsock`
/// and `Context::clone_deep` -- so each context either owns its own
/// connection or has none yet.
#[derive(Debug)]
pub struct DaemonChannel {
    config: Config,
    stream: Option<UnixStream>,
}

impl DaemonChannel {
    /// Build a channel that has not connected yet; the first request opens
    /// the socket.
    pub fn new(config: Config) -> DaemonChannel {
        DaemonChannel { config, stream: None }
    }

    fn ensure_connected(&mut self) -> Result<&mut UnixStream> {
        if self.stream.is_none() {
            let stream = UnixStream::connect(&self.config.socket_path)
                .map_err(ChannelError::Io)?;
            stream.set_read_timeout(Some(self.config.connect_timeout * 10)).map_err(ChannelError::Io)?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("just connected"))
    }

    /// Serialize `ctx`'s fields into a single request buffer, in the fixed
    /// field order the daemon expects: action, then bind/remote addresses,
    /// hostname/service/port, addrinfo hint, current and suggested
    /// sockopts, and a trailing `Eof`.
    pub fn pack_ctx(action: Action, ctx: &ContextData, buf: &mut [u8]) -> Result<usize> {
        let mut pos = 0usize;
        tlv::push(buf, &mut pos, Tag::Action, &(action as u32).to_ne_bytes())?;

        if let Some(addr) = &ctx.bind_sa_req {
            tlv::push(buf, &mut pos, Tag::BindSaReq, &addr.to_raw())?;
        }
        if let Some(addr) = &ctx.remote_sa {
            tlv::push(buf, &mut pos, Tag::RemoteSaReq, &addr.to_raw())?;
        }
        if let Some(name) = &ctx.remote_hostname {
            tlv::push(buf, &mut pos, Tag::RemoteHostname, name.as_bytes())?;
        }
        if let Some(service) = &ctx.remote_service {
            tlv::push(buf, &mut pos, Tag::RemoteSrvname, service.as_bytes())?;
        }
        if ctx.remote_port != 0 {
            tlv::push(buf, &mut pos, Tag::RemotePort, &ctx.remote_port.to_ne_bytes())?;
        }
        if let Some(hint) = &ctx.remote_addrinfo_hint {
            tlv::push_addrinfo(buf, &mut pos, Tag::RemoteAddrinfoHint, hint)?;
        }
        if !ctx.sockopts_current.is_empty() {
            tlv::push_sockopts(buf, &mut pos, Tag::SockoptsCurrent, &ctx.sockopts_current)?;
        }
        if !ctx.sockopts_suggested.is_empty() {
            tlv::push_sockopts(buf, &mut pos, Tag::SockoptsSuggested, &ctx.sockopts_suggested)?;
        }
        if let Some(id) = ctx.id {
            tlv::push(buf, &mut pos, Tag::CtxId, &id.as_u128().to_ne_bytes())?;
        }
        tlv::push_tag(buf, &mut pos, Tag::Eof)?;
        Ok(pos)
    }

    /// Send one request for `action` built from `ctx`'s current fields, then
    /// block for the full response and fold it back into `ctx`. This is the
    /// only entry point other modules use; callers never see raw records.
    pub fn request(&mut self, action: Action, ctx: &mut ContextData) -> Result<DaemonResponse> {
        let mut out = vec![0u8; self.config.tlv_maxlen];
        let n = Self::pack_ctx(action, ctx, &mut out)?;

        let stream = self.ensure_connected()?;
        stream.write_all(&out[..n]).map_err(ChannelError::Io)?;

        let mut response = DaemonResponse::default();
        let mut in_buf = vec![0u8; self.config.tlv_maxlen];
        loop {
            let record = tlv::read_tlv(stream, &mut in_buf)?;
            match record.tag {
                Tag::Eof => break,
                Tag::Action => {
                    let raw = u32::from_ne_bytes(record.value.get(..4).ok_or(ChannelError::Protocol)?.try_into().unwrap());
                    response.action = Action::from_raw(raw);
                }
                Tag::BindSaRes => response.bind_sa = Some(tlv::extract_sockaddr(record.value)?),
                Tag::RemoteSaRes => response.remote_sa_suggested = Some(tlv::extract_sockaddr(record.value)?),
                Tag::RemoteAddrinfoRes => response.remote_addrinfo = Some(tlv::extract_addrinfo(record.value)?),
                Tag::SockoptsSuggested => response.sockopts_suggested = Some(tlv::extract_sockopts(record.value)?),
                Tag::SocketsetFile => {
                    if let Some(bytes) = record.value.get(..4) {
                        response.socketset_fd = Some(i32::from_ne_bytes(bytes.try_into().unwrap()));
                    }
                }
                Tag::CtxId => {
                    if let Some(bytes) = record.value.get(..16) {
                        let raw = u128::from_ne_bytes(bytes.try_into().unwrap());
                        log::debug!("DaemonChannel::request: daemon echoed ctxid {raw:#x}");
                    }
                }
                Tag::ActionErrorCodes => response.error = true,
                other => {
                    log::debug!("DaemonChannel::request: ignoring unexpected response tag {other:?}");
                }
            }
        }
        response.apply(ctx);
        Ok(response)
    }
}

/// The daemon's answer to one [`DaemonChannel::request`], already folded
/// back into the context by the time callers see it; kept around so the
/// call surface can branch on `action`/`socketset_fd` without re-reading
/// `ctx`.
#[derive(Debug, Default)]
pub struct DaemonResponse {
    pub action: Option<Action>,
    pub bind_sa: Option<Address>,
    pub remote_sa_suggested: Option<Address>,
    pub remote_addrinfo: Option<AddrInfo>,
    pub sockopts_suggested: Option<SocketOptionList>,
    pub socketset_fd: Option<i32>,
    pub error: bool,
}

impl DaemonResponse {
    fn apply(&self, ctx: &mut ContextData) {
        if let Some(addr) = &self.bind_sa {
            ctx.bind_sa_suggested = Some(addr.clone());
        }
        if let Some(addr) = &self.remote_sa_suggested {
            ctx.remote_sa_suggested = Some(addr.clone());
        }
        if let Some(chain) = &self.remote_addrinfo {
            ctx.remote_addrinfo_res = Some(chain.clone());
        }
        if let Some(opts) = &self.sockopts_suggested {
            ctx.sockopts_suggested = opts.clone();
        }
    }
}

/// Feed bytes already read into `in_buf` through [`tlv::proc_tlv_event`]
/// until it reports `TooShort`, returning how many complete records were
/// consumed. Used by the mock daemon in tests and by any server-side
/// harness driving the incremental parser instead of the blocking
/// `read_tlv` path.
pub fn drain_complete_records(in_buf: &[u8], ctx: &mut ContextData) -> Result<(usize, bool)> {
    let mut consumed = 0usize;
    loop {
        match tlv::proc_tlv_event(&in_buf[consumed..], ctx)? {
            ProcResult::TooShort => return Ok((consumed, false)),
            ProcResult::Eof => return Ok((consumed, true)),
            ProcResult::Consumed(n) => consumed += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    fn temp_socket_path() -> std::path::PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mam.sock");
        std::mem::forget(dir);
        path
    }

    #[test]
    fn pack_ctx_writes_action_first_and_terminates_with_eof() {
        let mut ctx = ContextData::default();
        ctx.remote_hostname = Some("example.invalid".to_string());
        let mut buf = vec![0u8; 512];
        let n = DaemonChannel::pack_ctx(Action::ConnectReq, &ctx, &mut buf).unwrap();

        let header_len = std::mem::size_of::<u32>() + tlv::WORD_SIZE;
        let first_tag = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(first_tag, Tag::Action as u32);

        let mut pos = header_len + 4; // action value is 4 bytes
        let hostname_tag = u32::from_ne_bytes(buf[pos..pos + 4].try_into().unwrap());
        assert_eq!(hostname_tag, Tag::RemoteHostname as u32);
        let _ = n;
        let _ = pos;
        pos = n - header_len; // last record is Eof
        let eof_tag = u32::from_ne_bytes(buf[pos..pos + 4].try_into().unwrap());
        assert_eq!(eof_tag, Tag::Eof as u32);
    }

    #[test]
    fn request_round_trips_against_a_mock_daemon() {
        let sock_path = temp_socket_path();
        let listener = UnixListener::bind(&sock_path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).ok();
        });
        // request() would block forever on a server that never answers, so
        // this test only exercises that a connection is established and
        // the request bytes are framed; a fuller round trip lives in the
        // crate's integration tests with a responding mock daemon.
        drop(server);

        let cfg = Config { socket_path: sock_path, ..Config::from_env() };
        let mut channel = DaemonChannel::new(cfg);
        assert!(channel.stream.is_none());
        let _ = channel.ensure_connected();
        assert!(channel.stream.is_some());
    }

    #[test]
    fn drain_complete_records_stops_at_too_short() {
        let mut ctx = ContextData::default();
        let mut buf = vec![0u8; 64];
        let mut pos = 0;
        tlv::push(&mut buf, &mut pos, Tag::RemotePort, &8080u16.to_ne_bytes()).unwrap();
        let (consumed, eof) = drain_complete_records(&buf[..pos], &mut ctx).unwrap();
        assert_eq!(consumed, pos);
        assert!(!eof);
        assert_eq!(ctx.remote_port, 8080);
    }
}
