//! TLV wire codec: a length-prefixed, host-byte-order, schema-free binary
//! encoding shared by the request and response halves of the daemon
//! protocol, plus the incremental parser the server side of that protocol
//! uses to consume records out of an event buffer without blocking.
//!
//! Record layout: `tag: u32 | length: Word | value: length bytes`, where
//! [`Word`] is the platform's unsigned word -- the codec does not
//! network-normalize (see `DESIGN.md`'s note on wire compatibility). A
//! stream is framed by a trailing [`Tag::Eof`] record with an empty value;
//! the receiver must not rely on transport-level EOF.

use std::io::Read;

use crate::addr::{Address, Family};
use crate::addrinfo::AddrInfo;
use crate::context::ContextData;
use crate::error::{CodecError, Error};
use crate::sockopt::{SockOptFlags, SocketOption, SocketOptionList};

/// The platform's unsigned word, used for the TLV length field. Defaults to
/// the host's native `usize` width; `tlv-word32` pins it to 32 bits for a
/// byte-stable wire format across hosts of different word width.
#[cfg(not(feature = "tlv-word32"))]
pub type Word = usize;
#[cfg(feature = "tlv-word32")]
pub type Word = u32;

pub const WORD_SIZE: usize = std::mem::size_of::<Word>();
const TAG_SIZE: usize = std::mem::size_of::<u32>();

fn write_word(dst: &mut [u8], value: usize) {
    dst.copy_from_slice(&(value as Word).to_ne_bytes());
}

fn read_word(src: &[u8]) -> usize {
    let mut bytes = [0u8; WORD_SIZE];
    bytes.copy_from_slice(src);
    Word::from_ne_bytes(bytes) as usize
}

/// The closed set of wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Tag {
    Action = 1,
    BindSaReq = 2,
    BindSaRes = 3,
    RemoteSaReq = 4,
    RemoteSaRes = 5,
    RemoteHostname = 6,
    RemoteSrvname = 7,
    RemotePort = 8,
    RemoteAddrinfoHint = 9,
    RemoteAddrinfoRes = 10,
    SockoptsCurrent = 11,
    SockoptsSuggested = 12,
    SocketsetFile = 13,
    CtxId = 14,
    Eof = 15,
    ActionErrorCodes = 16,
}

impl Tag {
    pub fn from_raw(raw: u32) -> Option<Tag> {
        Some(match raw {
            1 => Tag::Action,
            2 => Tag::BindSaReq,
            3 => Tag::BindSaRes,
            4 => Tag::RemoteSaReq,
            5 => Tag::RemoteSaRes,
            6 => Tag::RemoteHostname,
            7 => Tag::RemoteSrvname,
            8 => Tag::RemotePort,
            9 => Tag::RemoteAddrinfoHint,
            10 => Tag::RemoteAddrinfoRes,
            11 => Tag::SockoptsCurrent,
            12 => Tag::SockoptsSuggested,
            13 => Tag::SocketsetFile,
            14 => Tag::CtxId,
            15 => Tag::Eof,
            16 => Tag::ActionErrorCodes,
            _ => return None,
        })
    }
}

/// Action codes carried by the `Action` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    GetaddrinfoResolveReq = 1,
    GetaddrinfoResolveResp = 2,
    ConnectReq = 3,
    ConnectResp = 4,
    SocketconnectReq = 5,
    SocketconnectResp = 6,
    SocketchooseReq = 7,
    SocketchooseRespExisting = 8,
    SocketchooseRespNew = 9,
    SocketconnectFallback = 10,
    ErrorUnknownRequest = 11,
}

impl Action {
    pub fn from_raw(raw: u32) -> Option<Action> {
        Some(match raw {
            1 => Action::GetaddrinfoResolveReq,
            2 => Action::GetaddrinfoResolveResp,
            3 => Action::ConnectReq,
            4 => Action::ConnectResp,
            5 => Action::SocketconnectReq,
            6 => Action::SocketconnectResp,
            7 => Action::SocketchooseReq,
            8 => Action::SocketchooseRespExisting,
            9 => Action::SocketchooseRespNew,
            10 => Action::SocketconnectFallback,
            11 => Action::ErrorUnknownRequest,
            _ => return None,
        })
    }
}

/// Append an empty-value record for `tag`. Fails (leaving `*pos` unchanged)
/// when the remaining capacity is less than `sizeof(tag) + sizeof(length)`.
pub fn push_tag(buf: &mut [u8], pos: &mut usize, tag: Tag) -> Result<usize, CodecError> {
    push(buf, pos, tag, &[])
}

/// Append a record carrying `data` as its value.
pub fn push(buf: &mut [u8], pos: &mut usize, tag: Tag, data: &[u8]) -> Result<usize, CodecError> {
    let needed = TAG_SIZE + WORD_SIZE + data.len();
    let available = buf.len().saturating_sub(*pos);
    if available < needed {
        return Err(CodecError::BufferOverflow { needed, available });
    }
    let start = *pos;
    buf[start..start + TAG_SIZE].copy_from_slice(&(tag as u32).to_ne_bytes());
    let len_start = start + TAG_SIZE;
    write_word(&mut buf[len_start..len_start + WORD_SIZE], data.len());
    let data_start = len_start + WORD_SIZE;
    buf[data_start..data_start + data.len()].copy_from_slice(data);
    *pos += needed;
    Ok(needed)
}

fn encode_node_header(node: &AddrInfo) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[0..4].copy_from_slice(&node.flags.to_ne_bytes());
    out[4..8].copy_from_slice(&node.family.to_ne_bytes());
    out[8..12].copy_from_slice(&node.socktype.to_ne_bytes());
    out[12..16].copy_from_slice(&node.protocol.to_ne_bytes());
    let addrlen = node.addr.as_ref().map(|a| a.to_raw().len()).unwrap_or(0) as u32;
    out[16..20].copy_from_slice(&addrlen.to_ne_bytes());
    out[20] = node.addr.is_some() as u8;
    out[21] = node.canonname.is_some() as u8;
    out[22] = node.next.is_some() as u8;
    out
}

/// Encode an addrinfo chain as the concatenation, for each node, of
/// `{node-header, addr-bytes?, canonname-length-prefix-and-bytes?}`.
/// Absence of the chain means "do not emit a record" -- callers check
/// `Option::is_none` before calling `push_addrinfo`.
pub fn push_addrinfo(buf: &mut [u8], pos: &mut usize, tag: Tag, chain: &AddrInfo) -> Result<usize, CodecError> {
    let mut data = Vec::new();
    for node in chain.iter() {
        data.extend_from_slice(&encode_node_header(node));
        if let Some(addr) = &node.addr {
            data.extend_from_slice(&addr.to_raw());
        }
        if let Some(name) = &node.canonname {
            data.extend_from_slice(&(name.len() as u32).to_ne_bytes());
            data.extend_from_slice(name.as_bytes());
        }
    }
    push(buf, pos, tag, &data)
}

/// Encode a socket option list as the concatenation, for each option, of
/// `{option-header, value-bytes?}`.
pub fn push_sockopts(buf: &mut [u8], pos: &mut usize, tag: Tag, list: &SocketOptionList) -> Result<usize, CodecError> {
    let mut data = Vec::new();
    for opt in list.iter() {
        data.extend_from_slice(&opt.level.to_ne_bytes());
        data.extend_from_slice(&opt.name.to_ne_bytes());
        data.extend_from_slice(&(opt.value.len() as u32).to_ne_bytes());
        data.extend_from_slice(&opt.flags.bits().to_ne_bytes());
        data.extend_from_slice(&opt.returnvalue.to_ne_bytes());
        if !opt.value.is_empty() {
            data.extend_from_slice(&opt.value);
        }
    }
    push(buf, pos, tag, &data)
}

/// Decode `bytes` as a single sockaddr copied exactly into a freshly
/// allocated [`Address`]. The family is read from the leading bytes written
/// by [`Address::to_raw`].
pub fn extract_sockaddr(bytes: &[u8]) -> Result<Address, Error> {
    if bytes.len() < 2 {
        return Err(CodecError::Truncated { expected: 2, got: bytes.len() }.into());
    }
    let family_raw = u16::from_ne_bytes([bytes[0], bytes[1]]) as i32;
    let family = Family::from_raw(family_raw)
        .ok_or(CodecError::MalformedLength)?;
    Address::from_raw(family, bytes)
}

const NODE_HEADER_LEN: usize = 24;

/// Decode an addrinfo chain, mirroring the encoder. Every encoded presence
/// flag is rewritten to a freshly owned sub-object; the last node's
/// `next`-present flag is false. Fails on any short sub-buffer without
/// leaking a partially built chain (we only ever return a fully-built
/// `Vec<AddrInfo>` or an error; nothing is allocated into `next` pointers
/// until the whole chain has decoded successfully).
pub fn extract_addrinfo(bytes: &[u8]) -> Result<AddrInfo, Error> {
    let mut nodes = Vec::new();
    let mut pos = 0usize;
    loop {
        if bytes.len() - pos < NODE_HEADER_LEN {
            return Err(CodecError::Truncated { expected: NODE_HEADER_LEN, got: bytes.len() - pos }.into());
        }
        let h = &bytes[pos..pos + NODE_HEADER_LEN];
        let flags = i32::from_ne_bytes(h[0..4].try_into().unwrap());
        let family = i32::from_ne_bytes(h[4..8].try_into().unwrap());
        let socktype = i32::from_ne_bytes(h[8..12].try_into().unwrap());
        let protocol = i32::from_ne_bytes(h[12..16].try_into().unwrap());
        let addrlen = u32::from_ne_bytes(h[16..20].try_into().unwrap()) as usize;
        let has_addr = h[20] != 0;
        let has_canon = h[21] != 0;
        let has_next = h[22] != 0;
        pos += NODE_HEADER_LEN;

        let addr = if has_addr {
            if bytes.len() - pos < addrlen {
                return Err(CodecError::Truncated { expected: addrlen, got: bytes.len() - pos }.into());
            }
            let a = extract_sockaddr(&bytes[pos..pos + addrlen])?;
            pos += addrlen;
            Some(a)
        } else {
            None
        };

        let canonname = if has_canon {
            if bytes.len() - pos < 4 {
                return Err(CodecError::Truncated { expected: 4, got: bytes.len() - pos }.into());
            }
            let name_len = u32::from_ne_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if bytes.len() - pos < name_len {
                return Err(CodecError::Truncated { expected: name_len, got: bytes.len() - pos }.into());
            }
            let name = String::from_utf8_lossy(&bytes[pos..pos + name_len]).into_owned();
            pos += name_len;
            Some(name)
        } else {
            None
        };

        nodes.push(AddrInfo { flags, family, socktype, protocol, addr, canonname, next: None });

        if !has_next {
            break;
        }
    }
    AddrInfo::from_nodes(nodes).ok_or(CodecError::Truncated { expected: NODE_HEADER_LEN, got: 0 }.into())
}

const OPT_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4;

/// Decode a socket option list, mirroring the encoder.
pub fn extract_sockopts(bytes: &[u8]) -> Result<SocketOptionList, Error> {
    let mut list = SocketOptionList::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if bytes.len() - pos < OPT_HEADER_LEN {
            return Err(CodecError::Truncated { expected: OPT_HEADER_LEN, got: bytes.len() - pos }.into());
        }
        let h = &bytes[pos..pos + OPT_HEADER_LEN];
        let level = i32::from_ne_bytes(h[0..4].try_into().unwrap());
        let name = i32::from_ne_bytes(h[4..8].try_into().unwrap());
        let optlen = u32::from_ne_bytes(h[8..12].try_into().unwrap()) as usize;
        let flags = SockOptFlags::from_bits_truncate(u32::from_ne_bytes(h[12..16].try_into().unwrap()));
        let returnvalue = i32::from_ne_bytes(h[16..20].try_into().unwrap());
        pos += OPT_HEADER_LEN;

        let value = if optlen > 0 {
            if bytes.len() - pos < optlen {
                return Err(CodecError::Truncated { expected: optlen, got: bytes.len() - pos }.into());
            }
            let v = bytes[pos..pos + optlen].to_vec();
            pos += optlen;
            v
        } else {
            Vec::new()
        };

        list.push(SocketOption { level, name, value, flags, returnvalue });
    }
    Ok(list)
}

/// One decoded record: its tag and the slice of `buf` holding its value.
pub struct Record<'a> {
    pub tag: Tag,
    pub value: &'a [u8],
    pub record_len: usize,
}

/// Synchronous framed read of one record from `reader`, buffered through
/// `buf`. Fails on a short read or on a length field claiming more bytes
/// than `buf` can hold. On the `Eof` tag, returns an empty value.
pub fn read_tlv<'a>(reader: &mut impl Read, buf: &'a mut [u8]) -> Result<Record<'a>, Error> {
    let header_len = TAG_SIZE + WORD_SIZE;
    if buf.len() < header_len {
        return Err(CodecError::BufferOverflow { needed: header_len, available: buf.len() }.into());
    }
    reader
        .read_exact(&mut buf[..header_len])
        .map_err(crate::error::ChannelError::from)?;
    let tag_raw = u32::from_ne_bytes(buf[0..TAG_SIZE].try_into().unwrap());
    let tag = Tag::from_raw(tag_raw).ok_or(CodecError::MalformedLength)?;
    let value_len = read_word(&buf[TAG_SIZE..header_len]);
    let record_len = header_len + value_len;
    if value_len > 0 {
        if buf.len() < record_len {
            return Err(CodecError::BufferOverflow { needed: record_len, available: buf.len() }.into());
        }
        reader
            .read_exact(&mut buf[header_len..record_len])
            .map_err(crate::error::ChannelError::from)?;
    }
    Ok(Record { tag, value: &buf[header_len..record_len], record_len })
}

/// Result of one [`proc_tlv_event`] step.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcResult {
    /// A record is only partially present in `in_buf`; the caller should
    /// wait for more bytes and retry.
    TooShort,
    /// The `Eof` record was consumed; the message is complete.
    Eof,
    /// A non-`Eof` record was fully consumed; holds the number of bytes to
    /// drain from the front of `in_buf`.
    Consumed(usize),
}

/// Incremental, non-blocking counterpart to [`read_tlv`] for the server
/// side: consumes one complete record from `in_buf` (which is not assumed
/// to hold a full message), applies it to `ctx` via the unpack-into-context
/// rules, and reports how much of `in_buf` it consumed. Unknown tags are
/// skipped (and logged) without aborting the parse, exactly as a `socket`
/// or `sockopts` batch would keep flowing around one unrecognized record.
pub fn proc_tlv_event(in_buf: &[u8], ctx: &mut ContextData) -> Result<ProcResult, Error> {
    let header_len = TAG_SIZE + WORD_SIZE;
    if in_buf.len() < header_len {
        return Ok(ProcResult::TooShort);
    }
    let tag_raw = u32::from_ne_bytes(in_buf[0..TAG_SIZE].try_into().unwrap());
    let value_len = read_word(&in_buf[TAG_SIZE..header_len]);
    let record_len = header_len + value_len;
    if in_buf.len() < record_len {
        return Ok(ProcResult::TooShort);
    }
    let value = &in_buf[header_len..record_len];

    let Some(tag) = Tag::from_raw(tag_raw) else {
        log::warn!("proc_tlv_event: skipping unknown tag {tag_raw:#x}");
        return Ok(ProcResult::Consumed(record_len));
    };

    match tag {
        Tag::Eof => return Ok(ProcResult::Eof),
        Tag::Action => {
            let raw = value.get(..4).and_then(|b| b.try_into().ok()).map(u32::from_ne_bytes);
            if raw.and_then(Action::from_raw).is_none() {
                log::warn!("proc_tlv_event: unknown or short action code");
            }
        }
        Tag::BindSaReq => ctx.bind_sa_req = Some(extract_sockaddr(value)?),
        Tag::BindSaRes => ctx.bind_sa_suggested = Some(extract_sockaddr(value)?),
        Tag::RemoteSaReq => ctx.remote_sa = Some(extract_sockaddr(value)?),
        Tag::RemoteSaRes => ctx.remote_sa_suggested = Some(extract_sockaddr(value)?),
        Tag::RemoteHostname => {
            ctx.remote_hostname = Some(String::from_utf8_lossy(value).into_owned())
        }
        Tag::RemoteSrvname => {
            ctx.remote_service = Some(String::from_utf8_lossy(value).into_owned())
        }
        Tag::RemotePort => {
            if value.len() >= 2 {
                ctx.remote_port = u16::from_ne_bytes([value[0], value[1]]);
            }
        }
        Tag::RemoteAddrinfoHint => ctx.remote_addrinfo_hint = Some(extract_addrinfo(value)?),
        Tag::RemoteAddrinfoRes => ctx.remote_addrinfo_res = Some(extract_addrinfo(value)?),
        Tag::SockoptsCurrent => ctx.sockopts_current = extract_sockopts(value)?,
        Tag::SockoptsSuggested => ctx.sockopts_suggested = extract_sockopts(value)?,
        Tag::SocketsetFile => {
            if value.len() >= 4 {
                let fd = i32::from_ne_bytes(value[..4].try_into().unwrap());
                log::debug!("proc_tlv_event: socketset_file {fd}");
            }
        }
        Tag::CtxId => {
            if value.len() >= 16 {
                let raw = u128::from_ne_bytes(value[..16].try_into().unwrap());
                ctx.id = Some(crate::types::ContextId::from_u128(raw));
            }
        }
        Tag::ActionErrorCodes => {
            log::warn!("proc_tlv_event: daemon reported an error action code");
        }
    }
    Ok(ProcResult::Consumed(record_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_tag_matches_the_byte_exact_scenario() {
        let mut buf = vec![0u8; 64];
        let mut pos = 0;
        let written = push_tag(&mut buf, &mut pos, Tag::Eof).unwrap();
        assert_eq!(written, TAG_SIZE + WORD_SIZE);
        assert_eq!(pos, written);
        assert_eq!(&buf[0..TAG_SIZE], &(Tag::Eof as u32).to_ne_bytes());
        assert_eq!(read_word(&buf[TAG_SIZE..TAG_SIZE + WORD_SIZE]), 0);
    }

    #[test]
    fn push_fails_one_byte_short_and_leaves_pos_unchanged() {
        let header_len = TAG_SIZE + WORD_SIZE;
        let mut buf = vec![0u8; header_len - 1];
        let mut pos = 0;
        let err = push_tag(&mut buf, &mut pos, Tag::Eof).unwrap_err();
        assert!(matches!(err, CodecError::BufferOverflow { .. }));
        assert_eq!(pos, 0);
    }

    #[test]
    fn addrinfo_round_trips() {
        let mut chain = AddrInfo::new(libc::AF_INET, libc::SOCK_STREAM, 0);
        chain.addr = Some(Address::inet4([93, 184, 216, 34], 80));
        chain.canonname = Some("example.invalid".to_string());
        chain.push_back({
            let mut n = AddrInfo::new(libc::AF_INET6, libc::SOCK_STREAM, 0);
            n.addr = Some(Address::inet6([0; 16], 80));
            n
        });

        let mut buf = vec![0u8; 512];
        let mut pos = 0;
        push_addrinfo(&mut buf, &mut pos, Tag::RemoteAddrinfoRes, &chain).unwrap();

        let header_len = TAG_SIZE + WORD_SIZE;
        let value_len = read_word(&buf[TAG_SIZE..header_len]);
        let decoded = extract_addrinfo(&buf[header_len..header_len + value_len]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.canonname.as_deref(), Some("example.invalid"));
    }

    #[test]
    fn truncated_addrinfo_fails_without_partial_chain() {
        let err = extract_addrinfo(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::Truncated { .. })));
    }

    #[test]
    fn sockopts_round_trip() {
        let mut list = SocketOptionList::new();
        list.push(SocketOption::new(libc::SOL_SOCKET, libc::SO_BROADCAST, vec![1, 0, 0, 0], SockOptFlags::empty()));
        list.push(SocketOption::new(crate::sockopt::INTENTS, 7, vec![2, 0, 0, 0], SockOptFlags::empty()));

        let mut buf = vec![0u8; 256];
        let mut pos = 0;
        push_sockopts(&mut buf, &mut pos, Tag::SockoptsCurrent, &list).unwrap();

        let header_len = TAG_SIZE + WORD_SIZE;
        let value_len = read_word(&buf[TAG_SIZE..header_len]);
        let decoded = extract_sockopts(&buf[header_len..header_len + value_len]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.find(libc::SOL_SOCKET, libc::SO_BROADCAST).unwrap().value, vec![1, 0, 0, 0]);
    }

    #[test]
    fn proc_tlv_event_reports_too_short_on_a_partial_record() {
        let mut ctx = ContextData::default();
        let partial = [0u8; 2];
        assert_eq!(proc_tlv_event(&partial, &mut ctx).unwrap(), ProcResult::TooShort);
    }

    #[test]
    fn proc_tlv_event_applies_remote_hostname_and_reports_eof() {
        let mut buf = vec![0u8; 128];
        let mut pos = 0;
        push(&mut buf, &mut pos, Tag::RemoteHostname, b"example.invalid").unwrap();
        push_tag(&mut buf, &mut pos, Tag::Eof).unwrap();

        let mut ctx = ContextData::default();
        let r1 = proc_tlv_event(&buf[..pos], &mut ctx).unwrap();
        let consumed = match r1 {
            ProcResult::Consumed(n) => n,
            other => panic!("expected Consumed, got {other:?}"),
        };
        assert_eq!(ctx.remote_hostname.as_deref(), Some("example.invalid"));

        let r2 = proc_tlv_event(&buf[consumed..pos], &mut ctx).unwrap();
        assert_eq!(r2, ProcResult::Eof);
    }
}
