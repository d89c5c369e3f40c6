//! Socket address values.
//!
//! An [`Address`] preserves the family-specific raw bytes bit-exactly so it
//! can round-trip through the TLV codec and the native socket calls without
//! reinterpretation. Equality is by family and address bytes only -- the
//! socket-set registry's equivalence rule depends on this (ports, and for
//! IPv6 the flow/scope fields, do not participate).

use crate::error::{CodecError, Error};
use nix::sys::socket::{SockaddrIn, SockaddrIn6, UnixAddr};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address family tag, matching the `AF_*` values the codec and the
/// registry key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Family {
    Inet4 = libc::AF_INET,
    Inet6 = libc::AF_INET6,
    Unix = libc::AF_UNIX,
}

impl Family {
    pub fn from_raw(raw: i32) -> Option<Family> {
        match raw {
            libc::AF_INET => Some(Family::Inet4),
            libc::AF_INET6 => Some(Family::Inet6),
            libc::AF_UNIX => Some(Family::Unix),
            _ => None,
        }
    }
}

/// A tagged socket address value over {inet4, inet6, unix}.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet4 { addr: [u8; 4], port: u16 },
    Inet6 { addr: [u8; 16], port: u16, flowinfo: u32, scope_id: u32 },
    Unix { path: Vec<u8> },
}

impl Address {
    pub fn family(&self) -> Family {
        match self {
            Address::Inet4 { .. } => Family::Inet4,
            Address::Inet6 { .. } => Family::Inet6,
            Address::Unix { .. } => Family::Unix,
        }
    }

    /// Family-specific address bytes, ignoring port (and, for IPv6,
    /// flow/scope). This is the key the socket-set registry compares.
    pub fn addr_bytes(&self) -> &[u8] {
        match self {
            Address::Inet4 { addr, .. } => addr,
            Address::Inet6 { addr, .. } => addr,
            Address::Unix { path } => path,
        }
    }

    /// Equivalence used by the socket-set registry: same family, same
    /// address bytes, port ignored.
    pub fn equivalent(&self, other: &Address) -> bool {
        self.family() == other.family() && self.addr_bytes() == other.addr_bytes()
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Inet4 { port, .. } => Some(*port),
            Address::Inet6 { port, .. } => Some(*port),
            Address::Unix { .. } => None,
        }
    }

    /// Replace the port, used when `socketconnect` injects the resolved
    /// `remote_port` into an address the daemon only described by host.
    pub fn with_port(mut self, new_port: u16) -> Address {
        match &mut self {
            Address::Inet4 { port, .. } => *port = new_port,
            Address::Inet6 { port, .. } => *port = new_port,
            Address::Unix { .. } => {}
        }
        self
    }

    /// Encode into the family-specific raw byte layout the TLV codec
    /// ships on the wire (mirrors `struct sockaddr_in`/`sockaddr_in6`/
    /// `sockaddr_un`). Round-trips exactly via [`Address::from_raw`].
    pub fn to_raw(&self) -> Vec<u8> {
        match self {
            Address::Inet4 { addr, port } => {
                let mut buf = Vec::with_capacity(8);
                buf.extend_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf.extend_from_slice(addr);
                buf
            }
            Address::Inet6 { addr, port, flowinfo, scope_id } => {
                let mut buf = Vec::with_capacity(28);
                buf.extend_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf.extend_from_slice(&flowinfo.to_be_bytes());
                buf.extend_from_slice(addr);
                buf.extend_from_slice(&scope_id.to_ne_bytes());
                buf
            }
            Address::Unix { path } => {
                let mut buf = Vec::with_capacity(2 + path.len());
                buf.extend_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
                buf.extend_from_slice(path);
                buf
            }
        }
    }

    /// Decode `bytes` as a family-specific sockaddr copied exactly into a
    /// freshly allocated [`Address`]. Fails on a short buffer.
    pub fn from_raw(family: Family, bytes: &[u8]) -> Result<Address, Error> {
        match family {
            Family::Inet4 => {
                if bytes.len() < 8 {
                    return Err(CodecError::Truncated { expected: 8, got: bytes.len() }.into());
                }
                let port = u16::from_be_bytes([bytes[2], bytes[3]]);
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&bytes[4..8]);
                Ok(Address::Inet4 { addr, port })
            }
            Family::Inet6 => {
                if bytes.len() < 28 {
                    return Err(CodecError::Truncated { expected: 28, got: bytes.len() }.into());
                }
                let port = u16::from_be_bytes([bytes[2], bytes[3]]);
                let flowinfo = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&bytes[8..24]);
                let scope_id = u32::from_ne_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
                Ok(Address::Inet6 { addr, port, flowinfo, scope_id })
            }
            Family::Unix => {
                if bytes.len() < 2 {
                    return Err(CodecError::Truncated { expected: 2, got: bytes.len() }.into());
                }
                Ok(Address::Unix { path: bytes[2..].to_vec() })
            }
        }
    }

    pub fn to_socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Address::Inet4 { addr, port } => Some(
                std::net::SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::from(*addr)), *port),
            ),
            Address::Inet6 { addr, port, .. } => Some(
                std::net::SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::from(*addr)), *port),
            ),
            Address::Unix { .. } => None,
        }
    }

    pub fn inet4(addr: [u8; 4], port: u16) -> Address {
        Address::Inet4 { addr, port }
    }

    pub fn inet6(addr: [u8; 16], port: u16) -> Address {
        Address::Inet6 { addr, port, flowinfo: 0, scope_id: 0 }
    }

    pub fn unix_path(path: impl Into<Vec<u8>>) -> Address {
        Address::Unix { path: path.into() }
    }

    /// Convert to the concrete `nix` sockaddr type needed to make the
    /// native `bind`/`connect` call.
    pub fn to_nix_inet4(&self) -> Option<SockaddrIn> {
        match self {
            Address::Inet4 { addr, port } => {
                let ip = Ipv4Addr::from(*addr);
                Some(SockaddrIn::from(std::net::SocketAddrV4::new(ip, *port)))
            }
            _ => None,
        }
    }

    pub fn to_nix_inet6(&self) -> Option<SockaddrIn6> {
        match self {
            Address::Inet6 { addr, port, flowinfo, scope_id } => {
                let ip = Ipv6Addr::from(*addr);
                Some(SockaddrIn6::from(std::net::SocketAddrV6::new(
                    ip, *port, *flowinfo, *scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn to_nix_unix(&self) -> Option<UnixAddr> {
        match self {
            Address::Unix { path } => UnixAddr::new(path.as_slice()).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inet4_round_trips_through_raw_bytes() {
        let a = Address::inet4([10, 0, 0, 1], 8080);
        let raw = a.to_raw();
        let b = Address::from_raw(Family::Inet4, &raw).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn equivalence_ignores_port() {
        let a = Address::inet4([10, 0, 0, 1], 80);
        let b = Address::inet4([10, 0, 0, 1], 443);
        assert!(a.equivalent(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn equivalence_requires_matching_family() {
        let a = Address::inet4([10, 0, 0, 1], 80);
        let b = Address::Unix { path: vec![10, 0, 0, 1] };
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn truncated_raw_buffer_fails_decode() {
        let err = Address::from_raw(Family::Inet6, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::Codec(CodecError::Truncated { .. })));
    }
}
