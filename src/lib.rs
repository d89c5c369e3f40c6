//! muaccrs: a client-side socket-interception library for a local
//! multi-access manager daemon.
//!
//! This crate gives a process a drop-in replacement for the BSD socket
//! calls (`socket`, `getaddrinfo`, `bind`, `setsockopt`/`getsockopt`,
//! `connect`, `close`) that, behind the scenes, consults a local daemon
//! over a Unix domain socket for policy decisions -- which address family
//! to prefer, which source address to bind to, which socket options to
//! apply -- before falling back to the native syscall. Every call degrades
//! gracefully to its native behavior if the daemon is absent, busy, or
//! silent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use muaccrs::calls;
//!
//! let ctx = calls::socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
//! let addrinfo = calls::getaddrinfo(&ctx, Some("example.invalid"), Some("80"), None)?;
//! calls::connect(&ctx, addrinfo.addr.as_ref().unwrap())?;
//! calls::close(ctx)?;
//! ```
//!
//! # Layout
//!
//! - [`addr`], [`addrinfo`], [`sockopt`]: the value types the wire protocol
//!   and the call surface share.
//! - [`context`]: the per-flow aggregate every call mutates.
//! - [`tlv`]: the wire codec, both the blocking and the incremental parser.
//! - [`channel`]: the daemon round trip built on top of the codec.
//! - [`registry`]: the process-wide socket-set bookkeeping `socketconnect`
//!   and `socketchoose` need.
//! - [`calls`]: the intercepted call surface itself.
//! - [`config`]: where the daemon lives and how long to wait for it.
//! - [`error`]: the unified error type every public function returns.

pub mod addr;
pub mod addrinfo;
pub mod calls;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod registry;
pub mod sockopt;
pub mod tlv;
pub mod types;

pub use context::Context;
pub use error::{Error, Result};
