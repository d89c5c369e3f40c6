//! End-to-end scenarios against a mock daemon listening on a temp Unix
//! socket, covering the connect-rewrite and refcount-lifecycle behaviors
//! from the specification's testable-properties section.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};

use muaccrs::addr::Address;
use muaccrs::channel::DaemonChannel;
use muaccrs::config::Config;
use muaccrs::context::{Context, ContextData};
use muaccrs::tlv::{self, Action, Tag};

fn temp_socket() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mam.sock");
    (dir, path)
}

/// Reads one framed request, then writes a canned response built from
/// `write_response`, then closes. Good enough for a strict
/// request-then-response round trip with no pipelining.
fn run_mock_daemon(listener: UnixListener, write_response: impl FnOnce(&mut UnixStream) + Send + 'static) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = vec![0u8; 4096];
        // Drain the request until its Eof record.
        let mut ctx = ContextData::default();
        loop {
            let mut probe = [0u8; 4096];
            let n = stream.read(&mut probe).unwrap_or(0);
            if n == 0 {
                break;
            }
            buf[..n].copy_from_slice(&probe[..n]);
            if let Ok((_, eof)) = muaccrs::channel::drain_complete_records(&buf[..n], &mut ctx) {
                if eof {
                    break;
                }
            }
        }
        write_response(&mut stream);
    })
}

#[test]
fn init_retain_release_lifecycle_matches_the_refcount_scenario() {
    let c = Context::init();
    assert_eq!(c.refcount(), 1);
    let r = c.retain();
    assert_eq!(r.refcount(), 2);
    assert_eq!(r.release(), 1);
    assert_eq!(c.refcount(), 1);
    assert_eq!(c.release(), 0);
}

#[test]
fn connect_with_daemon_rewriting_the_address() {
    let (_dir, sock_path) = temp_socket();
    let listener = UnixListener::bind(&sock_path).expect("bind");

    let server = run_mock_daemon(listener, |stream| {
        let mut out = vec![0u8; 512];
        let mut pos = 0;
        tlv::push(&mut out, &mut pos, Tag::Action, &(Action::ConnectResp as u32).to_ne_bytes()).unwrap();
        let rewritten = Address::inet4([10, 0, 0, 1], 80);
        tlv::push(&mut out, &mut pos, Tag::RemoteSaRes, &rewritten.to_raw()).unwrap();
        tlv::push_tag(&mut out, &mut pos, Tag::Eof).unwrap();
        stream.write_all(&out[..pos]).unwrap();
    });

    let cfg = Config { socket_path: sock_path, ..Config::from_env() };
    let mut ctx = ContextData::default();
    ctx.remote_sa = Some(Address::inet4([1, 2, 3, 4], 80));
    ctx.domain = libc::AF_INET;

    let mut channel = DaemonChannel::new(cfg);
    let response = channel.request(Action::ConnectReq, &mut ctx).expect("request");

    assert_eq!(response.remote_sa_suggested, Some(Address::inet4([10, 0, 0, 1], 80)));
    assert_eq!(ctx.remote_sa_suggested, Some(Address::inet4([10, 0, 0, 1], 80)));
    assert_eq!(ctx.remote_sa, Some(Address::inet4([1, 2, 3, 4], 80)));

    server.join().unwrap();
}

#[test]
fn socketchoose_resp_existing_names_a_descriptor_from_the_set() {
    let (_dir, sock_path) = temp_socket();
    let listener = UnixListener::bind(&sock_path).expect("bind");

    let server = run_mock_daemon(listener, |stream| {
        let mut out = vec![0u8; 256];
        let mut pos = 0;
        tlv::push(&mut out, &mut pos, Tag::Action, &(Action::SocketchooseRespExisting as u32).to_ne_bytes()).unwrap();
        tlv::push(&mut out, &mut pos, Tag::SocketsetFile, &9i32.to_ne_bytes()).unwrap();
        tlv::push_tag(&mut out, &mut pos, Tag::Eof).unwrap();
        stream.write_all(&out[..pos]).unwrap();
    });

    let cfg = Config { socket_path: sock_path, ..Config::from_env() };
    let mut ctx = ContextData::default();
    let mut channel = DaemonChannel::new(cfg);
    let response = channel.request(Action::SocketchooseReq, &mut ctx).expect("request");

    assert_eq!(response.action, Some(Action::SocketchooseRespExisting));
    assert_eq!(response.socketset_fd, Some(9));

    server.join().unwrap();
}
