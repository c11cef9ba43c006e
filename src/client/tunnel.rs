//! CONNECT tunnels: after the 200, the proxy is a byte pipe between the
//! client and the origin, with per-direction backpressure.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BytesMut;
use log::{debug, trace};

use crate::client::{send_error_and_close, ConnRef};
use crate::comm::{self, ConnectProgress, Flag, Reactor};
use crate::config::get_config;
use crate::http::{self, Request};
use crate::server::ipcache;

struct Tunnel {
    client_fd: i32,
    server_fd: i32,
}

type TunnelRef = Rc<RefCell<Tunnel>>;

/// Take over a CONNECT transaction. The connection state stops parsing;
/// from here the two sockets only relay.
pub fn start(r: &mut Reactor, conn: &ConnRef, request: Request) {
    let client_fd = conn.borrow().fd;

    let target = match http::parse_uri_target(http::Method::Connect, &request.uri) {
        Ok(t) => t,
        Err(_) => {
            send_error_and_close(r, conn, 400, "Bad Request", "Invalid CONNECT target.");
            return;
        }
    };
    let ips = match ipcache::resolve(&target.host) {
        Ok(ips) => ips,
        Err(_) => {
            send_error_and_close(
                r,
                conn,
                503,
                "DNS Failure",
                "The CONNECT hostname could not be resolved.",
            );
            return;
        }
    };
    let dest = SocketAddr::new(ips[0], target.port);

    let server_fd = match r.open_tcp_socket(dest.is_ipv4(), &request.uri) {
        Ok(fd) => fd,
        Err(_) => {
            send_error_and_close(
                r,
                conn,
                503,
                "Out of Descriptors",
                "The proxy is short of file descriptors.",
            );
            return;
        }
    };

    trace!("tunnel FD {client_fd} <-> FD {server_fd} to {dest}");
    let conn2 = conn.clone();
    let connect_timeout = get_config().general.connect_timeout.as_secs() as i64;
    r.set_timeout(
        server_fd,
        connect_timeout,
        Some(Box::new(move |r, fd| {
            r.comm_close(fd);
            send_error_and_close(
                r,
                &conn2,
                504,
                "Connection Timeout",
                "The CONNECT destination did not answer in time.",
            );
        })),
    );

    match r.connect(server_fd, dest) {
        ConnectProgress::Connected => established(r, conn, server_fd),
        ConnectProgress::InProgress => {
            let conn2 = conn.clone();
            r.set_write_handler(
                server_fd,
                Some(Box::new(move |r, fd| wait_connect(r, &conn2, fd, dest))),
            );
        }
        ConnectProgress::Failed(_) => {
            r.comm_close(server_fd);
            send_error_and_close(
                r,
                conn,
                503,
                "Connection Failed",
                "The CONNECT destination refused the connection.",
            );
        }
    }
}

fn wait_connect(r: &mut Reactor, conn: &ConnRef, fd: i32, dest: SocketAddr) {
    match r.connect(fd, dest) {
        ConnectProgress::Connected => established(r, conn, fd),
        ConnectProgress::InProgress => {
            let conn2 = conn.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, fd| wait_connect(r, &conn2, fd, dest))),
            );
        }
        ConnectProgress::Failed(e) => {
            debug!("tunnel connect failed: {e}");
            r.comm_close(fd);
            send_error_and_close(
                r,
                conn,
                503,
                "Connection Failed",
                "The CONNECT destination refused the connection.",
            );
        }
    }
}

fn established(r: &mut Reactor, conn: &ConnRef, server_fd: i32) {
    let client_fd = conn.borrow().fd;
    r.set_timeout(server_fd, 0, None);

    let tunnel = Rc::new(RefCell::new(Tunnel {
        client_fd,
        server_fd,
    }));

    // either side going away tears the pair down
    {
        let t = tunnel.clone();
        r.add_close_handler(
            client_fd,
            Box::new(move |r| {
                let peer = t.borrow().server_fd;
                r.comm_close(peer);
            }),
        );
        let t = tunnel.clone();
        r.add_close_handler(
            server_fd,
            Box::new(move |r| {
                let peer = t.borrow().client_fd;
                r.comm_close(peer);
            }),
        );
    }

    let t = tunnel.clone();
    comm::write_full(
        r,
        client_fd,
        BytesMut::from(&b"HTTP/1.1 200 Connection established\r\n\r\n"[..]),
        Box::new(move |r, res| {
            if res.flag != Flag::Ok {
                shutdown(r, &t);
                return;
            }
            relay_arm(r, &t, true);
            relay_arm(r, &t, false);
        }),
    );
}

fn shutdown(r: &mut Reactor, tunnel: &TunnelRef) {
    let (c, s) = {
        let t = tunnel.borrow();
        (t.client_fd, t.server_fd)
    };
    r.comm_close(c);
    r.comm_close(s);
}

/// Arm one relay direction; `from_client` picks which.
fn relay_arm(r: &mut Reactor, tunnel: &TunnelRef, from_client: bool) {
    let src = if from_client {
        tunnel.borrow().client_fd
    } else {
        tunnel.borrow().server_fd
    };
    if !r.fds.is_open(src) {
        return;
    }
    let t = tunnel.clone();
    r.set_read_handler(
        src,
        Some(Box::new(move |r, fd| relay_read(r, &t, fd, from_client))),
    );
}

fn relay_read(r: &mut Reactor, tunnel: &TunnelRef, src: i32, from_client: bool) {
    let dst = if from_client {
        tunnel.borrow().server_fd
    } else {
        tunnel.borrow().client_fd
    };

    let mut buf = [0u8; 16 * 1024];
    match r.read(src, &mut buf) {
        Err(ref e) if comm::ignore_errno(e) => relay_arm(r, tunnel, from_client),
        Err(_) | Ok(0) => shutdown(r, tunnel),
        Ok(n) => {
            if from_client {
                r.stats.client_bytes_in += n as u64;
            } else {
                r.stats.server_bytes_in += n as u64;
            }
            // hold this direction's reads until the forward write drains
            let t = tunnel.clone();
            comm::write_full(
                r,
                dst,
                BytesMut::from(&buf[..n]),
                Box::new(move |r, res| {
                    if res.flag == Flag::Ok {
                        relay_arm(r, &t, from_client);
                    } else {
                        shutdown(r, &t);
                    }
                }),
            );
        }
    }
}
