//! Client-side HTTP machinery: accept, parse, store-or-forward, and the
//! keepalive/pipelining discipline. One `ConnState` per accepted connection;
//! at most one transaction writes the response at a time.

pub mod stream;
pub mod transport;
pub mod tunnel;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use socket2::{SockRef, TcpKeepalive};

use crate::auth::{self, CredentialState};
use crate::comm::{Flag, Reactor};
use crate::config::{get_config, PortCfg};
use crate::errors::HttpParseError;
use crate::http::{self, Method, Request};
use crate::server;
use crate::store::{self, ClientRef, Entry, ENTRY_CACHABLE, ENTRY_COMPLETE};
use crate::utils::clock;
use transport::{ReadOutcome, Transport};

const CLIENT_READ_SIZE: usize = 8 * 1024;
/// Hard cap on an accepted request body.
const MAX_REQUEST_BODY: u64 = 64 * 1024 * 1024;

/// The in-flight response writer.
pub struct Transaction {
    pub request: Request,
    pub entry: Entry,
    pub reader: ClientRef,
    pub headers_sent: bool,
    pub keepalive: bool,
    pub hit: bool,
}

pub struct ConnState {
    pub fd: i32,
    pub port: Rc<PortCfg>,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub transport: Transport,
    in_buf: BytesMut,
    /// A request whose body is still arriving, with bytes outstanding.
    reading_body: Option<(Request, u64)>,
    pipeline: VecDeque<Request>,
    pub current: Option<Transaction>,
    auth_pending: bool,
    /// A CONNECT took the connection over; the parser stays out of the way.
    tunneling: bool,
    pub out_size: u64,
    pub out_headers_sz: u64,
}

pub type ConnRef = Rc<RefCell<ConnState>>;

/// Apply the port's keepalive quadruple to an accepted socket.
fn apply_keepalive(fd: i32, port: &PortCfg) {
    if !port.keepalive.enabled {
        return;
    }
    let sock = std::mem::ManuallyDrop::new(unsafe {
        <socket2::Socket as std::os::fd::FromRawFd>::from_raw_fd(fd)
    });
    let mut ka = TcpKeepalive::new();
    if port.keepalive.idle > 0 {
        ka = ka.with_time(std::time::Duration::from_secs(port.keepalive.idle as u64));
    }
    if port.keepalive.interval > 0 {
        ka = ka.with_interval(std::time::Duration::from_secs(port.keepalive.interval as u64));
    }
    if let Err(e) = SockRef::from(&*sock).set_tcp_keepalive(&ka) {
        warn!("FD {fd}: cannot set TCP keepalive: {e}");
    }
}

/// Accept handler for HTTP/HTTPS listeners: drain the accept queue, create a
/// connection state per socket, re-arm.
pub fn accept_connections(r: &mut Reactor, lfd: i32, port: &Rc<PortCfg>) {
    loop {
        match r.accept(lfd, "client http connect") {
            Ok((fd, peer, local)) => {
                apply_keepalive(fd, port);
                if get_config().general.log_client_connections {
                    info!("client connection from {peer} on {}", port.name);
                }
                new_connection(r, fd, peer, local, port.clone());
            }
            Err(ref e) if crate::comm::ignore_errno(e) => break,
            Err(e) => {
                debug!("accept failure on {}: {e}", port.name);
                break;
            }
        }
    }
    let port = port.clone();
    r.set_read_handler(
        lfd,
        Some(Box::new(move |r, lfd| accept_connections(r, lfd, &port))),
    );
}

fn new_connection(r: &mut Reactor, fd: i32, peer: SocketAddr, local: SocketAddr, port: Rc<PortCfg>) {
    let transport = match port.tls.as_ref().and_then(|t| t.static_context.as_ref()) {
        Some(ctx) => match Transport::tls_server(fd, ctx) {
            Ok(t) => t,
            Err(e) => {
                warn!("FD {fd}: cannot create TLS session: {e}");
                r.comm_close(fd);
                return;
            }
        },
        None => Transport::plain(fd),
    };

    let conn = Rc::new(RefCell::new(ConnState {
        fd,
        port,
        peer,
        local,
        transport,
        in_buf: BytesMut::with_capacity(CLIENT_READ_SIZE),
        reading_body: None,
        pipeline: VecDeque::new(),
        current: None,
        auth_pending: false,
        tunneling: false,
        out_size: 0,
        out_headers_sz: 0,
    }));

    {
        let conn = conn.clone();
        r.add_close_handler(
            fd,
            Box::new(move |r| {
                if let Some(txn) = conn.borrow_mut().current.take() {
                    store::unsubscribe(r, &txn.entry, &txn.reader);
                }
            }),
        );
    }

    arm_client_read(r, &conn);
}

fn arm_client_read(r: &mut Reactor, conn: &ConnRef) {
    let fd = conn.borrow().fd;
    if !r.fds.is_open(fd) || conn.borrow().tunneling {
        return;
    }
    {
        let conn = conn.clone();
        r.set_read_handler(fd, Some(Box::new(move |r, _| client_read(r, &conn))));
    }
    // keep the buffered-reader hint in sync with TLS internal buffers
    let pending = conn.borrow().transport.buffered_input() > 0;
    r.set_read_pending(fd, pending);

    let idle = get_config().general.client_idle_timeout.as_secs() as i64;
    let c = conn.clone();
    r.set_timeout(
        fd,
        idle,
        Some(Box::new(move |r, fd| {
            trace!("client FD {fd} idle timeout");
            let _ = &c;
            r.comm_close(fd);
        })),
    );
}

fn client_read(r: &mut Reactor, conn: &ConnRef) {
    let fd = conn.borrow().fd;

    // a TLS connection may still be mid-handshake
    let hs = conn.borrow_mut().transport.continue_handshake();
    match hs {
        Ok(true) => {}
        Ok(false) => {
            arm_client_read(r, conn);
            return;
        }
        Err(e) => {
            debug!("client FD {fd}: {e}");
            r.comm_close(fd);
            return;
        }
    }

    let mut chunk = [0u8; CLIENT_READ_SIZE];
    let outcome = conn.borrow_mut().transport.read(&mut chunk);
    match outcome {
        ReadOutcome::Data(n) => {
            r.fds.fd_bytes_read(fd, n);
            r.stats.client_bytes_in += n as u64;
            conn.borrow_mut().in_buf.extend_from_slice(&chunk[..n]);
            drive_parser(r, conn);
        }
        ReadOutcome::WouldBlock => arm_client_read(r, conn),
        ReadOutcome::Eof => {
            trace!("client FD {fd} closed by peer");
            r.comm_close(fd);
        }
        ReadOutcome::Error(e) => {
            debug!("client FD {fd} read error: {e}");
            r.comm_close(fd);
        }
    }
}

/// Consume as many complete requests as the buffer holds, then re-arm.
fn drive_parser(r: &mut Reactor, conn: &ConnRef) {
    let fd = conn.borrow().fd;
    let max_head = get_config().general.max_request_header_size.as_usize();

    loop {
        // finish an in-progress body first
        let pending_body = conn.borrow_mut().reading_body.take();
        if let Some((mut req, remaining)) = pending_body {
            let mut c = conn.borrow_mut();
            let take = (c.in_buf.len() as u64).min(remaining) as usize;
            let bytes = c.in_buf.split_to(take);
            req.body.extend_from_slice(&bytes);
            let left = remaining - take as u64;
            if left > 0 {
                c.reading_body = Some((req, left));
                drop(c);
                arm_client_read(r, conn);
                return;
            }
            c.pipeline.push_back(req);
            drop(c);
            continue;
        }

        let parsed = {
            let c = conn.borrow();
            if c.in_buf.is_empty() {
                Ok(None)
            } else {
                http::parse_request(&c.in_buf, max_head)
            }
        };
        match parsed {
            Ok(None) => break,
            Ok(Some(p)) => {
                let mut c = conn.borrow_mut();
                let _ = c.in_buf.split_to(p.consumed);
                let req = p.request;
                match req.headers.content_length() {
                    Ok(Some(len)) if len > MAX_REQUEST_BODY => {
                        drop(c);
                        send_error_and_close(
                            r,
                            conn,
                            413,
                            "Payload Too Large",
                            "The request body exceeds the proxy limit.",
                        );
                        return;
                    }
                    Ok(Some(len)) if len > 0 && req.method != Method::Connect => {
                        c.reading_body = Some((req, len));
                        drop(c);
                        continue;
                    }
                    Ok(_) => {
                        c.pipeline.push_back(req);
                        drop(c);
                    }
                    Err(_) => {
                        drop(c);
                        send_error_and_close(
                            r,
                            conn,
                            400,
                            "Bad Request",
                            "The Content-Length header is invalid.",
                        );
                        return;
                    }
                }
            }
            Err(HttpParseError::HeaderTooBig(_)) => {
                // 431-equivalent, then the connection goes away
                send_error_and_close(
                    r,
                    conn,
                    431,
                    "Request Header Fields Too Large",
                    "The request header block exceeds the configured limit.",
                );
                return;
            }
            Err(HttpParseError::MissingHost) => {
                send_error_and_close(
                    r,
                    conn,
                    400,
                    "Bad Request",
                    "HTTP/1.1 requests must carry a Host header.",
                );
                return;
            }
            Err(e) => {
                debug!("client FD {fd}: malformed request: {e}");
                send_error_and_close(
                    r,
                    conn,
                    400,
                    "Bad Request",
                    "The request could not be parsed.",
                );
                return;
            }
        }
    }

    process_next(r, conn);
    arm_client_read(r, conn);
}

/// Begin the next pipelined transaction, if none is being answered.
pub fn process_next(r: &mut Reactor, conn: &ConnRef) {
    let next = {
        let mut c = conn.borrow_mut();
        if c.current.is_some() || c.auth_pending {
            None
        } else {
            c.pipeline.pop_front()
        }
    };
    let Some(request) = next else { return };

    let cfg = get_config();
    if cfg.auth.basic_users.is_empty() {
        dispatch_request(r, conn, request);
        return;
    }

    let token = request
        .headers
        .get("Proxy-Authorization")
        .and_then(auth::basic::token_from_header)
        .map(str::to_string);
    let Some(token) = token else {
        send_auth_challenge(r, conn);
        return;
    };

    conn.borrow_mut().auth_pending = true;
    let conn2 = conn.clone();
    auth::authenticate_basic(
        r,
        &token,
        Box::new(move |r, state| {
            conn2.borrow_mut().auth_pending = false;
            match state {
                CredentialState::Ok => dispatch_request(r, &conn2, request),
                _ => send_auth_challenge(r, &conn2),
            }
        }),
    );
}

fn send_auth_challenge(r: &mut Reactor, conn: &ConnRef) {
    let (mut reply, body) = server::error_page(
        407,
        "Proxy Authentication Required",
        "Valid proxy credentials are required to use this service.",
        "",
    );
    reply
        .headers
        .put("Proxy-Authenticate", "Basic realm=\"kestrel\"");
    let mut wire = reply.pack();
    wire.extend_from_slice(&body);
    let conn2 = conn.clone();
    stream_write(
        r,
        conn,
        wire,
        Box::new(move |r, flag, _| {
            if flag == Flag::Ok {
                process_next(r, &conn2);
            }
        }),
    );
}

/// Absolute URL for the transaction: proxy requests carry one already,
/// accelerated/origin-form requests synthesize it from Host.
fn canonical_url(req: &Request) -> Option<String> {
    if !req.uri.starts_with('/') {
        return Some(req.uri.clone());
    }
    let host = req.headers.get("Host")?;
    Some(format!("http://{}{}", host, req.uri))
}

/// Request-side cacheability: method, credentials, directives, stop-list.
fn request_cachable(req: &Request, url: &str) -> bool {
    if !req.method.is_cachable() {
        return false;
    }
    if req.headers.has("Authorization") {
        return false;
    }
    if req.headers.cache_control_has("no-store") {
        return false;
    }
    let cfg = get_config();
    if cfg.general.stoplist.iter().any(|s| url.contains(s.as_str())) {
        return false;
    }
    true
}

fn dispatch_request(r: &mut Reactor, conn: &ConnRef, request: Request) {
    let fd = conn.borrow().fd;

    if request.method == Method::Connect {
        conn.borrow_mut().tunneling = true;
        tunnel::start(r, conn, request);
        return;
    }

    let Some(url) = canonical_url(&request) else {
        send_error_and_close(r, conn, 400, "Bad Request", "The request URI is not absolute.");
        return;
    };

    let reload = request.headers.cache_control_has("no-cache")
        || request
            .headers
            .get("Pragma")
            .map(|v| v.eq_ignore_ascii_case("no-cache"))
            .unwrap_or(false);
    let cachable = request_cachable(&request, &url);
    let key = store::StoreTable::key_for(request.method, &url);
    let now = clock::current_time();

    // store lookup: attach to a live entry unless it is stale or bypassed
    if let Some(entry) = r.store.get_public(key) {
        let fresh = {
            let e = entry.borrow();
            !e.has(ENTRY_COMPLETE) || e.is_fresh(now)
        };
        if reload || !fresh {
            store::release_request(r, &entry);
        } else {
            trace!("client FD {fd}: hit for {url}");
            attach_transaction(r, conn, request, entry, true);
            return;
        }
    }

    trace!("client FD {fd}: miss for {url}");
    let flags = if cachable && !reload { ENTRY_CACHABLE } else { 0 };
    let entry = store::create_entry(r, request.method, &url, flags);
    // subscribe before the fetch starts: a synchronous abort (DNS, sockets)
    // must find its reader so the error page reaches this client
    let fetch_request = request.clone();
    attach_transaction(r, conn, request, entry.clone(), false);
    server::start(r, &entry, &fetch_request);
}

fn attach_transaction(r: &mut Reactor, conn: &ConnRef, request: Request, entry: Entry, hit: bool) {
    let reader = store::subscribe(&entry, 0);
    let keepalive = request.version == http::Version::HTTP11
        && !request
            .headers
            .get("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
    conn.borrow_mut().current = Some(Transaction {
        request,
        entry,
        reader,
        headers_sent: false,
        keepalive,
        hit,
    });
    stream::kick(r, conn);
}

/// Write `wire` to the client through the transport, honoring TLS
/// would-block states, then deliver the outcome.
pub(crate) fn stream_write(
    r: &mut Reactor,
    conn: &ConnRef,
    wire: BytesMut,
    cb: Box<dyn FnOnce(&mut Reactor, Flag, usize)>,
) {
    step_stream_write(r, conn, wire, 0, cb);
}

fn step_stream_write(
    r: &mut Reactor,
    conn: &ConnRef,
    mut wire: BytesMut,
    written: usize,
    cb: Box<dyn FnOnce(&mut Reactor, Flag, usize)>,
) {
    let fd = conn.borrow().fd;
    if !r.fds.is_open(fd) || r.fds.get(fd).closing {
        cb(r, Flag::ErrClosing, written);
        return;
    }
    if wire.is_empty() {
        cb(r, Flag::Ok, written);
        return;
    }
    let res = conn.borrow_mut().transport.write(&wire);
    match res {
        Ok(n) if n > 0 => {
            r.fds.fd_bytes_written(fd, n);
            r.stats.client_bytes_out += n as u64;
            let _ = wire.split_to(n);
            step_stream_write(r, conn, wire, written + n, cb);
        }
        Ok(_) => {
            // zero-byte write: not an error unless it persists
            let conn2 = conn.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, _| {
                    step_stream_write(r, &conn2, wire, written, cb)
                })),
            );
        }
        Err(ref e)
            if e.kind() == std::io::ErrorKind::WouldBlock || crate::comm::ignore_errno(e) =>
        {
            let conn2 = conn.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, _| {
                    step_stream_write(r, &conn2, wire, written, cb)
                })),
            );
        }
        Err(e) => {
            debug!("client FD {fd} write error: {e}");
            cb(r, Flag::CommError, written);
        }
    }
}

/// Answer with a generated error page, then close: the session-fatal path.
pub(crate) fn send_error_and_close(
    r: &mut Reactor,
    conn: &ConnRef,
    status: u16,
    reason: &str,
    detail: &str,
) {
    let (mut reply, body) = server::error_page(status, reason, detail, "");
    reply.headers.replace("Connection", "close");
    let mut wire = reply.pack();
    wire.extend_from_slice(&body);
    let fd = conn.borrow().fd;
    warn!("client FD {fd}: {status} {reason}");
    stream_write(
        r,
        conn,
        wire,
        Box::new(move |r, _, _| {
            r.comm_close(fd);
        }),
    );
}

#[cfg(test)]
mod tests;
