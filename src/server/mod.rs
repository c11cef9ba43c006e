//! The server-side fetch: connect to the origin (or parent), forward the
//! request, and stream the response into a store entry under the
//! delete-behind backpressure discipline.

pub mod forward;
pub mod ipcache;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{BufMut, BytesMut};
use log::{debug, trace};
use once_cell::sync::Lazy;

use crate::comm::{self, ConnectProgress, Flag, Reactor};
use crate::config::get_config;
use crate::http::{self, Method, Reply, Request};
use crate::mem::{pools, Pool};
use crate::store::{
    self, ttl, Entry, ENTRY_CLIENT_ABORT, ENTRY_DELETE_BEHIND, HTTP_DELETE_GAP,
};
use crate::utils::clock;

const FETCH_READ_SIZE: usize = 16 * 1024;

static FETCH_BUF_POOL: Lazy<Pool> = Lazy::new(|| pools().create("fetch-io", FETCH_READ_SIZE));

/// Render a generated error page; the single shape for transactional
/// failures reported to clients.
pub fn error_page(status: u16, reason: &str, detail: &str, url: &str) -> (Reply, BytesMut) {
    let cfg = get_config();
    let mut body = BytesMut::new();
    body.put_slice(
        format!(
            "<html><head><title>{status} {reason}</title></head>\n\
             <body><h1>{status} {reason}</h1>\n\
             <p>While trying to retrieve the URL: <a href=\"{url}\">{url}</a></p>\n\
             <p>{detail}</p>\n\
             <hr><address>{} ({}/{})</address></body></html>\n",
            cfg.general.visible_hostname,
            "kestrel",
            crate::VERSION,
        )
        .as_bytes(),
    );

    let mut reply = Reply::new(status, reason);
    reply.headers.put("Server", &format!("kestrel/{}", crate::VERSION));
    reply
        .headers
        .put("Date", &http::date::mkrfc1123(clock::current_time()));
    reply.headers.put("Content-Type", "text/html");
    reply
        .headers
        .put("Content-Length", &body.len().to_string());
    (reply, body)
}

struct HttpFetch {
    entry: Entry,
    fd: i32,
    request: Request,
    dest: SocketAddr,
    in_buf: BytesMut,
    headers_done: bool,
    /// Body bytes still expected; None means "until EOF".
    body_remaining: Option<u64>,
}

type FetchRef = Rc<RefCell<HttpFetch>>;

/// Build the request we forward: parent proxies get the absolute form,
/// origins get the origin form; hop headers go away and Via is appended.
fn forwarded_request(
    client_req: &Request,
    target: &http::UriTarget,
    via_parent: bool,
) -> Request {
    let uri = if via_parent {
        client_req.uri.clone()
    } else {
        target.path.clone()
    };
    let mut req = Request::new(client_req.method, &uri);
    req.version = http::Version::HTTP11;
    req.headers = client_req.headers.clone();
    http::strip_hop_headers(&mut req.headers);
    req.headers.remove("Proxy-Authorization");
    // the body, if any, is sent up front
    req.headers.remove("Expect");
    if !req.headers.has("Host") {
        req.headers.put("Host", &target.host);
    }
    let cfg = get_config();
    let via = format!("1.1 {} (kestrel/{})", cfg.general.visible_hostname, crate::VERSION);
    match client_req.headers.get("Via") {
        Some(prior) => req.headers.replace("Via", &format!("{prior}, {via}")),
        None => req.headers.put("Via", &via),
    }
    // we do not reuse origin connections, and EOF must delimit unframed and
    // chunked bodies
    req.headers.put("Connection", "close");
    req.body = client_req.body.clone();
    req
}

/// Abort the fetch's entry with a generated error page.
fn fetch_abort(r: &mut Reactor, entry: &Entry, status: u16, reason: &str, detail: &str) {
    let url = entry.borrow().url.clone();
    debug!("fetch error for {url}: {status} {reason}");
    let (reply, body) = error_page(status, reason, detail, &url);
    store::abort(r, entry, reply, &body);
}

/// Start a server-side fetch that writes into `entry`.
pub fn start(r: &mut Reactor, entry: &Entry, client_req: &Request) {
    let url = entry.borrow().url.clone();
    let target = match http::parse_uri_target(client_req.method, &url) {
        Ok(t) => t,
        Err(_) => {
            fetch_abort(
                r,
                entry,
                400,
                "Invalid URL",
                "The requested URL could not be parsed.",
            );
            return;
        }
    };

    let path = forward::choose(&target);
    let (dest_host, dest_port) = path.destination();
    let ips = match ipcache::resolve(dest_host) {
        Ok(ips) => ips,
        Err(_) => {
            fetch_abort(
                r,
                entry,
                503,
                "DNS Failure",
                "The hostname could not be resolved.",
            );
            return;
        }
    };
    let dest = SocketAddr::new(ips[0], dest_port);

    let fd = match r.open_tcp_socket(dest.is_ipv4(), &url) {
        Ok(fd) => fd,
        Err(_) => {
            fetch_abort(
                r,
                entry,
                503,
                "Out of Descriptors",
                "The proxy is short of file descriptors, try again shortly.",
            );
            return;
        }
    };

    let request = forwarded_request(client_req, &target, path.via_parent());
    let fetch = Rc::new(RefCell::new(HttpFetch {
        entry: entry.clone(),
        fd,
        request,
        dest,
        in_buf: BytesMut::new(),
        headers_done: false,
        body_remaining: None,
    }));

    let connect_timeout = get_config().general.connect_timeout.as_secs() as i64;
    {
        let fetch = fetch.clone();
        r.set_timeout(
            fd,
            connect_timeout,
            Some(Box::new(move |r, fd| {
                let entry = fetch.borrow().entry.clone();
                fetch_abort(
                    r,
                    &entry,
                    503,
                    "Connection Timeout",
                    "The remote site did not accept the connection in time.",
                );
                r.comm_close(fd);
            })),
        );
    }

    match r.connect(fd, dest) {
        ConnectProgress::Connected => send_request(r, &fetch),
        ConnectProgress::InProgress => {
            trace!("fetch FD {fd}: connect in progress to {dest}");
            let f = fetch.clone();
            r.set_write_handler(fd, Some(Box::new(move |r, fd| conn_in_progress(r, fd, &f))));
        }
        ConnectProgress::Failed(_) => {
            let entry = fetch.borrow().entry.clone();
            r.comm_close(fd);
            fetch_abort(
                r,
                &entry,
                503,
                "Connection Failed",
                "The remote site refused the connection; it may be down.",
            );
        }
    }
}

fn conn_in_progress(r: &mut Reactor, fd: i32, fetch: &FetchRef) {
    let dest = fetch.borrow().dest;
    match r.connect(fd, dest) {
        ConnectProgress::Connected => send_request(r, fetch),
        ConnectProgress::InProgress => {
            let f = fetch.clone();
            r.set_write_handler(fd, Some(Box::new(move |r, fd| conn_in_progress(r, fd, &f))));
        }
        ConnectProgress::Failed(_) => {
            let entry = fetch.borrow().entry.clone();
            r.comm_close(fd);
            fetch_abort(
                r,
                &entry,
                503,
                "Connection Failed",
                "The remote site refused the connection; it may be down.",
            );
        }
    }
}

fn send_request(r: &mut Reactor, fetch: &FetchRef) {
    let (fd, mut wire) = {
        let f = fetch.borrow();
        let mut wire = f.request.pack();
        wire.extend_from_slice(&f.request.body);
        (f.fd, wire)
    };
    let n = wire.len();
    trace!("fetch FD {fd}: sending {n}-byte request");
    let f = fetch.clone();
    comm::write_full(
        r,
        fd,
        std::mem::take(&mut wire),
        Box::new(move |r, res| {
            let entry = f.borrow().entry.clone();
            match res.flag {
                Flag::Ok => {
                    r.stats.server_bytes_out += res.size as u64;
                    arm_read(r, fd, &f);
                }
                Flag::ErrClosing => {}
                _ => {
                    r.comm_close(fd);
                    fetch_abort(
                        r,
                        &entry,
                        503,
                        "Connection Failed",
                        "The request could not be delivered to the remote site.",
                    );
                }
            }
        }),
    );
}

fn arm_read(r: &mut Reactor, fd: i32, fetch: &FetchRef) {
    let f = fetch.clone();
    r.set_read_handler(fd, Some(Box::new(move |r, fd| read_reply(r, fd, &f))));
    let f = fetch.clone();
    let read_timeout = get_config().general.read_timeout.as_secs() as i64;
    r.set_timeout(
        fd,
        read_timeout,
        Some(Box::new(move |r, fd| {
            let entry = f.borrow().entry.clone();
            fetch_abort(
                r,
                &entry,
                504,
                "Read Timeout",
                "The remote site stopped sending data; it may be down or too slow.",
            );
            r.comm_close(fd);
        })),
    );
}

fn read_reply(r: &mut Reactor, fd: i32, fetch: &FetchRef) {
    let entry = fetch.borrow().entry.clone();

    if entry.borrow().has(ENTRY_DELETE_BEHIND) {
        if store::client_waiting(&entry) {
            let (clen, off) = {
                let e = entry.borrow();
                (e.mem.current_len(), e.mem.lowest_offset())
            };
            if clen - off > HTTP_DELETE_GAP {
                trace!("read deferred for {}: gap {} bytes", entry.borrow().url, clen - off);
                // stay subscribed without draining: TCP backpressure reaches
                // the origin while the reader catches up
                let f = fetch.clone();
                r.set_read_handler(fd, Some(Box::new(move |r, fd| read_reply(r, fd, &f))));
                // no read timeout while we are the ones refusing to read
                r.set_timeout(fd, 0, None);
                return;
            }
        } else {
            fetch_abort(
                r,
                &entry,
                500,
                "No Client",
                "All clients went away before the transfer completed \
                 and the object is too big to cache.",
            );
            r.comm_close(fd);
            return;
        }
    }

    let mut page = FETCH_BUF_POOL.alloc();
    page.resize(FETCH_READ_SIZE, 0);
    match r.read(fd, &mut page[..]) {
        Err(ref e) if comm::ignore_errno(e) => {
            arm_read(r, fd, fetch);
        }
        Err(e) => {
            let reset = e.raw_os_error() == Some(libc::ECONNRESET);
            let have_data = fetch.borrow().headers_done && entry.borrow().mem.current_len() > 0;
            if reset && have_data {
                // RESET at the end of transmission counts as EOF
                debug!("fetch FD {fd}: RESET treated as end of object");
                finish_fetch(r, fd, fetch);
            } else {
                fetch_abort(
                    r,
                    &entry,
                    502,
                    "Read Error",
                    "The connection to the remote site failed mid-transfer.",
                );
                r.comm_close(fd);
            }
        }
        Ok(0) => {
            if fetch.borrow().headers_done {
                finish_fetch(r, fd, fetch);
            } else {
                fetch_abort(
                    r,
                    &entry,
                    502,
                    "Zero Sized Reply",
                    "The remote site closed the connection without sending any data.",
                );
                r.comm_close(fd);
            }
        }
        Ok(n) => {
            r.stats.server_bytes_in += n as u64;
            let data = page[..n].to_vec();
            drop(page);
            handle_bytes(r, fd, fetch, &data);
        }
    }
}

fn handle_bytes(r: &mut Reactor, fd: i32, fetch: &FetchRef, data: &[u8]) {
    if fetch.borrow().headers_done {
        ingest_body(r, fd, fetch, data);
        return;
    }

    let entry = fetch.borrow().entry.clone();
    let max_head = get_config().general.max_request_header_size.as_usize();
    fetch.borrow_mut().in_buf.extend_from_slice(data);

    let parsed = {
        let f = fetch.borrow();
        http::parse_reply(&f.in_buf, max_head)
    };
    match parsed {
        Err(e) => {
            debug!("fetch FD {fd}: bad reply head: {e}");
            fetch_abort(
                r,
                &entry,
                502,
                "Invalid Response",
                "The remote site sent a malformed HTTP response.",
            );
            r.comm_close(fd);
        }
        Ok(None) => {
            arm_read(r, fd, fetch);
        }
        Ok(Some((mut reply, consumed))) => {
            if (100..200).contains(&reply.status) {
                // interim reply: discard it and keep parsing
                let rest = {
                    let mut f = fetch.borrow_mut();
                    f.in_buf.split_off(consumed)
                };
                fetch.borrow_mut().in_buf.clear();
                if rest.is_empty() {
                    arm_read(r, fd, fetch);
                } else {
                    handle_bytes(r, fd, fetch, &rest);
                }
                return;
            }
            let method = entry.borrow().method;
            let chunked = reply
                .headers
                .get("Transfer-Encoding")
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
            let content_length = reply.headers.content_length().unwrap_or(None);
            let bodyless = method == Method::Head || reply.status == 204 || reply.status == 304;

            let body = {
                let mut f = fetch.borrow_mut();
                f.headers_done = true;
                f.body_remaining = if bodyless {
                    Some(0)
                } else if chunked {
                    None // the chunked stream is stored verbatim; EOF ends it
                } else {
                    content_length
                };
                let tail = f.in_buf.split_off(consumed);
                f.in_buf.clear();
                tail
            };

            // reply-side cacheability
            if reply.status != 200
                || reply.headers.cache_control_has("private")
                || reply.headers.cache_control_has("no-store")
                || chunked
            {
                store::release_request(r, &entry);
            }
            http::strip_hop_headers(&mut reply.headers);
            trace!("fetch FD {fd}: reply {} ({} body bytes buffered)", reply.status, body.len());
            store::set_reply(r, &entry, reply);

            if !body.is_empty() {
                ingest_body(r, fd, fetch, &body);
            } else if fetch.borrow().body_remaining == Some(0) {
                finish_fetch(r, fd, fetch);
            } else {
                arm_read(r, fd, fetch);
            }
        }
    }
}

fn ingest_body(r: &mut Reactor, fd: i32, fetch: &FetchRef, data: &[u8]) {
    let entry = fetch.borrow().entry.clone();

    if entry.borrow().has(ENTRY_CLIENT_ABORT) {
        // keep the last bit we already have, then give up on the origin
        store::append(r, &entry, data);
        fetch_abort(
            r,
            &entry,
            500,
            "Client Aborted",
            "The client dropped the connection before the transfer completed.",
        );
        r.comm_close(fd);
        return;
    }

    let cap = get_config().general.max_object_size_in_memory.as_bytes();
    let grown = entry.borrow().mem.current_len() + data.len() as u64;
    if grown > cap && !entry.borrow().has(ENTRY_DELETE_BEHIND) {
        // accept the data, but start deleting behind it
        store::start_delete_behind(r, &entry);
    }

    store::append(r, &entry, data);

    let done = {
        let mut f = fetch.borrow_mut();
        match f.body_remaining {
            Some(rem) => {
                let left = rem.saturating_sub(data.len() as u64);
                f.body_remaining = Some(left);
                left == 0
            }
            None => false,
        }
    };
    if done {
        finish_fetch(r, fd, fetch);
    } else {
        arm_read(r, fd, fetch);
    }
}

fn finish_fetch(r: &mut Reactor, fd: i32, fetch: &FetchRef) {
    let entry = fetch.borrow().entry.clone();
    {
        let mut e = entry.borrow_mut();
        if !e.has(ENTRY_DELETE_BEHIND) {
            let rules = get_config().general.ttl_rules();
            let now = clock::current_time();
            let ttl = e
                .reply
                .as_ref()
                .map(|rep| ttl::http_ttl(rep, now, &rules))
                .unwrap_or(0);
            e.expires = now + ttl;
        }
    }
    store::complete(r, &entry);
    r.comm_close(fd);
}

#[cfg(test)]
mod tests;
