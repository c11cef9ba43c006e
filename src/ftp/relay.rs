//! The upstream FTP peer: one control connection per gateway session,
//! commands forwarded as the client issues them, data transfers carried over
//! upstream-passive connections and bridged through a store entry (down) or
//! a body pipe (up).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::BytesMut;
use log::{debug, trace};

use crate::comm::{self, ConnectProgress, Flag, Reactor};
use crate::config::get_config;
use crate::ftp::reply::{RawReply, ReplyParser, ReplyWrapper};
use crate::ftp::{self, SessionRef};
use crate::server::ipcache;
use crate::store::{self, Entry};

/// Upload bytes travel from the client data connection to the relay through
/// this pipe; the producer wakes the consumer as data lands.
pub struct BodyPipe {
    pub buf: BytesMut,
    pub done: bool,
    consumer: Option<Box<dyn FnOnce(&mut Reactor)>>,
}

pub type PipeRef = Rc<RefCell<BodyPipe>>;

impl BodyPipe {
    pub fn new() -> PipeRef {
        Rc::new(RefCell::new(BodyPipe {
            buf: BytesMut::new(),
            done: false,
            consumer: None,
        }))
    }
}

pub fn pipe_put(r: &mut Reactor, pipe: &PipeRef, data: &[u8]) {
    pipe.borrow_mut().buf.extend_from_slice(data);
    pipe_wake(r, pipe);
}

pub fn pipe_finish(r: &mut Reactor, pipe: &PipeRef) {
    pipe.borrow_mut().done = true;
    pipe_wake(r, pipe);
}

fn pipe_wake(r: &mut Reactor, pipe: &PipeRef) {
    if let Some(cb) = pipe.borrow_mut().consumer.take() {
        cb(r);
    }
}

/// What a forwarded command needs from the data channel.
pub enum CmdKind {
    Plain,
    Download(Entry),
    Upload(PipeRef),
}

pub struct Pending {
    pub cmd: String,
    pub args: String,
    pub kind: CmdKind,
}

enum Phase {
    Connecting,
    AwaitGreeting,
    Idle,
    AwaitReply,
    AwaitPasv,
    DataConnect,
    AwaitTransferStart,
    Downloading,
    Uploading,
    AwaitFinal,
    Dead,
}

pub struct FtpRelay {
    pub host: String,
    pub port: u16,
    ctrl_fd: i32,
    phase: Phase,
    parser: ReplyParser,
    pending: Option<Pending>,
    data_fd: Option<i32>,
    /// The final transfer reply arrived before the data EOF did.
    final_seen: bool,
    session: Weak<RefCell<ftp::FtpSession>>,
}

pub type RelayRef = Rc<RefCell<FtpRelay>>;

const RELAY_READ_SIZE: usize = 16 * 1024;

/// Forward one command; establishes the control connection on first use.
pub fn forward(r: &mut Reactor, session: &SessionRef, pending: Pending) {
    let relay = {
        let s = session.borrow();
        s.relay.clone()
    };
    match relay {
        Some(relay) => {
            {
                let mut rl = relay.borrow_mut();
                assert!(rl.pending.is_none(), "one command in flight per session");
                rl.pending = Some(pending);
            }
            if matches!(relay.borrow().phase, Phase::Idle) {
                send_pending(r, &relay);
            }
        }
        None => {
            let (host, port) = {
                let s = session.borrow();
                match s.host.rsplit_once(':') {
                    Some((h, p)) if p.parse::<u16>().is_ok() => {
                        (h.to_string(), p.parse().expect("checked"))
                    }
                    _ => (s.host.clone(), 21),
                }
            };
            begin(r, session, host, port, pending);
        }
    }
}

/// Tear the relay down; idempotent, used on session teardown and USER reset.
pub fn close(r: &mut Reactor, relay: &RelayRef) {
    let (ctrl, data) = {
        let mut rl = relay.borrow_mut();
        rl.phase = Phase::Dead;
        (rl.ctrl_fd, rl.data_fd.take())
    };
    if let Some(fd) = data {
        r.comm_close(fd);
    }
    r.comm_close(ctrl);
}

fn begin(r: &mut Reactor, session: &SessionRef, host: String, port: u16, pending: Pending) {
    let ips = match ipcache::resolve(&host) {
        Ok(ips) => ips,
        Err(_) => {
            ftp::relay_failed(r, session, "cannot resolve FTP server");
            return;
        }
    };
    let dest = SocketAddr::new(ips[0], port);
    let fd = match r.open_tcp_socket(dest.is_ipv4(), &format!("ftp://{host}:{port}")) {
        Ok(fd) => fd,
        Err(_) => {
            ftp::relay_failed(r, session, "out of descriptors");
            return;
        }
    };

    let relay = Rc::new(RefCell::new(FtpRelay {
        host,
        port,
        ctrl_fd: fd,
        phase: Phase::Connecting,
        parser: ReplyParser::new(),
        pending: Some(pending),
        data_fd: None,
        final_seen: false,
        session: Rc::downgrade(session),
    }));
    session.borrow_mut().relay = Some(relay.clone());

    let connect_timeout = get_config().general.connect_timeout.as_secs() as i64;
    {
        let rl = relay.clone();
        r.set_timeout(
            fd,
            connect_timeout,
            Some(Box::new(move |r, _| {
                fail(r, &rl, "timeout connecting to FTP server");
            })),
        );
    }

    match r.connect(fd, dest) {
        ConnectProgress::Connected => control_established(r, &relay),
        ConnectProgress::InProgress => {
            let rl = relay.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, fd| relay_connecting(r, &rl, fd, dest))),
            );
        }
        ConnectProgress::Failed(_) => fail(r, &relay, "cannot connect to FTP server"),
    }
}

fn relay_connecting(r: &mut Reactor, relay: &RelayRef, fd: i32, dest: SocketAddr) {
    match r.connect(fd, dest) {
        ConnectProgress::Connected => control_established(r, relay),
        ConnectProgress::InProgress => {
            let rl = relay.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, fd| relay_connecting(r, &rl, fd, dest))),
            );
        }
        ConnectProgress::Failed(_) => fail(r, relay, "cannot connect to FTP server"),
    }
}

fn control_established(r: &mut Reactor, relay: &RelayRef) {
    relay.borrow_mut().phase = Phase::AwaitGreeting;
    arm_control_read(r, relay);
}

fn arm_control_read(r: &mut Reactor, relay: &RelayRef) {
    let fd = relay.borrow().ctrl_fd;
    if !r.fds.is_open(fd) {
        return;
    }
    let rl = relay.clone();
    r.set_read_handler(fd, Some(Box::new(move |r, fd| control_read(r, fd, &rl))));
    let read_timeout = get_config().general.read_timeout.as_secs() as i64;
    let rl = relay.clone();
    r.set_timeout(
        fd,
        read_timeout,
        Some(Box::new(move |r, _| {
            fail(r, &rl, "FTP server stopped responding");
        })),
    );
}

fn control_read(r: &mut Reactor, fd: i32, relay: &RelayRef) {
    let mut buf = [0u8; 4096];
    match r.read(fd, &mut buf) {
        Err(ref e) if comm::ignore_errno(e) => arm_control_read(r, relay),
        Err(_) | Ok(0) => fail(r, relay, "FTP server closed the control connection"),
        Ok(n) => {
            let mut bytes = BytesMut::from(&buf[..n]);
            loop {
                let advanced = relay.borrow_mut().parser.advance(&mut bytes);
                match advanced {
                    Ok(Some(raw)) => {
                        trace!("relay FD {fd}: <<{} {}", raw.code, raw.reason());
                        handle_control_reply(r, relay, raw);
                        if matches!(relay.borrow().phase, Phase::Dead) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        fail(r, relay, "FTP server sent a malformed reply");
                        return;
                    }
                }
            }
            arm_control_read(r, relay);
        }
    }
}

fn write_command(r: &mut Reactor, relay: &RelayRef, cmd: &str, args: &str) {
    let fd = relay.borrow().ctrl_fd;
    let line = if args.is_empty() {
        format!("{cmd}\r\n")
    } else {
        format!("{cmd} {args}\r\n")
    };
    trace!("relay FD {fd}: >>{}", line.trim_end());
    let rl = relay.clone();
    comm::write_full(
        r,
        fd,
        BytesMut::from(line.as_bytes()),
        Box::new(move |r, res| {
            if res.flag != Flag::Ok && res.flag != Flag::ErrClosing {
                fail(r, &rl, "cannot send command to FTP server");
            }
        }),
    );
}

fn send_pending(r: &mut Reactor, relay: &RelayRef) {
    let (cmd, args, needs_data) = {
        let rl = relay.borrow();
        match rl.pending.as_ref() {
            Some(p) => (
                p.cmd.clone(),
                p.args.clone(),
                !matches!(p.kind, CmdKind::Plain),
            ),
            None => return,
        }
    };
    relay.borrow_mut().final_seen = false;
    if needs_data {
        relay.borrow_mut().phase = Phase::AwaitPasv;
        write_command(r, relay, "PASV", "");
    } else {
        relay.borrow_mut().phase = Phase::AwaitReply;
        write_command(r, relay, &cmd, &args);
    }
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` → socket address.
fn parse_pasv_reply(raw: &RawReply) -> Option<SocketAddr> {
    let text = raw.lines.last()?;
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let nums: Vec<u16> = text[open + 1..close]
        .split(',')
        .map(|t| t.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .ok()?;
    if nums.len() != 6 || nums[..4].iter().any(|&n| n > 255) {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(
        nums[0] as u8,
        nums[1] as u8,
        nums[2] as u8,
        nums[3] as u8,
    );
    Some(SocketAddr::new(ip.into(), nums[4] * 256 + nums[5]))
}

fn handle_control_reply(r: &mut Reactor, relay: &RelayRef, raw: RawReply) {
    let phase_now = {
        let rl = relay.borrow();
        match rl.phase {
            Phase::AwaitGreeting => 0,
            Phase::AwaitReply => 1,
            Phase::AwaitPasv => 2,
            Phase::AwaitTransferStart => 3,
            Phase::Downloading | Phase::Uploading | Phase::AwaitFinal => 4,
            _ => 5,
        }
    };

    match phase_now {
        0 => {
            if raw.code != 220 {
                fail(r, relay, "FTP server refused the connection");
                return;
            }
            relay.borrow_mut().phase = Phase::Idle;
            send_pending(r, relay);
        }
        1 => {
            relay.borrow_mut().phase = Phase::Idle;
            let pending = relay.borrow_mut().pending.take();
            if pending.is_some() {
                deliver(r, relay, raw.into_wrapper());
            }
        }
        2 => {
            let Some(addr) = parse_pasv_reply(&raw) else {
                finish_data_command(r, relay, raw.into_wrapper());
                return;
            };
            open_data_connection(r, relay, addr);
        }
        3 => {
            if raw.code >= 300 {
                // upstream refused the transfer; the data conn is useless
                if let Some(fd) = relay.borrow_mut().data_fd.take() {
                    r.comm_close(fd);
                }
                finish_data_command(r, relay, raw.into_wrapper());
                return;
            }
            // 125/150: transfer starts
            let kind_is_download = matches!(
                relay.borrow().pending.as_ref().map(|p| &p.kind),
                Some(CmdKind::Download(_))
            );
            relay.borrow_mut().phase = if kind_is_download {
                Phase::Downloading
            } else {
                Phase::Uploading
            };
            deliver_transfer_start(r, relay, raw.into_wrapper());
            if kind_is_download {
                arm_data_read(r, relay);
            } else {
                shovel_upload(r, relay);
            }
        }
        4 => {
            // final transfer reply
            let done_downloading = matches!(relay.borrow().phase, Phase::AwaitFinal);
            let is_ok_download = raw.code < 300
                && matches!(
                    relay.borrow().pending.as_ref().map(|p| &p.kind),
                    Some(CmdKind::Download(_))
                );
            if is_ok_download && !done_downloading {
                // success reply raced ahead of the data EOF: let the data
                // connection drain; its EOF will finish the transfer
                relay.borrow_mut().final_seen = true;
                return;
            }
            let pending = relay.borrow_mut().pending.take();
            relay.borrow_mut().phase = Phase::Idle;
            match pending.map(|p| p.kind) {
                Some(CmdKind::Download(entry)) => {
                    if raw.code >= 300 {
                        // the forwarded reply answers the client; the abort
                        // afterwards only unwinds the entry
                        finish_data_command(r, relay, raw.clone().into_wrapper());
                        store_abort_download(r, &entry, &raw);
                    } else {
                        // data already complete; session sends its own 226
                        debug!("relay: discarding upstream final reply {}", raw.code);
                    }
                }
                Some(CmdKind::Upload(_)) | None => {
                    deliver(r, relay, raw.into_wrapper());
                }
                Some(CmdKind::Plain) => unreachable!("plain commands have no data phase"),
            }
        }
        _ => {
            debug!("relay: unsolicited reply {} ignored", raw.code);
        }
    }
}

fn store_abort_download(r: &mut Reactor, entry: &Entry, raw: &RawReply) {
    let (reply, body) = crate::server::error_page(
        502,
        "FTP Transfer Failed",
        raw.reason(),
        &entry.borrow().url.clone(),
    );
    store::abort(r, entry, reply, &body);
}

fn open_data_connection(r: &mut Reactor, relay: &RelayRef, addr: SocketAddr) {
    let fd = match r.open_tcp_socket(addr.is_ipv4(), "ftp relay data") {
        Ok(fd) => fd,
        Err(_) => {
            fail(r, relay, "out of descriptors for data connection");
            return;
        }
    };
    relay.borrow_mut().data_fd = Some(fd);
    relay.borrow_mut().phase = Phase::DataConnect;

    match r.connect(fd, addr) {
        ConnectProgress::Connected => data_connected(r, relay),
        ConnectProgress::InProgress => {
            let rl = relay.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, fd| data_connecting(r, &rl, fd, addr))),
            );
        }
        ConnectProgress::Failed(_) => {
            fail(r, relay, "cannot open data connection to FTP server")
        }
    }
}

fn data_connecting(r: &mut Reactor, relay: &RelayRef, fd: i32, addr: SocketAddr) {
    match r.connect(fd, addr) {
        ConnectProgress::Connected => data_connected(r, relay),
        ConnectProgress::InProgress => {
            let rl = relay.clone();
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, fd| data_connecting(r, &rl, fd, addr))),
            );
        }
        ConnectProgress::Failed(_) => {
            fail(r, relay, "cannot open data connection to FTP server")
        }
    }
}

fn data_connected(r: &mut Reactor, relay: &RelayRef) {
    let (cmd, args) = {
        let rl = relay.borrow();
        match rl.pending.as_ref() {
            Some(p) => (p.cmd.clone(), p.args.clone()),
            None => return,
        }
    };
    relay.borrow_mut().phase = Phase::AwaitTransferStart;
    write_command(r, relay, &cmd, &args);
}

fn arm_data_read(r: &mut Reactor, relay: &RelayRef) {
    let Some(fd) = relay.borrow().data_fd else {
        return;
    };
    if !r.fds.is_open(fd) {
        return;
    }
    let rl = relay.clone();
    r.set_read_handler(fd, Some(Box::new(move |r, fd| data_read(r, fd, &rl))));
}

fn data_read(r: &mut Reactor, fd: i32, relay: &RelayRef) {
    let entry = match relay.borrow().pending.as_ref().map(|p| &p.kind) {
        Some(CmdKind::Download(entry)) => entry.clone(),
        _ => return,
    };

    // the session's reader applies the FTP delete gap through the entry
    if entry.borrow().has(store::ENTRY_DELETE_BEHIND) && store::client_waiting(&entry) {
        let (clen, off) = {
            let e = entry.borrow();
            (e.mem.current_len(), e.mem.lowest_offset())
        };
        if clen - off > store::FTP_DELETE_GAP {
            let rl = relay.clone();
            r.set_read_handler(fd, Some(Box::new(move |r, fd| data_read(r, fd, &rl))));
            return;
        }
    }

    let mut buf = [0u8; RELAY_READ_SIZE];
    match r.read(fd, &mut buf) {
        Err(ref e) if comm::ignore_errno(e) => arm_data_read(r, relay),
        Err(_) => fail(r, relay, "data connection error"),
        Ok(0) => {
            trace!("relay FD {fd}: data EOF");
            {
                let mut rl = relay.borrow_mut();
                rl.data_fd = None;
                if rl.final_seen {
                    // the upstream's final reply already came through
                    rl.pending = None;
                    rl.phase = Phase::Idle;
                } else {
                    rl.phase = Phase::AwaitFinal;
                }
            }
            r.comm_close(fd);
            store::complete(r, &entry);
        }
        Ok(n) => {
            let cap = get_config().general.max_object_size_in_memory.as_bytes();
            if entry.borrow().mem.current_len() + n as u64 > cap
                && !entry.borrow().has(store::ENTRY_DELETE_BEHIND)
            {
                store::start_delete_behind(r, &entry);
            }
            store::append(r, &entry, &buf[..n]);
            arm_data_read(r, relay);
        }
    }
}

fn shovel_upload(r: &mut Reactor, relay: &RelayRef) {
    let (pipe, fd) = {
        let rl = relay.borrow();
        let pipe = match rl.pending.as_ref().map(|p| &p.kind) {
            Some(CmdKind::Upload(pipe)) => pipe.clone(),
            _ => return,
        };
        let Some(fd) = rl.data_fd else { return };
        (pipe, fd)
    };

    let (chunk, done) = {
        let mut p = pipe.borrow_mut();
        let chunk = p.buf.split();
        (chunk, p.done)
    };

    if chunk.is_empty() {
        if done {
            // body finished: close the data connection to signal EOF and
            // wait for the upstream's final reply
            relay.borrow_mut().data_fd = None;
            relay.borrow_mut().phase = Phase::AwaitFinal;
            r.comm_close(fd);
        } else {
            let rl = relay.clone();
            pipe.borrow_mut().consumer = Some(Box::new(move |r| shovel_upload(r, &rl)));
        }
        return;
    }

    let rl = relay.clone();
    comm::write_full(
        r,
        fd,
        chunk,
        Box::new(move |r, res| {
            if res.flag == Flag::Ok {
                shovel_upload(r, &rl);
            } else if res.flag != Flag::ErrClosing {
                fail(r, &rl, "upload data connection error");
            }
        }),
    );
}

fn deliver(r: &mut Reactor, relay: &RelayRef, wrapper: ReplyWrapper) {
    if let Some(session) = relay.borrow().session.upgrade() {
        ftp::relay_reply(r, &session, wrapper);
    }
}

/// Deliver a 1xx transfer-start reply without consuming the pending command.
fn deliver_transfer_start(r: &mut Reactor, relay: &RelayRef, wrapper: ReplyWrapper) {
    if let Some(session) = relay.borrow().session.upgrade() {
        ftp::relay_reply(r, &session, wrapper);
    }
}

/// A data command is over (successfully or not): drop its data channel and
/// hand the wrapper up.
fn finish_data_command(r: &mut Reactor, relay: &RelayRef, wrapper: ReplyWrapper) {
    let data_fd = {
        let mut rl = relay.borrow_mut();
        rl.pending = None;
        rl.phase = Phase::Idle;
        rl.data_fd.take()
    };
    if let Some(fd) = data_fd {
        r.comm_close(fd);
    }
    deliver(r, relay, wrapper);
}

fn fail(r: &mut Reactor, relay: &RelayRef, note: &str) {
    debug!("ftp relay failure: {note}");
    let session = relay.borrow().session.upgrade();
    close(r, relay);
    if let Some(session) = session {
        ftp::relay_failed(r, &session, note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pasv_reply() {
        let raw = RawReply {
            code: 227,
            lines: vec!["227 Entering Passive Mode (192,0,2,7,4,1)".to_string()],
        };
        assert_eq!(
            parse_pasv_reply(&raw),
            Some("192.0.2.7:1025".parse().unwrap())
        );

        let bad = RawReply {
            code: 227,
            lines: vec!["227 whatever".to_string()],
        };
        assert_eq!(parse_pasv_reply(&bad), None);

        let oob = RawReply {
            code: 227,
            lines: vec!["227 Entering Passive Mode (999,0,2,7,4,1)".to_string()],
        };
        assert_eq!(parse_pasv_reply(&oob), None);
    }
}
