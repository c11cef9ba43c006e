//! The FTP-to-HTTP translation server: an FTP control endpoint facing the
//! client, a relayed FTP peer upstream, and a data connection whose
//! lifecycle is independent of both.
//!
//! The control connection runs an explicit state machine; at most one
//! command is in flight per session, and every exit path funnels through
//! `close_data_connection`, which is idempotent.

pub mod relay;
pub mod reply;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BytesMut;
use log::{debug, info, trace, warn};

use crate::comm::{self, Flag, Reactor};
use crate::config::{get_config, PortCfg};
use crate::ftp::relay::{CmdKind, Pending, PipeRef, RelayRef};
use crate::ftp::reply::{unquote_pre, ReplyWrapper};
use crate::store::{self, ClientRef, CopyResult, Entry};
use crate::utils::clock;

/// Master server-state of one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Begin,
    Connected,
    HandleFeat,
    HandlePasv,
    HandlePort,
    HandleDataRequest,
    HandleUploadRequest,
    HandleEprt,
    HandleEpsv,
    HandleCwd,
    HandlePass,
    HandleCdup,
    Error,
}

/// RFC 959 verbs the gateway can relay meaningfully. `AUTH` is deliberately
/// absent: TLS upgrade of relayed control channels is not offered.
const SUPPORTED_COMMANDS: [&str; 37] = [
    "USER", "PASS", "ACCT", "QUIT", "PORT", "EPRT", "PASV", "EPSV", "TYPE", "MODE", "STRU",
    "RETR", "STOR", "STOU", "APPE", "ALLO", "REST", "RNFR", "RNTO", "ABOR", "DELE", "RMD",
    "MKD", "PWD", "CWD", "CDUP", "LIST", "NLST", "MLSD", "MLST", "SYST", "STAT", "HELP",
    "FEAT", "NOOP", "SIZE", "MDTM",
];

/// Commands whose parameter is a pathname (used when composing the URI).
const PATHED_COMMANDS: [&str; 15] = [
    "MLST", "MLSD", "STAT", "NLST", "LIST", "MKD", "RMD", "DELE", "RNTO", "RNFR", "APPE",
    "STOR", "RETR", "SMNT", "CWD",
];

const UPLOAD_COMMANDS: [&str; 3] = ["STOR", "APPE", "STOU"];
const DOWNLOAD_COMMANDS: [&str; 4] = ["RETR", "LIST", "NLST", "MLSD"];

/// Hard cap on one command token, independent of the header-size directive.
const MAX_TOKEN: usize = 32 * 1024;

fn supported_command(cmd: &str) -> bool {
    SUPPORTED_COMMANDS.contains(&cmd)
}

fn command_has_path_parameter(cmd: &str) -> bool {
    PATHED_COMMANDS.contains(&cmd)
}

enum PreCheck {
    Ready,
    /// Waiting on a passive accept or an active connect.
    Waiting,
    Failed,
}

pub struct FtpSession {
    pub ctrl_fd: i32,
    pub port: Rc<PortCfg>,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub state: ServerState,
    greeting_read: bool,
    pub uri: String,
    pub host: String,
    working_dir: String,
    got_epsv_all: bool,
    in_buf: BytesMut,

    data_conn: Option<i32>,
    data_listen: Option<(i32, u16)>,
    connector_pending: bool,
    /// PORT/EPRT advertised address; the not-yet-opened active data conn.
    active_addr: Option<SocketAddr>,
    /// Reply parked until the passive accept fires.
    parked_reply: Option<ReplyWrapper>,
    /// CWD argument awaiting the peer's verdict.
    pending_cwd: Option<String>,

    upload_pipe: Option<PipeRef>,
    pub relay: Option<RelayRef>,
    entry: Option<Entry>,
    reader: Option<ClientRef>,
}

pub type SessionRef = Rc<RefCell<FtpSession>>;

/// Accept handler for ftp_port listeners.
pub fn accept_connections(r: &mut Reactor, lfd: i32, port: &Rc<PortCfg>) {
    loop {
        match r.accept(lfd, "client ftp connect") {
            Ok((fd, peer, local)) => {
                if get_config().general.log_client_connections {
                    info!("ftp client connection from {peer} on {}", port.name);
                }
                new_session(r, fd, peer, local, port.clone());
            }
            Err(ref e) if comm::ignore_errno(e) => break,
            Err(e) => {
                debug!("ftp accept failure on {}: {e}", port.name);
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

fn new_session(r: &mut Reactor, fd: i32, peer: SocketAddr, local: SocketAddr, port: Rc<PortCfg>) {
    let mut session = FtpSession {
        ctrl_fd: fd,
        port,
        peer,
        local,
        state: ServerState::Begin,
        greeting_read: false,
        uri: String::new(),
        host: String::new(),
        working_dir: String::new(),
        got_epsv_all: false,
        in_buf: BytesMut::new(),
        data_conn: None,
        data_listen: None,
        connector_pending: false,
        active_addr: None,
        parked_reply: None,
        pending_cwd: None,
        upload_pipe: None,
        relay: None,
        entry: None,
        reader: None,
    };

    // interception: the URL derives from where the client thought it was
    // connecting, and no USER is required to compute it
    if session.port.transparent() {
        session.host = format!("{}", local.ip());
        calc_uri(&mut session, None);
        debug!("FTP transparent URL: {}", session.uri);
    }

    let session = Rc::new(RefCell::new(session));

    {
        let s = session.clone();
        r.add_close_handler(
            fd,
            Box::new(move |r| {
                close_data_connection(r, &s);
                let relay = s.borrow_mut().relay.take();
                if let Some(relay) = relay {
                    relay::close(r, &relay);
                }
                let (entry, reader) = {
                    let mut b = s.borrow_mut();
                    (b.entry.take(), b.reader.take())
                };
                if let (Some(entry), Some(reader)) = (entry, reader) {
                    store::unsubscribe(r, &entry, &reader);
                }
            }),
        );
    }

    // Begin -> Connected happens by greeting the client
    write_early_reply(r, &session, 220, "Service ready");
    session.borrow_mut().state = ServerState::Connected;
}

/// Ready for the next command: consume one already buffered, or wait for
/// the socket.
fn arm_ctrl_read(r: &mut Reactor, session: &SessionRef) {
    let buffered = session
        .borrow()
        .in_buf
        .iter()
        .any(|&b| b == b'\n');
    if buffered {
        parse_one_request(r, session);
    } else {
        arm_ctrl_socket(r, session);
    }
}

fn arm_ctrl_socket(r: &mut Reactor, session: &SessionRef) {
    let fd = session.borrow().ctrl_fd;
    if !r.fds.is_open(fd) {
        return;
    }
    let s = session.clone();
    r.set_read_handler(fd, Some(Box::new(move |r, fd| ctrl_read(r, fd, &s))));
    let idle = get_config().general.ftp_client_idle_timeout.as_secs() as i64;
    r.set_timeout(fd, idle, None);
}

fn ctrl_read(r: &mut Reactor, fd: i32, session: &SessionRef) {
    let mut buf = [0u8; 4096];
    match r.read(fd, &mut buf) {
        Err(ref e) if comm::ignore_errno(e) => arm_ctrl_socket(r, session),
        Err(_) | Ok(0) => {
            trace!("ftp client FD {fd} control closed");
            r.comm_close(fd);
        }
        Ok(n) => {
            session.borrow_mut().in_buf.extend_from_slice(&buf[..n]);
            parse_one_request(r, session);
        }
    }
}

/// Scan the control buffer for one full `\r\n`-terminated command. OWS and
/// empty commands are skipped up to a hard buffer limit.
fn parse_one_request(r: &mut Reactor, session: &SessionRef) {
    const INLINE_SPACE: &[u8] = b" \x0c\r\t\x0b";
    let max_buf = get_config().general.max_request_header_size.as_usize();

    let line = {
        let mut s = session.borrow_mut();
        // leading OWS and empty command lines
        while let Some(&b) = s.in_buf.first() {
            if INLINE_SPACE.contains(&b) || b == b'\n' {
                let _ = s.in_buf.split_to(1);
            } else {
                break;
            }
        }
        match s.in_buf.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let raw = s.in_buf.split_to(nl + 1);
                Some(raw)
            }
            None => {
                if s.in_buf.len() >= max_buf.min(MAX_TOKEN) {
                    None // overflow handled below with the borrow released
                } else {
                    drop(s);
                    arm_ctrl_socket(r, session);
                    return;
                }
            }
        }
    };

    let Some(raw) = line else {
        // overlong input without a terminator
        session.borrow_mut().state = ServerState::Error;
        write_final_reply(r, session, 421, "Huge request");
        return;
    };

    let text = String::from_utf8_lossy(&raw);
    let text = text.trim_end_matches(['\r', '\n']);
    let mut parts = text.splitn(2, [' ', '\t']);
    let verb = parts.next().unwrap_or("").to_uppercase();
    let params = parts
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| INLINE_SPACE.contains(&(c as u8)))
        .to_string();

    if verb.is_empty() {
        arm_ctrl_read(r, session);
        return;
    }
    if verb.len() > MAX_TOKEN || params.len() > MAX_TOKEN {
        session.borrow_mut().state = ServerState::Error;
        write_final_reply(r, session, 421, "Huge request");
        return;
    }

    debug!(">>ftp {verb} {params}");
    handle_command(r, session, verb, params);
}

fn change_state(session: &SessionRef, new_state: ServerState, reason: &str) {
    let mut s = session.borrow_mut();
    trace!(
        "ftp client state {:?} -> {:?} because {reason}",
        s.state,
        new_state
    );
    s.state = new_state;
}

/// Compute the session URI from host and, when tracked, working dir + file.
fn calc_uri(s: &mut FtpSession, file: Option<&str>) {
    let mut uri = format!("ftp://{}", s.host);
    if !s.working_dir.is_empty() {
        if !s.working_dir.starts_with('/') {
            uri.push('/');
        }
        uri.push_str(&s.working_dir);
    }
    if !uri.ends_with('/') {
        uri.push('/');
    }
    if let Some(file) = file {
        uri.push_str(file.trim_start_matches('/'));
    }
    s.uri = uri;
}

fn handle_command(r: &mut Reactor, session: &SessionRef, verb: String, params: String) {
    // explicit mode requires USER before anything else
    {
        let s = session.borrow();
        if !s.port.transparent() && !s.greeting_read && verb != "USER" {
            drop(s);
            write_early_reply(r, session, 530, "Must login first");
            return;
        }
    }

    if verb == "USER" && !session.borrow().port.transparent() {
        match handle_user(r, session, &params) {
            Ok(login) => {
                // forward just the login part to the peer
                forward_plain(r, session, ServerState::Connected, "USER", &login);
                return;
            }
            Err(()) => return, // early error already written
        }
    }

    if verb == "AUTH" || !supported_command(&verb) {
        write_early_reply(r, session, 502, "Unknown or unsupported command");
        return;
    }

    match verb.as_str() {
        "QUIT" => {
            session.borrow_mut().state = ServerState::Error;
            write_final_reply(r, session, 221, "Goodbye");
        }
        "PASV" => handle_pasv(r, session, &params),
        "EPSV" => handle_epsv(r, session, &params),
        "PORT" => handle_port(r, session, &params),
        "EPRT" => handle_eprt(r, session, &params),
        "FEAT" => forward_plain(r, session, ServerState::HandleFeat, "FEAT", ""),
        "CWD" => {
            session.borrow_mut().pending_cwd = Some(params.clone());
            forward_plain(r, session, ServerState::HandleCwd, "CWD", &params)
        }
        "CDUP" => forward_plain(r, session, ServerState::HandleCdup, "CDUP", ""),
        "PASS" => forward_plain(r, session, ServerState::HandlePass, "PASS", &params),
        v if DOWNLOAD_COMMANDS.contains(&v) => {
            handle_data_request(r, session, verb.clone(), params)
        }
        v if UPLOAD_COMMANDS.contains(&v) => {
            handle_upload_request(r, session, verb.clone(), params)
        }
        _ => {
            // forward as is, no post-processing
            forward_plain(r, session, ServerState::Connected, &verb, &params);
        }
    }
}

/// `USER login@host`: required to learn the peer; changing the host mid
/// session tears the old login down. Returns the login part for the peer.
fn handle_user(r: &mut Reactor, session: &SessionRef, params: &str) -> Result<String, ()> {
    if params.is_empty() {
        write_early_reply(r, session, 501, "Missing username");
        return Err(());
    }
    let Some((login, host)) = params.rsplit_once('@') else {
        write_early_reply(r, session, 501, "Missing host");
        return Err(());
    };
    if host.is_empty() {
        write_early_reply(r, session, 501, "Missing host");
        return Err(());
    }

    let old_uri = {
        let mut s = session.borrow_mut();
        let old = if s.greeting_read {
            Some(s.uri.clone())
        } else {
            None
        };
        s.host = host.to_string();
        s.working_dir.clear();
        calc_uri(&mut s, None);
        s.greeting_read = true;
        old
    };

    match old_uri {
        None => {
            debug!("set FTP URI to {}", session.borrow().uri);
        }
        // the original compares case-insensitively here, which is lossy for
        // case-sensitive server paths
        Some(old) if old.eq_ignore_ascii_case(&session.borrow().uri) => {
            trace!("kept FTP URI as {old}");
        }
        Some(old) => {
            debug!("reset FTP URI from {old} to {}", session.borrow().uri);
            close_data_connection(r, session);
            let relay = session.borrow_mut().relay.take();
            if let Some(relay) = relay {
                relay::close(r, &relay);
            }
            reset_login(session, "URI reset");
        }
    }

    Ok(login.to_string())
}

/// Clear client and server login-related state after the old login is gone.
fn reset_login(session: &SessionRef, reason: &str) {
    debug!("will need to re-login due to {reason}");
    session.borrow_mut().greeting_read = false;
    change_state(session, ServerState::Begin, reason);
    change_state(session, ServerState::Connected, "greeting already sent");
}

fn handle_pasv(r: &mut Reactor, session: &SessionRef, params: &str) {
    if session.borrow().got_epsv_all {
        write_early_reply(r, session, 500, "Bad PASV command");
        return;
    }
    if !params.is_empty() {
        write_early_reply(r, session, 501, "Unexpected parameter");
        return;
    }
    change_state(session, ServerState::HandlePasv, "handlePasvRequest");

    let Some(port) = listen_for_data_connection(r, session) else {
        return;
    };
    let addr = session.borrow().local.ip();
    let addr_str = format!("{addr}").replace('.', ",");
    let line = format!(
        "227 Entering Passive Mode ({},{},{}).",
        addr_str,
        port / 256,
        port % 256
    );
    write_final_reply_line(r, session, &line);
}

fn handle_epsv(r: &mut Reactor, session: &SessionRef, params: &str) {
    if params.eq_ignore_ascii_case("ALL") {
        session.borrow_mut().got_epsv_all = true;
        write_early_reply(r, session, 200, "EPSV ALL ok");
        return;
    }
    if !(params.is_empty() || params == "1" || params == "2") {
        write_early_reply(r, session, 501, "Unsupported EPSV parameter");
        return;
    }
    change_state(session, ServerState::HandleEpsv, "handleEpsvRequest");

    let Some(port) = listen_for_data_connection(r, session) else {
        return;
    };
    let line = format!("229 Entering Extended Passive Mode (|||{port}|)");
    write_final_reply_line(r, session, &line);
}

/// `PORT h1,h2,h3,h4,p1,p2`
fn parse_port_params(params: &str) -> Option<SocketAddr> {
    let nums: Vec<u16> = params
        .split(',')
        .map(|t| t.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .ok()?;
    if nums.len() != 6 || nums[..4].iter().any(|&n| n > 255) {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8);
    Some(SocketAddr::new(ip.into(), nums[4] * 256 + nums[5]))
}

/// `EPRT |proto|addr|port|`
fn parse_eprt_params(params: &str) -> Option<SocketAddr> {
    let mut it = params.split('|');
    let _empty = it.next()?;
    let _proto = it.next()?;
    let addr: std::net::IpAddr = it.next()?.parse().ok()?;
    let port: u16 = it.next()?.parse().ok()?;
    Some(SocketAddr::new(addr, port))
}

/// [Re]initializes the active data-connection target. Does not connect.
fn create_data_connection(
    r: &mut Reactor,
    session: &SessionRef,
    clt_addr: SocketAddr,
) -> bool {
    let ctrl_peer = session.borrow().peer;
    if clt_addr.ip() != ctrl_peer.ip() {
        debug!("rogue PORT {clt_addr} request? ctrl: {ctrl_peer}");
        // closing the control connection would not deter the attacker and
        // punishes the legitimate client, so only the parameter is refused
        write_early_reply(r, session, 501, "Prohibited parameter value");
        return false;
    }
    close_data_connection(r, session);
    session.borrow_mut().active_addr = Some(clt_addr);
    true
}

fn handle_port(r: &mut Reactor, session: &SessionRef, params: &str) {
    if session.borrow().got_epsv_all {
        write_early_reply(r, session, 500, "Rejecting PORT after EPSV ALL");
        return;
    }
    if params.is_empty() {
        write_early_reply(r, session, 501, "Missing parameter");
        return;
    }
    let Some(addr) = parse_port_params(params) else {
        write_early_reply(r, session, 501, "Invalid parameter");
        return;
    };
    if !create_data_connection(r, session, addr) {
        return;
    }
    change_state(session, ServerState::HandlePort, "handlePortRequest");
    write_final_reply(r, session, 200, "PORT successfully converted to PASV.");
}

fn handle_eprt(r: &mut Reactor, session: &SessionRef, params: &str) {
    debug!("process an EPRT {params}");
    if session.borrow().got_epsv_all {
        write_early_reply(r, session, 500, "Rejecting EPRT after EPSV ALL");
        return;
    }
    if params.is_empty() {
        write_early_reply(r, session, 501, "Missing parameter");
        return;
    }
    let Some(addr) = parse_eprt_params(params) else {
        write_early_reply(r, session, 501, "Invalid parameter");
        return;
    };
    if !create_data_connection(r, session, addr) {
        return;
    }
    change_state(session, ServerState::HandleEprt, "handleEprtRequest");
    write_final_reply(r, session, 200, "EPRT successfully converted to PASV.");
}

/// Passive mode: open a listening socket bound next to the control
/// connection and wait for the client. Returns the listening port.
fn listen_for_data_connection(r: &mut Reactor, session: &SessionRef) -> Option<u16> {
    close_data_connection(r, session);

    let bind_ip = if session.borrow().port.transparent() {
        session.borrow().port.addr.ip()
    } else {
        session.borrow().local.ip()
    };
    let bind = SocketAddr::new(bind_ip, 0);
    let uri = session.borrow().uri.clone();
    let (lfd, local) = match r.open_listener(bind, &uri, 8) {
        Ok(ok) => ok,
        Err(e) => {
            warn!("cannot open FTP data listener: {e}");
            write_final_reply(r, session, 451, "Internal error");
            return None;
        }
    };
    // the passive listener is not a hot TCP class; treat it as an ordinary
    // socket so its accept rides the general pass
    r.fds.get_mut(lfd).incoming = crate::comm::fd::IncomingClass::None;
    session.borrow_mut().data_listen = Some((lfd, local.port()));

    let s = session.clone();
    r.set_read_handler(
        lfd,
        Some(Box::new(move |r, lfd| accept_data_connection(r, lfd, &s))),
    );
    Some(local.port())
}

fn accept_data_connection(r: &mut Reactor, lfd: i32, session: &SessionRef) {
    match r.accept(lfd, "passive client ftp data") {
        Ok((fd, remote, _local)) => {
            let ctrl_peer = session.borrow().peer;
            if remote.ip() != ctrl_peer.ip() {
                debug!("rogue data conn? ctrl: {ctrl_peer}, data from {remote}");
                r.comm_close(fd);
                let s = session.clone();
                r.set_read_handler(
                    lfd,
                    Some(Box::new(move |r, lfd| accept_data_connection(r, lfd, &s))),
                );
                return;
            }
            trace!("accepted ftp data connection from {remote}");
            close_data_connection(r, session);
            session.borrow_mut().data_conn = Some(fd);
            data_connection_ready(r, session);
        }
        Err(ref e) if comm::ignore_errno(e) => {
            let s = session.clone();
            r.set_read_handler(
                lfd,
                Some(Box::new(move |r, lfd| accept_data_connection(r, lfd, &s))),
            );
        }
        Err(e) => {
            debug!("ftp data accept failure: {e}");
        }
    }
}

/// The data connection came up; release anything parked on it.
fn data_connection_ready(r: &mut Reactor, session: &SessionRef) {
    let parked = session.borrow_mut().parked_reply.take();
    if let Some(wrapper) = parked {
        let state = session.borrow().state;
        write_wrapper_reply(r, session, &wrapper, false);
        match state {
            ServerState::HandleUploadRequest => maybe_read_upload_data(r, session),
            ServerState::HandleDataRequest => stream_data(r, session),
            _ => {}
        }
    }
}

/// `closeDataConnection` is safe to call from any exit path, repeatedly.
fn close_data_connection(r: &mut Reactor, session: &SessionRef) {
    let (listen, conn) = {
        let mut s = session.borrow_mut();
        s.connector_pending = false;
        s.active_addr = None;
        (s.data_listen.take(), s.data_conn.take())
    };
    if let Some((lfd, _)) = listen {
        trace!("FTP closing client data listen socket FD {lfd}");
        r.comm_close(lfd);
    }
    if let Some(fd) = conn {
        trace!("FTP closing client data connection FD {fd}");
        r.comm_close(fd);
    }
}

/// Check that the client data connection is ready or has a chance of
/// becoming ready soon; starts the active connect when needed.
fn check_data_conn_pre(
    r: &mut Reactor,
    session: &SessionRef,
    retry_verb: &str,
    retry_params: &str,
) -> PreCheck {
    if session.borrow().data_conn.is_some() {
        return PreCheck::Ready;
    }
    if session.borrow().data_listen.is_some() {
        // the client's data handshake may simply not have reached us yet
        return PreCheck::Ready;
    }
    let Some(addr) = session.borrow().active_addr else {
        write_early_reply(r, session, 425, "Use PORT or PASV first");
        return PreCheck::Failed;
    };

    // active transfer: open a data connection from the proxy to the client
    let fd = match r.open_tcp_socket(addr.is_ipv4(), "active client ftp data") {
        Ok(fd) => fd,
        Err(_) => {
            write_early_reply(r, session, 425, "Cannot open data connection.");
            return PreCheck::Failed;
        }
    };
    session.borrow_mut().connector_pending = true;

    let verb = retry_verb.to_string();
    let params = retry_params.to_string();
    let s = session.clone();
    let continue_cmd = move |r: &mut Reactor, ok: bool| {
        s.borrow_mut().connector_pending = false;
        if ok {
            handle_command(r, &s, verb.clone(), params.clone());
        } else {
            write_early_reply(r, &s, 425, "Cannot open data connection.");
        }
    };
    start_active_connect(r, session, fd, addr, Box::new(continue_cmd));
    PreCheck::Waiting
}

fn start_active_connect(
    r: &mut Reactor,
    session: &SessionRef,
    fd: i32,
    addr: SocketAddr,
    done: Box<dyn FnOnce(&mut Reactor, bool)>,
) {
    let session = session.clone();
    match r.connect(fd, addr) {
        comm::ConnectProgress::Connected => {
            session.borrow_mut().data_conn = Some(fd);
            done(r, true);
        }
        comm::ConnectProgress::InProgress => {
            r.set_write_handler(
                fd,
                Some(Box::new(move |r, fd| {
                    start_active_connect(r, &session, fd, addr, done)
                })),
            );
        }
        comm::ConnectProgress::Failed(e) => {
            debug!("active ftp data connect to {addr} failed: {e}");
            r.comm_close(fd);
            done(r, false);
        }
    }
}

/// Check that the client data connection is ready for immediate I/O.
fn check_data_conn_post(session: &SessionRef) -> bool {
    session.borrow().data_conn.is_some()
}

fn handle_data_request(r: &mut Reactor, session: &SessionRef, verb: String, params: String) {
    match check_data_conn_pre(r, session, &verb, &params) {
        PreCheck::Ready => {}
        PreCheck::Waiting | PreCheck::Failed => return,
    }

    let entry = {
        let mut s = session.borrow_mut();
        let file = if !params.is_empty() && command_has_path_parameter(&verb) {
            Some(params.as_str())
        } else {
            None
        };
        calc_uri(&mut s, file);
        let uri = s.uri.clone();
        drop(s);
        // FTP request URIs are not distinctive enough for caching
        store::create_entry(r, crate::http::Method::Get, &uri, 0)
    };
    let reader = store::subscribe(&entry, 0);
    {
        let mut s = session.borrow_mut();
        s.entry = Some(entry.clone());
        s.reader = Some(reader);
    }

    change_state(session, ServerState::HandleDataRequest, "handleDataRequest");
    relay::forward(
        r,
        session,
        Pending {
            cmd: verb,
            args: params,
            kind: CmdKind::Download(entry),
        },
    );
}

fn handle_upload_request(r: &mut Reactor, session: &SessionRef, verb: String, params: String) {
    match check_data_conn_pre(r, session, &verb, &params) {
        PreCheck::Ready => {}
        PreCheck::Waiting | PreCheck::Failed => return,
    }

    {
        let mut s = session.borrow_mut();
        let file = if !params.is_empty() {
            Some(params.as_str())
        } else {
            None
        };
        calc_uri(&mut s, file);
    }

    let pipe = relay::BodyPipe::new();
    session.borrow_mut().upload_pipe = Some(pipe.clone());

    change_state(session, ServerState::HandleUploadRequest, "handleDataRequest");
    relay::forward(
        r,
        session,
        Pending {
            cmd: verb,
            args: params,
            kind: CmdKind::Upload(pipe),
        },
    );
}

fn forward_plain(
    r: &mut Reactor,
    session: &SessionRef,
    state: ServerState,
    verb: &str,
    params: &str,
) {
    if state != ServerState::Connected {
        change_state(session, state, "forwarding");
    }
    relay::forward(
        r,
        session,
        Pending {
            cmd: verb.to_string(),
            args: params.to_string(),
            kind: CmdKind::Plain,
        },
    );
}

// ---- reply side --------------------------------------------------------

/// A relayed reply arrived from the upstream peer.
pub(crate) fn relay_reply(r: &mut Reactor, session: &SessionRef, wrapper: ReplyWrapper) {
    let state = session.borrow().state;
    match state {
        ServerState::HandleFeat => handle_feat_reply(r, session, wrapper),
        ServerState::HandleDataRequest => handle_data_reply(r, session, wrapper),
        ServerState::HandleUploadRequest => write_forwarded_reply(r, session, wrapper),
        ServerState::HandleCwd => {
            let accepted = wrapper
                .status
                .map(|s| (200..300).contains(&s))
                .unwrap_or(false);
            let pending = session.borrow_mut().pending_cwd.take();
            if accepted {
                if let Some(dir) = pending {
                    // keep the tracked working directory in step with the peer
                    let mut s = session.borrow_mut();
                    if dir.starts_with('/') {
                        s.working_dir = dir;
                    } else {
                        let mut joined = s.working_dir.clone();
                        if !joined.is_empty() && !joined.ends_with('/') {
                            joined.push('/');
                        }
                        joined.push_str(&dir);
                        s.working_dir = joined;
                    }
                }
            }
            write_forwarded_reply(r, session, wrapper)
        }
        ServerState::Error => {
            // 421: we will close due to the error state
            write_error_reply(r, session, &wrapper, 421);
        }
        _ => write_forwarded_reply(r, session, wrapper),
    }
}

/// The relay could not talk to the peer at all.
pub(crate) fn relay_failed(r: &mut Reactor, session: &SessionRef, note: &str) {
    debug!("ftp relay failed: {note}");
    let transfer = {
        let s = session.borrow();
        matches!(
            s.state,
            ServerState::HandleDataRequest | ServerState::HandleUploadRequest
        )
    };
    close_data_connection(r, session);
    session.borrow_mut().relay = None;
    session.borrow_mut().state = ServerState::Error;
    if transfer {
        write_final_reply(r, session, 451, note);
    } else {
        write_final_reply(r, session, 421, note);
    }
}

/// Splice upstream-advertised features with the gateway's own: EPRT and
/// EPSV are always advertised, quoted in the reference format.
fn handle_feat_reply(r: &mut Reactor, session: &SessionRef, wrapper: ReplyWrapper) {
    if !wrapper.is_ftp() {
        write_wrapper_reply(
            r,
            session,
            &ReplyWrapper::new(502, "Server does not support FEAT"),
            true,
        );
        return;
    }

    let mut out = ReplyWrapper::new(211, "End");
    out.pre.push("211-Features:".to_string());
    let mut has_eprt = false;
    let mut has_epsv = false;

    if wrapper.status == Some(211) {
        for line in &wrapper.pre {
            // tolerate both quoted relay format and raw feature lines
            let feature = unquote_pre(line).unwrap_or_else(|| line.clone());
            let name = feature.trim().split(' ').next().unwrap_or("").to_uppercase();
            if name.is_empty() || name.ends_with(':') {
                continue;
            }
            if supported_command(&name) {
                out.pre.push(feature.clone());
            }
            if name == "EPRT" {
                has_eprt = true;
            } else if name == "EPSV" {
                has_epsv = true;
            }
        }
    } // else we got a FEAT error and only report gateway features

    if !has_eprt {
        out.pre.push(" EPRT".to_string());
    }
    if !has_epsv {
        out.pre.push(" EPSV".to_string());
    }

    write_forwarded_reply(r, session, out);
}

fn handle_data_reply(r: &mut Reactor, session: &SessionRef, wrapper: ReplyWrapper) {
    let ok_status = wrapper
        .status
        .map(|c| (100..300).contains(&c))
        .unwrap_or(false);

    if !ok_status {
        // the KO reply is the whole answer; the reader must not race it
        let (entry, reader) = {
            let mut s = session.borrow_mut();
            (s.entry.take(), s.reader.take())
        };
        if let (Some(entry), Some(reader)) = (entry, reader) {
            store::unsubscribe(r, &entry, &reader);
        }
        write_forwarded_reply(r, session, wrapper);
        if check_data_conn_post(session) {
            debug!("closing data conn on KO reply");
            close_data_connection(r, session);
        }
        return;
    }

    let has_channel = {
        let s = session.borrow();
        s.data_conn.is_some() || s.data_listen.is_some() || s.connector_pending
    };
    if !has_channel {
        // the client already closed its data side; the data must not flow
        debug!("ignoring FTP srv data response after clt data closure");
        return;
    }

    write_forwarded_reply(r, session, wrapper);
}

/// Done sending one transfer's data to the user; emit the final status.
fn user_data_completion_checkpoint(r: &mut Reactor, session: &SessionRef, code: u16) {
    close_data_connection(r, session);
    let (entry, reader) = {
        let mut s = session.borrow_mut();
        (s.entry.take(), s.reader.take())
    };
    if let (Some(entry), Some(reader)) = (entry, reader) {
        store::unsubscribe(r, &entry, &reader);
    }
    let msg = match code {
        226 => "Transfer complete",
        451 => "Requested action aborted: local error in processing",
        _ => "Transfer failed",
    };
    write_final_reply(r, session, code, msg);
}

/// Stream the response body from the store entry onto the data connection.
fn stream_data(r: &mut Reactor, session: &SessionRef) {
    let (entry, reader, data_fd) = {
        let s = session.borrow();
        match (&s.entry, &s.reader, s.data_conn) {
            (Some(e), Some(c), Some(fd)) => (e.clone(), c.clone(), fd),
            _ => return,
        }
    };

    match store::copy_some(&entry, &reader, 64 * 1024) {
        CopyResult::Data(chunk) => {
            let s = session.clone();
            comm::write_full(
                r,
                data_fd,
                chunk,
                Box::new(move |r, res| match res.flag {
                    Flag::Ok => stream_data(r, &s),
                    Flag::ErrClosing => {}
                    _ => user_data_completion_checkpoint(r, &s, 451),
                }),
            );
        }
        CopyResult::Pending => {
            let s = session.clone();
            store::register_callback(&reader, Box::new(move |r| stream_data(r, &s)));
        }
        CopyResult::Complete => {
            let code = if entry.borrow().has(store::ENTRY_ABORTED) {
                451
            } else {
                226
            };
            user_data_completion_checkpoint(r, session, code);
        }
    }
}

/// Upload: import client data-connection bytes into the body pipe.
fn maybe_read_upload_data(r: &mut Reactor, session: &SessionRef) {
    let Some(fd) = session.borrow().data_conn else {
        return;
    };
    if !r.fds.is_open(fd) {
        return;
    }
    let s = session.clone();
    r.set_read_handler(fd, Some(Box::new(move |r, fd| read_upload_data(r, fd, &s))));
}

fn read_upload_data(r: &mut Reactor, fd: i32, session: &SessionRef) {
    let Some(pipe) = session.borrow().upload_pipe.clone() else {
        return;
    };
    let mut buf = [0u8; 16 * 1024];
    match r.read(fd, &mut buf) {
        Err(ref e) if comm::ignore_errno(e) => maybe_read_upload_data(r, session),
        Err(_) => {
            debug!("upload data connection error");
            close_data_connection(r, session);
            relay::pipe_finish(r, &pipe);
        }
        Ok(0) => {
            trace!("upload data EOF");
            close_data_connection(r, session);
            relay::pipe_finish(r, &pipe);
        }
        Ok(n) => {
            r.stats.client_bytes_in += n as u64;
            relay::pipe_put(r, &pipe, &buf[..n]);
            maybe_read_upload_data(r, session);
        }
    }
}

// ---- reply writing -----------------------------------------------------

/// Writes an FTP response before a request wrapper exists; keeps reading.
fn write_early_reply(r: &mut Reactor, session: &SessionRef, code: u16, msg: &str) {
    debug_assert!((100..1000).contains(&code));
    trace!("<<ftp {code} {msg}");
    let fd = session.borrow().ctrl_fd;
    let wire = BytesMut::from(format!("{code} {msg}\r\n").as_bytes());
    let s = session.clone();
    comm::write_full(
        r,
        fd,
        wire,
        Box::new(move |r, res| {
            if res.flag == Flag::Ok {
                arm_ctrl_read(r, &s);
            } else if res.flag != Flag::ErrClosing {
                let fd = s.borrow().ctrl_fd;
                r.comm_close(fd);
            }
        }),
    );
}

/// Write a reply that finishes the current transaction.
fn write_final_reply(r: &mut Reactor, session: &SessionRef, code: u16, msg: &str) {
    let wrapper = ReplyWrapper::new(code, msg);
    write_wrapper_reply(r, session, &wrapper, true);
}

fn write_final_reply_line(r: &mut Reactor, session: &SessionRef, line: &str) {
    let fd = session.borrow().ctrl_fd;
    trace!("<<ftp {line}");
    let wire = BytesMut::from(format!("{line}\r\n").as_bytes());
    let s = session.clone();
    comm::write_full(
        r,
        fd,
        wire,
        Box::new(move |r, res| wrote_reply(r, &s, res.flag, true)),
    );
}

/// Forward a relayed reply. Transfer-start replies (125/150) wait for the
/// data connection when it is not up yet.
fn write_forwarded_reply(r: &mut Reactor, session: &SessionRef, wrapper: ReplyWrapper) {
    if !wrapper.is_ftp() {
        // internally-generated replies end up here: keep control open,
        // drop the data channel, report 451
        change_state(session, ServerState::Connected, "foreign reply");
        close_data_connection(r, session);
        write_error_reply(r, session, &wrapper, 451);
        return;
    }

    let scode = wrapper.status.expect("ftp wrapper has status");
    let state = session.borrow().state;
    let transferring = matches!(
        state,
        ServerState::HandleDataRequest | ServerState::HandleUploadRequest
    );

    if (scode == 125 || scode == 150) && transferring {
        if check_data_conn_post(session) {
            debug!("data connection established, start data transfer");
            write_wrapper_reply(r, session, &wrapper, false);
            match state {
                ServerState::HandleUploadRequest => maybe_read_upload_data(r, session),
                _ => stream_data(r, session),
            }
        } else if session.borrow().data_listen.is_some() {
            debug!("wait for the client to establish a data connection");
            session.borrow_mut().parked_reply = Some(wrapper);
        } else {
            // data already moved, or the active connect failed and the
            // client was told; nothing more to do here
            debug!("done with data OR active connection failed");
        }
        return;
    }

    let finishes = !(100..200).contains(&scode);
    write_wrapper_reply(r, session, &wrapper, finishes);
}

/// Error response with reply-derived details, used on fatal paths.
fn write_error_reply(r: &mut Reactor, session: &SessionRef, wrapper: &ReplyWrapper, scode: u16) {
    let reason = wrapper.reason.clone().unwrap_or_else(|| "Lost Error".to_string());
    let mut out = ReplyWrapper::new(scode, &reason);
    out.pre = wrapper.pre.clone();
    write_wrapper_reply(r, session, &out, true);
}

fn write_wrapper_reply(
    r: &mut Reactor,
    session: &SessionRef,
    wrapper: &ReplyWrapper,
    finishes: bool,
) {
    let fd = session.borrow().ctrl_fd;
    let mut wire = BytesMut::new();
    wrapper.print(&mut wire);
    trace!("<<ftp reply {} bytes", wire.len());
    let s = session.clone();
    comm::write_full(
        r,
        fd,
        wire,
        Box::new(move |r, res| wrote_reply(r, &s, res.flag, finishes)),
    );
}

fn wrote_reply(r: &mut Reactor, session: &SessionRef, flag: Flag, finishes: bool) {
    let fd = session.borrow().ctrl_fd;
    if flag == Flag::ErrClosing {
        return;
    }
    if flag != Flag::Ok {
        debug!("FTP reply writing failed");
        r.comm_close(fd);
        return;
    }
    if session.borrow().state == ServerState::Error {
        debug!("closing on FTP server error");
        r.comm_close(fd);
        return;
    }
    if finishes {
        session.borrow_mut().upload_pipe = None;
        change_state(session, ServerState::Connected, "wroteReply");
        arm_ctrl_read(r, session);
    }
}

#[cfg(test)]
mod tests;
