//! Errors.

use std::{io, net::SocketAddr};

use openssl::error::ErrorStack;

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error ocurred: {0}")]
    SocketError(String),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    HttpParse(#[from] HttpParseError),
    #[error(transparent)]
    FtpProtocol(#[from] FtpProtocolError),
    #[error(transparent)]
    TlsConfig(#[from] TlsConfigError),
    #[error(transparent)]
    CertDb(#[from] CertDbError),
    #[error("bad configuration: {0}")]
    BadConfig(String),
    #[error("shutting down")]
    ShuttingDown,
    #[error("dns lookup failed for {0}")]
    DnsFailure(String),
    #[error("connection to {0} failed")]
    ConnectFailure(SocketAddr),
    #[error("origin read timeout")]
    ReadTimeout,
    #[error("transaction lifetime expired")]
    LifetimeExpired,
    #[error("store entry aborted")]
    StoreAborted,
    #[error("all clients went away before transfer completed")]
    NoClientLeft,
    #[error("out of file descriptors")]
    OutOfDescriptors,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to flush socket")]
    Flush(#[source] io::Error),
    #[error("failed to write to socket")]
    Write(#[source] io::Error),
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        error: io::Error,
    },
    #[error("failed to listen on {addr}")]
    Listen {
        addr: SocketAddr,
        #[source]
        error: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HttpParseError {
    #[error("request line is not valid HTTP")]
    InvalidRequestLine,
    #[error("unsupported HTTP version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("header block exceeds {0} bytes")]
    HeaderTooBig(usize),
    #[error("malformed header field")]
    MalformedHeader,
    #[error("HTTP/1.1 request without Host header")]
    MissingHost,
    #[error("invalid request URI {0:?}")]
    InvalidUri(String),
    #[error("status line is not valid HTTP")]
    InvalidStatusLine,
    #[error("invalid Content-Length")]
    InvalidContentLength,
}

#[derive(Debug, thiserror::Error)]
pub enum FtpProtocolError {
    #[error("control command exceeds buffer limit")]
    HugeRequest,
    #[error("must login first")]
    MissingLogin,
    #[error("missing username")]
    MissingUsername,
    #[error("missing host")]
    MissingHost,
    #[error("unknown or unsupported command")]
    UnsupportedCommand,
    #[error("invalid URI")]
    InvalidUri,
    #[error("malformed command")]
    MalformedCommand,
    #[error("data connection failed")]
    DataConnection,
    #[error("upstream reply is not an FTP reply wrapper")]
    ForeignReply,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("unknown TLS option {0:?}")]
    UnknownOption(String),
    #[error("unknown TLS flag {0:?}")]
    UnknownFlag(String),
    #[error("cert= option must be set before key= is used")]
    KeyWithoutCert,
    #[error("unknown TLS minimum version {0:?}")]
    BadMinVersion(String),
    #[error("TLS context session id is too long")]
    ContextIdTooLong,
    #[error("failed to load {path}")]
    LoadFile {
        path: String,
        #[source]
        error: io::Error,
    },
    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
}

#[derive(Debug, thiserror::Error)]
pub enum CertDbError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("certificate db index is locked by another process")]
    Locked,
    #[error("corrupt certificate db size file")]
    CorruptSize,
    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
}

/// Identifies one accepted client connection in log and error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub port_name: String,
}

impl ClientIdentifier {
    pub fn new(addr: &str, port_name: &str) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            port_name: port_name.into(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let Self { addr, port_name } = self;
        write!(f, "{{ {addr} via {port_name} }}")
    }
}
