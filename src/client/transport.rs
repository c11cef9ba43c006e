//! Client-connection transport: a plain socket, or TLS over the same
//! descriptor. TLS decrypts into a library buffer above the kernel socket,
//! which is exactly what the FD table's `read_pending` hint exists for.

use std::io::{self, Read, Write};

use openssl::ssl::{ErrorCode, Ssl, SslContext, SslStream};

/// Raw-descriptor I/O for the TLS stream; nonblocking errors surface as
/// WouldBlock so the reactor can re-arm.
pub struct RawFdIo(pub i32);

impl Read for RawFdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for RawFdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.0,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub enum Transport {
    Plain(i32),
    Tls {
        stream: SslStream<RawFdIo>,
        handshaken: bool,
    },
}

/// What one transport read produced.
pub enum ReadOutcome {
    Data(usize),
    /// Nothing now; re-arm and come back.
    WouldBlock,
    Eof,
    Error(io::Error),
}

impl Transport {
    pub fn plain(fd: i32) -> Transport {
        Transport::Plain(fd)
    }

    pub fn tls_server(fd: i32, ctx: &SslContext) -> Result<Transport, openssl::error::ErrorStack> {
        let ssl = Ssl::new(ctx)?;
        let stream = SslStream::new(ssl, RawFdIo(fd))?;
        Ok(Transport::Tls {
            stream,
            handshaken: false,
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    /// Drive the TLS accept handshake if one is pending. Ok(true) means the
    /// transport is ready for application data.
    pub fn continue_handshake(&mut self) -> Result<bool, io::Error> {
        match self {
            Transport::Plain(_) => Ok(true),
            Transport::Tls { stream, handshaken } => {
                if *handshaken {
                    return Ok(true);
                }
                match stream.accept() {
                    Ok(()) => {
                        *handshaken = true;
                        Ok(true)
                    }
                    Err(e)
                        if e.code() == ErrorCode::WANT_READ
                            || e.code() == ErrorCode::WANT_WRITE =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(io::Error::other(format!("TLS handshake failed: {e}"))),
                }
            }
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self {
            Transport::Plain(fd) => {
                let n = unsafe {
                    libc::recv(*fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                if n > 0 {
                    ReadOutcome::Data(n as usize)
                } else if n == 0 {
                    ReadOutcome::Eof
                } else {
                    let e = io::Error::last_os_error();
                    if crate::comm::ignore_errno(&e) {
                        ReadOutcome::WouldBlock
                    } else {
                        ReadOutcome::Error(e)
                    }
                }
            }
            Transport::Tls { stream, .. } => match stream.ssl_read(buf) {
                Ok(n) => ReadOutcome::Data(n),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => ReadOutcome::Eof,
                Err(e)
                    if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE =>
                {
                    ReadOutcome::WouldBlock
                }
                Err(e) => match e.into_io_error() {
                    Ok(io_err) if crate::comm::ignore_errno(&io_err) => ReadOutcome::WouldBlock,
                    Ok(io_err) => ReadOutcome::Error(io_err),
                    Err(other) => ReadOutcome::Error(io::Error::other(other.to_string())),
                },
            },
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(fd) => {
                let n = unsafe {
                    libc::send(
                        *fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }
            Transport::Tls { stream, .. } => match stream.ssl_write(buf) {
                Ok(n) => Ok(n),
                Err(e)
                    if e.code() == ErrorCode::WANT_WRITE || e.code() == ErrorCode::WANT_READ =>
                {
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Err(e) => Err(e
                    .into_io_error()
                    .unwrap_or_else(|o| io::Error::other(o.to_string()))),
            },
        }
    }

    /// Bytes already decrypted and buffered above the socket. Nonzero means
    /// the FD must be treated as readable regardless of the kernel's view.
    pub fn buffered_input(&self) -> usize {
        match self {
            Transport::Plain(_) => 0,
            Transport::Tls { stream, .. } => stream.ssl().pending(),
        }
    }
}
