//! The per-worker file-descriptor table.
//!
//! One `Fde` record per OS descriptor, indexed by the raw descriptor number.
//! The reactor is the single writer; records never outlive the table.

use std::io;

use log::{debug, warn};

use crate::comm::Reactor;
use crate::utils::clock;

/// Callback armed for read/write/timeout readiness. Detached from the table
/// before it is invoked, so re-arming is always explicit.
pub type IoHandler = Box<dyn FnOnce(&mut Reactor, i32)>;

/// Callback run while a descriptor closes, in registration order.
pub type CloseHandler = Box<dyn FnOnce(&mut Reactor)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdType {
    None,
    Log,
    File,
    Socket,
    Pipe,
    MsgHdr,
    Unknown,
}

impl FdType {
    pub fn as_str(self) -> &'static str {
        match self {
            FdType::None => "None",
            FdType::Log => "Log",
            FdType::File => "File",
            FdType::Socket => "Socket",
            FdType::Pipe => "Pipe",
            FdType::MsgHdr => "MsgHdr",
            FdType::Unknown => "Unknown",
        }
    }
}

/// Which hot "incoming" class a descriptor belongs to, if any. The reactor
/// polls these classes opportunistically between general passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingClass {
    None,
    Udp,
    Dns,
    TcpListener,
}

/// I/O method pair selected at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMethod {
    Plain,
    Socket,
    MsgHdr,
}

impl IoMethod {
    pub fn read(self, fd: i32, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            match self {
                IoMethod::Plain => libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()),
                IoMethod::Socket => {
                    libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                }
                IoMethod::MsgHdr => libc::recvmsg(
                    fd,
                    buf.as_mut_ptr() as *mut libc::msghdr,
                    libc::MSG_DONTWAIT,
                ),
            }
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn write(self, fd: i32, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            match self {
                IoMethod::Plain => libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()),
                IoMethod::Socket => libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                ),
                IoMethod::MsgHdr => {
                    let r = libc::sendmsg(
                        fd,
                        buf.as_ptr() as *const libc::msghdr,
                        libc::MSG_NOSIGNAL,
                    );
                    // the caller expects a byte count matching its request
                    if r > 0 {
                        buf.len() as isize
                    } else {
                        r
                    }
                }
            }
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// One file-descriptor entry.
pub struct Fde {
    pub open: bool,
    pub closing: bool,
    pub kind: FdType,
    pub incoming: IncomingClass,
    pub desc: String,
    pub io: IoMethod,

    pub read_handler: Option<IoHandler>,
    pub write_handler: Option<IoHandler>,
    /// Buffered-reader hint: data is available above the OS socket, so the
    /// descriptor must be treated as readable even when the kernel disagrees.
    pub read_pending: bool,

    /// Absolute wall-clock deadline in seconds; 0 means no timeout armed.
    pub timeout: i64,
    pub timeout_handler: Option<IoHandler>,

    pub close_handlers: Vec<CloseHandler>,

    pub bytes_read: u64,
    pub bytes_written: u64,

    /// Interest mask last pushed to an epoll backend.
    pub backend_state: u32,
}

impl Fde {
    fn new() -> Fde {
        Fde {
            open: false,
            closing: false,
            kind: FdType::None,
            incoming: IncomingClass::None,
            desc: String::new(),
            io: IoMethod::Plain,
            read_handler: None,
            write_handler: None,
            read_pending: false,
            timeout: 0,
            timeout_handler: None,
            close_handlers: Vec::new(),
            bytes_read: 0,
            bytes_written: 0,
            backend_state: 0,
        }
    }

    fn clear(&mut self) {
        *self = Fde::new();
    }
}

/// Number of descriptors held in reserve for logs and emergencies.
const RESERVED_FD: usize = 64;

pub struct FdTable {
    table: Vec<Fde>,
    biggest_fd: i32,
    number_fd: usize,
}

impl FdTable {
    pub fn new(max_fd: usize) -> FdTable {
        FdTable {
            table: (0..max_fd).map(|_| Fde::new()).collect(),
            biggest_fd: -1,
            number_fd: 0,
        }
    }

    #[inline]
    pub fn max_fd(&self) -> usize {
        self.table.len()
    }

    /// Largest open descriptor number, -1 when none are open.
    #[inline]
    pub fn biggest_fd(&self) -> i32 {
        self.biggest_fd
    }

    /// Count of open descriptors.
    #[inline]
    pub fn number_fd(&self) -> usize {
        self.number_fd
    }

    #[inline]
    pub fn get(&self, fd: i32) -> &Fde {
        &self.table[fd as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, fd: i32) -> &mut Fde {
        &mut self.table[fd as usize]
    }

    pub fn is_open(&self, fd: i32) -> bool {
        fd >= 0 && (fd as usize) < self.table.len() && self.table[fd as usize].open
    }

    pub fn fd_open(&mut self, fd: i32, kind: FdType, desc: &str) {
        assert!(fd >= 0);
        assert!((fd as usize) < self.table.len());

        if self.table[fd as usize].open {
            warn!("closing already-open FD {fd} on re-open");
            self.fd_close(fd);
        }

        let f = &mut self.table[fd as usize];
        assert!(!f.open);
        debug!("fd_open FD {fd} {desc}");
        f.kind = kind;
        f.open = true;
        f.backend_state = 0;
        f.io = match kind {
            FdType::Socket => IoMethod::Socket,
            FdType::MsgHdr => IoMethod::MsgHdr,
            _ => IoMethod::Plain,
        };
        f.desc = desc.to_string();

        self.update_biggest(fd, true);
        self.number_fd += 1;
    }

    /// Removes an entry. Calling this on a descriptor that is not open is a
    /// programming error and panics.
    pub fn fd_close(&mut self, fd: i32) {
        assert!(fd >= 0);
        let f = &mut self.table[fd as usize];
        assert!(f.open, "fd_close of closed FD {fd}");

        if f.kind == FdType::File {
            assert!(f.read_handler.is_none());
            assert!(f.write_handler.is_none());
        }

        debug!("fd_close FD {fd} {}", f.desc);
        f.read_handler = None;
        f.write_handler = None;
        f.open = false;
        f.clear();
        self.update_biggest(fd, false);
        self.number_fd -= 1;
    }

    pub fn fd_note(&mut self, fd: i32, desc: &str) {
        self.table[fd as usize].desc = desc.to_string();
    }

    pub fn fd_bytes_read(&mut self, fd: i32, len: usize) {
        self.table[fd as usize].bytes_read += len as u64;
    }

    pub fn fd_bytes_written(&mut self, fd: i32, len: usize) {
        self.table[fd as usize].bytes_written += len as u64;
    }

    fn update_biggest(&mut self, fd: i32, opening: bool) {
        if fd < self.biggest_fd {
            return;
        }
        assert!((fd as usize) < self.table.len());
        if fd > self.biggest_fd {
            // we cannot be closing an FD bigger than our known biggest
            assert!(opening);
            self.biggest_fd = fd;
            return;
        }
        // fd == biggest: must be closing, walk down to the next open one
        assert!(!opening);
        while self.biggest_fd >= 0 && !self.table[self.biggest_fd as usize].open {
            self.biggest_fd -= 1;
        }
    }

    /// Descriptors still available to this worker.
    pub fn nfree(&self) -> usize {
        self.table.len().saturating_sub(self.number_fd)
    }

    /// Whether descriptor usage is close enough to the limit that new
    /// connections should be refused.
    pub fn usage_high(&self) -> bool {
        let nrfree = self.nfree();
        nrfree < RESERVED_FD * 2 || nrfree < self.number_fd / 4
    }

    /// Log every open descriptor; debugging aid.
    pub fn dump_open(&self) {
        for (i, f) in self.table.iter().enumerate() {
            if !f.open {
                continue;
            }
            let dir = match (f.bytes_read > 0, f.bytes_written > 0) {
                (true, true) => "READ/WRITE",
                (true, false) => "READING",
                (false, true) => "WRITING",
                (false, false) => "UNSTARTED",
            };
            log::info!("Open FD {dir:<10} {i:>4} {}", f.desc);
        }
    }

    /// Find expired timeouts. The handlers are detached and returned so the
    /// caller can run them without holding the table borrowed.
    pub fn take_expired_timeouts(&mut self) -> Vec<(i32, Option<IoHandler>)> {
        let now = clock::current_time();
        let mut fired = Vec::new();
        for fd in 0..=self.biggest_fd.max(-1) {
            if fd < 0 {
                break;
            }
            let f = &mut self.table[fd as usize];
            if !f.open || f.timeout == 0 || f.timeout > now {
                continue;
            }
            f.timeout = 0;
            fired.push((fd, f.timeout_handler.take()));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_biggest_and_number_track_opens() {
        let mut t = FdTable::new(64);
        assert_eq!(t.biggest_fd(), -1);
        t.fd_open(5, FdType::Socket, "a");
        t.fd_open(9, FdType::Socket, "b");
        t.fd_open(7, FdType::File, "c");
        assert_eq!(t.biggest_fd(), 9);
        assert_eq!(t.number_fd(), 3);

        t.fd_close(9);
        assert_eq!(t.biggest_fd(), 7);
        assert_eq!(t.number_fd(), 2);

        t.fd_close(5);
        assert_eq!(t.biggest_fd(), 7);
        t.fd_close(7);
        assert_eq!(t.biggest_fd(), -1);
        assert_eq!(t.number_fd(), 0);
    }

    #[test]
    #[should_panic(expected = "fd_close of closed FD")]
    fn test_fd_close_of_closed_fd_panics() {
        let mut t = FdTable::new(16);
        t.fd_close(3);
    }

    #[test]
    fn test_io_method_selection() {
        let mut t = FdTable::new(16);
        t.fd_open(1, FdType::Socket, "sock");
        assert_eq!(t.get(1).io, IoMethod::Socket);
        t.fd_close(1);
        t.fd_open(1, FdType::File, "file");
        assert_eq!(t.get(1).io, IoMethod::Plain);
        t.fd_close(1);
    }

    #[test]
    fn test_closed_fd_has_cleared_handlers() {
        let mut t = FdTable::new(16);
        t.fd_open(2, FdType::Socket, "s");
        t.get_mut(2).read_handler = Some(Box::new(|_, _| {}));
        t.get_mut(2).timeout = 12345;
        t.fd_close(2);
        assert!(t.get(2).read_handler.is_none());
        assert!(t.get(2).write_handler.is_none());
        assert_eq!(t.get(2).timeout, 0);
        assert!(t.get(2).close_handlers.is_empty());
    }
}
