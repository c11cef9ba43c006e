//! Pluggable readiness backends for the reactor.

pub mod epoll;
pub mod poll;

use std::io;

use crate::comm::fd::FdTable;

/// One descriptor the backend reports as ready.
#[derive(Debug, Clone, Copy)]
pub struct ReadyFd {
    pub fd: i32,
    pub read: bool,
    pub write: bool,
    /// The kernel says the descriptor is invalid (POLLNVAL-class); the
    /// reactor answers with a structured teardown.
    pub nval: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Poll,
    Epoll,
}

pub enum Backend {
    Poll(poll::PollBackend),
    Epoll(epoll::EpollBackend),
}

impl Backend {
    pub fn new(kind: BackendKind) -> io::Result<Backend> {
        Ok(match kind {
            BackendKind::Poll => Backend::Poll(poll::PollBackend::new()),
            BackendKind::Epoll => Backend::Epoll(epoll::EpollBackend::new()?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Poll(_) => "poll",
            Backend::Epoll(_) => "epoll",
        }
    }

    /// Interest changed for `fd`; `state` is the fde's backend bookkeeping.
    pub fn update_interest(&mut self, fd: i32, read: bool, write: bool, state: &mut u32) {
        match self {
            Backend::Poll(_) => {}
            Backend::Epoll(b) => b.update_interest(fd, read, write, state),
        }
    }

    /// The descriptor is going away.
    pub fn forget(&mut self, fd: i32, state: &mut u32) {
        match self {
            Backend::Poll(_) => {}
            Backend::Epoll(b) => b.forget(fd, state),
        }
    }

    /// Waits up to `msec` for readiness and fills `out`. Returns the number
    /// of ready descriptors reported by the kernel.
    pub fn scan(
        &mut self,
        table: &FdTable,
        msec: i32,
        out: &mut Vec<ReadyFd>,
    ) -> io::Result<usize> {
        match self {
            Backend::Poll(b) => b.scan(table, msec, out),
            Backend::Epoll(b) => b.scan(msec, out),
        }
    }
}
