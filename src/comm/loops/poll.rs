//! poll(2) backend: rebuilds the interest vector from the FD table on every
//! pass. Portable default.

use std::io;

use crate::comm::fd::FdTable;
use crate::comm::loops::ReadyFd;

const READ_BITS: i16 = libc::POLLRDNORM | libc::POLLIN | libc::POLLHUP | libc::POLLERR;
const WRITE_BITS: i16 = libc::POLLWRNORM | libc::POLLOUT | libc::POLLHUP | libc::POLLERR;

pub struct PollBackend {
    pfds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> PollBackend {
        PollBackend { pfds: Vec::new() }
    }

    pub fn scan(
        &mut self,
        table: &FdTable,
        msec: i32,
        out: &mut Vec<ReadyFd>,
    ) -> io::Result<usize> {
        self.pfds.clear();
        let maxfd = table.biggest_fd() + 1;
        for fd in 0..maxfd {
            let f = table.get(fd);
            let mut events: i16 = 0;
            if f.read_handler.is_some() {
                events |= libc::POLLRDNORM;
            }
            if f.write_handler.is_some() {
                events |= libc::POLLWRNORM;
            }
            if events != 0 {
                self.pfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }

        let num = unsafe { libc::poll(self.pfds.as_mut_ptr(), self.pfds.len() as libc::nfds_t, msec) };
        if num < 0 {
            return Err(io::Error::last_os_error());
        }

        out.clear();
        for p in &self.pfds {
            if p.revents == 0 {
                continue;
            }
            out.push(ReadyFd {
                fd: p.fd,
                read: p.revents & READ_BITS != 0,
                write: p.revents & WRITE_BITS != 0,
                nval: p.revents & libc::POLLNVAL != 0,
            });
        }
        Ok(num as usize)
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        Self::new()
    }
}
