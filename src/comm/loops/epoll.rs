//! epoll(7) backend: interest is maintained incrementally as handlers are
//! armed and cleared, so the wait call is O(ready) instead of O(open).

use std::io;

use log::debug;

use crate::comm::loops::ReadyFd;

const EV_READ: u32 = (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const EV_WRITE: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub struct EpollBackend {
    epfd: i32,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<EpollBackend> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; 4096],
        })
    }

    pub fn update_interest(&mut self, fd: i32, read: bool, write: bool, state: &mut u32) {
        let mut want: u32 = 0;
        if read {
            want |= libc::EPOLLIN as u32;
        }
        if write {
            want |= libc::EPOLLOUT as u32;
        }

        let op = if want == *state {
            return;
        } else if *state == 0 {
            libc::EPOLL_CTL_ADD
        } else if want == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };

        let mut ev = libc::epoll_event {
            events: want,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // a racing close can leave a stale DEL behind; not fatal
            debug!("epoll_ctl op {op} FD {fd} failed: {err}");
        }
        *state = want;
    }

    pub fn forget(&mut self, fd: i32, state: &mut u32) {
        if *state != 0 {
            let mut ev = libc::epoll_event { events: 0, u64: 0 };
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
            *state = 0;
        }
    }

    pub fn scan(&mut self, msec: i32, out: &mut Vec<ReadyFd>) -> io::Result<usize> {
        let num = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                msec,
            )
        };
        if num < 0 {
            return Err(io::Error::last_os_error());
        }

        out.clear();
        for ev in &self.events[..num as usize] {
            out.push(ReadyFd {
                fd: ev.u64 as i32,
                read: ev.events & EV_READ != 0,
                write: ev.events & EV_WRITE != 0,
                nval: false,
            });
        }
        Ok(num as usize)
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
