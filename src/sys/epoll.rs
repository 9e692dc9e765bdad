use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::cmp;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::interest::Interest;

/// Raw `epoll_create1`/`epoll_ctl`/`epoll_wait` wrapper. `token` is an
/// opaque `u64` the caller controls; this crate stores a registry index in
/// it rather than a raw pointer (see `crate::poller`).
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, events: &mut Vec<libc::epoll_event>, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout_ms
        ))?;

        unsafe { events.set_len(cnt as usize) };
        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Interest, edge_triggered: bool) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest, edge_triggered),
            u64: token,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest, edge_triggered: bool) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest, edge_triggered),
            u64: token,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }
}

fn interest_to_epoll(interest: Interest, edge_triggered: bool) -> u32 {
    let mut kind = 0i32;

    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLPRI;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    if edge_triggered {
        kind |= EPOLLET;
    }
    // oneshot is unused by this reactor's always-level-triggered channels,
    // kept here only as a documented non-default.
    let _ = EPOLLONESHOT;

    kind as u32
}

pub fn decode(event: &libc::epoll_event) -> (Interest, u64) {
    let epoll = event.events as i32;
    let mut kind = Interest::NONE;

    if epoll & (EPOLLIN | EPOLLPRI) != 0 {
        kind |= Interest::READABLE;
    }
    if epoll & EPOLLOUT != 0 {
        kind |= Interest::WRITABLE;
    }
    if epoll & EPOLLERR != 0 {
        kind |= Interest::ERROR;
    }
    if epoll & (EPOLLRDHUP | EPOLLHUP) != 0 {
        kind |= Interest::HUP;
    }

    (kind, event.u64)
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
