use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

/// The wakeup primitive used to break a subloop out of `epoll_wait` from a
/// foreign thread: `EventLoop::wakeup()` writes to it, the loop's own
/// wakeup `Channel` reads it on the next epoll round.
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    /// `eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK)`.
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        (&self.inner).write_all(&buf)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn accumulates_until_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(1).unwrap();
        eventfd.write(1).unwrap();
        eventfd.write(1).unwrap();
        assert_eq!(3, eventfd.read().unwrap());
    }

    #[test]
    fn write_max_blocks() {
        let eventfd = EventFd::new().unwrap();
        assert!(eventfd.write(0xffff_ffff_ffff_fffe).is_ok());
        assert!(eventfd.write(0xffff_ffff_ffff_fffe).is_err());
    }
}
