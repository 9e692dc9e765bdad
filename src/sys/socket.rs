use std::io::{self, IoSlice, IoSliceMut, Error, ErrorKind};
use std::mem;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, socklen_t};

use super::fd::FileDesc;

pub fn setsockopt<T>(sock: &Socket, level: c_int, opt: c_int, val: T) -> io::Result<()> {
    let val = &val as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        level,
        opt,
        val,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, level: c_int, opt: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        level,
        opt,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = match *addr {
            SocketAddr::V4(ref a) => {
                let raw = &mut storage as *mut _ as *mut libc::sockaddr_in;
                *raw = mem::transmute_copy(a);
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(ref a) => {
                let raw = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                *raw = mem::transmute_copy(a);
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as socklen_t)
    }
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let raw = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(raw.sin_addr.s_addr);
            let port = u16::from_be(raw.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let raw = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip: [u8; 16] = raw.sin6_addr.s6_addr;
            let port = u16::from_be(raw.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip.into(),
                port,
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

/// A non-blocking, close-on-exec TCP socket: listener, accepted stream, or
/// outbound stream, depending on how it was constructed.
pub struct Socket(FileDesc);

impl Socket {
    fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let fam = match *addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        match syscall!(socket(fam, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(fam, libc::SOCK_STREAM, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    /// Create, bind and listen a nonblocking TCP listener, matching the
    /// `createNonblocking` + `bind` + `listen` sequence of the original
    /// `Acceptor` constructor. Always returns the created fd on success;
    /// construction failure is treated as fatal by the caller.
    pub fn bind_listen(addr: &SocketAddr, reuseport: bool, backlog: i32) -> io::Result<Socket> {
        let sock = Socket::new_stream(addr)?;
        sock.set_reuseaddr(true)?;
        if reuseport {
            sock.set_reuseport(true)?;
        }

        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(
            sock.as_raw_fd(),
            &storage as *const _ as *const sockaddr,
            len
        ))?;
        syscall!(listen(sock.as_raw_fd(), backlog))?;
        sock.set_nonblocking(true)?;

        Ok(sock)
    }

    pub fn connect(addr: &SocketAddr) -> io::Result<Socket> {
        let sock = Socket::new_stream(addr)?;
        sock.set_nonblocking(true)?;

        let (storage, len) = addr_to_sockaddr(addr);
        match syscall!(connect(
            sock.as_raw_fd(),
            &storage as *const _ as *const sockaddr,
            len
        )) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        Ok(sock)
    }

    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };

        let addr = sockaddr_to_addr(&storage, len as usize)?;
        Ok((Socket(unsafe { FileDesc::new(fd) }), addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(recv(
            self.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0
        ))?;
        Ok(n as usize)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let n = syscall!(readv(
            self.as_raw_fd(),
            bufs.as_mut_ptr() as *mut libc::iovec,
            bufs.len() as c_int
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(send(
            self.as_raw_fd(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL
        ))?;
        Ok(n as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let n = syscall!(writev(
            self.as_raw_fd(),
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as c_int
        ))?;
        Ok(n as usize)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.as_raw_fd(), how))?;
        Ok(())
    }

    pub fn set_reuseaddr(&self, val: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, val as c_int)
    }

    pub fn set_reuseport(&self, val: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, val as c_int)
    }

    pub fn set_nodelay(&self, val: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, val as c_int)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        let raw: c_int = getsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok(raw != 0)
    }

    pub fn set_nonblocking(&self, val: bool) -> io::Result<()> {
        let mut val = val as c_int;
        syscall!(ioctl(self.as_raw_fd(), libc::FIONBIO, &mut val)).map(drop)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn try_clone(&self) -> io::Result<Socket> {
        Ok(Socket(self.0.try_clone()?))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
