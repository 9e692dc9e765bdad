//! Owns the listening socket on the base loop, grounded on
//! `original_source/Acceptor.cc`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event_loop::EventLoopInner;
use crate::sys::Socket;

pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

pub struct Acceptor {
    event_loop: Rc<RefCell<EventLoopInner>>,
    socket: Socket,
    channel: Channel,
    new_connection_callback: Option<NewConnectionCallback>,
    listening: bool,
}

impl Acceptor {
    /// Must be called on the base loop's thread: binds and listens
    /// immediately. Bind/listen failure is recoverable (per `SPEC_FULL.md`
    /// §7, a narrowing of the original's blanket `LOG_FATAL`).
    pub fn new(
        event_loop: Rc<RefCell<EventLoopInner>>,
        addr: &SocketAddr,
        reuse_port: bool,
    ) -> Result<Rc<RefCell<Acceptor>>> {
        let socket = Socket::bind_listen(addr, reuse_port, 1024).map_err(|e| {
            log::error!("Acceptor failed to bind/listen on {}: {}", addr, e);
            Error::Bind { addr: *addr, source: e }
        })?;

        let channel = Channel::new(socket.as_raw_fd());

        let this = Rc::new(RefCell::new(Acceptor {
            event_loop,
            socket,
            channel: channel.clone(),
            new_connection_callback: None,
            listening: false,
        }));

        let weak: Weak<RefCell<Acceptor>> = Rc::downgrade(&this);
        channel.set_read_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.borrow_mut().handle_read();
            }
        });

        Ok(this)
    }

    pub fn set_new_connection_callback(&mut self, cb: impl FnMut(Socket, SocketAddr) + 'static) {
        self.new_connection_callback = Some(Box::new(cb));
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Enables read interest on the listen fd and registers the channel
    /// with the base loop's poller. Idempotent.
    pub fn listen(&mut self) {
        if self.listening {
            return;
        }
        self.listening = true;
        self.channel.enable_reading();
        self.event_loop.borrow_mut().update_channel(&self.channel);
    }

    fn handle_read(&mut self) {
        match self.socket.accept() {
            Ok((conn_sock, peer_addr)) => {
                if let Some(cb) = &mut self.new_connection_callback {
                    cb(conn_sock, peer_addr);
                } else {
                    log::debug!("no new-connection callback installed, dropping accepted socket");
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                // Matches the original: log and let the kernel drop the
                // pending connection off the listen queue. A reserved idle
                // fd that frees a slot to accept-then-drop is a documented
                // design variant this crate does not implement (DESIGN.md).
                log::error!("accept failed: too many open files (EMFILE)");
            }
            Err(e) => {
                log::warn!("accept failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoopInner;

    #[test]
    fn listen_registers_channel_with_poller() {
        let event_loop = EventLoopInner::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let acceptor = Acceptor::new(event_loop.clone(), &addr, true).unwrap();
        acceptor.borrow_mut().listen();
        assert!(acceptor.borrow().is_listening());
        assert!(event_loop.borrow().has_channel(&acceptor.borrow().channel));
    }
}
