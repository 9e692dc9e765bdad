//! Per-connection state machine: buffered non-blocking I/O, half-close,
//! and high-water-mark back-pressure. `TcpConnection` is thread-confined
//! (built around `Rc<RefCell<_>>`, touched only on its owning subloop's
//! thread); `Connection` is the `Send + Sync` public handle user callbacks
//! receive and that a foreign thread can call `send`/`shutdown` through.
//!
//! Grounded on `original_source/TcpConnection.h`'s field list (the `.cc`
//! body was not part of the retrieval; the state machine and `send`/
//! `send_in_loop` policy below follow `SPEC_FULL.md` §4.6, which carries
//! forward the Muduo-family convention the header implies).

use std::cell::RefCell;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{self, LoopHandle};
use crate::sys::Socket;

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTING: u8 = 2;
const DISCONNECTED: u8 = 3;

pub type ConnectionCb = Arc<dyn Fn(Connection) + Send + Sync>;
pub type MessageCb = Arc<dyn Fn(Connection, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCb = Arc<dyn Fn(Connection) + Send + Sync>;
pub type HighWaterMarkCb = Arc<dyn Fn(Connection, usize) + Send + Sync>;

/// The user-supplied callback bundle, shared (via `Arc`) across every
/// connection a `TcpServer` hands out — cloning it to move to a subloop
/// thread is just a refcount bump, no closure state is duplicated.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub connection: Option<ConnectionCb>,
    pub message: Option<MessageCb>,
    pub write_complete: Option<WriteCompleteCb>,
    pub high_water_mark: Option<HighWaterMarkCb>,
}

/// The `Send + Sync` handle to a live connection. Holds only plain data
/// (a loop handle, a slab id, the immutable addresses/name, and an atomic
/// mirror of connection state) so it can be cloned into a user callback or
/// moved to a foreign thread freely; all the actual buffered I/O lives in
/// the thread-confined `TcpConnection` this handle's `id` resolves to on
/// its owning subloop.
#[derive(Clone)]
pub struct Connection {
    loop_handle: LoopHandle,
    id: usize,
    name: Arc<str>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Arc<AtomicU8>,
}

impl Connection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    pub fn get_loop(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    /// The subloop-local slab id backing this handle. Used by `TcpServer`
    /// to post `connect_destroyed` back to the connection's owning subloop
    /// once it is removed from the server's name map.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Sends `data` on the owning subloop. Hops over via `run_in_loop` if
    /// called from any other thread, matching `send` → `send_in_loop`.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let id = self.id;
        self.loop_handle.run_in_loop(move || {
            if let Some(conn) = event_loop::current().borrow().get_connection(id) {
                conn.borrow_mut().send_in_loop(&data);
            }
        });
    }

    /// Half-closes the write side. Idempotent in DISCONNECTING/DISCONNECTED,
    /// matching the round-trip law in `SPEC_FULL.md` §8.
    pub fn shutdown(&self) {
        let id = self.id;
        self.loop_handle.run_in_loop(move || {
            if let Some(conn) = event_loop::current().borrow().get_connection(id) {
                conn.borrow_mut().shutdown();
            }
        });
    }
}

pub struct TcpConnection {
    loop_handle: LoopHandle,
    name: Arc<str>,
    state: u8,
    shared_state: Arc<AtomicU8>,
    socket: Socket,
    channel: Channel,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Buffer,
    output_buffer: Buffer,
    high_water_mark: usize,
    reading: bool,
    fault: bool,
    callbacks: Arc<Callbacks>,
    id: Option<usize>,
    /// Invoked once from `handle_close`; notifies the owning `TcpServer` so
    /// it can erase its name map entry and schedule `connect_destroyed`.
    /// Built on the subloop thread out of `Send`-only captures (a
    /// `LoopHandle` pair and a name), never a smuggled `Rc`.
    close_notify: Option<Box<dyn FnMut()>>,
}

impl TcpConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        loop_handle: LoopHandle,
        name: Arc<str>,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        callbacks: Arc<Callbacks>,
        high_water_mark: usize,
    ) -> Rc<RefCell<TcpConnection>> {
        use std::os::unix::io::AsRawFd;
        let channel = Channel::new(socket.as_raw_fd());

        let this = Rc::new(RefCell::new(TcpConnection {
            loop_handle,
            name,
            state: CONNECTING,
            shared_state: Arc::new(AtomicU8::new(CONNECTING)),
            socket,
            channel: channel.clone(),
            local_addr,
            peer_addr,
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
            high_water_mark,
            reading: false,
            fault: false,
            callbacks,
            id: None,
            close_notify: None,
        }));

        channel.tie(&this);

        let weak: Weak<RefCell<TcpConnection>> = Rc::downgrade(&this);
        let w = weak.clone();
        channel.set_read_callback(move || {
            if let Some(this) = w.upgrade() {
                TcpConnection::handle_read(&this);
            }
        });
        let w = weak.clone();
        channel.set_write_callback(move || {
            if let Some(this) = w.upgrade() {
                this.borrow_mut().handle_write();
            }
        });
        let w = weak.clone();
        channel.set_close_callback(move || {
            if let Some(this) = w.upgrade() {
                TcpConnection::handle_close(&this);
            }
        });
        let w = weak;
        channel.set_error_callback(move || {
            if let Some(this) = w.upgrade() {
                TcpConnection::handle_error(&this);
            }
        });

        this
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn set_id(&mut self, id: usize) {
        self.id = Some(id);
    }

    pub fn set_close_notify(&mut self, notify: Box<dyn FnMut()>) {
        self.close_notify = Some(notify);
    }

    /// Builds the public `Connection` handle this instance hands to user
    /// callbacks. Panics if called before `set_id`, which is always
    /// assigned immediately after insertion into the subloop's slab.
    pub fn handle(&self) -> Connection {
        Connection {
            loop_handle: self.loop_handle.clone(),
            id: self.id.expect("TcpConnection::handle called before set_id"),
            name: self.name.clone(),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
            state: self.shared_state.clone(),
        }
    }

    pub fn connected(&self) -> bool {
        self.state == CONNECTED
    }

    fn set_state(&mut self, state: u8) {
        self.state = state;
        self.shared_state.store(state, Ordering::Release);
    }

    /// Ties the channel's lifetime guard, enables reading, transitions to
    /// CONNECTED, and fires the user connection callback. Must run on the
    /// owning subloop's thread (posted there by `TcpServer::new_connection`).
    ///
    /// Takes `&Rc<RefCell<Self>>` rather than `&mut self` and drops its
    /// borrow before firing the user callback: the callback may call back
    /// into this same connection (e.g. `conn.send(...)`), which re-enters
    /// this `RefCell` and would panic with `BorrowMutError` if a borrow
    /// were still held.
    pub fn connect_established(this: &Rc<RefCell<TcpConnection>>) {
        let (channel, cb, handle) = {
            let mut conn = this.borrow_mut();
            conn.set_state(CONNECTED);
            conn.reading = true;
            conn.channel.enable_reading();
            (conn.channel.clone(), conn.callbacks.connection.clone(), conn.handle())
        };

        event_loop::current().borrow_mut().update_channel(&channel);

        if let Some(cb) = cb {
            cb(handle);
        }
    }

    /// Disables all events, removes the channel, and fires the user
    /// connection callback with a disconnected state. Posted by the
    /// library close path once the `TcpServer` has dropped its own
    /// bookkeeping for this connection.
    pub fn connect_destroyed(&mut self) {
        if self.state == CONNECTED {
            self.set_state(DISCONNECTED);
        }
        self.channel.disable_all();
        event_loop::current().borrow_mut().remove_channel(&self.channel);
    }

    fn loop_handle_update(&self) {
        event_loop::current().borrow_mut().update_channel(&self.channel);
    }

    /// Reads into `input_buffer`, then fires the message callback with the
    /// `RefCell` borrow already released — the echo pattern (`conn.send()`
    /// from inside the message callback) re-enters this same connection via
    /// `run_in_loop`, which runs inline on the owning thread, so no borrow
    /// can still be live when `cb` is called.
    fn handle_read(this: &Rc<RefCell<TcpConnection>>) {
        let result = {
            let mut conn = this.borrow_mut();
            conn.input_buffer.read_fd(&conn.socket)
        };

        match result {
            Ok(0) => TcpConnection::handle_close(this),
            Ok(_n) => {
                let cb = this.borrow().callbacks.message.clone();
                if let Some(cb) = cb {
                    let handle = this.borrow().handle();
                    let mut buf = std::mem::take(&mut this.borrow_mut().input_buffer);
                    cb(handle, &mut buf, Instant::now());
                    this.borrow_mut().input_buffer = buf;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("TcpConnection[{}] read error: {}", this.borrow().name, e);
                TcpConnection::handle_error(this);
            }
        }
    }

    fn handle_write(&mut self) {
        if !self.channel.is_writing() {
            log::trace!("TcpConnection[{}] handle_write called with no data queued", self.name);
            return;
        }

        let data = self.output_buffer.peek().to_vec();
        match self.socket.write(&data) {
            Ok(n) => {
                self.output_buffer.retrieve(n);
                if self.output_buffer.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = self.callbacks.write_complete.clone() {
                        let handle = self.handle();
                        self.loop_handle.queue_in_loop(move || cb(handle));
                    }
                    if self.state == DISCONNECTING {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("TcpConnection[{}] write error: {}", self.name, e);
            }
        }
    }

    /// Disables events, fires the user connection callback, then the
    /// library-internal close notification — both with the `RefCell`
    /// borrow released first, for the same reentrancy reason as
    /// `handle_read`/`connect_established`.
    fn handle_close(this: &Rc<RefCell<TcpConnection>>) {
        let fired = {
            let mut conn = this.borrow_mut();
            if conn.state == DISCONNECTED {
                None
            } else {
                conn.channel.disable_all();
                conn.set_state(DISCONNECTED);
                let cb = conn.callbacks.connection.clone();
                let handle = conn.handle();
                let notify = conn.close_notify.take();
                Some((cb, handle, notify))
            }
        };

        if let Some((cb, handle, mut notify)) = fired {
            if let Some(cb) = cb {
                cb(handle);
            }
            if let Some(notify) = &mut notify {
                notify();
            }
        }
    }

    fn handle_error(this: &Rc<RefCell<TcpConnection>>) {
        let conn = this.borrow();
        let err = conn.socket.take_error().ok().flatten();
        log::warn!("TcpConnection[{}] socket error: {:?}", conn.name, err);
    }

    /// `send` → `send_in_loop`'s six-step policy from `SPEC_FULL.md` §4.6.
    fn send_in_loop(&mut self, data: &[u8]) {
        if self.state == DISCONNECTED {
            log::warn!("TcpConnection[{}] send on a disconnected connection, dropping", self.name);
            return;
        }
        if self.fault {
            return;
        }

        let mut remaining = data.len();
        let mut written = 0usize;

        if self.output_buffer.readable_bytes() == 0 && !self.channel.is_writing() {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(cb) = self.callbacks.write_complete.clone() {
                            let handle = self.handle();
                            self.loop_handle.queue_in_loop(move || cb(handle));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    let raw = e.raw_os_error();
                    if raw == Some(libc::EPIPE) || raw == Some(libc::ECONNRESET) {
                        log::warn!("TcpConnection[{}] send hit {}: suppressing further writes", self.name, e);
                        self.fault = true;
                    } else {
                        log::warn!("TcpConnection[{}] send error: {}", self.name, e);
                    }
                    return;
                }
            }
        }

        if remaining > 0 {
            let before = self.output_buffer.readable_bytes();
            if let Some(cb) = self.callbacks.high_water_mark.clone() {
                let mark = self.high_water_mark;
                let after = before + remaining;
                if before < mark && after >= mark {
                    let handle = self.handle();
                    self.loop_handle.queue_in_loop(move || cb(handle, after));
                }
            }
            self.output_buffer.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
                self.loop_handle_update();
            }
        }
    }

    /// Half-closes the write side if nothing is pending; otherwise defers
    /// to `handle_write` once the output buffer drains.
    fn shutdown(&mut self) {
        if self.state != CONNECTED && self.state != DISCONNECTING {
            return;
        }
        if self.state == CONNECTED {
            self.set_state(DISCONNECTING);
        }
        self.shutdown_in_loop();
    }

    fn shutdown_in_loop(&mut self) {
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                log::warn!("TcpConnection[{}] shutdown(SHUT_WR) failed: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoopInner;
    use std::sync::atomic::AtomicUsize;

    fn accept_blocking(listener: &Socket) -> (Socket, SocketAddr) {
        loop {
            match listener.accept() {
                Ok(pair) => return pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
    }

    fn read_blocking(sock: &Socket, buf: &mut [u8]) {
        let mut got = 0;
        while got < buf.len() {
            match sock.read(&mut buf[got..]) {
                Ok(0) => panic!("peer closed before sending enough bytes"),
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    fn connect_pair(loop_handle: LoopHandle, high_water_mark: usize) -> (Rc<RefCell<TcpConnection>>, Socket) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::bind_listen(&addr, true, 16).unwrap();
        let local = listener.local_addr().unwrap();
        let client = Socket::connect(&local).unwrap();
        let (server_sock, peer_addr) = accept_blocking(&listener);
        let local_addr = server_sock.local_addr().unwrap();

        let conn = TcpConnection::new(
            loop_handle,
            Arc::from("test-conn"),
            server_sock,
            local_addr,
            peer_addr,
            Arc::new(Callbacks::default()),
            high_water_mark,
        );
        (conn, client)
    }

    #[test]
    fn connect_established_transitions_to_connected_and_fires_callback() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let (conn, _client) = connect_pair(handle, 64 * 1024);
        let f = fired.clone();
        conn.borrow_mut().callbacks = Arc::new(Callbacks {
            connection: Some(Arc::new(move |_c| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        conn.borrow_mut().set_id(0);

        TcpConnection::connect_established(&conn);
        assert!(conn.borrow().connected());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_in_loop_direct_write_succeeds_without_buffering() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();
        let (conn, client) = connect_pair(handle, 64 * 1024);
        conn.borrow_mut().set_id(0);
        TcpConnection::connect_established(&conn);

        conn.borrow_mut().send_in_loop(b"hello");
        assert_eq!(conn.borrow().output_buffer.readable_bytes(), 0);

        let mut buf = [0u8; 5];
        read_blocking(&client, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn shutdown_is_idempotent_once_disconnecting() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();
        let (conn, _client) = connect_pair(handle, 64 * 1024);
        conn.borrow_mut().set_id(0);
        TcpConnection::connect_established(&conn);

        conn.borrow_mut().shutdown();
        assert_eq!(conn.borrow().state, DISCONNECTING);
        conn.borrow_mut().shutdown();
        assert_eq!(conn.borrow().state, DISCONNECTING);
    }

    #[test]
    fn send_on_disconnected_connection_is_dropped_silently() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();
        let (conn, _client) = connect_pair(handle, 64 * 1024);
        conn.borrow_mut().set_id(0);
        conn.borrow_mut().set_state(DISCONNECTED);

        conn.borrow_mut().send_in_loop(b"dropped");
        assert_eq!(conn.borrow().output_buffer.readable_bytes(), 0);
    }
}
