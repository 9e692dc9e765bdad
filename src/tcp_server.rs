//! The user-facing façade: owns the `Acceptor`, the `LoopThreadPool`, and
//! the name→connection map, wiring accepted sockets onto a chosen subloop.
//! Grounded on spec.md §4.7 and `SPEC_FULL.md`'s carried-forward contract
//! (no `TcpServer.cc` was part of the retrieval; reconstructed from the
//! spec's own wiring description plus `Acceptor`/`TcpConnection`).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::error::Result;
use crate::event_loop::{self, EventLoopInner, LoopHandle};
use crate::loop_thread_pool::LoopThreadPool;
use crate::sys::Socket;
use crate::tcp_connection::{Callbacks, Connection, ConnectionCb, HighWaterMarkCb, MessageCb, TcpConnection, WriteCompleteCb};

thread_local! {
    // `TcpServer` is thread-confined to the base loop's thread, same as
    // `EventLoopInner`; a connection's `close_notify` (built from `Send`
    // data alone on its own subloop) hops back here via `run_in_loop` to
    // find the server instance that owns it.
    static CURRENT_SERVER: RefCell<Option<Weak<RefCell<TcpServer>>>> = RefCell::new(None);
}

fn current() -> Option<Rc<RefCell<TcpServer>>> {
    CURRENT_SERVER.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}

pub struct TcpServer {
    base_loop: Rc<RefCell<EventLoopInner>>,
    base_handle: LoopHandle,
    acceptor: Rc<RefCell<Acceptor>>,
    pool: Option<LoopThreadPool>,
    thread_num: usize,
    name: Arc<str>,
    next_conn_id: Cell<u64>,
    connections: HashMap<Arc<str>, Connection>,
    callbacks: Callbacks,
    high_water_mark: usize,
    started: bool,
}

impl TcpServer {
    /// Builds the `Acceptor` on `base_loop` and wires its new-connection
    /// callback to `TcpServer::new_connection`. Does not bind/listen yet —
    /// that happens in `start()`.
    pub fn new(
        base_loop: Rc<RefCell<EventLoopInner>>,
        addr: &SocketAddr,
        name: impl Into<Arc<str>>,
        reuse_port: bool,
    ) -> Result<Rc<RefCell<TcpServer>>> {
        let base_handle = base_loop.borrow().handle();
        let acceptor = Acceptor::new(base_loop.clone(), addr, reuse_port)?;

        let this = Rc::new(RefCell::new(TcpServer {
            base_loop,
            base_handle,
            acceptor: acceptor.clone(),
            pool: None,
            thread_num: 0,
            name: name.into(),
            next_conn_id: Cell::new(0),
            connections: HashMap::new(),
            callbacks: Callbacks::default(),
            high_water_mark: 64 * 1024,
            started: false,
        }));

        let weak: Weak<RefCell<TcpServer>> = Rc::downgrade(&this);
        acceptor.borrow_mut().set_new_connection_callback(move |socket, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.borrow_mut().new_connection(socket, peer_addr);
            }
        });

        CURRENT_SERVER.with(|cell| *cell.borrow_mut() = Some(Rc::downgrade(&this)));

        Ok(this)
    }

    /// Must precede `start()`; sizes the subloop pool. `0` keeps every
    /// connection on the base loop.
    pub fn set_thread_num(&mut self, n: usize) {
        self.thread_num = n;
    }

    pub fn set_connection_callback(&mut self, cb: impl Fn(Connection) + Send + Sync + 'static) {
        self.callbacks.connection = Some(Arc::new(cb) as ConnectionCb);
    }

    pub fn set_message_callback(&mut self, cb: impl Fn(Connection, &mut crate::buffer::Buffer, std::time::Instant) + Send + Sync + 'static) {
        self.callbacks.message = Some(Arc::new(cb) as MessageCb);
    }

    pub fn set_write_complete_callback(&mut self, cb: impl Fn(Connection) + Send + Sync + 'static) {
        self.callbacks.write_complete = Some(Arc::new(cb) as WriteCompleteCb);
    }

    pub fn set_high_water_mark_callback(&mut self, cb: impl Fn(Connection, usize) + Send + Sync + 'static, mark: usize) {
        self.callbacks.high_water_mark = Some(Arc::new(cb) as HighWaterMarkCb);
        self.high_water_mark = mark;
    }

    pub fn get_loop(&self) -> LoopHandle {
        self.base_handle.clone()
    }

    /// The listener's bound address, useful when constructed against an
    /// ephemeral port (`addr` with port `0`).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.borrow().local_addr()
    }

    /// Idempotent: the pool and acceptor are only ever started once.
    pub fn start(this: &Rc<RefCell<TcpServer>>) {
        let mut me = this.borrow_mut();
        if me.started {
            return;
        }
        me.started = true;
        me.pool = Some(LoopThreadPool::new(me.thread_num));

        let acceptor = me.acceptor.clone();
        me.base_handle.run_in_loop(move || {
            acceptor.borrow_mut().listen();
        });
    }

    /// Runs on the base loop (the `Acceptor`'s read callback is only ever
    /// invoked there): picks the next subloop, composes a unique name, and
    /// posts the rest of the connection's setup to that subloop.
    fn new_connection(&mut self, socket: Socket, peer_addr: SocketAddr) {
        let local_addr = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                log::warn!("TcpServer[{}] getsockname failed on new connection: {}", self.name, e);
                return;
            }
        };

        let id = self.next_conn_id.get() + 1;
        self.next_conn_id.set(id);
        let conn_name: Arc<str> = Arc::from(format!("{}-{}#{}", self.name, peer_addr, id));

        let chosen = match &self.pool {
            Some(pool) if !pool.is_empty() => pool.get_next_loop(),
            _ => self.base_handle.clone(),
        };

        let callbacks = Arc::new(self.callbacks.clone());
        let high_water_mark = self.high_water_mark;
        let base_handle = self.base_handle.clone();
        let name = conn_name;
        let loop_handle = chosen.clone();

        chosen.run_in_loop(move || {
            let conn = TcpConnection::new(loop_handle, name.clone(), socket, local_addr, peer_addr, callbacks, high_water_mark);
            let slab_id = event_loop::current().borrow_mut().insert_connection(conn.clone());
            conn.borrow_mut().set_id(slab_id);

            let notify_base = base_handle.clone();
            let notify_name = name.clone();
            conn.borrow_mut().set_close_notify(Box::new(move || {
                let base = notify_base.clone();
                let name = notify_name.clone();
                base.run_in_loop(move || {
                    if let Some(server) = current() {
                        server.borrow_mut().remove_connection_in_loop(&name);
                    }
                });
            }));

            let handle = conn.borrow().handle();
            base_handle.run_in_loop(move || {
                if let Some(server) = current() {
                    server.borrow_mut().connections.insert(name, handle);
                }
            });

            TcpConnection::connect_established(&conn);
        });
    }

    /// Erases the map entry and posts `connect_destroyed` to the
    /// connection's own subloop. Only ever reached via a task already
    /// running on the base loop (see `new_connection`'s `close_notify`).
    fn remove_connection_in_loop(&mut self, name: &str) {
        if let Some(handle) = self.connections.remove(name) {
            let loop_handle = handle.get_loop();
            let id = handle.id();
            loop_handle.run_in_loop(move || {
                if let Some(conn) = event_loop::current().borrow_mut().remove_connection(id) {
                    conn.borrow_mut().connect_destroyed();
                }
            });
        }
    }
}
