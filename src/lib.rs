//! A multi-reactor, non-blocking TCP network library built around an
//! epoll-backed event loop.
//!
//! Application code builds a base [`EventLoopInner`] on its main thread,
//! wraps it in a [`TcpServer`], registers callbacks for connect/disconnect,
//! inbound messages, write-complete, and high-water-mark back-pressure, and
//! calls `start()`. Accepted connections are handed round-robin to a pool
//! of subordinate loops, each running on its own OS thread; all I/O for a
//! given connection happens on exactly one of those threads for its whole
//! lifetime.
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use reactor_tcp::{EventLoopInner, TcpServer};
//!
//! let base_loop = EventLoopInner::new().unwrap();
//! let addr: SocketAddr = "127.0.0.1:7890".parse().unwrap();
//! let server = TcpServer::new(base_loop.clone(), &addr, "echo", true).unwrap();
//!
//! server.borrow_mut().set_thread_num(4);
//! server.borrow_mut().set_message_callback(|conn, buf, _ts| {
//!     let bytes = buf.retrieve_all_as_vec();
//!     conn.send(bytes);
//! });
//!
//! TcpServer::start(&server);
//! EventLoopInner::run(&base_loop).unwrap();
//! ```

mod sys;

mod interest;
mod channel;
mod poller;
mod task;
mod event_loop;
mod thread;
mod loop_thread_pool;
mod buffer;
mod acceptor;
mod tcp_connection;
mod tcp_server;

pub mod error;

pub use interest::Interest;
pub use channel::Channel;
pub use event_loop::{current as current_loop, EventLoopInner, LoopHandle};
pub use thread::LoopThread;
pub use loop_thread_pool::LoopThreadPool;
pub use buffer::Buffer;
pub use acceptor::Acceptor;
pub use tcp_connection::{Callbacks, Connection, TcpConnection};
pub use tcp_server::TcpServer;
pub use sys::Socket;

pub use error::{Error, Result};
