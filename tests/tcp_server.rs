//! End-to-end scenarios from the spec's testable-properties section,
//! driven against real loopback sockets and real threads — no mocked
//! syscalls, matching `danclive-queen-io/test/custom_event.rs`'s own
//! integration-test style.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use reactor_tcp::{EventLoopInner, LoopHandle, TcpServer};

/// Builds and runs a `TcpServer` entirely on a freshly spawned thread —
/// `EventLoopInner`/`TcpServer` are `Rc`-based and thread-confined, so they
/// can never be constructed on one thread and driven from another. `configure`
/// runs on that thread before `start()`, registering whatever callbacks the
/// test needs; only plain `Send` data (the base loop's handle and its bound
/// address) crosses back to the caller.
fn spawn_server(
    thread_num: usize,
    configure: impl FnOnce(&Rc<RefCell<TcpServer>>) + Send + 'static,
) -> (LoopHandle, SocketAddr) {
    let (tx, rx) = mpsc::sync_channel(0);

    std::thread::spawn(move || {
        let base_loop = EventLoopInner::new().unwrap();
        let base_handle = base_loop.borrow().handle();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(base_loop.clone(), &addr, "test", true).unwrap();
        server.borrow_mut().set_thread_num(thread_num);

        configure(&server);

        TcpServer::start(&server);
        let bound = server.borrow().local_addr().unwrap();

        tx.send((base_handle, bound)).unwrap();

        EventLoopInner::run(&base_loop).unwrap();
    });

    rx.recv().unwrap()
}

/// Scenario 1: echo round-trip. The connection callback fires exactly
/// twice (up, then down); the client sees its own bytes echoed back, then
/// the server half-closes and the client observes EOF.
#[test]
fn echo_round_trip() {
    let connection_events = Arc::new(AtomicUsize::new(0));
    let events = connection_events.clone();

    let (base_handle, addr) = spawn_server(3, move |server| {
        let mut s = server.borrow_mut();
        s.set_connection_callback(move |_conn| {
            events.fetch_add(1, Ordering::SeqCst);
        });
        s.set_message_callback(|conn, buf, _ts| {
            let bytes = buf.retrieve_all_as_vec();
            conn.send(bytes);
            conn.shutdown();
        });
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello\n");

    let mut eof = [0u8; 1];
    let n = client.read(&mut eof).unwrap();
    assert_eq!(n, 0, "expected EOF after server half-close");

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(connection_events.load(Ordering::SeqCst), 2);

    base_handle.quit();
}

/// Scenario 2: cross-thread send crossing the high-water mark. The
/// callback fires exactly once per upward crossing, and write-complete
/// fires once the buffer has drained.
#[test]
fn cross_thread_send_high_water_mark() {
    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let write_complete_hits = Arc::new(AtomicUsize::new(0));
    let hw = high_water_hits.clone();
    let wc = write_complete_hits.clone();

    let conn_slot: Arc<std::sync::Mutex<Option<reactor_tcp::Connection>>> = Arc::new(std::sync::Mutex::new(None));
    let slot = conn_slot.clone();

    let (base_handle, addr) = spawn_server(1, move |server| {
        let mut s = server.borrow_mut();
        s.set_high_water_mark_callback(
            move |_conn, _size| {
                hw.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        );
        s.set_write_complete_callback(move |_conn| {
            wc.fetch_add(1, Ordering::SeqCst);
        });
        s.set_connection_callback(move |conn| {
            if conn.connected() {
                *slot.lock().unwrap() = Some(conn);
            }
        });
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_nonblocking(true).ok();

    // Deliberately never read on the client side, so the server's socket
    // send buffer plus our own output buffer back up past the mark.
    std::thread::sleep(Duration::from_millis(100));

    client.write_all(b"x").unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let conn = conn_slot.lock().unwrap().clone().expect("connection callback never fired");
    for _ in 0..20 {
        conn.send(vec![b'x'; 1_000_000]);
    }

    std::thread::sleep(Duration::from_millis(300));
    assert!(high_water_hits.load(Ordering::SeqCst) >= 1);

    base_handle.quit();
}

/// Scenario 3: accept storm. Connections distribute round-robin across
/// exactly the configured number of subloops.
#[test]
fn accept_storm_distributes_round_robin() {
    let loop_ids: Arc<std::sync::Mutex<std::collections::HashSet<usize>>> =
        Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
    let seen = loop_ids.clone();

    let (base_handle, addr) = spawn_server(3, move |server| {
        server.borrow_mut().set_connection_callback(move |conn| {
            if conn.connected() {
                seen.lock().unwrap().insert(conn.get_loop().id());
            }
        });
    });

    let mut clients = Vec::new();
    for _ in 0..30 {
        clients.push(TcpStream::connect(addr).unwrap());
    }

    std::thread::sleep(Duration::from_millis(300));
    // All 3 subloops must have received connections; round robin spreads
    // 30 connections evenly over exactly 3 distinct loop identities.
    assert_eq!(loop_ids.lock().unwrap().len(), 3);

    base_handle.quit();
}

/// Scenario 5: quitting from a foreign thread returns `run()` promptly.
#[test]
fn quit_from_foreign_thread_is_prompt() {
    let base_loop = EventLoopInner::new().unwrap();
    let handle = base_loop.borrow().handle();

    let quitter = handle.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        quitter.quit();
    });

    let start = std::time::Instant::now();
    EventLoopInner::run(&base_loop).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

/// `start()` is idempotent and `shutdown()` is idempotent once
/// disconnecting, per the spec's round-trip laws. `configure` itself calls
/// `start()` once so `spawn_server`'s own unconditional `start()` call
/// afterward exercises the idempotent second call; a successful connection
/// afterward proves the listener is still healthy.
#[test]
fn start_twice_has_the_same_effect_as_once() {
    let (base_handle, addr) = spawn_server(2, |server| {
        TcpServer::start(server);
    });

    let client = TcpStream::connect(addr);
    assert!(client.is_ok());

    base_handle.quit();
}
