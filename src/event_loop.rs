//! The reactor core. `EventLoopInner` is thread-confined (built around
//! `Rc<RefCell<_>>`) and is never touched from any thread but the one that
//! created it; `LoopHandle` is the `Send + Sync` handle every other thread
//! actually holds, grounded on `original_source/EventLoop.cc`.

use std::cell::Cell;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use slab::Slab;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::EventFd;
use crate::task::Task;
use crate::tcp_connection::TcpConnection;

/// Default `epoll_wait` timeout when nothing else bounds it, carried over
/// verbatim from `original_source/EventLoop.cc`'s `kPollTimeMs`.
const K_POLL_TIME_MS: u64 = 10_000;

thread_local! {
    static IN_LOOP_THREAD: Cell<bool> = Cell::new(false);
    // Lets a task posted from a foreign thread (built from plain `Send`
    // data: a slab id, an `Arc`-shared callback bundle) find its way back
    // to the `EventLoopInner` of whatever thread it ends up running on,
    // without ever moving an `Rc`/`RefCell` across a thread boundary.
    static CURRENT_LOOP: RefCell<Option<Weak<RefCell<EventLoopInner>>>> = RefCell::new(None);
}

/// The `EventLoopInner` owned by the calling thread, if any. Every task
/// this crate posts across threads is built from `Send` data alone and
/// resolves its target loop through this accessor once it actually runs —
/// see `crate::task`. Panics if the calling thread hosts no loop, which
/// only happens if a task escapes its owning loop's lifetime or is invoked
/// from a thread that never constructed one (a programming error, not a
/// recoverable condition).
pub fn current() -> Rc<RefCell<EventLoopInner>> {
    CURRENT_LOOP.with(|cell| {
        cell.borrow().as_ref().and_then(Weak::upgrade)
    }).unwrap_or_else(|| {
        log::error!("event_loop::current() called with no EventLoopInner owning this thread");
        panic!("no EventLoopInner owns the current thread");
    })
}

struct LoopShared {
    quit: AtomicBool,
    calling_pending_functors: AtomicBool,
    pending: Mutex<VecDeque<Task>>,
    wakeup_fd: EventFd,
    thread_id: ThreadId,
}

/// The `Send + Sync` cross-thread handle to a running subloop. This is what
/// `LoopThread::start_loop()` hands back to its creator, and what a
/// `Connection`'s `send()`/`shutdown()` post tasks through.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// A stable identity for the loop this handle points at: two handles
    /// cloned from the same loop always return the same id, and different
    /// loops never collide, unlike comparing the handles' own addresses
    /// (which are just stack locations of whatever local variable holds
    /// them). Used to tell subloops apart in round-robin distribution
    /// tests.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Run `f` immediately if called from the loop's own thread, otherwise
    /// queue it for the next iteration.
    pub fn run_in_loop<F: FnOnce() + Send + 'static>(&self, f: F) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always queue `f`, waking the loop if it is not already about to
    /// check its pending-task queue (matches the original's rule: wake up
    /// whenever called off-thread, or from within `doPendingFunctors`
    /// itself, so a task queued by another task isn't starved until the
    /// next 10s poll timeout).
    pub fn queue_in_loop<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.pending.lock().unwrap().push_back(Box::new(f));
        if !self.is_in_loop_thread() || self.inner.calling_pending_functors.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        if let Err(e) = self.inner.wakeup_fd.write(1) {
            log::warn!("EventLoop wakeup write failed: {}", e);
        }
    }
}

/// The thread-confined reactor: a `Poller`, the registry of live
/// `Channel`s indexed the same way the `Poller` hands out indices, and the
/// subloop's own `Slab` of live connections (the spec's sanctioned
/// `Slab<Connection>`-owned-by-the-subloop realization).
pub struct EventLoopInner {
    poller: Poller,
    channels: Vec<Option<Channel>>,
    connections: Slab<Rc<RefCell<TcpConnection>>>,
    handle: LoopHandle,
    #[allow(dead_code)]
    wakeup_channel: Channel,
}

impl EventLoopInner {
    /// Construct a new subloop on the calling thread. Panics if a second
    /// `EventLoopInner` is constructed on a thread that already owns one —
    /// "one loop per thread" is a hard invariant, matching
    /// `original_source/EventLoop.cc`'s constructor-time `LOG_FATAL`.
    pub fn new() -> std::io::Result<Rc<RefCell<EventLoopInner>>> {
        IN_LOOP_THREAD.with(|flag| {
            if flag.get() {
                log::error!("Another EventLoop already exists in this thread");
                panic!("another EventLoop already exists in this thread");
            }
            flag.set(true);
        });

        let poller = Poller::new()?;
        let wakeup_fd = EventFd::new()?;

        let shared = Arc::new(LoopShared {
            quit: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            wakeup_fd,
            thread_id: std::thread::current().id(),
        });
        let handle = LoopHandle { inner: shared };

        let wakeup_channel = Channel::new(handle.inner.wakeup_fd.as_raw_fd());

        let this = Rc::new(RefCell::new(EventLoopInner {
            poller,
            channels: Vec::new(),
            connections: Slab::new(),
            handle: handle.clone(),
            wakeup_channel: wakeup_channel.clone(),
        }));

        let weak_this: Weak<RefCell<EventLoopInner>> = Rc::downgrade(&this);
        wakeup_channel.set_read_callback(move || {
            if let Some(this) = weak_this.upgrade() {
                if let Err(e) = this.borrow().handle.inner.wakeup_fd.read() {
                    log::warn!("EventLoop wakeup read failed: {}", e);
                }
            }
        });
        wakeup_channel.enable_reading();
        this.borrow_mut().update_channel(&wakeup_channel);

        CURRENT_LOOP.with(|cell| *cell.borrow_mut() = Some(Rc::downgrade(&this)));

        Ok(this)
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    fn assert_in_loop_thread(&self) {
        if !self.handle.is_in_loop_thread() {
            log::error!("EventLoop invariant violated: accessed from a non-owning thread");
            panic!("EventLoop used from a thread that does not own it");
        }
    }

    /// Register (or update an already-registered) channel's interest mask
    /// with the poller. A channel whose interest has dropped to none is
    /// unregistered, matching `updateChannel`/`removeChannel` in
    /// `EPollPoller.cc`.
    pub fn update_channel(&mut self, channel: &Channel) {
        self.assert_in_loop_thread();
        match channel.index() {
            None => {
                let idx = self
                    .poller
                    .register(channel.fd(), channel.interest(), channel.edge_triggered())
                    .unwrap_or_else(|e| {
                        log::error!("poller register failed: {}", e);
                        panic!("poller register failed: {}", e);
                    });
                channel.set_index(Some(idx));
                if self.channels.len() <= idx {
                    self.channels.resize(idx + 1, None);
                }
                self.channels[idx] = Some(channel.clone());
            }
            Some(idx) => {
                if channel.is_none_event() {
                    self.poller.unregister(idx).unwrap_or_else(|e| {
                        log::error!("poller unregister failed: {}", e);
                    });
                    self.channels[idx] = None;
                    channel.set_index(None);
                } else {
                    self.poller
                        .reregister(idx, channel.interest(), channel.edge_triggered())
                        .unwrap_or_else(|e| {
                            log::error!("poller reregister failed: {}", e);
                        });
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        self.assert_in_loop_thread();
        if let Some(idx) = channel.index() {
            self.poller.unregister(idx).unwrap_or_else(|e| {
                log::error!("poller unregister failed: {}", e);
            });
            self.channels[idx] = None;
            channel.set_index(None);
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        channel
            .index()
            .map(|idx| self.poller.is_registered(idx))
            .unwrap_or(false)
    }

    pub fn insert_connection(&mut self, conn: Rc<RefCell<TcpConnection>>) -> usize {
        self.connections.insert(conn)
    }

    pub fn get_connection(&self, id: usize) -> Option<Rc<RefCell<TcpConnection>>> {
        self.connections.get(id).cloned()
    }

    pub fn remove_connection(&mut self, id: usize) -> Option<Rc<RefCell<TcpConnection>>> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Drain and run the pending cross-thread task queue. Swaps the queue
    /// out under the lock, then runs the drained tasks lock-free, matching
    /// `doPendingFunctors`'s swap trick (bounds lock hold time and lets a
    /// functor queue further tasks without deadlocking on its own mutex).
    fn do_pending_functors(this: &Rc<RefCell<EventLoopInner>>) {
        let handle = this.borrow().handle.clone();
        handle.inner.calling_pending_functors.store(true, Ordering::SeqCst);

        let functors: Vec<Task> = {
            let mut q = handle.inner.pending.lock().unwrap();
            q.drain(..).collect()
        };

        for f in functors {
            f();
        }

        handle.inner.calling_pending_functors.store(false, Ordering::SeqCst);
    }

    /// Run the reactor loop until `quit()` is called. Blocks in
    /// `epoll_wait` for up to `K_POLL_TIME_MS`, dispatches fired channels in
    /// `Poller`-reported order, then drains pending cross-thread tasks.
    pub fn run(this: &Rc<RefCell<EventLoopInner>>) -> std::io::Result<()> {
        this.borrow().assert_in_loop_thread();

        loop {
            let ready = {
                let mut inner = this.borrow_mut();
                let (_, ready) = inner.poller.wait(Some(Duration::from_millis(K_POLL_TIME_MS)))?;
                ready
            };

            for ev in &ready {
                let channel = this.borrow().channels.get(ev.index).and_then(|c| c.clone());
                if let Some(channel) = channel {
                    channel.handle_event(ev.revents);
                }
            }

            EventLoopInner::do_pending_functors(this);

            if this.borrow().handle.inner.quit.load(Ordering::SeqCst) {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        handle.run_in_loop(move || r.set(true));
        assert!(ran.get());
    }

    #[test]
    fn cross_thread_quit_wakes_loop_promptly() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();

        let quitter = handle.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            quitter.quit();
        });

        let start = std::time::Instant::now();
        EventLoopInner::run(&event_loop).unwrap();
        t.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cross_thread_queue_in_loop_runs_before_next_timeout() {
        let event_loop = EventLoopInner::new().unwrap();
        let handle = event_loop.borrow().handle();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let poster = handle.clone();
        let t = std::thread::spawn(move || {
            poster.queue_in_loop(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });
        t.join().unwrap();

        let quitter = handle.clone();
        let q = counter.clone();
        std::thread::spawn(move || {
            // Give the queued task a moment to run, then stop the loop.
            loop {
                if q.load(Ordering::SeqCst) == 1 {
                    quitter.quit();
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        EventLoopInner::run(&event_loop).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
