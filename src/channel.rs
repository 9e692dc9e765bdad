//! A `Channel` owns one fd's interest mask and callbacks and dispatches a
//! fired `Interest` to the right callback in the same order as
//! `original_source/Channel.cc::handleEventWithGuard`.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::interest::Interest;

type Callback = Box<dyn FnMut()>;
type ErrorCallback = Box<dyn FnMut()>;

/// Evaluates to `true` if the tied owner (a `TcpConnection`, typically) is
/// still alive. Realizes the C++ `weak_ptr<void> tie_` guard without
/// needing a `dyn Any` downcast: the closure already knows the concrete
/// type it was built from.
type TieGuard = Box<dyn Fn() -> bool>;

pub struct ChannelState {
    fd: RawFd,
    index: Option<usize>,
    interest: Interest,
    edge_triggered: bool,
    tie: Option<TieGuard>,
    read_callback: Option<Callback>,
    write_callback: Option<Callback>,
    close_callback: Option<Callback>,
    error_callback: Option<ErrorCallback>,
}

/// Shared handle to a `ChannelState`. Cloning a `Channel` shares the same
/// underlying fd registration; it is never sent across threads (the loop
/// that owns it is the only thread that ever touches it).
#[derive(Clone)]
pub struct Channel(pub Rc<RefCell<ChannelState>>);

impl Channel {
    pub fn new(fd: RawFd) -> Channel {
        Channel(Rc::new(RefCell::new(ChannelState {
            fd,
            index: None,
            interest: Interest::NONE,
            edge_triggered: false,
            tie: None,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        })))
    }

    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    pub fn index(&self) -> Option<usize> {
        self.0.borrow().index
    }

    pub fn set_index(&self, index: Option<usize>) {
        self.0.borrow_mut().index = index;
    }

    pub fn interest(&self) -> Interest {
        self.0.borrow().interest
    }

    pub fn edge_triggered(&self) -> bool {
        self.0.borrow().edge_triggered
    }

    pub fn set_edge_triggered(&self, edge: bool) {
        self.0.borrow_mut().edge_triggered = edge;
    }

    pub fn set_read_callback(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        self.0.borrow_mut().error_callback = Some(Box::new(cb));
    }

    /// The lifetime guard: ties this channel's dispatch to `owner`'s
    /// lifetime. Once `owner` is dropped, fired events are silently
    /// skipped instead of running stale callbacks.
    pub fn tie<T: 'static>(&self, owner: &Rc<RefCell<T>>) {
        let weak: Weak<RefCell<T>> = Rc::downgrade(owner);
        self.0.borrow_mut().tie = Some(Box::new(move || weak.upgrade().is_some()));
    }

    pub fn enable_reading(&self) {
        let mut state = self.0.borrow_mut();
        state.interest |= Interest::READABLE;
    }

    pub fn disable_reading(&self) {
        let mut state = self.0.borrow_mut();
        state.interest = state.interest - Interest::READABLE;
    }

    pub fn enable_writing(&self) {
        let mut state = self.0.borrow_mut();
        state.interest |= Interest::WRITABLE;
    }

    pub fn disable_writing(&self) {
        let mut state = self.0.borrow_mut();
        state.interest = state.interest - Interest::WRITABLE;
    }

    pub fn disable_all(&self) {
        self.0.borrow_mut().interest = Interest::NONE;
    }

    pub fn is_writing(&self) -> bool {
        self.0.borrow().interest.is_writable()
    }

    pub fn is_none_event(&self) -> bool {
        self.0.borrow().interest.is_none()
    }

    /// Runs the appropriate callback(s) for a fired `Interest`, in the same
    /// order as the original: hangup-without-readable closes, error,
    /// readable, writable.
    ///
    /// Each callback is taken out of the cell before it runs and put back
    /// afterwards, so no borrow of `ChannelState` is live while the
    /// callback executes. Without this, a callback that re-enters this same
    /// `Channel` (e.g. a read handler that enables writing, or a write
    /// handler that checks `is_writing()`) would hit a `BorrowMutError`.
    pub fn handle_event(&self, revents: Interest) {
        let tied_alive = match &self.0.borrow().tie {
            Some(guard) => guard(),
            None => true,
        };
        if !tied_alive {
            return;
        }

        if revents.is_hup() && !revents.is_readable() {
            self.run_close_callback();
        }

        if revents.is_error() {
            self.run_error_callback();
        }

        if revents.is_readable() {
            self.run_read_callback();
        }

        if revents.is_writable() {
            self.run_write_callback();
        }
    }

    fn run_read_callback(&self) {
        if let Some(mut cb) = self.0.borrow_mut().read_callback.take() {
            cb();
            self.0.borrow_mut().read_callback.get_or_insert(cb);
        }
    }

    fn run_write_callback(&self) {
        if let Some(mut cb) = self.0.borrow_mut().write_callback.take() {
            cb();
            self.0.borrow_mut().write_callback.get_or_insert(cb);
        }
    }

    fn run_close_callback(&self) {
        if let Some(mut cb) = self.0.borrow_mut().close_callback.take() {
            cb();
            self.0.borrow_mut().close_callback.get_or_insert(cb);
        }
    }

    fn run_error_callback(&self) {
        if let Some(mut cb) = self.0.borrow_mut().error_callback.take() {
            cb();
            self.0.borrow_mut().error_callback.get_or_insert(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::Interest;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn dispatch_order_hup_before_error_before_read_before_write() {
        let channel = Channel::new(-1);
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        channel.set_close_callback(move || o.borrow_mut().push("close"));
        let o = order.clone();
        channel.set_error_callback(move || o.borrow_mut().push("error"));
        let o = order.clone();
        channel.set_read_callback(move || o.borrow_mut().push("read"));
        let o = order.clone();
        channel.set_write_callback(move || o.borrow_mut().push("write"));

        channel.handle_event(Interest::HUP | Interest::ERROR | Interest::READABLE | Interest::WRITABLE);

        assert_eq!(*order.borrow(), vec!["close", "error", "read", "write"]);
    }

    #[test]
    fn hup_with_readable_does_not_close() {
        let channel = Channel::new(-1);
        let closed = Rc::new(Cell::new(false));
        let c = closed.clone();
        channel.set_close_callback(move || c.set(true));

        channel.handle_event(Interest::HUP | Interest::READABLE);
        assert!(!closed.get());
    }

    #[test]
    fn tie_skips_dispatch_after_owner_dropped() {
        let channel = Channel::new(-1);
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        channel.set_read_callback(move || f.set(true));

        let owner = Rc::new(RefCell::new(0u32));
        channel.tie(&owner);
        drop(owner);

        channel.handle_event(Interest::READABLE);
        assert!(!fired.get());
    }

    #[test]
    fn enable_disable_reading_toggles_interest_idempotently() {
        let channel = Channel::new(-1);
        channel.enable_reading();
        channel.enable_reading();
        assert!(channel.interest().is_readable());
        channel.disable_reading();
        channel.disable_reading();
        assert!(!channel.interest().is_readable());
    }
}
