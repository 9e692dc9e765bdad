//! The epoll-backed poller a subloop drives its `wait()` call through.
//!
//! Grounded on `original_source/EPollPoller.cc`: a growable scratch event
//! list that starts at 16 and doubles when `poll()` fills it completely.
//! The original tracks a per-fd new/added/deleted index state to support
//! lazily deferring `epoll_ctl(DEL)`; this poller always deletes on
//! `unregister`, so presence in `slots` is all the state a registry entry
//! needs. Unlike the original, `epoll_event.u64` carries a `usize` registry
//! index rather than a raw `Channel*` — see `DESIGN.md`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::interest::Interest;
use crate::sys::epoll::{self, Epoll};

const INIT_EVENT_LIST_SIZE: usize = 16;

struct ChannelSlot {
    fd: RawFd,
    interest: Interest,
}

/// One fd's worth of activity reported back by a `wait()` round.
pub struct ReadyEvent {
    pub index: usize,
    pub revents: Interest,
}

pub struct Poller {
    epoll: Epoll,
    // fd -> registry index, so `update`/`remove` can find a channel's slot
    // without a linear scan.
    index_of: IndexMap<RawFd, usize>,
    slots: Vec<Option<ChannelSlot>>,
    event_buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            index_of: IndexMap::new(),
            slots: Vec::new(),
            event_buf: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
        })
    }

    /// Register a new fd, returning the registry index future `wait()`
    /// rounds will report it back under.
    pub fn register(&mut self, fd: RawFd, interest: Interest, edge_triggered: bool) -> io::Result<usize> {
        let index = self.slots.len();
        self.epoll.add(fd, index as u64, interest, edge_triggered)?;
        self.slots.push(Some(ChannelSlot { fd, interest }));
        self.index_of.insert(fd, index);
        Ok(index)
    }

    pub fn reregister(&mut self, index: usize, interest: Interest, edge_triggered: bool) -> io::Result<()> {
        let slot = self.slots[index].as_mut().expect("reregister on removed channel");
        self.epoll.modify(slot.fd, index as u64, interest, edge_triggered)?;
        slot.interest = interest;
        Ok(())
    }

    pub fn unregister(&mut self, index: usize) -> io::Result<()> {
        let slot = self.slots[index].take().expect("unregister on removed channel");
        self.epoll.delete(slot.fd)?;
        self.index_of.swap_remove(&slot.fd);
        Ok(())
    }

    pub fn is_registered(&self, index: usize) -> bool {
        self.slots.get(index).map(|s| s.is_some()).unwrap_or(false)
    }

    /// Block for up to `timeout` waiting for activity, growing the scratch
    /// buffer (doubling) whenever a round fills it completely, and return
    /// the fired events via `visit`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<(Instant, Vec<ReadyEvent>)> {
        if self.event_buf.capacity() == 0 {
            self.event_buf.reserve(INIT_EVENT_LIST_SIZE);
        }
        unsafe { self.event_buf.set_len(self.event_buf.capacity()) };

        let n = self.epoll.wait(&mut self.event_buf, timeout)?;
        let now = Instant::now();

        let mut ready = Vec::with_capacity(n);
        for i in 0..n {
            let (revents, token) = epoll::decode(&self.event_buf[i]);
            ready.push(ReadyEvent {
                index: token as usize,
                revents,
            });
        }

        if n == self.event_buf.capacity() {
            let new_cap = self.event_buf.capacity() * 2;
            self.event_buf.reserve(new_cap - self.event_buf.capacity());
        }

        Ok((now, ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn register_and_wait_readable() {
        let mut poller = Poller::new().unwrap();
        let efd = crate::sys::EventFd::new().unwrap();
        let idx = poller.register(efd.as_raw_fd(), Interest::READABLE, false).unwrap();

        efd.write(1).unwrap();

        let (_, events) = poller.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index, idx);
        assert!(events[0].revents.is_readable());
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let mut poller = Poller::new().unwrap();
        let (_, events) = poller.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn scratch_buffer_doubles_when_full() {
        let poller = Poller::new().unwrap();
        assert_eq!(poller.event_buf.capacity(), INIT_EVENT_LIST_SIZE);
    }
}
