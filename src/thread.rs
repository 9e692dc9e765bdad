//! `LoopThread` spawns an OS thread that builds and runs its own subloop,
//! grounded on `original_source/EventLoopThread.cc`'s condition-variable
//! handoff (realized here with a zero-capacity `sync_channel`, standing in
//! for the C++ binary semaphore).

use std::sync::mpsc::sync_channel;
use std::thread::JoinHandle;

use crate::event_loop::{EventLoopInner, LoopHandle};

pub struct LoopThread {
    join_handle: Option<JoinHandle<()>>,
    handle: LoopHandle,
}

impl LoopThread {
    /// Spawn the thread and block until its subloop has been constructed
    /// and its `LoopHandle` published back, the same rendezvous
    /// `EventLoopThread::startLoop()` performs.
    pub fn start() -> LoopThread {
        let (tx, rx) = sync_channel::<LoopHandle>(0);

        let join_handle = std::thread::Builder::new()
            .name("loop-thread".into())
            .spawn(move || {
                let event_loop = EventLoopInner::new().expect("failed to create subloop");
                let handle = event_loop.borrow().handle();
                tx.send(handle).expect("creator of LoopThread went away before rendezvous");

                if let Err(e) = EventLoopInner::run(&event_loop) {
                    log::error!("subloop exited with error: {}", e);
                }
            })
            .expect("failed to spawn loop thread");

        let handle = rx.recv().expect("loop thread died before publishing its handle");

        LoopThread {
            join_handle: Some(join_handle),
            handle,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rendezvous_hands_back_a_working_handle() {
        let loop_thread = LoopThread::start();
        let handle = loop_thread.handle();
        assert!(!handle.is_in_loop_thread());
    }
}
