//! Cross-thread task injection, grounded on `original_source/EventLoop.cc`'s
//! `pendingFunctors_` / `doPendingFunctors()`.
//!
//! Every task posted across a thread boundary in this crate is built from
//! plain `Send` data (ids into a loop's connection `Slab`, `Arc`-shared
//! callback bundles, `LoopHandle` clones) rather than by smuggling a
//! thread-confined `Rc`/`RefCell` across threads. A task that needs to act
//! on the loop it ends up running on looks itself up via
//! `crate::event_loop::current()`, which resolves to that thread's own
//! `EventLoopInner` — see `DESIGN.md`'s Resolved Open Questions for why
//! this sidesteps the `unsafe impl Send` wrapper an `Rc`-closing task would
//! otherwise need.
pub type Task = Box<dyn FnOnce() + Send + 'static>;
