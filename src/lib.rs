//! spindle: a multi-reactor TCP event loop engine.
//!
//! One loop per thread: each `EventLoop` owns a readiness multiplexer and
//! a set of descriptor handles bound to callbacks, and drains a queue of
//! tasks posted from other threads. A base loop accepts connections
//! through an `Acceptor` and hands each accepted stream to a worker loop
//! picked round-robin from a `LoopThreadPool`.
//!
//! Building blocks:
//! - `Multiplexer`: epoll (default) or poll(2) readiness, selectable per
//!   loop or via the environment
//! - `Handle`: per-descriptor dispatch record with tie-guarded callbacks
//! - `EventLoop` / `LoopHandle`: the reactor and its cross-thread face
//! - `LoopThread` / `LoopThreadPool`: one loop per worker thread
//! - `Acceptor`: the listening socket on the base loop

pub mod acceptor;
pub mod event_loop;
pub mod handle;
pub mod loop_thread;
pub mod mux;
pub mod pool;
pub mod timestamp;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use handle::{Handle, HandleRef, RegState, NONE_EVENT, READ_EVENT, WRITE_EVENT};
pub use loop_thread::{LoopThread, ThreadInitCallback};
pub use mux::{new_default_multiplexer, EpollMultiplexer, Multiplexer, PollMultiplexer};
pub use pool::LoopThreadPool;
pub use timestamp::Timestamp;
