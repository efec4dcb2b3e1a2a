//! Kernel readiness multiplexers.
//!
//! A multiplexer owns one kernel readiness object and a table mapping raw
//! descriptors to the handles registered for them. Kernel event records
//! carry only the descriptor; ready descriptors are resolved back to
//! handles through the table, so a handle destroyed while an event is in
//! flight is skipped instead of dereferenced.
//!
//! Two variants:
//! - `EpollMultiplexer` (default), level-triggered epoll
//! - `PollMultiplexer`, poll(2) based, selected by environment flag

mod epoll;
mod poll;

pub use epoll::EpollMultiplexer;
pub use poll::PollMultiplexer;

use crate::handle::{Handle, HandleRef};
use crate::timestamp::Timestamp;

/// Environment flag selecting the poll(2) variant.
pub const USE_POLL_ENV: &str = "MUDUO_USE_POLL";

/// Interface between a loop and its kernel readiness object.
pub trait Multiplexer {
    /// Block up to `timeout_ms` milliseconds. For each ready descriptor,
    /// stamp the corresponding handle's revents and append it to `active`.
    /// Returns the wall-clock time observed right after the call unblocked.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<HandleRef>) -> Timestamp;

    /// Submit the handle's current interest to the kernel table, driving
    /// the ADD / MOD / DEL decision from the handle's registration state.
    fn update_handle(&mut self, handle: &mut Handle);

    /// Erase the handle from the table, deleting the kernel registration
    /// if one is live, and reset its state to `New`.
    fn remove_handle(&mut self, handle: &mut Handle);

    /// Whether this exact handle is currently known to the multiplexer.
    fn has_handle(&self, handle: &Handle) -> bool;
}

/// Construct the variant selected by the environment: poll(2) when
/// `MUDUO_USE_POLL` is set to any value, epoll otherwise.
pub fn new_default_multiplexer() -> Box<dyn Multiplexer> {
    if std::env::var_os(USE_POLL_ENV).is_some() {
        Box::new(PollMultiplexer::new())
    } else {
        Box::new(EpollMultiplexer::new())
    }
}
