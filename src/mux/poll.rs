//! poll(2) multiplexer, the environment-selected fallback variant.
//!
//! Interest masks are stored in epoll encoding throughout the engine; this
//! variant translates to and from `pollfd` event bits at the syscall
//! boundary. The pollfd array is kept dense: deleting a registration
//! swap-removes its slot and re-indexes the entry that moved into it.

use super::Multiplexer;
use crate::handle::{Handle, HandleRef, RegState};
use crate::timestamp::Timestamp;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use tracing::{debug, error, trace};

struct PollEntry {
    handle: Weak<RefCell<Handle>>,
    /// Index into the pollfd array; `None` while the registration is
    /// `Deleted` but still known.
    slot: Option<usize>,
}

#[derive(Default)]
pub struct PollMultiplexer {
    handles: HashMap<RawFd, PollEntry>,
    pollfds: Vec<libc::pollfd>,
}

fn to_poll_events(interest: u32) -> libc::c_short {
    let mut events = 0;
    if interest & libc::EPOLLIN as u32 != 0 {
        events |= libc::POLLIN;
    }
    if interest & libc::EPOLLPRI as u32 != 0 {
        events |= libc::POLLPRI;
    }
    if interest & libc::EPOLLOUT as u32 != 0 {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_revents(revents: libc::c_short) -> u32 {
    let mut mask = 0;
    if revents & libc::POLLIN != 0 {
        mask |= libc::EPOLLIN as u32;
    }
    if revents & libc::POLLPRI != 0 {
        mask |= libc::EPOLLPRI as u32;
    }
    if revents & libc::POLLOUT != 0 {
        mask |= libc::EPOLLOUT as u32;
    }
    // An invalid descriptor is surfaced to the handle as an error.
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        mask |= libc::EPOLLERR as u32;
    }
    if revents & libc::POLLHUP != 0 {
        mask |= libc::EPOLLHUP as u32;
    }
    mask
}

impl PollMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_slot(&mut self, fd: RawFd, interest: u32) -> usize {
        self.pollfds.push(libc::pollfd {
            fd,
            events: to_poll_events(interest),
            revents: 0,
        });
        self.pollfds.len() - 1
    }

    fn release_slot(&mut self, slot: usize) {
        self.pollfds.swap_remove(slot);
        if let Some(moved) = self.pollfds.get(slot) {
            let moved_fd = moved.fd;
            if let Some(entry) = self.handles.get_mut(&moved_fd) {
                entry.slot = Some(slot);
            }
        }
    }

    fn fill_active(&mut self, mut ready: usize, active: &mut Vec<HandleRef>) {
        for pfd in &self.pollfds {
            if ready == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            ready -= 1;
            match self
                .handles
                .get(&pfd.fd)
                .and_then(|entry| entry.handle.upgrade())
            {
                Some(handle) => {
                    handle.borrow_mut().set_revents(from_poll_revents(pfd.revents));
                    active.push(handle);
                }
                None => trace!(fd = pfd.fd, "ready descriptor has no live handle"),
            }
        }
    }
}

impl Multiplexer for PollMultiplexer {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<HandleRef>) -> Timestamp {
        trace!(fds = self.pollfds.len(), "entering poll");
        let ready = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = if ready < 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        let now = Timestamp::now();

        if ready > 0 {
            trace!(ready, "events ready");
            self.fill_active(ready as usize, active);
        } else if ready == 0 {
            trace!("poll timed out");
        } else if let Some(err) = saved {
            if err.kind() == io::ErrorKind::Interrupted {
                debug!("poll interrupted");
            } else {
                error!(error = %err, "poll failed");
            }
        }
        now
    }

    fn update_handle(&mut self, handle: &mut Handle) {
        let fd = handle.fd();
        let interest = handle.interest();
        trace!(fd, interest, state = ?handle.state(), "update");
        match handle.state() {
            RegState::New | RegState::Deleted => {
                let slot = self.push_slot(fd, interest);
                self.handles.insert(
                    fd,
                    PollEntry {
                        handle: handle.self_weak(),
                        slot: Some(slot),
                    },
                );
                handle.set_state(RegState::Added);
            }
            RegState::Added => {
                if handle.is_none_interest() {
                    if let Some(slot) = self.handles.get_mut(&fd).and_then(|e| e.slot.take()) {
                        self.release_slot(slot);
                    }
                    handle.set_state(RegState::Deleted);
                } else if let Some(slot) = self.handles.get(&fd).and_then(|e| e.slot) {
                    self.pollfds[slot].events = to_poll_events(interest);
                }
            }
        }
    }

    fn remove_handle(&mut self, handle: &mut Handle) {
        let fd = handle.fd();
        trace!(fd, "remove");
        if let Some(entry) = self.handles.remove(&fd) {
            if let Some(slot) = entry.slot {
                self.release_slot(slot);
            }
        }
        handle.set_state(RegState::New);
    }

    fn has_handle(&self, handle: &Handle) -> bool {
        self.handles
            .get(&handle.fd())
            .map_or(false, |entry| entry.handle.ptr_eq(&handle.self_weak()))
    }
}
