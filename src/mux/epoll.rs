//! Level-triggered epoll multiplexer, the default variant.

use super::Multiplexer;
use crate::handle::{Handle, HandleRef, RegState};
use crate::timestamp::Timestamp;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Weak;
use tracing::{debug, error, trace};

/// Initial event buffer capacity; doubled whenever a poll fills it.
const INIT_EVENT_CAPACITY: usize = 16;

pub struct EpollMultiplexer {
    epoll_fd: OwnedFd,
    handles: HashMap<RawFd, Weak<RefCell<Handle>>>,
    events: Vec<libc::epoll_event>,
}

impl EpollMultiplexer {
    /// Create the kernel epoll object with close-on-exec semantics.
    ///
    /// # Panics
    ///
    /// Panics when the kernel object cannot be created; a loop cannot
    /// exist without its multiplexer.
    pub fn new() -> Self {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            panic!("epoll_create1 failed: {}", io::Error::last_os_error());
        }
        EpollMultiplexer {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            handles: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_CAPACITY],
        }
    }

    fn fill_active(&mut self, ready: usize, active: &mut Vec<HandleRef>) {
        for event in &self.events[..ready] {
            let fd = event.u64 as RawFd;
            match self.handles.get(&fd).and_then(Weak::upgrade) {
                Some(handle) => {
                    handle.borrow_mut().set_revents(event.events);
                    active.push(handle);
                }
                // The handle went away between registration and delivery.
                None => trace!(fd, "ready descriptor has no live handle"),
            }
        }
    }

    fn ctl(&self, op: libc::c_int, handle: &Handle) {
        let fd = handle.fd();
        let mut event = libc::epoll_event {
            events: handle.interest(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, error = %err, "epoll_ctl del failed");
            } else {
                panic!("epoll_ctl add/mod failed for fd {fd}: {err}");
            }
        }
    }
}

impl Default for EpollMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer for EpollMultiplexer {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<HandleRef>) -> Timestamp {
        trace!(fds = self.handles.len(), "entering epoll_wait");
        let ready = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        // Capture errno before anything else on this thread can clobber it.
        let saved = if ready < 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        let now = Timestamp::now();

        if ready > 0 {
            trace!(ready, "events ready");
            let ready = ready as usize;
            self.fill_active(ready, active);
            if ready == self.events.len() {
                let grown = self.events.len() * 2;
                self.events
                    .resize(grown, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if ready == 0 {
            trace!("epoll_wait timed out");
        } else if let Some(err) = saved {
            if err.kind() == io::ErrorKind::Interrupted {
                debug!("epoll_wait interrupted");
            } else {
                error!(error = %err, "epoll_wait failed");
            }
        }
        now
    }

    fn update_handle(&mut self, handle: &mut Handle) {
        let fd = handle.fd();
        trace!(fd, interest = handle.interest(), state = ?handle.state(), "update");
        match handle.state() {
            RegState::New | RegState::Deleted => {
                self.handles.insert(fd, handle.self_weak());
                handle.set_state(RegState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, handle);
            }
            RegState::Added => {
                if handle.is_none_interest() {
                    self.ctl(libc::EPOLL_CTL_DEL, handle);
                    handle.set_state(RegState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, handle);
                }
            }
        }
    }

    fn remove_handle(&mut self, handle: &mut Handle) {
        let fd = handle.fd();
        trace!(fd, "remove");
        self.handles.remove(&fd);
        if handle.state() == RegState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, handle);
        }
        handle.set_state(RegState::New);
    }

    fn has_handle(&self, handle: &Handle) -> bool {
        self.handles
            .get(&handle.fd())
            .map_or(false, |weak| weak.ptr_eq(&handle.self_weak()))
    }
}
