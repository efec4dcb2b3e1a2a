//! Per-descriptor dispatch records.
//!
//! A `Handle` binds one file descriptor to a set of callbacks and to the
//! loop that polls it. The handle never performs I/O itself and never
//! closes the descriptor; it only routes readiness events to the owner's
//! callbacks. Ownership of the descriptor stays with whoever created it
//! (acceptor, connection, wakeup).

use crate::event_loop::{EventLoop, WeakEventLoop};
use crate::timestamp::Timestamp;
use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use tracing::{trace, warn};

/// Empty interest mask.
pub const NONE_EVENT: u32 = 0;
/// Readable interest: normal plus urgent data.
pub const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
/// Writable interest.
pub const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

const IN_EVENT: u32 = libc::EPOLLIN as u32;
const HUP_EVENT: u32 = libc::EPOLLHUP as u32;
const ERROR_EVENT: u32 = libc::EPOLLERR as u32;

/// Registration state of a handle inside its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Never submitted to the kernel table (or fully removed again).
    New,
    /// Currently in the kernel table.
    Added,
    /// Deleted from the kernel table but still known to the multiplexer.
    Deleted,
}

/// Shared reference to a handle; loops are single-threaded, so `Rc` is the
/// sharing primitive throughout.
pub type HandleRef = Rc<RefCell<Handle>>;

/// Read callbacks receive the poll-return time of the batch that woke them.
pub type ReadCallback = Box<dyn FnMut(Timestamp)>;
/// Write, close and error callbacks are nullary.
pub type EventCallback = Box<dyn FnMut()>;

#[derive(Clone, Copy)]
enum Slot {
    Write,
    Close,
    Error,
}

/// One registered (or registrable) descriptor on one loop.
pub struct Handle {
    owner: WeakEventLoop,
    fd: RawFd,
    interest: u32,
    revents: u32,
    state: RegState,
    self_weak: Weak<RefCell<Handle>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    tie: Option<Weak<dyn Any>>,
    tied: bool,
}

impl Handle {
    /// Create a handle for `fd` on `event_loop`. The handle starts with an
    /// empty interest mask and is not registered until the first `enable_*`.
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> HandleRef {
        Rc::new_cyclic(|self_weak| {
            RefCell::new(Handle {
                owner: event_loop.downgrade(),
                fd,
                interest: NONE_EVENT,
                revents: 0,
                state: RegState::New,
                self_weak: self_weak.clone(),
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
                tie: None,
                tied: false,
            })
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The interest mask currently requested from the multiplexer.
    pub fn interest(&self) -> u32 {
        self.interest
    }

    /// The events observed in the most recent poll return.
    pub fn revents(&self) -> u32 {
        self.revents
    }

    pub fn state(&self) -> RegState {
        self.state
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.interest & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest & WRITE_EVENT != 0
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Timestamp) + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    /// Guard dispatch with a weak reference to the owning object.
    ///
    /// Once tied, events arriving after the owner has been dropped are
    /// discarded instead of invoking callbacks on a dead owner.
    pub fn tie<T: 'static>(&mut self, owner: &Rc<T>) {
        let weak: Weak<T> = Rc::downgrade(owner);
        let weak: Weak<dyn Any> = weak;
        self.tie = Some(weak);
        self.tied = true;
    }

    pub fn enable_reading(&mut self) {
        self.interest |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(&mut self) {
        self.interest &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(&mut self) {
        self.interest |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(&mut self) {
        self.interest &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(&mut self) {
        self.interest = NONE_EVENT;
        self.update();
    }

    /// Drop the handle from its loop's multiplexer entirely. The owner must
    /// `disable_all` first; after `remove` the multiplexer keeps no record.
    pub fn remove(&mut self) {
        match self.owner.upgrade() {
            Some(lp) => lp.remove_from(self),
            None => warn!(fd = self.fd, "owning loop is gone, remove dropped"),
        }
    }

    fn update(&mut self) {
        match self.owner.upgrade() {
            Some(lp) => lp.update_from(self),
            None => warn!(fd = self.fd, "owning loop is gone, update dropped"),
        }
    }

    pub(crate) fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    pub(crate) fn set_state(&mut self, state: RegState) {
        self.state = state;
    }

    pub(crate) fn clear_interest(&mut self) {
        self.interest = NONE_EVENT;
    }

    #[cfg(test)]
    pub(crate) fn set_interest(&mut self, interest: u32) {
        self.interest = interest;
    }

    pub(crate) fn self_weak(&self) -> Weak<RefCell<Handle>> {
        self.self_weak.clone()
    }

    /// Dispatch the events recorded in `revents`, in close, error, read,
    /// write order. Empty slots are no-ops; if the handle is tied and the
    /// tie target cannot be promoted, the whole event is dropped silently.
    pub(crate) fn handle_event(this: &HandleRef, receive_time: Timestamp) {
        let (fd, revents, registered, guard) = {
            let h = this.borrow();
            let guard = if h.tied {
                match h.tie.as_ref().and_then(Weak::upgrade) {
                    Some(g) => Some(g),
                    None => {
                        trace!(fd = h.fd, "tie target gone, event dropped");
                        return;
                    }
                }
            } else {
                None
            };
            (h.fd, h.revents, h.state != RegState::New, guard)
        };
        // Holds the promoted owner alive for the whole dispatch.
        let _guard = guard;
        trace!(fd, revents, "dispatching");

        if revents & HUP_EVENT != 0 && revents & IN_EVENT == 0 {
            Self::invoke(this, Slot::Close);
            if registered && Self::was_removed(this) {
                return;
            }
        }
        if revents & ERROR_EVENT != 0 {
            Self::invoke(this, Slot::Error);
            if registered && Self::was_removed(this) {
                return;
            }
        }
        if revents & READ_EVENT != 0 {
            Self::invoke_read(this, receive_time);
            if registered && Self::was_removed(this) {
                return;
            }
        }
        if revents & WRITE_EVENT != 0 {
            Self::invoke(this, Slot::Write);
        }
    }

    // A callback that removed its own handle resets the state tag to New;
    // the rest of the dispatch must then be skipped. Only meaningful for
    // handles that entered dispatch registered.
    fn was_removed(this: &HandleRef) -> bool {
        this.borrow().state == RegState::New
    }

    // The callback is moved out of the slot for the duration of the call so
    // it may re-borrow the handle, and restored afterwards unless the
    // callback installed a replacement.
    fn invoke(this: &HandleRef, slot: Slot) {
        let cb = {
            let mut h = this.borrow_mut();
            match slot {
                Slot::Write => h.write_cb.take(),
                Slot::Close => h.close_cb.take(),
                Slot::Error => h.error_cb.take(),
            }
        };
        if let Some(mut cb) = cb {
            cb();
            let mut h = this.borrow_mut();
            let stored = match slot {
                Slot::Write => &mut h.write_cb,
                Slot::Close => &mut h.close_cb,
                Slot::Error => &mut h.error_cb,
            };
            if stored.is_none() {
                *stored = Some(cb);
            }
        }
    }

    fn invoke_read(this: &HandleRef, receive_time: Timestamp) {
        let cb = this.borrow_mut().read_cb.take();
        if let Some(mut cb) = cb {
            cb(receive_time);
            let mut h = this.borrow_mut();
            if h.read_cb.is_none() {
                h.read_cb = Some(cb);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{create_event_fd, EventLoop};
    use std::cell::Cell;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_interest_mask_mutators() {
        let lp = EventLoop::new();
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());

        h.borrow_mut().enable_reading();
        assert!(h.borrow().is_reading());
        assert!(!h.borrow().is_writing());
        assert_eq!(h.borrow().state(), RegState::Added);

        h.borrow_mut().enable_writing();
        assert!(h.borrow().is_writing());

        h.borrow_mut().disable_writing();
        assert!(!h.borrow().is_writing());
        assert!(h.borrow().is_reading());

        h.borrow_mut().disable_all();
        assert!(h.borrow().is_none_interest());
        h.borrow_mut().remove();
    }

    #[test]
    fn test_registration_round_trip() {
        let lp = EventLoop::new();
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());

        h.borrow_mut().enable_reading();
        assert!(lp.has_handle(&h));

        h.borrow_mut().disable_all();
        assert_eq!(h.borrow().state(), RegState::Deleted);

        h.borrow_mut().remove();
        assert!(!lp.has_handle(&h));
        assert_eq!(h.borrow().state(), RegState::New);
    }

    #[test]
    fn test_dispatch_order_and_slots() {
        let lp = EventLoop::new();
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());

        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let mut hb = h.borrow_mut();
            let o = Rc::clone(&order);
            hb.set_error_callback(move || o.borrow_mut().push("error"));
            let o = Rc::clone(&order);
            hb.set_read_callback(move |_| o.borrow_mut().push("read"));
            let o = Rc::clone(&order);
            hb.set_write_callback(move || o.borrow_mut().push("write"));
        }

        h.borrow_mut()
            .set_revents(ERROR_EVENT | READ_EVENT | WRITE_EVENT);
        Handle::handle_event(&h, Timestamp::now());
        assert_eq!(*order.borrow(), vec!["error", "read", "write"]);
    }

    #[test]
    fn test_hangup_without_readable_invokes_close() {
        let lp = EventLoop::new();
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());

        let closed = Rc::new(Cell::new(false));
        let c = Rc::clone(&closed);
        h.borrow_mut().set_close_callback(move || c.set(true));

        h.borrow_mut().set_revents(HUP_EVENT);
        Handle::handle_event(&h, Timestamp::now());
        assert!(closed.get());

        // Hangup together with readable data must not short-circuit to close.
        closed.set(false);
        let reads = Rc::new(Cell::new(0));
        let r = Rc::clone(&reads);
        h.borrow_mut().set_read_callback(move |_| r.set(r.get() + 1));
        h.borrow_mut().set_revents(HUP_EVENT | IN_EVENT);
        Handle::handle_event(&h, Timestamp::now());
        assert!(!closed.get());
        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn test_tie_guard_drops_event_after_owner_release() {
        let lp = EventLoop::new();
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());

        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        h.borrow_mut().set_read_callback(move |_| counter.set(counter.get() + 1));

        let owner = Rc::new("connection");
        h.borrow_mut().tie(&owner);

        h.borrow_mut().set_revents(READ_EVENT);
        Handle::handle_event(&h, Timestamp::now());
        assert_eq!(hits.get(), 1);

        drop(owner);
        Handle::handle_event(&h, Timestamp::now());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_self_removal_stops_dispatch() {
        let lp = EventLoop::new();
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());
        h.borrow_mut().enable_reading();

        let wrote = Rc::new(Cell::new(false));
        {
            let mut hb = h.borrow_mut();
            let weak = Rc::downgrade(&h);
            hb.set_read_callback(move |_| {
                if let Some(me) = weak.upgrade() {
                    me.borrow_mut().disable_all();
                    me.borrow_mut().remove();
                }
            });
            let w = Rc::clone(&wrote);
            hb.set_write_callback(move || w.set(true));
        }

        h.borrow_mut().set_revents(READ_EVENT | WRITE_EVENT);
        Handle::handle_event(&h, Timestamp::now());
        assert!(!wrote.get());
        assert!(!lp.has_handle(&h));
    }
}
