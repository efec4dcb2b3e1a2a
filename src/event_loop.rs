//! The reactor: one loop per thread.
//!
//! An `EventLoop` owns one multiplexer, the wakeup descriptor, and a queue
//! of tasks posted from other threads. `run()` repeats the classic cycle:
//! block in the multiplexer, dispatch ready handles, drain pending tasks.
//!
//! The loop object itself is only usable on its owning thread. The
//! `Send + Sync` half of it is exposed as a `LoopHandle`, which carries the
//! cross-thread entry points: `run_in_loop`, `queue_in_loop`, `quit` and
//! `wakeup`. Work handed to another loop runs there at the tail of its next
//! iteration; a task that needs the full `EventLoop` picks it up on the
//! loop thread through `EventLoop::current()`.

use crate::handle::{Handle, HandleRef};
use crate::mux::{new_default_multiplexer, Multiplexer};
use crate::timestamp::Timestamp;
use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace};

/// Upper bound for one blocking multiplexer call.
const POLL_TIME_MS: i32 = 10_000;

/// A nullary callable posted to a loop for execution on its thread.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<LoopInner>>> = const { RefCell::new(None) };
}

/// Create the wakeup descriptor: an event counter with nonblocking and
/// close-on-exec semantics.
///
/// # Panics
///
/// Panics when the kernel refuses; a loop cannot exist without its wakeup.
pub(crate) fn create_event_fd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        panic!("eventfd failed: {}", io::Error::last_os_error());
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// The cross-thread half of a loop: task queue, quit flag and wakeup
/// descriptor. Shared between the loop and every `LoopHandle`.
struct LoopShared {
    thread: ThreadId,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    wakeup_fd: OwnedFd,
    pending: Mutex<Vec<Task>>,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup write was short");
        }
    }

    fn drain_wakeup(&self) {
        let mut counter: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup read was short");
        }
    }

    fn queue_in_loop(&self, task: Task) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(task);
        }
        // While the drain is running the current batch has already been
        // swapped out, so a task posted from the loop thread itself still
        // needs a wakeup or the next poll would block with it unseen.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(Box::new(task));
        }
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }
}

/// The single-threaded half: multiplexer, wakeup handle, loop state.
struct LoopInner {
    shared: Arc<LoopShared>,
    mux: RefCell<Box<dyn Multiplexer>>,
    wakeup_handle: RefCell<Option<HandleRef>>,
    looping: Cell<bool>,
    poll_return_time: Cell<Timestamp>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        // Tear down the wakeup handle first; the owning Rc is already
        // mid-drop, so this goes straight at the multiplexer.
        if let Some(wakeup) = self.wakeup_handle.get_mut().take() {
            let mut h = wakeup.borrow_mut();
            h.clear_interest();
            self.mux.get_mut().update_handle(&mut h);
            self.mux.get_mut().remove_handle(&mut h);
        }
        let _ = CURRENT_LOOP.try_with(|current| current.borrow_mut().take());
        debug!("event loop destroyed");
    }
}

/// A single-threaded event reactor. Cheap to clone; every clone refers to
/// the same loop and is usable only on the loop's owning thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

#[derive(Clone)]
pub(crate) struct WeakEventLoop {
    inner: Weak<LoopInner>,
}

impl WeakEventLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

impl EventLoop {
    /// Create a loop on the current thread with the default multiplexer
    /// variant.
    ///
    /// # Panics
    ///
    /// Panics if a loop already exists on this thread, or if the
    /// multiplexer or wakeup descriptor cannot be created.
    pub fn new() -> EventLoop {
        Self::with_multiplexer(new_default_multiplexer())
    }

    /// Create a loop on the current thread around an explicit multiplexer
    /// variant.
    pub fn with_multiplexer(mux: Box<dyn Multiplexer>) -> EventLoop {
        CURRENT_LOOP.with(|current| {
            if current
                .borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some()
            {
                panic!(
                    "another event loop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            wakeup_fd: create_event_fd(),
            pending: Mutex::new(Vec::new()),
        });
        let inner = Rc::new(LoopInner {
            shared,
            mux: RefCell::new(mux),
            wakeup_handle: RefCell::new(None),
            looping: Cell::new(false),
            poll_return_time: Cell::new(Timestamp::default()),
        });
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Some(Rc::downgrade(&inner)));

        let event_loop = EventLoop { inner };
        let wakeup = Handle::new(&event_loop, event_loop.inner.shared.wakeup_fd.as_raw_fd());
        let shared = Arc::clone(&event_loop.inner.shared);
        wakeup
            .borrow_mut()
            .set_read_callback(move |_| shared.drain_wakeup());
        wakeup.borrow_mut().enable_reading();
        *event_loop.inner.wakeup_handle.borrow_mut() = Some(wakeup);

        debug!(thread = ?thread::current().id(), "event loop created");
        event_loop
    }

    /// The loop bound to the current thread, if one exists.
    pub fn current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|inner| EventLoop { inner })
        })
    }

    /// A cheap `Send + Sync` handle carrying this loop's cross-thread
    /// entry points.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Run the poll / dispatch / drain cycle until `quit` is observed.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "run() called off the owning thread"
        );
        let inner = &self.inner;
        inner.looping.set(true);
        inner.shared.quit.store(false, Ordering::Release);
        debug!("event loop started");

        let mut active: Vec<HandleRef> = Vec::new();
        while !inner.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let poll_time = inner.mux.borrow_mut().poll(POLL_TIME_MS, &mut active);
            inner.poll_return_time.set(poll_time);
            for handle in &active {
                Handle::handle_event(handle, poll_time);
            }
            self.run_pending_tasks();
        }

        debug!("event loop stopped");
        inner.looping.set(false);
    }

    /// Ask the loop to exit after its current iteration. Callable from any
    /// thread through a `LoopHandle`; this method is the owner-thread
    /// convenience.
    pub fn quit(&self) {
        self.inner.shared.quit();
    }

    /// Run `task` now if called on the owning thread, otherwise enqueue it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.shared.run_in_loop(task);
    }

    /// Enqueue `task` for the tail of the next iteration and wake the loop
    /// if needed.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.shared.queue_in_loop(Box::new(task));
    }

    /// Interrupt a blocked poll by bumping the wakeup counter.
    pub fn wakeup(&self) {
        self.inner.shared.wakeup();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.shared.is_in_loop_thread()
    }

    pub fn is_looping(&self) -> bool {
        self.inner.looping.get()
    }

    /// The wall-clock instant observed after the most recent poll return.
    pub fn poll_return_time(&self) -> Timestamp {
        self.inner.poll_return_time.get()
    }

    /// Re-submit a handle's interest to the multiplexer.
    pub fn update_handle(&self, handle: &HandleRef) {
        self.update_from(&mut handle.borrow_mut());
    }

    /// Erase a handle from the multiplexer.
    pub fn remove_handle(&self, handle: &HandleRef) {
        self.remove_from(&mut handle.borrow_mut());
    }

    /// Whether this exact handle is registered with the multiplexer.
    pub fn has_handle(&self, handle: &HandleRef) -> bool {
        assert!(
            self.is_in_loop_thread(),
            "has_handle called off the owning thread"
        );
        self.inner.mux.borrow().has_handle(&handle.borrow())
    }

    pub(crate) fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn update_from(&self, handle: &mut Handle) {
        assert!(
            self.is_in_loop_thread(),
            "handle updated off the owning thread"
        );
        self.inner.mux.borrow_mut().update_handle(handle);
    }

    pub(crate) fn remove_from(&self, handle: &mut Handle) {
        assert!(
            self.is_in_loop_thread(),
            "handle removed off the owning thread"
        );
        self.inner.mux.borrow_mut().remove_handle(handle);
    }

    // Swap the queue out under the lock, then execute outside it: an
    // enqueuing thread never blocks on a running task, and a task that
    // re-enqueues lands in the next batch instead of the current one.
    fn run_pending_tasks(&self) {
        let shared = &self.inner.shared;
        shared.calling_pending.store(true, Ordering::Release);
        let tasks = {
            let mut pending = shared.pending.lock().unwrap();
            mem::take(&mut *pending)
        };
        trace!(count = tasks.len(), "draining pending tasks");
        for task in tasks {
            task();
        }
        shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// The `Send + Sync` face of a loop, safe to hold and use from any thread.
/// Clones refer to the same loop. Outlives the loop harmlessly: tasks
/// queued after the loop is gone are dropped with the queue.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Run `task` inline when already on the loop thread, otherwise
    /// enqueue it and wake the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.run_in_loop(task);
    }

    /// Enqueue `task` for the loop's next drain.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.queue_in_loop(Box::new(task));
    }

    /// Ask the loop to exit; wakes it when called from another thread.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Bump the wakeup counter, interrupting a blocked poll.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Whether two handles refer to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::READ_EVENT;
    use crate::mux::PollMultiplexer;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "another event loop")]
    fn test_second_loop_on_thread_is_fatal() {
        let _first = EventLoop::new();
        let _second = EventLoop::new();
    }

    #[test]
    fn test_loop_slot_clears_on_drop() {
        {
            let lp = EventLoop::new();
            assert!(EventLoop::current().is_some());
            drop(lp);
        }
        assert!(EventLoop::current().is_none());
        let _again = EventLoop::new();
    }

    #[test]
    fn test_run_in_loop_is_synchronous_on_owner_thread() {
        let lp = EventLoop::new();
        let (tx, rx) = mpsc::channel();
        lp.run_in_loop(move || tx.send(42).unwrap());
        // Executed inline, before the loop even runs.
        assert_eq!(rx.try_recv(), Ok(42));
    }

    #[test]
    fn test_queue_ordering_and_single_iteration_drain() {
        let lp = EventLoop::new();
        let (tx, rx) = mpsc::channel();
        let tx1 = tx.clone();
        lp.queue_in_loop(move || tx1.send(1).unwrap());
        let tx2 = tx.clone();
        lp.queue_in_loop(move || tx2.send(2).unwrap());
        let handle = lp.handle();
        lp.queue_in_loop(move || handle.quit());
        // Tasks queued from the owner thread before run() do not wake the
        // loop on their own.
        lp.wakeup();
        lp.run();
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
    }

    #[test]
    fn test_cross_thread_task_runs_promptly() {
        let (loop_tx, loop_rx) = mpsc::channel();
        let child = std::thread::spawn(move || {
            let lp = EventLoop::new();
            loop_tx.send(lp.handle()).unwrap();
            lp.run();
        });
        let handle: LoopHandle = loop_rx.recv().unwrap();
        assert!(!handle.is_in_loop_thread());

        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)), Ok(42));

        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn test_quit_from_other_thread_ends_empty_loop() {
        let (loop_tx, loop_rx) = mpsc::channel();
        let child = std::thread::spawn(move || {
            let lp = EventLoop::new();
            loop_tx.send(lp.handle()).unwrap();
            lp.run();
        });
        let handle = loop_rx.recv().unwrap();
        // Wait for the loop to reach its cycle (run() clears the quit flag
        // on entry) before asking it to exit.
        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn test_reenqueue_during_drain_wakes_next_iteration() {
        let (loop_tx, loop_rx) = mpsc::channel();
        let child = std::thread::spawn(move || {
            let lp = EventLoop::new();
            loop_tx.send(lp.handle()).unwrap();
            lp.run();
        });
        let handle = loop_rx.recv().unwrap();

        let (tx, rx) = mpsc::channel();
        let inner_handle = handle.clone();
        handle.queue_in_loop(move || {
            // Posted mid-drain on the loop thread; must still wake.
            let tx = tx.clone();
            inner_handle.queue_in_loop(move || tx.send("second batch").unwrap());
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Ok("second batch")
        );

        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn test_wakeup_storm_stays_live() {
        let (loop_tx, loop_rx) = mpsc::channel();
        let child = std::thread::spawn(move || {
            let lp = EventLoop::new();
            loop_tx.send(lp.handle()).unwrap();
            lp.run();
        });
        let handle = loop_rx.recv().unwrap();
        for _ in 0..1000 {
            handle.wakeup();
        }
        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        handle.quit();
        child.join().unwrap();
    }

    #[test]
    fn test_event_buffer_growth_delivers_all_ready_handles() {
        let lp = EventLoop::new();
        let count = 20;
        let fds: Vec<_> = (0..count).map(|_| create_event_fd()).collect();
        let hit = Rc::new(RefCell::new(vec![false; count]));
        let mut handles = Vec::new();
        for (i, fd) in fds.iter().enumerate() {
            let h = Handle::new(&lp, fd.as_raw_fd());
            let hit = Rc::clone(&hit);
            h.borrow_mut().set_read_callback(move |_| hit.borrow_mut()[i] = true);
            h.borrow_mut().enable_reading();
            handles.push(h);
        }
        for fd in &fds {
            let one: u64 = 1;
            let n =
                unsafe { libc::write(fd.as_raw_fd(), &one as *const u64 as *const _, 8) };
            assert_eq!(n, 8);
        }

        // Two iterations: the first may saturate the initial event buffer,
        // the second picks up the remainder (level-triggered, unread).
        let handle = lp.handle();
        lp.queue_in_loop(move || {
            let quitter = handle.clone();
            handle.queue_in_loop(move || quitter.quit());
        });
        lp.wakeup();
        lp.run();

        assert!(hit.borrow().iter().all(|&b| b));
        for h in &handles {
            h.borrow_mut().disable_all();
            h.borrow_mut().remove();
        }
    }

    #[test]
    fn test_poll_variant_full_cycle() {
        let lp = EventLoop::with_multiplexer(Box::new(PollMultiplexer::new()));
        let efd = create_event_fd();
        let h = Handle::new(&lp, efd.as_raw_fd());
        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        h.borrow_mut().set_read_callback(move |ts| {
            assert!(ts.is_valid());
            s.set(true);
        });
        h.borrow_mut().enable_reading();

        let one: u64 = 1;
        let n = unsafe { libc::write(efd.as_raw_fd(), &one as *const u64 as *const _, 8) };
        assert_eq!(n, 8);

        let handle = lp.handle();
        lp.queue_in_loop(move || handle.quit());
        lp.wakeup();
        lp.run();

        assert!(seen.get());
        assert!(h.borrow().revents() & READ_EVENT != 0);
        h.borrow_mut().disable_all();
        h.borrow_mut().remove();
    }
}
