//! One loop bound to one freshly spawned thread.

use crate::event_loop::{EventLoop, LoopHandle};
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Run once on the child thread right after its loop is constructed,
/// before the loop starts running. The pool hands the same callback to
/// every worker.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Owns a worker thread whose sole job is to run one event loop.
pub struct LoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    loop_handle: Option<LoopHandle>,
}

impl LoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        LoopThread {
            name: name.into(),
            init,
            thread: None,
            loop_handle: None,
        }
    }

    /// Spawn the thread and block until its loop exists; returns the
    /// loop's cross-thread handle.
    pub fn start_loop(&mut self) -> io::Result<LoopHandle> {
        let (tx, rx) = mpsc::channel();
        let init = self.init.clone();
        let name = self.name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let event_loop = EventLoop::new();
            if let Some(init) = init {
                init(&event_loop);
            }
            // The parent may have given up waiting; run regardless.
            let _ = tx.send(event_loop.handle());
            event_loop.run();
            debug!(thread = %name, "loop thread finished");
        })?;

        let loop_handle = rx.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::Other,
                "loop thread exited before its loop was constructed",
            )
        })?;
        self.thread = Some(thread);
        self.loop_handle = Some(loop_handle.clone());
        Ok(loop_handle)
    }

    /// The running loop's handle, once started.
    pub fn loop_handle(&self) -> Option<&LoopHandle> {
        self.loop_handle.as_ref()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(loop_handle) = self.loop_handle.take() {
            // Delivered as a task: a plain quit() sent before the child
            // reaches run() would be erased when run() clears the flag.
            let quitter = loop_handle.clone();
            loop_handle.queue_in_loop(move || quitter.quit());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(thread = %self.name, "loop thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_start_loop_returns_running_loop() {
        let mut lt = LoopThread::new("test-loop", None);
        let handle = lt.start_loop().unwrap();
        assert!(!handle.is_in_loop_thread());

        let (tx, rx) = mpsc::channel();
        handle.queue_in_loop(move || {
            tx.send(thread::current().name().map(String::from)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop"));
    }

    #[test]
    fn test_init_callback_runs_before_loop() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let init: ThreadInitCallback = Arc::new(move |lp: &EventLoop| {
            assert!(lp.is_in_loop_thread());
            assert!(!lp.is_looping());
            flag.store(true, Ordering::Release);
        });
        let mut lt = LoopThread::new("test-init", Some(init));
        lt.start_loop().unwrap();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_drop_quits_and_joins() {
        let handle = {
            let mut lt = LoopThread::new("test-drop", None);
            let handle = lt.start_loop().unwrap();
            let (tx, rx) = mpsc::channel();
            handle.queue_in_loop(move || tx.send(()).unwrap());
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
            handle
        };
        // The thread is gone; queued work is dropped, not executed.
        let (tx, rx) = mpsc::channel::<()>();
        handle.queue_in_loop(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
