//! Round-robin pool of worker loops behind one base loop.
//!
//! The base loop (the accepting reactor) is supplied by the embedder and
//! not owned here. With zero workers the pool degenerates to handing the
//! base loop back on every pick, so single-threaded embedders need no
//! special casing.

use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::{LoopThread, ThreadInitCallback};
use std::io;
use tracing::info;

pub struct LoopThreadPool {
    base: LoopHandle,
    name: String,
    threads: Vec<LoopThread>,
    loops: Vec<LoopHandle>,
    num_threads: usize,
    next: usize,
    started: bool,
}

impl LoopThreadPool {
    pub fn new(base_loop: &EventLoop, name: impl Into<String>) -> Self {
        LoopThreadPool {
            base: base_loop.handle(),
            name: name.into(),
            threads: Vec::new(),
            loops: Vec::new(),
            num_threads: 0,
            next: 0,
            started: false,
        }
    }

    /// Record the desired worker count; nothing is spawned until `start`.
    pub fn set_thread_count(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the workers, running `init` on each new loop's thread before
    /// it starts looping. With zero workers `init` runs on the base loop.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started, "pool started twice");
        assert!(
            self.base.is_in_loop_thread(),
            "pool started off the base loop thread"
        );
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread = LoopThread::new(format!("{}-{i}", self.name), init.clone());
            self.loops.push(thread.start_loop()?);
            self.threads.push(thread);
        }
        info!(workers = self.num_threads, name = %self.name, "loop pool started");

        if self.num_threads == 0 {
            if let (Some(init), Some(base)) = (init, EventLoop::current()) {
                init(&base);
            }
        }
        Ok(())
    }

    /// The next worker loop, round-robin; the base loop when the pool is
    /// empty. Callable only from the base loop's thread.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        assert!(
            self.base.is_in_loop_thread(),
            "get_next_loop called off the base loop thread"
        );
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let picked = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        picked
    }

    /// Every worker loop, or the base loop when the pool is empty.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LoopThreadPool {
    fn drop(&mut self) {
        // Workers go down newest-first; each drop quits its loop and joins.
        while let Some(thread) = self.threads.pop() {
            drop(thread);
        }
    }
}
