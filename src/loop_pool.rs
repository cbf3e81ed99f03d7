use std::io;
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::loop_thread::{LoopThread, ThreadInitCallback};

/// A fixed set of sub-loops plus a round-robin selector.
///
/// With zero threads all work runs on the base loop. Selection is a plain
/// cursor: connections are long-lived, so fairness of assignment matters
/// more than load-awareness.
pub struct LoopPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<LoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl LoopPool {
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> LoopPool {
        LoopPool {
            base_loop,
            name: name.to_owned(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "thread count fixed after start");
        self.num_threads = num_threads;
    }

    /// Spawns the worker loops; with zero workers the init callback runs
    /// once on the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started, "pool started twice");
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            let mut thread = LoopThread::new(init.clone(), name);
            self.loops.push(thread.start_loop()?);
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Returns the next sub-loop round-robin, or the base loop when the
    /// pool has no workers.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let event_loop = Arc::clone(&self.loops[self.next]);
        self.next = (self.next + 1) % self.loops.len();
        event_loop
    }
}
