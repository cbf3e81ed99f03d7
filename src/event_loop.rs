use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use log::{debug, error, trace};

use crate::bound::LoopBound;
use crate::channel::{Channel, ChannelHandler};
use crate::poller::Poller;
use crate::timestamp::Timestamp;

const POLL_TIMEOUT_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// A reactor: one thread, one poller, one task queue.
///
/// The loop multiplexes readiness for every channel registered with it and
/// dispatches on the thread that created it. All state a loop drives is
/// owned by that thread; the single sanctioned crossing point is
/// [`queue_in_loop`](EventLoop::queue_in_loop) (and its convenience
/// wrapper [`run_in_loop`](EventLoop::run_in_loop)), backed by an eventfd
/// that forces an early poll return.
///
/// At most one `EventLoop` may exist per thread; constructing a second one
/// on the same thread panics.
///
/// # Examples
///
/// ```no_run
/// use evio::EventLoop;
///
/// let event_loop = EventLoop::new().unwrap();
/// let handle = event_loop.clone();
/// std::thread::spawn(move || {
///     handle.run_in_loop(|| println!("ran on the loop thread"));
///     handle.quit();
/// });
/// event_loop.run();
/// ```
pub struct EventLoop {
    thread: ThreadId,
    poller: LoopBound<Poller>,
    wakeup_fd: OwnedFd,
    wakeup_channel: LoopBound<Option<Rc<RefCell<Channel>>>>,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

impl EventLoop {
    /// Creates the event loop for the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already has an `EventLoop`.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let thread = thread::current().id();
        let wakeup_fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
        // SAFETY: `eventfd(2)` returned a valid, owned fd.
        let wakeup_fd = unsafe { OwnedFd::from_raw_fd(wakeup_fd) };

        let event_loop = Arc::new(EventLoop {
            thread,
            poller: LoopBound::new(thread, Poller::new()?),
            wakeup_fd,
            wakeup_channel: LoopBound::new(thread, None),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });

        let channel = Channel::new(&event_loop, event_loop.wakeup_fd.as_raw_fd());
        let event_loop_dyn: Arc<dyn ChannelHandler> = event_loop.clone();
        let handler: Weak<dyn ChannelHandler> = Arc::downgrade(&event_loop_dyn);
        channel.borrow_mut().tie(handler);
        channel.borrow_mut().enable_reading();
        *event_loop.wakeup_channel.borrow_mut() = Some(channel);

        // Claimed only once construction can no longer fail.
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(true));
        debug!("EventLoop created on {:?}", thread);
        Ok(event_loop)
    }

    /// Runs the reactor until [`quit`](EventLoop::quit).
    ///
    /// Each cycle polls for readiness, dispatches every ready channel, then
    /// drains the pending-task queue. Must be called on the loop's thread.
    /// A quit requested before `run` is entered is honoured immediately;
    /// a quit loop stays quit.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        debug!("EventLoop on {:?} starts looping", self.thread);

        let mut active: Vec<Rc<RefCell<Channel>>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active);
            for channel in &active {
                Channel::handle_event(channel, receive_time);
            }
            self.run_pending_tasks();
        }

        debug!("EventLoop on {:?} stops looping", self.thread);
    }

    /// Asks the loop to exit after the current cycle.
    ///
    /// Safe from any thread; a cross-thread quit wakes the poller so it is
    /// observed promptly.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by thread {:?} was used from thread {:?}",
                self.thread,
                thread::current().id()
            );
        }
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Runs `task` on the loop thread: immediately when already there,
    /// otherwise via the queue.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue.
    ///
    /// Wakes the poller when called from another thread, and also when the
    /// loop is currently draining the queue: a drain may append new tasks,
    /// and the wakeup guarantees the next poll returns immediately so they
    /// run without waiting out the poll timeout.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // Swap under the lock, run outside it: tasks are free to call
        // queue_in_loop without deadlocking.
        let tasks = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        trace!("running {} pending tasks", tasks.len());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
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
            error!("wakeup write returned {} instead of 8", n);
        }
    }

    pub(crate) fn update_channel(&self, channel: &mut Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &mut Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }
}

impl ChannelHandler for EventLoop {
    /// Clears the eventfd counter after a wakeup.
    fn handle_read(&self, _receive_time: Timestamp) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup read returned {} instead of 8", n);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The final handle is normally dropped on the loop thread; only
        // there can the wakeup channel be unregistered cleanly. The fds
        // close either way.
        if self.is_in_loop_thread() {
            if let Some(channel) = self.wakeup_channel.borrow_mut().take() {
                // Straight to the poller: the loop's weak handles are
                // already unupgradable at this point.
                self.poller
                    .borrow_mut()
                    .remove_channel(&mut channel.borrow_mut());
            }
            LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}
