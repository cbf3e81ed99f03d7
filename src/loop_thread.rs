use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::debug;

use crate::event_loop::EventLoop;

/// Callback invoked on each worker thread with its freshly built loop,
/// before the loop starts running.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// One worker thread whose entire body is one [`EventLoop`].
///
/// The loop is constructed *on* the worker (one loop per thread), then its
/// handle is published back to the starter. Dropping the `LoopThread`
/// quits the loop and joins the thread.
pub struct LoopThread {
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
    init: Option<ThreadInitCallback>,
    name: String,
}

type Published = Mutex<Option<io::Result<Arc<EventLoop>>>>;

impl LoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: String) -> LoopThread {
        LoopThread {
            event_loop: None,
            thread: None,
            init,
            name,
        }
    }

    /// Spawns the worker and blocks until its loop is constructed.
    ///
    /// Returns a handle to the worker's loop; it stays valid for the life
    /// of the `LoopThread`.
    pub fn start_loop(&mut self) -> io::Result<Arc<EventLoop>> {
        assert!(self.thread.is_none(), "loop thread started twice");

        let published = Arc::new((Published::new(None), Condvar::new()));
        let publisher = Arc::clone(&published);
        let init = self.init.take();

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let (lock, cvar) = &*publisher;
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        *lock.lock().unwrap() = Some(Err(err));
                        cvar.notify_one();
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    *lock.lock().unwrap() = Some(Ok(Arc::clone(&event_loop)));
                    cvar.notify_one();
                }
                event_loop.run();
                debug!("loop thread {:?} finished", std::thread::current().name());
            })?;

        let (lock, cvar) = &*published;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        let event_loop = slot.take().unwrap()?;

        self.thread = Some(handle);
        self.event_loop = Some(Arc::clone(&event_loop));
        Ok(event_loop)
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
