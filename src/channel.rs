use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::{Arc, Weak};

use log::{debug, trace};

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Interest/readiness bit for reads. Priority data counts as readable.
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
/// Interest/readiness bit for writes.
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
const NONE_EVENT: u32 = 0;

/// Where a channel currently stands with the poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Registration {
    /// Never registered, or fully removed.
    New,
    /// Present in the kernel interest list.
    Added,
    /// Known to the poller's map but deleted from the kernel list.
    Deleted,
}

/// Readiness callbacks for one channel.
///
/// The poller hands ready channels to the loop; the loop dispatches to the
/// handler the channel is tied to. The tie is a `Weak`, upgraded once per
/// dispatch: if the owner (a connection, an acceptor, the loop's own wakeup
/// fd) is already gone, the event is dropped on the floor instead of
/// running a callback on a dead object.
pub(crate) trait ChannelHandler {
    fn handle_read(&self, receive_time: Timestamp);
    fn handle_write(&self) {}
    fn handle_close(&self) {}
    fn handle_error(&self) {}
}

/// Binds a file descriptor's interest set and readiness dispatch to an
/// event loop.
///
/// The channel does not own the fd; its owner does, and must remove the
/// channel from the loop before closing the descriptor.
pub(crate) struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    interest: u32,
    revents: u32,
    registration: Registration,
    handler: Option<Weak<dyn ChannelHandler>>,
    self_weak: RcWeak<RefCell<Channel>>,
}

impl Channel {
    pub(crate) fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Rc<RefCell<Channel>> {
        Rc::new_cyclic(|self_weak| {
            RefCell::new(Channel {
                event_loop: Arc::downgrade(event_loop),
                fd,
                interest: NONE_EVENT,
                revents: NONE_EVENT,
                registration: Registration::New,
                handler: None,
                self_weak: self_weak.clone(),
            })
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> u32 {
        self.interest
    }

    pub(crate) fn set_revents(&mut self, revents: u32) {
        self.revents = revents;
    }

    pub(crate) fn registration(&self) -> Registration {
        self.registration
    }

    pub(crate) fn set_registration(&mut self, registration: Registration) {
        self.registration = registration;
    }

    pub(crate) fn weak(&self) -> RcWeak<RefCell<Channel>> {
        self.self_weak.clone()
    }

    /// Ties this channel to the object whose lifetime gates dispatch.
    pub(crate) fn tie(&mut self, handler: Weak<dyn ChannelHandler>) {
        self.handler = Some(handler);
    }

    pub(crate) fn is_none_interest(&self) -> bool {
        self.interest == NONE_EVENT
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest & WRITE_EVENT != 0
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.interest & READ_EVENT != 0
    }

    pub(crate) fn enable_reading(&mut self) {
        self.interest |= READ_EVENT;
        self.update();
    }

    pub(crate) fn enable_writing(&mut self) {
        self.interest |= WRITE_EVENT;
        self.update();
    }

    pub(crate) fn disable_writing(&mut self) {
        self.interest &= !WRITE_EVENT;
        self.update();
    }

    pub(crate) fn disable_all(&mut self) {
        self.interest = NONE_EVENT;
        self.update();
    }

    fn update(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        } else {
            debug!("channel fd = {} updated after its loop was dropped", self.fd);
        }
    }

    /// Removes this channel from its loop's poller.
    pub(crate) fn remove(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    /// Dispatches one batch of readiness for `channel`.
    ///
    /// The channel borrow is released before any handler runs, so handlers
    /// are free to mutate interest (and the channel itself) re-entrantly.
    pub(crate) fn handle_event(channel: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
        let (fd, revents, handler) = {
            let ch = channel.borrow();
            (ch.fd, ch.revents, ch.handler.clone())
        };

        let guard = match handler.and_then(|weak| weak.upgrade()) {
            Some(guard) => guard,
            // The owner is gone; nothing may run on its behalf.
            None => return,
        };

        trace!("channel fd = {} revents = {:#x}", fd, revents);

        let hup = libc::EPOLLHUP as u32;
        let err = libc::EPOLLERR as u32;
        let readable = READ_EVENT | libc::EPOLLRDHUP as u32;

        if revents & hup != 0 && revents & libc::EPOLLIN as u32 == 0 {
            guard.handle_close();
        }
        if revents & err != 0 {
            guard.handle_error();
        }
        if revents & readable != 0 {
            guard.handle_read(receive_time);
        }
        if revents & WRITE_EVENT != 0 {
            guard.handle_write();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.registration == Registration::Added {
            debug!(
                "channel fd = {} dropped while still in the kernel interest list",
                self.fd
            );
        }
    }
}
