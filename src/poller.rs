use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak as RcWeak};

use log::{error, trace};

use crate::channel::{Channel, Registration};
use crate::timestamp::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Wraps the kernel readiness facility (epoll, level-triggered).
///
/// Blocks in [`poll`](Poller::poll) until registered descriptors become
/// ready, then recovers the `Channel` associated with each event. The
/// fd-to-channel map holds weak references; a channel whose owner has
/// already dropped simply produces no dispatch.
pub(crate) struct Poller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, RcWeak<RefCell<Channel>>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Poller {
            // SAFETY: `epoll_create1(2)` returned a valid, owned fd.
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    /// Blocks up to `timeout_ms`, filling `active` with ready channels and
    /// setting their `revents`. Returns the wall-clock instant of wake.
    pub(crate) fn poll(
        &mut self,
        timeout_ms: i32,
        active: &mut Vec<Rc<RefCell<Channel>>>,
    ) -> Timestamp {
        trace!("polling {} registered fds", self.channels.len());

        let capacity = self.events.capacity();
        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.ep.as_raw_fd(),
                self.events.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n > 0 {
            trace!("{} events ready", n);
            // SAFETY: `epoll_wait` initialised the first `n` entries.
            unsafe { self.events.set_len(n as usize) };
            self.fill_active(active);
            if n as usize == capacity {
                // A full batch: double the event list for the next poll.
                self.events.reserve(capacity);
            }
        } else if n == 0 {
            trace!("poll timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait failed: {}", saved);
        }
        now
    }

    fn fill_active(&self, active: &mut Vec<Rc<RefCell<Channel>>>) {
        for event in &self.events {
            let fd = event.u64 as RawFd;
            let channel = self.channels.get(&fd).and_then(RcWeak::upgrade);
            if let Some(channel) = channel {
                channel.borrow_mut().set_revents(event.events);
                active.push(channel);
            }
        }
    }

    /// Reconciles a channel's desired interest with the kernel.
    ///
    /// `New`/`Deleted` channels are (re-)added; an `Added` channel whose
    /// interest dropped to none is deleted from the kernel list but kept in
    /// the map, ready to be re-added cheaply.
    pub(crate) fn update_channel(&mut self, channel: &mut Channel) {
        let registration = channel.registration();
        trace!(
            "update channel fd = {} interest = {:#x} registration = {:?}",
            channel.fd(),
            channel.interest(),
            registration
        );

        match registration {
            Registration::New | Registration::Deleted => {
                if registration == Registration::New {
                    self.channels.insert(channel.fd(), channel.weak());
                }
                channel.set_registration(Registration::Added);
                self.update(libc::EPOLL_CTL_ADD, channel);
            }
            Registration::Added => {
                if channel.is_none_interest() {
                    self.update(libc::EPOLL_CTL_DEL, channel);
                    channel.set_registration(Registration::Deleted);
                } else {
                    self.update(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Erases a channel from the map, deleting its kernel registration if
    /// one is outstanding.
    pub(crate) fn remove_channel(&mut self, channel: &mut Channel) {
        trace!("remove channel fd = {}", channel.fd());
        self.channels.remove(&channel.fd());
        if channel.registration() == Registration::Added {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_registration(Registration::New);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(&channel.fd())
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.interest(),
            u64: channel.fd() as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            op,
            channel.fd(),
            &mut event
        )) {
            if op == libc::EPOLL_CTL_DEL {
                // Losing a DEL is harmless: the fd is on its way out.
                error!("epoll_ctl del fd = {}: {}", channel.fd(), err);
            } else {
                // ADD/MOD failing means our registration state has diverged
                // from the kernel's; no safe recovery exists.
                panic!("epoll_ctl add/mod fd = {}: {}", channel.fd(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::Registration;
    use crate::channel::Channel;
    use crate::event_loop::EventLoop;

    use std::os::fd::{FromRawFd, OwnedFd};

    #[test]
    fn registration_follows_interest_changes() {
        let event_loop = EventLoop::new().unwrap();
        let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)).unwrap();
        let _fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let channel = Channel::new(&event_loop, fd);

        assert_eq!(channel.borrow().registration(), Registration::New);

        channel.borrow_mut().enable_reading();
        assert_eq!(channel.borrow().registration(), Registration::Added);
        assert!(channel.borrow().is_reading());

        channel.borrow_mut().enable_writing();
        assert_eq!(channel.borrow().registration(), Registration::Added);
        assert!(channel.borrow().is_writing());

        // Interest dropping to none deletes the kernel registration but
        // keeps the map entry.
        channel.borrow_mut().disable_all();
        assert_eq!(channel.borrow().registration(), Registration::Deleted);
        assert!(event_loop.has_channel(&channel.borrow()));

        // Re-arming re-adds.
        channel.borrow_mut().enable_reading();
        assert_eq!(channel.borrow().registration(), Registration::Added);

        channel.borrow_mut().disable_writing();
        assert_eq!(channel.borrow().registration(), Registration::Added);

        channel.borrow_mut().remove();
        assert_eq!(channel.borrow().registration(), Registration::New);
        assert!(!event_loop.has_channel(&channel.borrow()));
    }

    #[test]
    fn remove_without_interest_change_issues_no_delete() {
        let event_loop = EventLoop::new().unwrap();
        let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)).unwrap();
        let _fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let channel = Channel::new(&event_loop, fd);

        channel.borrow_mut().enable_reading();
        channel.borrow_mut().disable_all();
        channel.borrow_mut().remove();
        assert_eq!(channel.borrow().registration(), Registration::New);
    }
}
