//! Per-fd event registration and dispatch.
//!
//! A `Channel` binds one file descriptor to its owning [`EventLoop`]: it
//! carries the epoll interest mask, the mask the poller saw ready, and the
//! per-event callbacks. It does not own the descriptor.
//!
//! All mask mutation and dispatch happens on the owning loop's thread.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event_loop::EventLoop;
use crate::poller;
use crate::timestamp::Timestamp;

pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;
pub(crate) const NO_EVENT: u32 = 0;

pub(crate) type ReadEventCallback = Box<dyn FnMut(Timestamp) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    owner: Weak<EventLoop>,
    fd: RawFd,
    /// Interest mask registered with the poller.
    events: AtomicU32,
    /// Ready mask written back by the poller before dispatch.
    revents: AtomicU32,
    /// Poller registration tag (new / added / deleted).
    index: AtomicI32,
    handlers: Mutex<Handlers>,
    /// Back-reference to the object whose lifetime must bound dispatch.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub(crate) fn new(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            owner,
            fd,
            events: AtomicU32::new(NO_EVENT),
            revents: AtomicU32::new(NO_EVENT),
            index: AtomicI32::new(poller::CHANNEL_NEW),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == NO_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    pub(crate) fn set_read_callback(&self, cb: ReadEventCallback) {
        self.handlers.lock().read = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        self.handlers.lock().write = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        self.handlers.lock().close = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        self.handlers.lock().error = Some(cb);
    }

    /// Bind dispatch to `owner`'s lifetime: `handle_event` upgrades the weak
    /// reference on entry and drops the whole event if the owner is gone.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events.store(NO_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Deregister from the owning loop's poller.
    pub fn remove(self: &Arc<Self>) {
        if let Some(lp) = self.owner.upgrade() {
            lp.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(lp) = self.owner.upgrade() {
            lp.update_channel(self);
        }
    }

    /// Dispatch the ready mask set by the poller.
    ///
    /// When a tie is installed, the weak reference is promoted to a strong
    /// one for the whole dispatch so a close callback that releases the last
    /// external reference cannot invalidate the callbacks that follow it.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tied = self.tie.lock().clone();
        match tied {
            Some(tie) => {
                if let Some(_guard) = tie.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
                // Owner already destroyed: drop the event.
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    /// Dispatch order: HUP-without-readable closes first, then error, then
    /// read, then write. A HUP that arrives alongside buffered bytes still
    /// runs the read callback, which observes EOF and routes to close
    /// itself.
    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents.load(Ordering::Relaxed);
        let mut handlers = self.handlers.lock();

        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }
        if revents & READ_EVENT != 0 {
            if let Some(cb) = handlers.read.as_mut() {
                cb(receive_time);
            }
        }
        if revents & WRITE_EVENT != 0 {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_channel() -> Arc<Channel> {
        // A dangling owner: mask mutation works, poller updates are no-ops.
        Channel::new(Weak::new(), -1)
    }

    fn recorder(
        channel: &Arc<Channel>,
    ) -> Arc<Mutex<Vec<&'static str>>> {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (r, w, c, e) = (order.clone(), order.clone(), order.clone(), order.clone());
        channel.set_read_callback(Box::new(move |_| r.lock().push("read")));
        channel.set_write_callback(Box::new(move || w.lock().push("write")));
        channel.set_close_callback(Box::new(move || c.lock().push("close")));
        channel.set_error_callback(Box::new(move || e.lock().push("error")));
        order
    }

    #[test]
    fn interest_mask_algebra() {
        let ch = detached_channel();
        assert!(ch.is_none_event());

        ch.enable_reading();
        assert!(ch.is_reading());
        assert!(!ch.is_writing());

        ch.enable_writing();
        assert!(ch.is_reading());
        assert!(ch.is_writing());

        ch.disable_writing();
        assert!(!ch.is_writing());

        ch.disable_all();
        assert!(ch.is_none_event());
    }

    #[test]
    fn hup_without_readable_dispatches_close() {
        let ch = detached_channel();
        let order = recorder(&ch);
        ch.set_revents(libc::EPOLLHUP as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["close"]);
    }

    #[test]
    fn hup_with_readable_prefers_read() {
        let ch = detached_channel();
        let order = recorder(&ch);
        ch.set_revents((libc::EPOLLHUP | libc::EPOLLIN) as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["read"]);
    }

    #[test]
    fn error_dispatches_before_read_and_write() {
        let ch = detached_channel();
        let order = recorder(&ch);
        ch.set_revents((libc::EPOLLERR | libc::EPOLLIN | libc::EPOLLOUT) as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["error", "read", "write"]);
    }

    #[test]
    fn dead_tie_drops_the_event() {
        let ch = detached_channel();
        let order = recorder(&ch);

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        ch.tie(&owner);
        drop(owner);

        ch.set_revents(libc::EPOLLIN as u32);
        ch.handle_event(Timestamp::now());
        assert!(order.lock().is_empty());
    }

    #[test]
    fn live_tie_allows_dispatch() {
        let ch = detached_channel();
        let order = recorder(&ch);

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        ch.tie(&owner);

        ch.set_revents(libc::EPOLLIN as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["read"]);
    }
}
