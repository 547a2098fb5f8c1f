//! Level-triggered epoll wrapper.
//!
//! Owns the epoll descriptor, the ready-event scratch vector, and the
//! fd-to-channel map. Exclusively owned (and only ever touched) by its
//! `EventLoop`'s thread.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tracing::{error, trace};

use crate::channel::Channel;
use crate::timestamp::Timestamp;

/// Channel has never been registered with this poller.
pub(crate) const CHANNEL_NEW: i32 = -1;
/// Channel is registered with the kernel.
pub(crate) const CHANNEL_ADDED: i32 = 1;
/// Channel is in the map but unsubscribed from the kernel.
pub(crate) const CHANNEL_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct Poller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    /// Wait for readiness, write each ready mask back into its channel, and
    /// append the ready channels to `active`. Returns the time the wait
    /// returned. Signal interruption is a quiet empty return.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        trace!(fds = self.channels.len(), "polling");
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n > 0 {
            trace!(ready = n, "events happened");
            self.fill_active_channels(n as usize, active);
            if n as usize == self.events.len() {
                // Came back full: double for the next round.
                let doubled = self.events.len() * 2;
                self.events.resize(doubled, unsafe { std::mem::zeroed() });
            }
        } else if n < 0 && saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait failed: {saved}");
        }
        now
    }

    fn fill_active_channels(&self, ready: usize, active: &mut Vec<Arc<Channel>>) {
        for event in &self.events[..ready] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(event.events);
                active.push(channel.clone());
            }
        }
    }

    /// Register, modify, or unsubscribe according to the channel's tag:
    /// new/deleted channels are (re-)added, an added channel with an empty
    /// interest mask is unsubscribed, anything else is modified in place.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(fd = channel.fd(), events = channel.events(), index, "update channel");

        if index == CHANNEL_NEW || index == CHANNEL_DELETED {
            if index == CHANNEL_NEW {
                self.channels.insert(channel.fd(), channel.clone());
            }
            channel.set_index(CHANNEL_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else if channel.is_none_event() {
            self.update(libc::EPOLL_CTL_DEL, channel);
            channel.set_index(CHANNEL_DELETED);
        } else {
            self.update(libc::EPOLL_CTL_MOD, channel);
        }
    }

    /// Erase from the map and, if currently subscribed, from the kernel.
    /// The tag resets to new so the channel could be re-registered later.
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if self.channels.remove(&fd).is_some() {
            trace!(fd, "remove channel");
            if channel.index() == CHANNEL_ADDED {
                self.update(libc::EPOLL_CTL_DEL, channel);
            }
            channel.set_index(CHANNEL_NEW);
        }
    }

    /// True only for the exact channel object registered under its fd.
    pub(crate) fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|registered| Arc::ptr_eq(registered, channel))
    }

    fn update(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        event.events = channel.events();
        event.u64 = channel.fd() as u64;

        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut event) } < 0 {
            error!(
                fd = channel.fd(),
                op,
                "epoll_ctl failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}
