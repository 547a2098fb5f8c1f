//! Listening-socket owner for the base loop.
//!
//! One accept per readiness notification; the accepted descriptor and peer
//! address are handed to the installed new-connection callback.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::socket::Socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(OwnedFd, SocketAddr) + Send>;

pub struct Acceptor {
    base_loop: Arc<EventLoop>,
    socket: Arc<Socket>,
    channel: Arc<Channel>,
    new_connection_cb: Arc<Mutex<Option<NewConnectionCallback>>>,
    listening: AtomicBool,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("listening", &self.listening)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Bind the listening socket and wire its read callback. Listening is
    /// deferred to [`Acceptor::listen`], which the server posts to the base
    /// loop.
    pub(crate) fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Acceptor, Error> {
        let socket = Socket::bind_listener(listen_addr, reuse_port)
            .map_err(|source| Error::Bind { addr: listen_addr, source })?;
        let local_addr = socket.local_addr().map_err(Error::Io)?;
        let socket = Arc::new(socket);

        let channel = Channel::new(Arc::downgrade(base_loop), socket.fd());
        let new_connection_cb: Arc<Mutex<Option<NewConnectionCallback>>> =
            Arc::new(Mutex::new(None));
        {
            let socket = socket.clone();
            let cb_slot = new_connection_cb.clone();
            channel.set_read_callback(Box::new(move |_| Acceptor::handle_read(&socket, &cb_slot)));
        }

        Ok(Acceptor {
            base_loop: base_loop.clone(),
            socket,
            channel,
            new_connection_cb,
            listening: AtomicBool::new(false),
            local_addr,
        })
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock() = Some(cb);
    }

    /// Start listening and arm the read callback. Must run on the base
    /// loop's thread.
    pub(crate) fn listen(&self) {
        assert!(
            self.base_loop.is_in_loop_thread(),
            "Acceptor::listen() must run on the base loop's thread"
        );
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen() {
            error!(addr = %self.local_addr, "listen failed: {e}");
            return;
        }
        self.channel.enable_reading();
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The bound address (with the real port when bound to port 0).
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn handle_read(socket: &Socket, cb_slot: &Mutex<Option<NewConnectionCallback>>) {
        match socket.accept() {
            Ok((fd, peer_addr)) => {
                CONNECTIONS_ACCEPTED.increment();
                if let Some(cb) = cb_slot.lock().as_mut() {
                    cb(fd, peer_addr);
                } else {
                    // Nobody to hand the connection to: dropping the fd
                    // closes it.
                    warn!(peer = %peer_addr, "no new-connection callback installed, closing");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                // Process fd table exhausted. The channel stays armed so
                // accepts resume once descriptors free up.
                // TODO: reserve-and-bounce an idle fd so the pending
                // connection can be accepted and closed instead of sitting
                // in the backlog.
                error!("accept failed: reached process fd limit");
            }
            Err(e) => {
                error!("accept failed: {e}");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failure_surfaces_address() {
        let event_loop = EventLoop::new().unwrap();
        let taken = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
        let err = Acceptor::new(&event_loop, taken.local_addr(), false).unwrap_err();
        match err {
            Error::Bind { addr, .. } => assert_eq!(addr, taken.local_addr()),
            other => panic!("expected bind error, got {other}"),
        }
    }

    #[test]
    fn local_addr_reports_bound_port() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert!(!acceptor.listening());
    }
}
