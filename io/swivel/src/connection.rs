//! Per-connection state machine and I/O handlers.
//!
//! A `TcpConnection` is shared-owned: the server's table holds one strong
//! reference and an in-flight dispatch holds another (through the channel
//! tie), so teardown is safe even when a callback releases the last external
//! reference mid-dispatch.
//!
//! All state mutation happens on the owning worker loop. `send` and
//! `shutdown` may be called from any thread; they re-route through
//! `run_in_loop` when needed, copying the payload so the caller's buffer
//! lifetime does not matter.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::socket::Socket;
use crate::timestamp::Timestamp;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired once on the transition to `Connected` and once on the transition
/// to `Disconnected`.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired each time new bytes land in the input buffer.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
/// Fired when the output buffer drains to empty after a prior partial write.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired exactly on the transition across the high-water mark, with the new
/// pending byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Default output-buffer backpressure threshold: 64 MiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    worker_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    pub(crate) fn new(
        worker_loop: Arc<EventLoop>,
        name: String,
        sock_fd: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let socket = Socket::from_fd(sock_fd);
        if let Err(e) = socket.set_keep_alive(true) {
            warn!(name = %name, "SO_KEEPALIVE failed: {e}");
        }
        let channel = Channel::new(Arc::downgrade(&worker_loop), socket.fd());

        let conn = Arc::new(TcpConnection {
            worker_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::default()),
            output: Mutex::new(Buffer::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
        });

        // The channel callbacks hold only weak references; the tie installed
        // in connect_established keeps the connection alive for the span of
        // each dispatch.
        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(Box::new({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            }
        }));
        conn.channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        conn.channel.set_close_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        debug!(name = %conn.name, fd = conn.channel.fd(), "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.worker_loop
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Change the backpressure threshold for subsequent sends.
    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_nodelay(on) {
            warn!(name = %self.name, "TCP_NODELAY failed: {e}");
        }
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub(crate) fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub(crate) fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        self.callbacks.lock().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    /// Send a copy of `data`. Thread-safe: off-loop callers have the payload
    /// copied into the posted task.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.worker_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.worker_loop
                .run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// On-loop send: try a direct write when nothing is buffered, then
    /// buffer the remainder and arm the write event. Crossing the
    /// high-water mark queues the backpressure callback exactly once.
    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let mut output = self.output.lock();
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                remaining = data.len() - nwrote;
                BYTES_SENT.add(nwrote as u64);
                if remaining == 0 {
                    self.queue_write_complete();
                }
            } else {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, "write failed: {e}");
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= mark && old_len < mark {
                let cb = self.callbacks.lock().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.clone();
                    let pending = old_len + remaining;
                    self.worker_loop.queue_in_loop(move || cb(&conn, pending));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once the output buffer is empty. The
    /// pending-drain branch of `handle_write` performs the deferred
    /// shutdown when bytes are still queued.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.worker_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, "shutdown failed: {e}");
            }
        }
    }

    /// Called once on the worker loop after construction: install the tie,
    /// start reading, fire the user connection callback.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.set_state(ConnState::Connected);
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();
        CONNECTIONS_ACTIVE.increment();

        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Symmetric teardown, called once on the worker loop when the server
    /// lets go of the connection.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            CONNECTIONS_ACTIVE.decrement();

            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        let mut input = self.input.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                let cb = self.callbacks.lock().message.clone();
                if let Some(cb) = cb {
                    cb(self, &mut *input, receive_time);
                } else {
                    input.retrieve_all();
                }
            }
            Err(e) => {
                drop(input);
                error!(name = %self.name, "read failed: {e}");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            warn!(
                name = %self.name,
                fd = self.channel.fd(),
                "connection is down, no more writing"
            );
            return;
        }

        let mut output = self.output.lock();
        let n = unsafe {
            libc::write(
                self.channel.fd(),
                output.peek().as_ptr() as *const libc::c_void,
                output.readable_bytes(),
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                error!(name = %self.name, "write failed: {e}");
            }
            return;
        }

        output.retrieve(n as usize);
        BYTES_SENT.add(n as u64);
        if output.readable_bytes() == 0 {
            self.channel.disable_writing();
            drop(output);
            self.queue_write_complete();
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().write_complete.clone();
        if let Some(cb) = cb {
            let conn = self.clone();
            self.worker_loop.queue_in_loop(move || cb(&conn));
        }
    }

    fn handle_close(self: &Arc<Self>) {
        debug!(
            name = %self.name,
            fd = self.channel.fd(),
            state = ?self.state(),
            "closing"
        );
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();
        CONNECTIONS_ACTIVE.decrement();

        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(self);
        }
        // The close hook is the server's remove path.
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = self.socket.take_error();
        error!(name = %self.name, "SO_ERROR = {err}");
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, fd = self.channel.fd(), "connection destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd};

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn fresh_connection_is_connecting_with_default_mark() {
        let event_loop = EventLoop::new().unwrap();
        let (fd, _peer) = socket_pair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = TcpConnection::new(event_loop, "test-conn#2".into(), fd, addr, addr);

        assert_eq!(conn.state(), ConnState::Connecting);
        assert!(!conn.connected());
        assert_eq!(conn.name(), "test-conn#2");
        assert_eq!(
            conn.high_water_mark.load(Ordering::Relaxed),
            DEFAULT_HIGH_WATER_MARK
        );
    }

    #[test]
    fn send_before_connected_is_dropped() {
        let event_loop = EventLoop::new().unwrap();
        let (fd, peer) = socket_pair();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let conn = TcpConnection::new(event_loop, "test-conn#3".into(), fd, addr, addr);

        // Still Connecting: nothing may reach the socket.
        conn.send(b"early");
        let mut probe = [0u8; 8];
        let n = unsafe {
            libc::recv(
                peer.as_raw_fd(),
                probe.as_mut_ptr() as *mut libc::c_void,
                probe.len(),
                libc::MSG_DONTWAIT,
            )
        };
        assert_eq!(n, -1);
        assert_eq!(
            std::io::Error::last_os_error().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }
}
