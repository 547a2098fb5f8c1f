use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by the reactor runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying syscall failed (epoll/eventfd creation and similar).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An event loop already exists on this thread.
    #[error("an event loop is already running on thread {tid}")]
    LoopExists { tid: libc::pid_t },
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}
