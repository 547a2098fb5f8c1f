//! Multi-reactor TCP server runtime.
//!
//! One event loop per thread, driven by level-triggered epoll. A base loop
//! owns the listening socket and hands each accepted connection to a worker
//! loop picked round-robin; from that point the connection is confined to
//! its worker thread. Application code plugs in through callbacks on
//! [`TcpServer`]: connection up/down, message arrived, write completed, and
//! high-water mark crossed.
//!
//! Cross-thread interaction goes through [`EventLoop::run_in_loop`], which
//! posts a task to the target loop's queue and kicks its wakeup eventfd.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod current_thread;
pub mod error;
pub mod event_loop;
pub mod loop_thread;
pub mod metrics;
pub mod poller;
pub mod server;
pub mod socket;
pub mod timestamp;

pub use buffer::Buffer;
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::EventLoop;
pub use loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::TcpServer;
pub use timestamp::Timestamp;
