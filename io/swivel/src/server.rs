//! The public entry point: acceptor + worker pool + connection table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::socket;
use crate::timestamp::Timestamp;

#[derive(Default)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    thread_init: Option<ThreadInitCallback>,
}

/// Non-blocking TCP server over a base reactor and a pool of worker
/// reactors.
///
/// The base loop (the caller's) owns the acceptor; each accepted connection
/// is assigned round-robin to a worker and stays confined to it. Set the
/// callbacks and thread count before [`TcpServer::start`], then run the
/// base loop.
pub struct TcpServer {
    base_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    callbacks: Mutex<UserCallbacks>,
    started: Once,
    next_conn_id: AtomicU64,
    /// Keyed by connection name; touched only on the base loop's thread.
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    /// Bind `listen_addr` on the base loop. Listening starts at
    /// [`TcpServer::start`].
    pub fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> Result<Arc<TcpServer>, Error> {
        let acceptor = Arc::new(Acceptor::new(base_loop, listen_addr, reuse_port)?);
        let ip_port = acceptor.local_addr().to_string();
        let pool = Arc::new(EventLoopThreadPool::new(base_loop.clone(), name.to_string()));

        let server = Arc::new(TcpServer {
            base_loop: base_loop.clone(),
            ip_port,
            name: name.to_string(),
            acceptor,
            pool,
            callbacks: Mutex::new(UserCallbacks::default()),
            started: Once::new(),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer_addr);
                }
            }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound listen address (with the real port when constructed on
    /// port 0).
    pub fn listen_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Worker reactor count; zero keeps every connection on the base loop.
    /// Must be called before [`TcpServer::start`].
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    {
        self.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
    {
        self.callbacks.lock().high_water_mark = Some(Arc::new(cb));
    }

    pub fn set_thread_init_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    {
        self.callbacks.lock().thread_init = Some(Arc::new(cb));
    }

    /// Start the worker pool and post `listen` to the base loop. Idempotent
    /// under concurrent callers.
    pub fn start(&self) {
        self.started.call_once(|| {
            let thread_init = self.callbacks.lock().thread_init.clone();
            self.pool.start(thread_init);

            let acceptor = self.acceptor.clone();
            self.base_loop.run_in_loop(move || acceptor.listen());
        });
    }

    /// Runs on the base loop for every accepted connection: pick a worker,
    /// name the connection, wire callbacks, and hand it over.
    fn new_connection(self: &Arc<Self>, sock_fd: OwnedFd, peer_addr: SocketAddr) {
        let worker_loop = self.pool.get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            server = %self.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = socket::local_addr_of(sock_fd.as_raw_fd()).unwrap_or_else(|e| {
            error!(conn = %conn_name, "getsockname failed: {e}");
            SocketAddr::from(([0, 0, 0, 0], 0))
        });

        let conn = TcpConnection::new(
            worker_loop.clone(),
            conn_name.clone(),
            sock_fd,
            local_addr,
            peer_addr,
        );
        self.connections.lock().insert(conn_name, conn.clone());

        {
            let callbacks = self.callbacks.lock();
            if let Some(cb) = &callbacks.connection {
                conn.set_connection_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.high_water_mark {
                conn.set_high_water_mark_callback(cb.clone());
            }
        }

        let weak: Weak<TcpServer> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let established = conn.clone();
        worker_loop.run_in_loop(move || established.connect_established());
    }

    /// Routed through the base loop; callable from any worker.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let server = self.clone();
        let conn = conn.clone();
        self.base_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        info!(server = %self.name, conn = conn.name(), "remove connection");
        self.connections.lock().remove(conn.name());

        // The queued task's strong reference keeps the connection alive
        // until connect_destroyed finishes on its worker.
        let worker_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        worker_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!(server = %self.name, "server shutting down");
        let drained: Vec<TcpConnectionPtr> =
            self.connections.lock().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            let worker_loop = conn.owner_loop().clone();
            worker_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
