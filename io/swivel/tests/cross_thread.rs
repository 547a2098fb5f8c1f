//! `send` from a foreign thread executes on the connection's worker.

use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use swivel::{EventLoop, TcpServer, current_thread};

#[test]
fn send_from_background_thread_lands_on_worker() {
    let (tx, rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();
    let (wc_tx, wc_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &base_loop,
            "127.0.0.1:0".parse().unwrap(),
            "cross-thread-test",
            false,
        )
        .unwrap();
        server.set_thread_num(1);
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                // Hand the connection (and the worker's tid) to the test.
                let _ = conn_tx.send((conn.clone(), current_thread::tid()));
            }
        });
        server.set_write_complete_callback(move |_conn| {
            let _ = wc_tx.send(current_thread::tid());
        });
        server.start();
        tx.send((base_loop.clone(), server.listen_addr())).unwrap();
        base_loop.run();
    });
    let (base_loop, addr) = rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let (conn, worker_tid) = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("connection never established");
    assert_ne!(worker_tid, current_thread::tid());

    // This thread is neither the base loop nor the worker.
    conn.send(b"x");

    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"x");

    // The write completed on the worker reactor, not on this thread.
    let wc_tid = wc_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("write-complete never fired");
    assert_eq!(wc_tid, worker_tid);
    assert_ne!(wc_tid, current_thread::tid());

    drop(conn);
    base_loop.quit();
    server_thread.join().unwrap();
}
