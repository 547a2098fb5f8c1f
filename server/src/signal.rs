//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use swivel::EventLoop;
use tracing::{info, warn};

/// Install a SIGINT/SIGTERM handler that quits the base loop, letting
/// `EventLoop::run` return so the process can unwind normally. A second
/// signal forces immediate exit.
pub fn install_quit_handler(base_loop: &Arc<EventLoop>) {
    let base_loop = base_loop.clone();
    let already_signaled = AtomicBool::new(false);

    ctrlc::set_handler(move || {
        if already_signaled.swap(true, Ordering::SeqCst) {
            warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        info!("received shutdown signal, quitting event loop");
        // Thread-safe: sets the quit flag and kicks the wakeup descriptor.
        base_loop.quit();
    })
    .expect("failed to set signal handler");
}
