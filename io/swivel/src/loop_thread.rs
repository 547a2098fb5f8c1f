//! Worker reactor threads and the round-robin pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::event_loop::EventLoop;

/// Runs once on each worker thread, with that worker's loop, before the
/// loop starts. With zero workers it runs on the base loop instead.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

struct Shared {
    loop_slot: Mutex<Option<Arc<EventLoop>>>,
    ready: Condvar,
}

/// One worker thread hosting one event loop.
///
/// The loop is constructed on the worker's own stack of control: the thread
/// builds it, publishes the handle back through the condvar, and then blocks
/// in `run()` until quit.
pub struct EventLoopThread {
    shared: Arc<Shared>,
    init: Option<ThreadInitCallback>,
    name: String,
    thread: Option<JoinHandle<()>>,
    worker_loop: Option<Arc<EventLoop>>,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: String) -> EventLoopThread {
        EventLoopThread {
            shared: Arc::new(Shared {
                loop_slot: Mutex::new(None),
                ready: Condvar::new(),
            }),
            init,
            name,
            thread: None,
            worker_loop: None,
        }
    }

    /// Spawn the worker and block until its loop handle is published.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        let shared = self.shared.clone();
        let init = self.init.take();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // The wakeup descriptor is the loop's lifeline; there is no
                // sensible recovery when it cannot be created.
                let event_loop = EventLoop::new().expect("failed to create worker event loop");
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let mut slot = shared.loop_slot.lock();
                    *slot = Some(event_loop.clone());
                    shared.ready.notify_one();
                }
                event_loop.run();
                *shared.loop_slot.lock() = None;
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(handle);

        let event_loop = {
            let mut slot = self.shared.loop_slot.lock();
            loop {
                if let Some(event_loop) = slot.as_ref() {
                    break event_loop.clone();
                }
                self.shared.ready.wait(&mut slot);
            }
        };
        self.worker_loop = Some(event_loop.clone());
        event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.worker_loop.take() {
            event_loop.quit();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct PoolInner {
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
    /// Round-robin cursor, advanced only on the base loop's thread.
    next: usize,
}

/// Spawns the worker reactors and hands them out round-robin.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    inner: Mutex<PoolInner>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            inner: Mutex::new(PoolInner {
                threads: Vec::new(),
                loops: Vec::new(),
                next: 0,
            }),
        }
    }

    /// Number of worker threads to spawn. Takes effect at [`start`].
    /// Zero (the default) means every connection runs on the base loop.
    ///
    /// [`start`]: EventLoopThreadPool::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the workers and collect their loops. With zero workers the
    /// init callback runs directly on the base loop.
    pub fn start(&self, init: Option<ThreadInitCallback>) {
        self.started.store(true, Ordering::Release);
        let num_threads = self.num_threads.load(Ordering::Relaxed);

        let mut inner = self.inner.lock();
        for i in 0..num_threads {
            let thread_name = format!("{}-{}", self.name, i);
            let mut thread = EventLoopThread::new(init.clone(), thread_name);
            let event_loop = thread.start_loop();
            inner.threads.push(thread);
            inner.loops.push(event_loop);
        }
        info!(name = %self.name, workers = num_threads, "thread pool started");

        if num_threads == 0
            && let Some(init) = init
        {
            init(&self.base_loop);
        }
    }

    /// The next worker loop, round-robin; the base loop when there are no
    /// workers. Called on the base loop's thread during accept.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        let mut inner = self.inner.lock();
        if inner.loops.is_empty() {
            return self.base_loop.clone();
        }
        let event_loop = inner.loops[inner.next].clone();
        inner.next = (inner.next + 1) % inner.loops.len();
        event_loop
    }

    /// Every worker loop, or the base loop when there are none.
    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        let inner = self.inner.lock();
        if inner.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            inner.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn start_loop_publishes_a_foreign_loop() {
        let mut thread = EventLoopThread::new(None, "loop-thread-test".into());
        let event_loop = thread.start_loop();
        assert!(!event_loop.is_in_loop_thread());

        let (tx, rx) = std::sync::mpsc::channel();
        event_loop.run_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5))
            .expect("worker loop never ran the task");
        // Drop joins the worker.
    }

    #[test]
    fn init_callback_runs_on_worker() {
        let init_tid = Arc::new(AtomicUsize::new(0));
        let recorded = init_tid.clone();
        let init: ThreadInitCallback = Arc::new(move |event_loop| {
            assert!(event_loop.is_in_loop_thread());
            recorded.store(crate::current_thread::tid() as usize, Ordering::Release);
        });

        let mut thread = EventLoopThread::new(Some(init), "loop-thread-init".into());
        let _event_loop = thread.start_loop();
        let tid = init_tid.load(Ordering::Acquire);
        assert_ne!(tid, 0);
        assert_ne!(tid, crate::current_thread::tid() as usize);
    }

    #[test]
    fn pool_without_workers_hands_out_base_loop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let base_loop = EventLoop::new().unwrap();
            let pool = EventLoopThreadPool::new(base_loop.clone(), "pool-test".into());

            let init_ran = Arc::new(AtomicBool::new(false));
            let flag = init_ran.clone();
            pool.start(Some(Arc::new(move |_| flag.store(true, Ordering::Release))));
            assert!(init_ran.load(Ordering::Acquire));

            assert!(Arc::ptr_eq(&pool.get_next_loop(), &base_loop));
            assert_eq!(pool.get_all_loops().len(), 1);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pool_rotates_workers_fairly() {
        let base_loop_thread = std::thread::spawn(|| {
            let base_loop = EventLoop::new().unwrap();
            let pool = EventLoopThreadPool::new(base_loop, "pool-rr".into());
            pool.set_thread_num(3);
            pool.start(None);
            assert!(pool.started());

            let loops = pool.get_all_loops();
            assert_eq!(loops.len(), 3);

            // Two full rounds: every worker is handed out exactly twice.
            let mut counts = vec![0usize; 3];
            for _ in 0..6 {
                let picked = pool.get_next_loop();
                let idx = loops
                    .iter()
                    .position(|l| Arc::ptr_eq(l, &picked))
                    .expect("picked loop not in pool");
                counts[idx] += 1;
            }
            assert_eq!(counts, vec![2, 2, 2]);
        });
        base_loop_thread.join().unwrap();
    }
}
