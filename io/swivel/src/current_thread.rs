//! Cached OS thread id.
//!
//! The kernel tid (not a runtime-assigned id) is user-visible in logs, so it
//! is fetched once per thread with `gettid` and cached in a thread-local.

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// The calling thread's kernel tid.
pub fn tid() -> libc::pid_t {
    CACHED_TID.with(|cached| {
        let mut t = cached.get();
        if t == 0 {
            t = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            cached.set(t);
        }
        t
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_is_positive_and_stable() {
        let first = tid();
        assert!(first > 0);
        assert_eq!(first, tid());
    }

    #[test]
    fn tid_differs_across_threads() {
        let here = tid();
        let there = std::thread::spawn(tid).join().unwrap();
        assert_ne!(here, there);
    }
}
