//! Blocking counters and the process-wide shutdown flag.
//!
//! An [`EventCounter`] is a monotonically increasing value plus a condition
//! variable. Waking is only a hint: waiters always re-check their own
//! predicate after [`EventCounter::wait_changed`] returns.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::error::MirrorError;

#[derive(Debug, Default)]
pub struct EventCounter {
    value: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bump the counter and wake one waiter.
    pub fn signal(&self) {
        let _guard = self.guard();
        self.value.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_one();
    }

    pub fn signal_all(&self) {
        let _guard = self.guard();
        self.value.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// Block while the counter still equals `observed`, up to `timeout`.
    /// `None` waits until signalled. Returns the counter value on return.
    pub fn wait_changed(&self, observed: u64, timeout: Option<Duration>) -> u64 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.guard();
        loop {
            let current = self.value.load(Ordering::Acquire);
            if current != observed {
                return current;
            }
            match deadline {
                None => {
                    guard = self
                        .cond
                        .wait(guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return current;
                    }
                    guard = self
                        .cond
                        .wait_timeout(guard, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }
}

/// Number of shutdown requests after which the process exits without
/// waiting for the threads.
pub const FORCED_EXIT_REQUESTS: u32 = 5;

/// Shared "keep running" flag, checked at every wait point.
///
/// Requesting shutdown wakes every registered counter so that blocked
/// threads observe the flag promptly.
#[derive(Debug)]
pub struct ShutdownSignal {
    running: AtomicBool,
    requests: AtomicU32,
    waiters: Mutex<Vec<Arc<EventCounter>>>,
    fatal: OnceLock<MirrorError>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            requests: AtomicU32::new(0),
            waiters: Mutex::new(Vec::new()),
            fatal: OnceLock::new(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn register(&self, counter: Arc<EventCounter>) {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(counter);
    }

    /// Ask every thread to stop. The fifth request exits the process with
    /// status 1.
    pub fn request(&self) {
        let count = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= FORCED_EXIT_REQUESTS {
            log::error!("shutdown requested {count} times without the threads stopping, exiting");
            std::process::exit(1);
        }
        self.stop();
    }

    /// Clear the running flag and wake all registered waiters without
    /// counting as a user request.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let waiters = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for waiter in waiters.iter() {
            waiter.signal_all();
        }
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Acquire)
    }

    /// Remember the first fatal error and stop everything.
    pub fn fail(&self, error: MirrorError) {
        log::error!("fatal: {error}");
        let _ = self.fatal.set(error);
        self.stop();
    }

    pub fn fatal_error(&self) -> Option<MirrorError> {
        self.fatal.get().map(MirrorError::to_sendable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_immediately_when_counter_moved() {
        let counter = EventCounter::new();
        counter.signal();
        assert_eq!(counter.wait_changed(0, None), 1);
    }

    #[test]
    fn wait_times_out_without_signal() {
        let counter = EventCounter::new();
        let start = Instant::now();
        assert_eq!(counter.wait_changed(0, Some(Duration::from_millis(20))), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn signal_from_other_thread_wakes_waiter() {
        let counter = Arc::new(EventCounter::new());
        let signaller = counter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaller.signal();
        });
        assert_eq!(counter.wait_changed(0, Some(Duration::from_secs(5))), 1);
        handle.join().unwrap();
    }

    #[test]
    fn stop_wakes_registered_counters() {
        let shutdown = ShutdownSignal::new();
        let counter = Arc::new(EventCounter::new());
        shutdown.register(counter.clone());
        shutdown.request();
        assert!(!shutdown.is_running());
        assert_eq!(counter.load(), 1);
        assert_eq!(shutdown.requests(), 1);
    }

    #[test]
    fn first_fatal_error_is_kept() {
        let shutdown = ShutdownSignal::new();
        shutdown.fail(MirrorError::AcquisitionFailed("first".into()));
        shutdown.fail(MirrorError::WorkerDead);
        assert!(matches!(
            shutdown.fatal_error(),
            Some(MirrorError::AcquisitionFailed(msg)) if msg == "first"
        ));
    }
}
