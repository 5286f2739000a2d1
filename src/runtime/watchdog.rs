//! Stall watchdog for the thread-per-block scheduler
//!
//! Low-overhead monitoring using atomic timestamps instead of locks. Each
//! worker stores the start time of a potentially-blocking wait in an atomic
//! variable, and the watchdog periodically scans these timestamps to report
//! blocks that have been parked past the configured threshold — usually a
//! sign of a stalled upstream device or a sink that stopped consuming.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for a single worker's wait tracking
struct WaitState {
    /// Timestamp (ms since epoch) when the current wait started, or 0 if running
    wait_start: AtomicU64,
    /// Whether this wait has already been reported
    has_warned: AtomicBool,
    block_name: String,
    operation: String, // "input wait", "output wait"
}

/// Handle to a worker's watchdog state (held by the worker thread)
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<WaitState>,
}

impl WatchdogHandle {
    /// Mark the start of a potentially-blocking wait.
    #[inline(always)]
    pub fn start_wait(&self) {
        self.state.wait_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the end of the wait.
    #[inline(always)]
    pub fn finish_wait(&self) {
        if self.state.has_warned.load(Ordering::Relaxed) {
            info!(
                "unblocked: [{}] {}",
                self.state.block_name, self.state.operation
            );
            self.state.has_warned.store(false, Ordering::Relaxed);
        }
        self.state.wait_start.store(0, Ordering::Relaxed);
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    workers: Arc<Mutex<Vec<Weak<WaitState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
        }
    }

    /// Register a worker for monitoring.
    pub fn register(&self, block_name: &str, operation: &str) -> WatchdogHandle {
        let state = Arc::new(WaitState {
            wait_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            block_name: block_name.to_string(),
            operation: operation.to_string(),
        });
        self.workers.lock().unwrap().push(Arc::downgrade(&state));
        WatchdogHandle { state }
    }

    /// Report workers stalled past the threshold.
    pub fn check_for_stalls(&self) {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;

        let mut workers = self.workers.lock().unwrap();
        workers.retain(|weak| {
            if let Some(state) = weak.upgrade() {
                let start = state.wait_start.load(Ordering::Relaxed);
                if start > 0 {
                    let waited_ms = now.saturating_sub(start);
                    if waited_ms > threshold_ms
                        && !state.has_warned.swap(true, Ordering::Relaxed)
                    {
                        warn!(
                            "stalled: [{}] {} for {:.1}s",
                            state.block_name,
                            state.operation,
                            waited_ms as f64 / 1000.0
                        );
                    }
                }
                true
            } else {
                false // Worker exited, drop the dead weak reference
            }
        });
    }

    /// Start the monitoring thread.
    pub fn start_monitoring_thread(&self) -> std::thread::JoinHandle<()> {
        let watchdog = self.clone();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(Duration::from_secs(1));
                if !watchdog.enabled.load(Ordering::Relaxed) {
                    break;
                }
                watchdog.check_for_stalls();
            }
        })
    }

    /// Stop the monitoring thread.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

/// RAII guard marking one wait; near-zero cost (two atomic stores)
pub struct WaitGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> WaitGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_wait();
        Self { handle }
    }
}

impl Drop for WaitGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_wait_is_flagged_once() {
        let watchdog = Watchdog::new(Duration::from_millis(0));
        let handle = watchdog.register("test_block", "input wait");

        handle.start_wait();
        std::thread::sleep(Duration::from_millis(5));
        watchdog.check_for_stalls();
        assert!(handle.state.has_warned.load(Ordering::Relaxed));

        handle.finish_wait();
        assert!(!handle.state.has_warned.load(Ordering::Relaxed));
        assert_eq!(handle.state.wait_start.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_dead_workers_are_pruned() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let handle = watchdog.register("short_lived", "output wait");
        drop(handle);
        watchdog.check_for_stalls();
        assert!(watchdog.workers.lock().unwrap().is_empty());
    }
}
