//! Stress helpers for sessions.
//!
//! These run session operations from many threads at once and report how
//! many succeeded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tether_session::{SessionResult, SyncSession};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            duration,
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
        }
    }
}

/// Runs `op(thread, iteration)` from `config.threads` threads started together.
pub fn run_concurrent<F>(config: &StressConfig, op: F) -> StressTestResult
where
    F: Fn(usize, usize) -> bool + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(config.threads));

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let op = Arc::clone(&op);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let barrier = Arc::clone(&barrier);
            let operations = config.operations;

            thread::spawn(move || {
                barrier.wait();
                for i in 0..operations {
                    if op(t, i) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Calls `start` and `stop` on one session from many threads.
pub fn stress_start_stop(session: &SyncSession, config: &StressConfig) -> StressTestResult {
    let session = session.clone();
    run_concurrent(config, move |t, i| {
        let result: SessionResult<()> = if (t + i) % 2 == 0 {
            session.start()
        } else {
            session.stop()
        };
        result.is_ok()
    })
}
