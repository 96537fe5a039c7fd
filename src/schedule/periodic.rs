//! Cancellable periodic scheduler.
//!
//! Each scheduler owns one tokio task that sleeps for the configured
//! interval, runs its action, and re-arms. The next sleep starts only after
//! the action returns, so firings never overlap and slow actions push the
//! following tick back instead of piling up.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::panic_message;
use crate::error::{RateKeeperError, Result};

/// Runs an action repeatedly on a background task until cancelled.
///
/// Dropping the scheduler cancels it, so a limiter that owns one stops its
/// background work on teardown.
pub struct PeriodicScheduler {
    /// Name used in log events
    name: &'static str,
    /// Delay between the end of one firing and the start of the next
    interval: Duration,
    /// Number of firings attempted so far
    ticks: Arc<AtomicU64>,
    /// Cancellation flag observed by the task
    cancel_tx: watch::Sender<bool>,
    /// Handle of the background task, taken by `shutdown`
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeriodicScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicScheduler")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("ticks", &self.ticks())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PeriodicScheduler {
    /// Start running `action` every `interval` on the current tokio runtime.
    ///
    /// Fails if `interval` is zero or if no runtime is available.
    pub fn schedule<F>(name: &'static str, interval: Duration, action: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(RateKeeperError::Config(format!(
                "{name}: interval must be greater than zero"
            )));
        }

        let runtime = Handle::try_current()
            .map_err(|e| RateKeeperError::Runtime(format!("{name}: {e}")))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ticks = Arc::new(AtomicU64::new(0));
        let handle = runtime.spawn(run(name, interval, action, cancel_rx, ticks.clone()));

        debug!(
            scheduler = name,
            interval_ms = interval.as_millis() as u64,
            "Periodic scheduler started"
        );

        Ok(Self {
            name,
            interval,
            ticks,
            cancel_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop future firings. A firing already in progress completes.
    pub fn cancel(&self) {
        if !self.cancel_tx.send_replace(true) {
            debug!(scheduler = self.name, "Periodic scheduler cancelled");
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Number of firings attempted, including ones whose action panicked.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancel and wait for the background task to exit.
    pub async fn shutdown(&self) {
        self.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(scheduler = self.name, error = %e, "Periodic scheduler task failed");
            }
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run<F>(
    name: &'static str,
    interval: Duration,
    mut action: F,
    mut cancel_rx: watch::Receiver<bool>,
    ticks: Arc<AtomicU64>,
) where
    F: FnMut() + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            // Fires on cancel and when the sender is dropped.
            _ = cancel_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if *cancel_rx.borrow() {
            break;
        }

        let tick = ticks.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(scheduler = name, tick, "Firing periodic action");

        if let Err(panic) = catch_unwind(AssertUnwindSafe(&mut action)) {
            error!(
                scheduler = name,
                tick,
                reason = panic_message(panic.as_ref()),
                "Periodic action panicked, schedule continues"
            );
        }
    }

    debug!(scheduler = name, "Periodic scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_action() -> (Arc<AtomicU64>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicU64::new(0));
        let captured = count.clone();
        (count, move || {
            captured.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = PeriodicScheduler::schedule("test", Duration::ZERO, || {});
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[test]
    fn test_schedule_requires_runtime() {
        let result = PeriodicScheduler::schedule("test", Duration::from_secs(1), || {});
        assert!(matches!(result, Err(RateKeeperError::Runtime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_interval() {
        let (count, action) = counting_action();
        let scheduler = PeriodicScheduler::schedule("test", Duration::from_secs(2), action).unwrap();

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.ticks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_does_not_stop_schedule() {
        let count = Arc::new(AtomicU64::new(0));
        let captured = count.clone();
        let scheduler = PeriodicScheduler::schedule("test", Duration::from_secs(1), move || {
            let n = captured.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                panic!("first tick fails");
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.ticks(), 3);
        assert!(!scheduler.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_future_firings() {
        let (count, action) = counting_action();
        let scheduler = PeriodicScheduler::schedule("test", Duration::from_secs(1), action).unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.cancel();
        scheduler.cancel();
        assert!(scheduler.is_cancelled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (count, action) = counting_action();
        let scheduler = PeriodicScheduler::schedule("test", Duration::from_secs(1), action).unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        drop(scheduler);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_task() {
        let (count, action) = counting_action();
        let scheduler = PeriodicScheduler::schedule("test", Duration::from_secs(1), action).unwrap();

        scheduler.shutdown().await;
        assert!(scheduler.is_cancelled());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_firing_after_blocking_action() {
        let count = Arc::new(AtomicU64::new(0));
        let captured = count.clone();
        let _scheduler = PeriodicScheduler::schedule("test", Duration::from_secs(1), move || {
            std::thread::sleep(Duration::from_millis(5));
            captured.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interval_measured_from_end_of_action() {
        let interval = Duration::from_millis(50);
        let work = Duration::from_millis(100);
        let starts = Arc::new(Mutex::new(Vec::new()));

        let captured = starts.clone();
        let scheduler = PeriodicScheduler::schedule("test", interval, move || {
            captured.lock().push(std::time::Instant::now());
            std::thread::sleep(work);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        scheduler.shutdown().await;

        let starts = starts.lock();
        assert!(starts.len() >= 2, "expected at least two firings, got {}", starts.len());
        for pair in starts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= work + interval, "firings only {gap:?} apart");
        }
    }
}
