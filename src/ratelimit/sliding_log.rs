//! Sliding window log.
//!
//! Keeps the instant of every admitted request and admits a new one only
//! while fewer than `limit` of them fall inside the trailing window. Expired
//! instants are pruned on each call; there is no background work.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{Admission, Algorithm};
use crate::error::{RateKeeperError, Result};

/// Admits at most `limit` requests in any trailing `window`.
///
/// An entry belongs to the window while `now - entry < window`; an entry
/// exactly `window` old has expired.
#[derive(Debug)]
pub struct SlidingWindowLog {
    window: Duration,
    limit: usize,
    /// Admission instants in chronological order
    entries: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLog {
    pub fn new(window: Duration, limit: usize) -> Result<Self> {
        if window.is_zero() {
            return Err(RateKeeperError::Config(
                "sliding window size must be greater than zero".to_string(),
            ));
        }
        if limit == 0 {
            return Err(RateKeeperError::Config(
                "sliding window limit must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            window,
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        })
    }

    /// Admit one request if the trailing window has room.
    pub fn allow(&self) -> bool {
        let (removed, kept, in_window, oldest, admitted, now) = {
            let mut entries = self.entries.lock();
            let now = Instant::now();
            let removed = prune(&mut entries, now, self.window);
            let kept = entries.len();

            let admitted = entries.len() < self.limit;
            if admitted {
                entries.push_back(now);
            }
            let oldest = entries.front().copied();
            (removed, kept, entries.len(), oldest, admitted, now)
        };

        if removed > 0 {
            debug!(removed, remaining = kept, "Removed expired timestamps");
        }

        if admitted {
            info!(in_window, "Request within limit, added to log");
            return true;
        }

        warn!(
            retry_after_ms = oldest
                .map(|t| self.window.saturating_sub(now.duration_since(t)).as_millis() as u64)
                .unwrap_or_default(),
            "Rate limit applied, too many requests in window"
        );
        false
    }

    /// Number of logged admissions still inside the window.
    pub fn in_window(&self) -> usize {
        let mut entries = self.entries.lock();
        prune(&mut entries, Instant::now(), self.window);
        entries.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Drop entries that have left the window, returning how many were removed.
fn prune(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) -> usize {
    let before = entries.len();
    while let Some(&oldest) = entries.front() {
        if now.duration_since(oldest) < window {
            break;
        }
        entries.pop_front();
    }
    before - entries.len()
}

impl Admission for SlidingWindowLog {
    fn allow(&self) -> bool {
        SlidingWindowLog::allow(self)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowLog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[test]
    fn test_invalid_configuration() {
        assert!(SlidingWindowLog::new(Duration::ZERO, 3).is_err());
        assert!(SlidingWindowLog::new(Duration::from_secs(10), 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_over_limit() {
        let log = SlidingWindowLog::new(Duration::from_secs(10), 3).unwrap();

        assert!(log.allow());
        assert!(log.allow());
        assert!(log.allow());
        assert!(!log.allow());

        // Rejections are not logged
        assert_eq!(log.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_after_window_passes() {
        let log = SlidingWindowLog::new(Duration::from_secs(10), 3).unwrap();

        for _ in 0..3 {
            assert!(log.allow());
        }
        assert!(!log.allow());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(log.allow());
        assert_eq!(log.in_window(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_exactly_window_old_is_expired() {
        let log = SlidingWindowLog::new(Duration::from_secs(10), 1).unwrap();

        assert!(log.allow());

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(!log.allow());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(log.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_per_entry() {
        let log = SlidingWindowLog::new(Duration::from_secs(10), 2).unwrap();

        assert!(log.allow()); // t=0
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(log.allow()); // t=4
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!log.allow()); // t=8, both still in window

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(log.allow()); // t=10, first entry expired
        assert!(!log.allow());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(log.allow()); // t=14, second entry expired
        assert_eq!(log.in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_boundary_burst() {
        let log = SlidingWindowLog::new(Duration::from_secs(60), 3).unwrap();

        tokio::time::advance(Duration::from_millis(59_900)).await;
        let before = (0..3).filter(|_| log.allow()).count();
        tokio::time::advance(Duration::from_millis(200)).await;
        let after = (0..3).filter(|_| log.allow()).count();

        assert_eq!(before, 3);
        assert_eq!(after, 0);
    }

    /// Fails any event emitted while the log's lock is held.
    struct LockCheck {
        log: Arc<SlidingWindowLog>,
        events: Arc<AtomicUsize>,
        while_locked: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> Layer<S> for LockCheck {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.events.fetch_add(1, Ordering::SeqCst);
            if self.log.entries.try_lock().is_none() {
                self.while_locked.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_logs_after_releasing_lock() {
        let log = Arc::new(SlidingWindowLog::new(Duration::from_millis(5), 1).unwrap());
        let events = Arc::new(AtomicUsize::new(0));
        let while_locked = Arc::new(AtomicUsize::new(0));

        let subscriber = tracing_subscriber::registry().with(LockCheck {
            log: log.clone(),
            events: events.clone(),
            while_locked: while_locked.clone(),
        });

        tracing::subscriber::with_default(subscriber, || {
            assert!(log.allow());
            assert!(!log.allow());
            std::thread::sleep(Duration::from_millis(10));
            // Prunes the expired entry, then admits
            assert!(log.allow());
        });

        // admit, reject, prune, admit
        assert_eq!(events.load(Ordering::SeqCst), 4);
        assert_eq!(while_locked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_respect_limit() {
        let log = Arc::new(SlidingWindowLog::new(Duration::from_secs(3600), 25).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                tokio::task::spawn_blocking(move || (0..20).filter(|_| log.allow()).count())
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }

        assert_eq!(admitted, 25);
        assert!(log.in_window() <= log.limit());
    }
}
