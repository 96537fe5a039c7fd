//! Token bucket.
//!
//! The bucket starts full. Each admission spends one token and a background
//! scheduler adds exactly one token per refill interval, capped at capacity.
//! Refills that land on a full bucket are discarded.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::backend::{Admission, Algorithm};
use crate::error::{RateKeeperError, Result};
use crate::schedule::PeriodicScheduler;

#[derive(Debug)]
struct TokenPool {
    capacity: u64,
    tokens: u64,
}

/// Bursts up to `capacity`, sustains one admission per `refill_interval`.
#[derive(Debug)]
pub struct TokenBucket {
    refill_interval: Duration,
    pool: Arc<Mutex<TokenPool>>,
    scheduler: PeriodicScheduler,
}

impl TokenBucket {
    /// Create a full bucket and start its refill schedule.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(capacity: u64, refill_interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(RateKeeperError::Config(
                "token bucket capacity must be greater than zero".to_string(),
            ));
        }

        let pool = Arc::new(Mutex::new(TokenPool {
            capacity,
            tokens: capacity,
        }));

        let shared = pool.clone();
        let scheduler =
            PeriodicScheduler::schedule("token_bucket_refill", refill_interval, move || {
                refill_pool(&shared)
            })?;

        Ok(Self {
            refill_interval,
            pool,
            scheduler,
        })
    }

    /// Spend one token if any are left.
    pub fn allow(&self) -> bool {
        let remaining = {
            let mut pool = self.pool.lock();
            if pool.tokens == 0 {
                None
            } else {
                pool.tokens -= 1;
                Some(pool.tokens)
            }
        };

        match remaining {
            Some(tokens) => {
                info!(tokens, "Assigning token to request");
                true
            }
            None => {
                warn!("No more tokens");
                false
            }
        }
    }

    /// Add one token unless the bucket is full. The scheduler calls this
    /// every refill interval.
    pub fn refill(&self) {
        refill_pool(&self.pool)
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> u64 {
        self.pool.lock().tokens
    }

    pub fn capacity(&self) -> u64 {
        self.pool.lock().capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Stop the refill schedule.
    pub fn shutdown(&self) {
        self.scheduler.cancel();
    }
}

fn refill_pool(pool: &Mutex<TokenPool>) {
    let tokens = {
        let mut pool = pool.lock();
        if pool.tokens == pool.capacity {
            None
        } else {
            pool.tokens += 1;
            Some(pool.tokens)
        }
    };

    match tokens {
        Some(tokens) => debug!(tokens, "Added new token"),
        None => trace!("Bucket is full"),
    }
}

impl Admission for TokenBucket {
    fn allow(&self) -> bool {
        TokenBucket::allow(self)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        let result = TokenBucket::new(0, Duration::from_secs(2));
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = TokenBucket::new(5, Duration::ZERO);
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject() {
        let bucket = TokenBucket::new(5, Duration::from_secs(2)).unwrap();

        for _ in 0..5 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
        assert_eq!(bucket.tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_one_token_per_interval() {
        let bucket = TokenBucket::new(5, Duration::from_secs(2)).unwrap();

        for _ in 0..5 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());

        tokio::time::sleep(Duration::from_millis(2_100)).await;

        // Exactly one more admission, not a proportional refill
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1)).unwrap();

        assert!(bucket.allow());
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        // Excess refills are discarded, not banked
        assert_eq!(bucket.tokens(), 3);
        for _ in 0..3 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }

    #[tokio::test]
    async fn test_manual_refill() {
        let bucket = TokenBucket::new(2, Duration::from_secs(3600)).unwrap();

        bucket.refill();
        assert_eq!(bucket.tokens(), 2);

        assert!(bucket.allow());
        assert!(bucket.allow());
        bucket.refill();
        assert_eq!(bucket.tokens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_refill() {
        let bucket = TokenBucket::new(1, Duration::from_secs(1)).unwrap();

        assert!(bucket.allow());
        bucket.shutdown();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bucket.tokens(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_spending_never_overdraws() {
        let bucket = Arc::new(TokenBucket::new(40, Duration::from_secs(3600)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::task::spawn_blocking(move || (0..30).filter(|_| bucket.allow()).count())
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }

        assert_eq!(admitted, 40);
        assert_eq!(bucket.tokens(), 0);
    }
}
