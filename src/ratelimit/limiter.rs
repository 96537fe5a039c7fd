//! Config-driven facade over the four limiters.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{Admission, Algorithm};
use super::fixed_window::FixedWindowCounter;
use super::leaky_bucket::{LeakyBucket, TicketStatus};
use super::sliding_log::SlidingWindowLog;
use super::ticket::Ticket;
use super::token_bucket::TokenBucket;
use crate::config::LimiterConfig;
use crate::error::Result;

/// Outcome of one admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "ticket", rename_all = "snake_case")]
pub enum Decision {
    /// The request may proceed now
    Admitted,
    /// The request was queued; its result is collected later with the ticket
    Deferred(Ticket),
    /// The request is over the limit
    Rejected,
}

impl Decision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Rejected)
    }

    pub fn ticket(&self) -> Option<Ticket> {
        match self {
            Decision::Deferred(ticket) => Some(*ticket),
            _ => None,
        }
    }
}

/// The limiter selected by configuration.
///
/// The leaky bucket variant processes request ids and publishes a short
/// confirmation string as each one's result.
pub enum RateLimiter {
    FixedWindow(FixedWindowCounter),
    SlidingWindowLog(SlidingWindowLog),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket<String, String>),
}

impl RateLimiter {
    /// Build the configured limiter. Must be called inside a tokio runtime.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;

        let limiter = match *config {
            LimiterConfig::FixedWindow {
                window_ms,
                capacity,
            } => RateLimiter::FixedWindow(FixedWindowCounter::new(
                Duration::from_millis(window_ms),
                capacity,
            )?),
            LimiterConfig::SlidingWindowLog { window_ms, limit } => RateLimiter::SlidingWindowLog(
                SlidingWindowLog::new(Duration::from_millis(window_ms), limit)?,
            ),
            LimiterConfig::TokenBucket {
                capacity,
                refill_interval_ms,
            } => RateLimiter::TokenBucket(TokenBucket::new(
                capacity,
                Duration::from_millis(refill_interval_ms),
            )?),
            LimiterConfig::LeakyBucket {
                queue_capacity,
                process_interval_ms,
                max_in_flight,
            } => RateLimiter::LeakyBucket(LeakyBucket::with_max_in_flight(
                queue_capacity,
                Duration::from_millis(process_interval_ms),
                max_in_flight,
                process_request,
            )?),
        };

        info!(
            algorithm = %limiter.algorithm(),
            interval_ms = config.interval().as_millis() as u64,
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    /// Decide what happens to the request identified by `request_id`.
    pub fn admit(&self, request_id: &str) -> Decision {
        let decision = match self {
            RateLimiter::LeakyBucket(bucket) => match bucket.submit(request_id.to_string()) {
                Some(ticket) => Decision::Deferred(ticket),
                None => Decision::Rejected,
            },
            _ => match self.as_admission() {
                Some(limiter) if limiter.allow() => Decision::Admitted,
                _ => Decision::Rejected,
            },
        };

        debug!(request_id, ?decision, "Admission decided");
        decision
    }

    /// Take the result of a deferred request. Always `None` for limiters
    /// that never defer.
    pub fn collect(&self, ticket: &Ticket) -> Option<String> {
        match self {
            RateLimiter::LeakyBucket(bucket) => bucket.collect(ticket),
            _ => None,
        }
    }

    pub fn status(&self, ticket: &Ticket) -> TicketStatus {
        match self {
            RateLimiter::LeakyBucket(bucket) => bucket.status(ticket),
            _ => TicketStatus::Unknown,
        }
    }

    /// The immediate-decision view of this limiter, if it has one.
    pub fn as_admission(&self) -> Option<&dyn Admission> {
        match self {
            RateLimiter::FixedWindow(limiter) => Some(limiter),
            RateLimiter::SlidingWindowLog(limiter) => Some(limiter),
            RateLimiter::TokenBucket(limiter) => Some(limiter),
            RateLimiter::LeakyBucket(_) => None,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            RateLimiter::FixedWindow(_) => Algorithm::FixedWindow,
            RateLimiter::SlidingWindowLog(_) => Algorithm::SlidingWindowLog,
            RateLimiter::TokenBucket(_) => Algorithm::TokenBucket,
            RateLimiter::LeakyBucket(_) => Algorithm::LeakyBucket,
        }
    }

    /// Stop the limiter's background schedule, if it has one.
    pub fn shutdown(&self) {
        match self {
            RateLimiter::FixedWindow(limiter) => limiter.shutdown(),
            RateLimiter::SlidingWindowLog(_) => {}
            RateLimiter::TokenBucket(limiter) => limiter.shutdown(),
            RateLimiter::LeakyBucket(limiter) => limiter.shutdown(),
        }
        debug!(algorithm = %self.algorithm(), "Rate limiter shut down");
    }
}

async fn process_request(ticket: Ticket, request_id: String) -> String {
    info!(%ticket, request_id = %request_id, "Processing deferred request");
    format!("processed request {request_id}")
}
