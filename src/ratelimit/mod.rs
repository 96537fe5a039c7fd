//! Rate limiting algorithms and the facade that selects one.

mod backend;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod sliding_log;
mod ticket;
mod token_bucket;

pub use backend::{Admission, Algorithm};
pub use fixed_window::FixedWindowCounter;
pub use leaky_bucket::{LeakyBucket, TicketStatus, WorkHandler, DEFAULT_MAX_IN_FLIGHT};
pub use limiter::{Decision, RateLimiter};
pub use sliding_log::SlidingWindowLog;
pub use ticket::Ticket;
pub use token_bucket::TokenBucket;
