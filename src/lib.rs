//! Ratekeeper - in-process admission control
//!
//! This crate decides, per request and in constant time, whether to admit,
//! defer or reject work using one of four disciplines: fixed window counter,
//! sliding window log, token bucket, or leaky bucket. Each limiter owns its
//! state and its background schedule, so independent instances can live
//! side by side.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod schedule;
