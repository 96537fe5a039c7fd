//! Admission trait shared by the synchronous limiters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The limiting discipline a limiter implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindowLog,
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    /// Stable snake_case name, matching the configuration format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limiter that decides admission immediately.
///
/// Rejection is a normal outcome reported as `false`, never an error.
/// Implementations are safe to call from any number of threads.
pub trait Admission: Send + Sync {
    /// Decide whether one request may proceed now.
    fn allow(&self) -> bool;

    /// The discipline behind this limiter.
    fn algorithm(&self) -> Algorithm;
}
