//! Fixed window counter.
//!
//! The counter starts full and each admission takes one slot. A background
//! scheduler refills it to capacity every `window_size`, counted from the
//! moment the limiter was built rather than from calendar boundaries. Two
//! adjacent windows can therefore admit up to twice the capacity in a burst
//! straddling a reset.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::{Admission, Algorithm};
use crate::error::{RateKeeperError, Result};
use crate::schedule::PeriodicScheduler;

/// Mutable state guarded by the limiter's lock.
#[derive(Debug)]
struct Window {
    capacity: u64,
    remaining: u64,
}

impl Window {
    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn reset(&mut self) {
        self.remaining = self.capacity;
    }
}

/// Admits up to `capacity` requests per window.
#[derive(Debug)]
pub struct FixedWindowCounter {
    window_size: Duration,
    window: Arc<Mutex<Window>>,
    scheduler: PeriodicScheduler,
}

impl FixedWindowCounter {
    /// Create a counter and start its reset schedule.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(window_size: Duration, capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(RateKeeperError::Config(
                "fixed window capacity must be greater than zero".to_string(),
            ));
        }

        let window = Arc::new(Mutex::new(Window {
            capacity,
            remaining: capacity,
        }));

        let shared = window.clone();
        let scheduler = PeriodicScheduler::schedule("fixed_window_reset", window_size, move || {
            reset_window(&shared, window_size)
        })?;

        Ok(Self {
            window_size,
            window,
            scheduler,
        })
    }

    /// Admit one request if the current window has room.
    pub fn allow(&self) -> bool {
        let admitted = self.window.lock().take();
        if admitted {
            info!("Allowing request, window counter decremented");
        } else {
            warn!(
                window_secs = self.window_size.as_secs_f64(),
                "Rate limit applied, counter resets at the next window boundary"
            );
        }
        admitted
    }

    /// Refill the window to capacity. The scheduler calls this every window.
    pub fn reset(&self) {
        reset_window(&self.window, self.window_size)
    }

    /// Slots left in the current window.
    pub fn remaining(&self) -> u64 {
        self.window.lock().remaining
    }

    pub fn capacity(&self) -> u64 {
        self.window.lock().capacity
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Stop the reset schedule.
    pub fn shutdown(&self) {
        self.scheduler.cancel();
    }
}

fn reset_window(window: &Mutex<Window>, window_size: Duration) {
    window.lock().reset();
    debug!(
        window_secs = window_size.as_secs_f64(),
        "Window counter reset to capacity"
    );
}

impl Admission for FixedWindowCounter {
    fn allow(&self) -> bool {
        FixedWindowCounter::allow(self)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
