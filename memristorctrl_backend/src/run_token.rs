//! Cooperative cancellation shared between a controller thread and whoever started it.
//!
//! A [`RunToken`] is cloned into the worker. The worker checks it at loop boundaries and sleeps
//! through [`RunToken::sleep`], which wakes up as soon as [`RunToken::cancel`] is called.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Returned by waits that were cut short by a cancellation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("run cancelled")]
pub struct Cancelled;

#[derive(Clone, Default)]
pub struct RunToken {
    cancelled: Arc<Mutex<bool>>,
    condvar: Arc<Condvar>,
}

impl RunToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock();
        *cancelled = true;
        self.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// `Err(Cancelled)` once the token has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Blocks for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.condvar.wait_until(&mut cancelled, deadline).timed_out() {
                return if *cancelled { Err(Cancelled) } else { Ok(()) };
            }
        }
        Err(Cancelled)
    }
}
