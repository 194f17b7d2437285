//! Timed reconnection with failure de-duplication.
//!
//! A connecting device that loses (or never gets) its peer re-arms a one-shot
//! timer at a fixed interval. Only the first failure of a streak is reported
//! at error level; a successful connection starts a new streak.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, error};

/// Retry timer owned by a socket driver task.
#[derive(Debug)]
pub struct ReconnectScheduler {
    interval: Option<Duration>,
    reported: bool,
    timer: Option<Pin<Box<Sleep>>>,
    attempts: u64,
    reported_failures: u64,
}

impl ReconnectScheduler {
    /// Build a scheduler. It stays disabled unless the device is
    /// reconnectable, not listening, and has a non-zero interval.
    #[must_use]
    pub fn new(interval: Option<Duration>, reconnectable: bool, listening: bool) -> Self {
        let interval = interval.filter(|d| reconnectable && !listening && !d.is_zero());
        Self {
            interval,
            reported: false,
            timer: None,
            attempts: 0,
            reported_failures: 0,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Record a failed connect. Logs the error only for the first failure
    /// since the last success; returns whether it was logged.
    pub fn connect_failed(&mut self, label: &str, err: &dyn std::fmt::Display) -> bool {
        if self.reported {
            debug!(chardev = %label, error = %err, "connect failed again");
            return false;
        }
        self.reported = true;
        self.reported_failures += 1;
        error!(chardev = %label, error = %err, "unable to connect character device");
        true
    }

    /// Start a new failure streak.
    pub fn connected(&mut self) {
        self.reported = false;
        self.cancel();
    }

    /// Arm the retry timer. Does nothing when disabled. Returns whether the
    /// timer is now armed.
    pub fn arm(&mut self) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        self.timer = Some(Box::pin(sleep(interval)));
        true
    }

    pub fn cancel(&mut self) {
        self.timer = None;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// When the armed timer fires.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.as_ref().map(|t| t.deadline())
    }

    /// Wait for the armed timer. Pending forever when nothing is armed, so
    /// it can sit in a `select!` unconditionally. Disarms on expiry and
    /// counts an attempt.
    pub async fn expired(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => timer.await,
            None => pending::<()>().await,
        }
        self.timer = None;
        self.attempts += 1;
    }

    /// Whether the current streak has been reported.
    #[must_use]
    pub fn is_reported(&self) -> bool {
        self.reported
    }

    /// Retries started by the timer.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Failures that were logged (one per streak).
    #[must_use]
    pub fn reported_failures(&self) -> u64 {
        self.reported_failures
    }
}
