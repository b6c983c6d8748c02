//! Fixed-interval reconnect timer
//!
//! The agent retries forever at a constant interval. At most one timer is
//! armed at a time: arming an armed timer keeps the existing deadline.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Reconnect timer owned by the connection controller
#[derive(Debug)]
pub struct ReconnectTimer {
    interval: Duration,
    deadline: Option<Instant>,
    attempt: usize,
}

impl ReconnectTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            attempt: 0,
        }
    }

    /// Arm the timer; returns false if it was already armed
    pub fn arm(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }

        self.deadline = Some(Instant::now() + self.interval);
        true
    }

    /// Wait for the armed deadline to pass, then disarm
    ///
    /// Returns immediately if the timer is not armed.
    pub async fn wait(&mut self) {
        if let Some(deadline) = self.deadline {
            sleep_until(deadline).await;
            self.deadline = None;
            self.attempt += 1;
        }
    }

    /// Disarm and forget past attempts (call after a successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnect timer after {} attempts", self.attempt);
        }
        self.deadline = None;
        self.attempt = 0;
    }

    /// Number of times the timer has fired since the last reset
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
