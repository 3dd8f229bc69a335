//! Selectable one-shot timer.

use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// One-shot timer for event loops.
///
/// `wait` resolves once, `interval` after the most recent `start`; while the
/// timer is stopped it never resolves, so it can sit in a `tokio::select!`
/// arm unconditionally. Firing does not disarm the timer by itself; the
/// owner stops it when handling expiry.
#[derive(Debug)]
pub struct OneShotTimer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl OneShotTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arms (or re-arms) the timer `interval` from now.
    pub fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }

    /// Disarms the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves at the armed deadline; never resolves while disarmed.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending::<()>().await,
        }
    }
}
