//! Cancelable, re-schedulable one-shot deadlines.
//!
//! The timers hold no task of their own. The owning session loop waits on
//! [`GraceTimer::expired`], so a fire and a cancel can never race each other.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone)]
pub struct GraceTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl GraceTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Arm the timer, restarting it if already armed.
    pub fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Resolves at `deadline`, or never when there is none.
    pub async fn expired(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Observable state of a management session's two timers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraceStatus {
    pub connected: bool,
    pub grace_scheduled: bool,
    pub short_grace_scheduled: bool,
}

impl GraceStatus {
    /// Whether a "reduce grace time" notice should arm the short timer.
    pub fn accepts_reduction(&self) -> bool {
        self.grace_scheduled && !self.short_grace_scheduled
    }
}
