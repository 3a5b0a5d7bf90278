//! Loop control - what a worker does after one iteration.

use std::time::Duration;

/// Outcome of one worker iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Iteration done; input consumed. Sleep before the next one.
    Continue(Duration),
    /// Not done; leave the input at the head and come back after the delay.
    Retry(Duration),
    /// Stop the worker.
    Break,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::Continue(Duration::ZERO)
    }
}

impl LoopControl {
    pub fn continue_now() -> Self {
        Self::Continue(Duration::ZERO)
    }

    pub fn continue_after(delay: Duration) -> Self {
        Self::Continue(delay)
    }

    pub fn retry_now() -> Self {
        Self::Retry(Duration::ZERO)
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self::Retry(delay)
    }

    pub fn interrupt() -> Self {
        Self::Break
    }

    /// Continue with a delay given in signed microseconds (negative = none)
    pub fn continue_after_us(delay_us: i64) -> Self {
        Self::Continue(Duration::from_micros(delay_us.max(0) as u64))
    }

    /// Retry with a delay given in signed microseconds (negative = none)
    pub fn retry_after_us(delay_us: i64) -> Self {
        Self::Retry(Duration::from_micros(delay_us.max(0) as u64))
    }

    pub fn is_break(&self) -> bool {
        matches!(self, Self::Break)
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    pub fn delay(&self) -> Duration {
        match self {
            Self::Continue(d) | Self::Retry(d) => *d,
            Self::Break => Duration::ZERO,
        }
    }

    /// Block the calling thread for the delay; no-op when zero
    pub fn sleep(&self) {
        let delay = self.delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}
