use crate::config::BreakerConfig;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Open, but the reset timeout has elapsed: the next attempt may go out.
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// After `failure_threshold` failures the breaker opens and [`allow`]
/// rejects attempts until `reset_timeout` has passed since the last
/// failure. A success closes it again.
///
/// [`allow`]: CircuitBreaker::allow
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    open: bool,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            open: false,
            failure_count: 0,
            last_failure: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn state(&self, now: Instant) -> BreakerState {
        if !self.open {
            BreakerState::Closed
        } else if self.remaining(now).is_none() {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    pub fn allow(&self, now: Instant) -> bool {
        self.state(now) != BreakerState::Open
    }

    /// Time left until the breaker half-opens, if it is currently blocking.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if !self.open {
            return None;
        }
        let last = self.last_failure?;
        let elapsed = now.saturating_duration_since(last);
        self.config
            .reset_timeout
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        if !self.open && self.failure_count >= self.config.failure_threshold {
            self.open = true;
            warn!(
                failures = self.failure_count,
                reset_after_ms = self.config.reset_timeout.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    pub fn record_success(&mut self) {
        if self.open {
            info!("circuit breaker closed after successful attempt");
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.open = false;
        self.failure_count = 0;
        self.last_failure = None;
    }
}
