//! Connection health state machine.
//!
//! Each subscription key moves through
//! `Disconnected -> Connecting -> Connected`, dropping to
//! `Retrying { attempt }` on failure and to `CircuitOpen` once
//! `max_retries` is spent. Only an explicit reconnect leaves
//! `CircuitOpen`. The monitor also owns the shared [`CircuitBreaker`] and
//! the idle-channel health check.

use crate::breaker::CircuitBreaker;
use crate::config::{BreakerConfig, HealthConfig, RetryConfig};
use crate::key::SubscriptionKey;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Retrying { attempt: u32 },
    Connected,
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Nothing,
    /// Channels are up but silent; the idle reconnect loop was armed.
    StaleDetected,
    /// The idle reconnect loop is due for a sweep.
    Reconnect,
}

impl RetryConfig {
    /// `min(base * growth^(attempt - 1), stagger_max_delay)` for 1-based attempts.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = self.stagger_max_delay;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);

        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Offset of the `index`-th channel in a mass reconnect.
    pub fn stagger_delay(&self, index: usize) -> Duration {
        let steps = u32::try_from(index).unwrap_or(u32::MAX);
        self.stagger_interval
            .saturating_mul(steps)
            .min(self.stagger_max_delay)
    }
}

pub struct ConnectionMonitor {
    retry: RetryConfig,
    health: HealthConfig,
    breaker: CircuitBreaker,
    links: HashMap<SubscriptionKey, LinkState>,
    last_activity: Instant,
    idle_reconnect_at: Option<Instant>,
}

impl ConnectionMonitor {
    pub fn new(retry: RetryConfig, breaker: BreakerConfig, health: HealthConfig) -> Self {
        Self {
            retry,
            health,
            breaker: CircuitBreaker::new(breaker),
            links: HashMap::new(),
            last_activity: Instant::now(),
            idle_reconnect_at: None,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.breaker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn track(&mut self, key: &SubscriptionKey) {
        self.links
            .entry(key.clone())
            .or_insert(LinkState::Disconnected);
    }

    pub fn forget(&mut self, key: &SubscriptionKey) {
        self.links.remove(key);
    }

    pub fn state(&self, key: &SubscriptionKey) -> Option<LinkState> {
        self.links.get(key).copied()
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.idle_reconnect_at = None;
    }

    /// An attempt was issued. A retrying key keeps its attempt number.
    pub fn on_connecting(&mut self, key: &SubscriptionKey) {
        if let Some(state) = self.links.get_mut(key) {
            if !matches!(state, LinkState::Retrying { .. }) {
                *state = LinkState::Connecting;
            }
        }
    }

    /// Returns `true` when the key was recovering from failures.
    pub fn on_connected(&mut self, key: &SubscriptionKey) -> bool {
        self.breaker.record_success();
        match self.links.get_mut(key) {
            Some(state) => {
                let recovered = matches!(state, LinkState::Retrying { .. });
                *state = LinkState::Connected;
                recovered
            }
            None => false,
        }
    }

    /// Decide what follows a failed or dropped attempt, given how many
    /// retries the key has already used.
    pub fn on_failure(&mut self, key: &SubscriptionKey, retries_used: u32) -> FailureDecision {
        let decision = if retries_used < self.retry.max_retries {
            let attempt = retries_used + 1;
            FailureDecision::Retry {
                attempt,
                delay: self.retry.backoff_delay(attempt),
            }
        } else {
            FailureDecision::Exhausted {
                attempts: retries_used,
            }
        };

        if let Some(state) = self.links.get_mut(key) {
            *state = match decision {
                FailureDecision::Retry { attempt, .. } => LinkState::Retrying { attempt },
                FailureDecision::Exhausted { .. } => LinkState::CircuitOpen,
            };
        }

        decision
    }

    /// Explicit reconnect: leaves `CircuitOpen` and starts over.
    pub fn on_manual_reconnect(&mut self, key: &SubscriptionKey) {
        if let Some(state) = self.links.get_mut(key) {
            *state = LinkState::Connecting;
        }
    }

    pub fn exhausted_keys(&self) -> Vec<SubscriptionKey> {
        self.links
            .iter()
            .filter(|(_, state)| **state == LinkState::CircuitOpen)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Connected iff at least one key is tracked and all of them are up.
    pub fn aggregate_connected(&self) -> bool {
        !self.links.is_empty()
            && self
                .links
                .values()
                .all(|state| *state == LinkState::Connected)
    }

    /// A change event arrived. Disarms the idle reconnect loop.
    pub fn record_activity(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        self.idle_reconnect_at.take().is_some()
    }

    pub fn idle_loop_active(&self) -> bool {
        self.idle_reconnect_at.is_some()
    }

    pub fn health_tick(&mut self, now: Instant) -> HealthAction {
        if !self.aggregate_connected() {
            return HealthAction::Nothing;
        }

        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for < self.health.event_timeout {
            return HealthAction::Nothing;
        }

        match self.idle_reconnect_at {
            None => {
                self.idle_reconnect_at = Some(now + self.health.idle_reconnect_interval);
                HealthAction::StaleDetected
            }
            Some(due) if now >= due => {
                self.idle_reconnect_at = Some(now + self.health.idle_reconnect_interval);
                HealthAction::Reconnect
            }
            Some(_) => HealthAction::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::EventFilter;

    fn key(table: &str) -> SubscriptionKey {
        SubscriptionKey::table(table, EventFilter::All, None)
    }

    fn monitor() -> ConnectionMonitor {
        ConnectionMonitor::new(
            RetryConfig::default(),
            BreakerConfig::default(),
            HealthConfig::default(),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig::default().with_stagger(Duration::from_millis(250), Duration::from_secs(10));

        assert_eq!(retry.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(retry.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(retry.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(retry.backoff_delay(5), Duration::from_secs(10));

        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let delay = retry.backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
    }

    #[test]
    fn test_stagger_offsets_are_capped() {
        let retry = RetryConfig::default().with_stagger(Duration::from_millis(250), Duration::from_secs(1));
        assert_eq!(retry.stagger_delay(0), Duration::ZERO);
        assert_eq!(retry.stagger_delay(3), Duration::from_millis(750));
        assert_eq!(retry.stagger_delay(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_exhausted() {
        let mut monitor = monitor();
        let k = key("missions");
        monitor.track(&k);
        monitor.on_connecting(&k);
        assert_eq!(monitor.state(&k), Some(LinkState::Connecting));

        for used in 0..5 {
            match monitor.on_failure(&k, used) {
                FailureDecision::Retry { attempt, .. } => assert_eq!(attempt, used + 1),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(monitor.state(&k), Some(LinkState::Retrying { attempt: 5 }));

        assert_eq!(
            monitor.on_failure(&k, 5),
            FailureDecision::Exhausted { attempts: 5 }
        );
        assert_eq!(monitor.state(&k), Some(LinkState::CircuitOpen));
        assert_eq!(monitor.exhausted_keys(), vec![k.clone()]);

        monitor.on_manual_reconnect(&k);
        assert!(monitor.on_connected(&k) == false);
        assert_eq!(monitor.state(&k), Some(LinkState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_is_reported() {
        let mut monitor = monitor();
        let k = key("missions");
        monitor.track(&k);
        monitor.on_failure(&k, 0);
        assert!(monitor.on_connected(&k));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_requires_every_key() {
        let mut monitor = monitor();
        assert!(!monitor.aggregate_connected());

        let a = key("missions");
        let b = key("reservations");
        monitor.track(&a);
        monitor.track(&b);
        monitor.on_connected(&a);
        assert!(!monitor.aggregate_connected());

        monitor.on_connected(&b);
        assert!(monitor.aggregate_connected());

        monitor.forget(&b);
        assert!(monitor.aggregate_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channels_arm_reconnect_loop() {
        let health = HealthConfig::default()
            .with_event_timeout(Duration::from_secs(120))
            .with_idle_reconnect_interval(Duration::from_secs(300));
        let mut monitor =
            ConnectionMonitor::new(RetryConfig::default(), BreakerConfig::default(), health);
        let k = key("missions");
        monitor.track(&k);
        monitor.on_connected(&k);

        let t0 = Instant::now();
        assert_eq!(monitor.health_tick(t0 + Duration::from_secs(60)), HealthAction::Nothing);
        assert_eq!(
            monitor.health_tick(t0 + Duration::from_secs(121)),
            HealthAction::StaleDetected
        );
        assert!(monitor.idle_loop_active());
        assert_eq!(monitor.health_tick(t0 + Duration::from_secs(200)), HealthAction::Nothing);
        assert_eq!(
            monitor.health_tick(t0 + Duration::from_secs(421)),
            HealthAction::Reconnect
        );

        assert!(monitor.record_activity(t0 + Duration::from_secs(430)));
        assert!(!monitor.idle_loop_active());
        assert_eq!(monitor.health_tick(t0 + Duration::from_secs(460)), HealthAction::Nothing);
    }
}
