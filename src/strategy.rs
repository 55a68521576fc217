//! Reconnect strategy: whether to retry, and after how long.
//!
//! [`ReconnectStrategy`] is a pure function of its immutable
//! [`ReconnectStrategyConfig`], the attempt number and the [`EnvSignals`]
//! observed when the connection dropped. It holds no mutable state and can be
//! shared freely.

use std::time::Duration;

use rand::Rng;

/// Close code the backend uses when a second login for the same user kicks
/// this session.
pub const CLOSE_CODE_DUPLICATE_LOGIN: u16 = 4001;

/// RFC 6455 policy-violation close code.
pub const CLOSE_CODE_POLICY_VIOLATION: u16 = 1008;

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.2;

/// Exponents beyond this already overflow any representable delay.
const MAX_EXPONENT: u32 = 1024;

/// Configuration for the reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectStrategyConfig {
    /// Highest attempt number that may still be retried.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Relative jitter, e.g. `0.2` for ±20%. Clamped to `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectStrategyConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl ReconnectStrategyConfig {
    /// Config with the given backoff parameters and the default jitter.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_factor,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Set the relative jitter. `0.0` makes every delay deterministic.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

/// Environment observed when deciding whether to reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvSignals {
    /// The host page/window is not visible.
    pub is_page_hidden: bool,
    /// The host reports no network.
    pub is_offline: bool,
    /// WebSocket close code of the dropped connection, if one was received.
    pub close_code: Option<u16>,
    /// How long the dropped connection had been up.
    pub connection_duration: Duration,
}

/// Why the strategy declined to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The attempt number exceeds `max_attempts`.
    Exhausted,
    /// No network; the online signal will trigger a new attempt.
    Offline,
    /// The page is hidden; becoming visible will trigger a new attempt.
    Hidden,
}

/// Outcome of [`ReconnectStrategy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry after `delay`.
    Retry {
        /// Jittered delay before the attempt.
        delay: Duration,
    },
    /// Do not retry automatically.
    GiveUp(GiveUpReason),
    /// The connection was terminated by a duplicate-login kick.
    Kicked,
}

/// Exponential backoff policy with a ceiling and an attempt cap.
#[derive(Debug, Clone, Default)]
pub struct ReconnectStrategy {
    config: ReconnectStrategyConfig,
}

impl ReconnectStrategy {
    /// Create a strategy from its configuration.
    pub fn new(config: ReconnectStrategyConfig) -> Self {
        Self { config }
    }

    /// The configuration this strategy was built with.
    pub fn config(&self) -> &ReconnectStrategyConfig {
        &self.config
    }

    /// Returns `true` if a close code means the server deliberately ended the
    /// session and retrying would only get kicked again.
    pub fn is_kick_code(code: u16) -> bool {
        matches!(code, CLOSE_CODE_DUPLICATE_LOGIN | CLOSE_CODE_POLICY_VIOLATION)
    }

    /// Whether attempt number `attempt` (1-based) should be made at all.
    pub fn should_reconnect(&self, attempt: u32, env: &EnvSignals) -> bool {
        self.give_up_reason(attempt, env).is_none()
            && !env.close_code.is_some_and(Self::is_kick_code)
    }

    /// Deterministic delay before attempt number `attempt` (1-based):
    /// `min(base_delay * backoff_factor^(attempt-1), max_delay)`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let factor = self.config.backoff_factor.max(0.0);
        // `exponent` is at most MAX_EXPONENT, which fits an i32.
        let scale = factor.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let secs = self.config.base_delay.as_secs_f64() * scale;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// [`compute_delay`](Self::compute_delay) spread uniformly over
    /// `[d * (1 - jitter), d * (1 + jitter)]`, still capped at `max_delay`.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.compute_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(delay.as_secs_f64() * scale)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Full decision for attempt number `attempt`, using the thread-local RNG
    /// for jitter.
    pub fn decide(&self, attempt: u32, env: &EnvSignals) -> ReconnectDecision {
        if env.close_code.is_some_and(Self::is_kick_code) {
            return ReconnectDecision::Kicked;
        }
        match self.give_up_reason(attempt, env) {
            Some(reason) => ReconnectDecision::GiveUp(reason),
            None => ReconnectDecision::Retry {
                delay: self.jittered_delay(attempt, &mut rand::rng()),
            },
        }
    }

    fn give_up_reason(&self, attempt: u32, env: &EnvSignals) -> Option<GiveUpReason> {
        if attempt > self.config.max_attempts {
            Some(GiveUpReason::Exhausted)
        } else if env.is_offline {
            Some(GiveUpReason::Offline)
        } else if env.is_page_hidden {
            Some(GiveUpReason::Hidden)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn three_attempt_strategy() -> ReconnectStrategy {
        ReconnectStrategy::new(ReconnectStrategyConfig::new(
            3,
            Duration::from_millis(1000),
            Duration::from_millis(8000),
            2.0,
        ))
    }

    #[test]
    fn three_attempt_backoff_delays() {
        let s = three_attempt_strategy();
        assert_eq!(s.compute_delay(1), Duration::from_millis(1000));
        assert_eq!(s.compute_delay(2), Duration::from_millis(2000));
        assert_eq!(s.compute_delay(3), Duration::from_millis(4000));
        assert_eq!(s.compute_delay(4), Duration::from_millis(8000));
        assert!(!s.should_reconnect(4, &EnvSignals::default()));
        assert!(s.should_reconnect(3, &EnvSignals::default()));
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let s = ReconnectStrategy::default();
        let max = s.config().max_attempts;
        let mut last = Duration::ZERO;
        for attempt in 1..=max {
            let d = s.compute_delay(attempt);
            let expected = Duration::from_secs(1 << (attempt - 1)).min(Duration::from_secs(60));
            assert_eq!(d, expected, "attempt {attempt}");
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_max() {
        let s = ReconnectStrategy::default();
        assert_eq!(s.compute_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let s = three_attempt_strategy();
        assert_eq!(s.compute_delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn offline_never_reconnects() {
        let s = ReconnectStrategy::default();
        let env = EnvSignals {
            is_offline: true,
            ..EnvSignals::default()
        };
        for attempt in 1..=s.config().max_attempts {
            assert!(!s.should_reconnect(attempt, &env));
        }
        assert_eq!(s.decide(1, &env), ReconnectDecision::GiveUp(GiveUpReason::Offline));
    }

    #[test]
    fn attempt_past_ceiling_never_reconnects() {
        let s = ReconnectStrategy::default();
        let n = s.config().max_attempts + 1;
        for env in [
            EnvSignals::default(),
            EnvSignals {
                is_page_hidden: true,
                ..EnvSignals::default()
            },
            EnvSignals {
                close_code: Some(1006),
                connection_duration: Duration::from_secs(3600),
                ..EnvSignals::default()
            },
        ] {
            assert!(!s.should_reconnect(n, &env));
        }
        assert_eq!(
            s.decide(n, &EnvSignals::default()),
            ReconnectDecision::GiveUp(GiveUpReason::Exhausted)
        );
    }

    #[test]
    fn hidden_page_defers_reconnect() {
        let s = ReconnectStrategy::default();
        let env = EnvSignals {
            is_page_hidden: true,
            ..EnvSignals::default()
        };
        assert_eq!(s.decide(1, &env), ReconnectDecision::GiveUp(GiveUpReason::Hidden));
    }

    #[test]
    fn kick_codes_are_not_retried() {
        let s = ReconnectStrategy::default();
        for code in [CLOSE_CODE_DUPLICATE_LOGIN, CLOSE_CODE_POLICY_VIOLATION] {
            let env = EnvSignals {
                close_code: Some(code),
                ..EnvSignals::default()
            };
            assert!(!s.should_reconnect(1, &env));
            assert_eq!(s.decide(1, &env), ReconnectDecision::Kicked);
        }
        let abnormal = EnvSignals {
            close_code: Some(1006),
            ..EnvSignals::default()
        };
        assert!(s.should_reconnect(1, &abnormal));
    }

    #[test]
    fn jitter_stays_in_band() {
        let s = ReconnectStrategy::default();
        let mut rng = rand::rng();
        for attempt in 1..=10 {
            let base = s.compute_delay(attempt);
            let low = base.mul_f64(0.8);
            let high = base.mul_f64(1.2).min(Duration::from_secs(60));
            for _ in 0..50 {
                let d = s.jittered_delay(attempt, &mut rng);
                assert!(d >= low.saturating_sub(Duration::from_millis(1)), "{d:?} < {low:?}");
                assert!(d <= high, "{d:?} > {high:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let s = ReconnectStrategy::new(ReconnectStrategyConfig::default().with_jitter(0.0));
        match s.decide(3, &EnvSignals::default()) {
            ReconnectDecision::Retry { delay } => assert_eq!(delay, Duration::from_secs(4)),
            other => panic!("expected Retry, got {other:?}"),
        }
    }
}
