//! Reconnect scheduling.
//!
//! [`ReconnectManager`] turns a [`ReconnectStrategy`] decision into at most
//! one pending timer on a [`TimerManager`]. When the timer fires it calls the
//! callback registered with [`ReconnectManager::on_reconnect`]. A kick is
//! reported through the context's `on_kicked` callback instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::strategy::{EnvSignals, GiveUpReason, ReconnectDecision, ReconnectStrategy};
use crate::timer::TimerManager;

/// Name of the reconnect timer in the [`TimerManager`].
pub const RECONNECT_TIMER: &str = "reconnect";

type ReconnectCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Inputs for one scheduling decision.
pub struct ReconnectContext {
    /// Environment observed when the connection dropped.
    pub env: EnvSignals,
    on_kicked: Option<Box<dyn FnOnce() + Send>>,
}

impl ReconnectContext {
    /// Context without a kick callback.
    pub fn new(env: EnvSignals) -> Self {
        Self {
            env,
            on_kicked: None,
        }
    }

    /// Run `callback` instead of reconnecting if the drop was a kick.
    #[must_use]
    pub fn on_kicked(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_kicked = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ReconnectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectContext")
            .field("env", &self.env)
            .field("has_on_kicked", &self.on_kicked.is_some())
            .finish()
    }
}

/// What [`ReconnectManager::schedule_reconnect`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A timer is armed for `attempt`, firing after `delay`.
    Scheduled {
        /// Attempt number passed to the callback.
        attempt: u32,
        /// Delay until the callback runs.
        delay: Duration,
    },
    /// Nothing armed.
    GaveUp(GiveUpReason),
    /// Nothing armed; `on_kicked` was invoked.
    Kicked,
}

/// Owns the single pending reconnect timer.
pub struct ReconnectManager {
    strategy: ReconnectStrategy,
    callback: Option<ReconnectCallback>,
    pending: Option<u32>,
}

impl fmt::Debug for ReconnectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectManager")
            .field("strategy", &self.strategy)
            .field("has_callback", &self.callback.is_some())
            .field("pending", &self.pending)
            .finish()
    }
}

impl ReconnectManager {
    /// Manager using `strategy`, with no callback registered yet.
    pub fn new(strategy: ReconnectStrategy) -> Self {
        Self {
            strategy,
            callback: None,
            pending: None,
        }
    }

    /// The strategy consulted for every decision.
    pub fn strategy(&self) -> &ReconnectStrategy {
        &self.strategy
    }

    /// Register the callback run when a scheduled attempt is due. It receives
    /// the attempt number. Replaces any previous callback.
    pub fn on_reconnect(&mut self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.callback = Some(Arc::new(callback));
    }

    /// Decide about attempt number `attempt` and arm the timer if the
    /// strategy says to retry. Any previously pending attempt is replaced.
    pub fn schedule_reconnect(
        &mut self,
        timers: &mut TimerManager,
        attempt: u32,
        context: ReconnectContext,
    ) -> ScheduleOutcome {
        match self.strategy.decide(attempt, &context.env) {
            ReconnectDecision::Kicked => {
                self.cancel(timers);
                warn!(close_code = ?context.env.close_code, "session kicked, not reconnecting");
                if let Some(on_kicked) = context.on_kicked {
                    on_kicked();
                }
                ScheduleOutcome::Kicked
            }
            ReconnectDecision::GiveUp(reason) => {
                self.cancel(timers);
                info!(attempt, ?reason, "not scheduling reconnect");
                ScheduleOutcome::GaveUp(reason)
            }
            ReconnectDecision::Retry { delay } => {
                let callback = self.callback.clone();
                timers.set_timeout(RECONNECT_TIMER, delay, move || match callback {
                    Some(callback) => callback(attempt),
                    None => warn!(attempt, "reconnect due but no callback registered"),
                });
                self.pending = Some(attempt);
                info!(attempt, ?delay, "reconnect scheduled");
                ScheduleOutcome::Scheduled { attempt, delay }
            }
        }
    }

    /// Drop the pending attempt, if any. Idempotent.
    pub fn cancel(&mut self, timers: &mut TimerManager) {
        if timers.clear(RECONNECT_TIMER) {
            debug!(attempt = ?self.pending, "pending reconnect cancelled");
        }
        self.pending = None;
    }

    /// The attempt whose timer is still waiting to fire.
    pub fn pending_attempt(&self, timers: &TimerManager) -> Option<u32> {
        self.pending
            .filter(|_| timers.is_active(RECONNECT_TIMER))
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
    use crate::strategy::{ReconnectStrategyConfig, CLOSE_CODE_DUPLICATE_LOGIN};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    fn manager() -> (ReconnectManager, Arc<StdMutex<Vec<u32>>>) {
        let config = ReconnectStrategyConfig::new(
            3,
            Duration::from_secs(1),
            Duration::from_secs(8),
            2.0,
        )
        .with_jitter(0.0);
        let mut manager = ReconnectManager::new(ReconnectStrategy::new(config));
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        manager.on_reconnect(move |attempt| sink.lock().unwrap().push(attempt));
        (manager, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_attempt_fires_after_delay() {
        let (mut manager, fired) = manager();
        let mut timers = TimerManager::new();

        let outcome =
            manager.schedule_reconnect(&mut timers, 2, ReconnectContext::new(EnvSignals::default()));
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(manager.pending_attempt(&timers), Some(2));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(fired.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.lock().unwrap().as_slice(), &[2]);
        assert_eq!(manager.pending_attempt(&timers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_attempt() {
        let (mut manager, fired) = manager();
        let mut timers = TimerManager::new();
        let env = EnvSignals::default();

        manager.schedule_reconnect(&mut timers, 3, ReconnectContext::new(env));
        manager.schedule_reconnect(&mut timers, 1, ReconnectContext::new(env));
        assert_eq!(timers.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.lock().unwrap().as_slice(), &[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (mut manager, fired) = manager();
        let mut timers = TimerManager::new();

        manager.cancel(&mut timers);
        manager.schedule_reconnect(&mut timers, 1, ReconnectContext::new(EnvSignals::default()));
        manager.cancel(&mut timers);
        manager.cancel(&mut timers);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn kick_invokes_side_channel_instead_of_timer() {
        let (mut manager, fired) = manager();
        let mut timers = TimerManager::new();
        let kicked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&kicked);

        let env = EnvSignals {
            close_code: Some(CLOSE_CODE_DUPLICATE_LOGIN),
            ..EnvSignals::default()
        };
        let outcome = manager.schedule_reconnect(
            &mut timers,
            1,
            ReconnectContext::new(env).on_kicked(move || flag.store(true, Ordering::SeqCst)),
        );

        assert_eq!(outcome, ScheduleOutcome::Kicked);
        assert!(kicked.load(Ordering::SeqCst));
        assert_eq!(timers.active_count(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_arm_nothing() {
        let (mut manager, _fired) = manager();
        let mut timers = TimerManager::new();
        let outcome =
            manager.schedule_reconnect(&mut timers, 4, ReconnectContext::new(EnvSignals::default()));
        assert_eq!(outcome, ScheduleOutcome::GaveUp(GiveUpReason::Exhausted));
        assert_eq!(timers.active_count(), 0);
    }
}
