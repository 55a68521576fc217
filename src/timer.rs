//! Named timers.
//!
//! [`TimerManager`] keeps one tokio task per named timer so callers can clear
//! timers by name instead of holding on to handles. Re-registering a name
//! replaces the previous timer; dropping the manager aborts everything.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

/// Shortest period accepted by [`TimerManager::set_interval`].
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Registry of named one-shot and repeating timers.
///
/// Must be used from within a tokio runtime; every timer is a spawned task.
#[derive(Debug, Default)]
pub struct TimerManager {
    timers: HashMap<String, JoinHandle<()>>,
}

impl TimerManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once after `delay`, replacing any timer named `name`.
    pub fn set_timeout<F>(&mut self, name: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        self.clear(&name);
        trace!(timer = %name, ?delay, "timeout armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        self.timers.insert(name, handle);
    }

    /// Run `callback` every `period`, first after one full period, replacing
    /// any timer named `name`.
    pub fn set_interval<F>(&mut self, name: impl Into<String>, period: Duration, mut callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        self.clear(&name);
        let period = period.max(MIN_INTERVAL);
        trace!(timer = %name, ?period, "interval armed");
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });
        self.timers.insert(name, handle);
    }

    /// Cancel and forget the timer named `name`. Returns `false` if there was none.
    pub fn clear(&mut self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some(handle) => {
                handle.abort();
                trace!(timer = %name, "timer cleared");
                true
            }
            None => false,
        }
    }

    /// Cancel and forget every timer.
    pub fn clear_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Returns `true` if a timer named `name` is registered and has not
    /// finished (a fired one-shot counts as finished).
    pub fn is_active(&self, name: &str) -> bool {
        self.timers
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of registered timers that have not finished.
    pub fn active_count(&self) -> usize {
        self.timers
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.clear_all();
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnMut() + Send>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let make = {
            let hits = Arc::clone(&hits);
            move || {
                let hits = Arc::clone(&hits);
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn FnMut() + Send>
            }
        };
        (hits, make)
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once() {
        let (hits, make) = counter();
        let mut timers = TimerManager::new();
        let mut cb = make();
        timers.set_timeout("once", Duration::from_secs(1), move || cb());

        assert!(timers.is_active("once"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.is_active("once"));
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_replaces_previous_timer() {
        let (first_hits, make_first) = counter();
        let (second_hits, make_second) = counter();
        let mut timers = TimerManager::new();

        let mut first = make_first();
        timers.set_interval("tick", Duration::from_secs(1), move || first());
        let mut second = make_second();
        timers.set_interval("tick", Duration::from_secs(1), move || second());
        assert_eq!(timers.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 3);

        assert!(timers.clear("tick"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(second_hits.load(Ordering::SeqCst), 3);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_waits_one_period_before_first_fire() {
        let (hits, make) = counter();
        let mut timers = TimerManager::new();
        let mut cb = make();
        timers.set_interval("beat", Duration::from_secs(60), move || cb());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_unknown_name_is_noop() {
        let mut timers = TimerManager::new();
        assert!(!timers.clear("missing"));
        timers.clear_all();
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_and_drop_stop_everything() {
        let (hits, make) = counter();
        let mut timers = TimerManager::new();
        for name in ["a", "b", "c"] {
            let mut cb = make();
            timers.set_interval(name, Duration::from_secs(1), move || cb());
        }
        assert_eq!(timers.active_count(), 3);
        timers.clear_all();
        assert_eq!(timers.active_count(), 0);

        let mut cb = make();
        timers.set_timeout("late", Duration::from_secs(1), move || cb());
        drop(timers);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
