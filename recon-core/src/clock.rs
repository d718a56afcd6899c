//! Time abstraction used by the scheduler, workers and adapters.
//!
//! Every timeout, backoff and grace period in the runtime goes through a
//! [`Clock`], so tests can drive simulated time with [`ManualClock`] instead of
//! waiting on the wall clock.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Boxed sleep future returned by [`Clock::sleep`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send>>;

pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Monotonic instant used for deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock timestamp recorded on jobs, findings and events.
    fn utc_now(&self) -> DateTime<Utc>;

    /// Completes once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Production clock backed by tokio timers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug)]
struct ManualTimer {
    deadline: Instant,
    waker: Option<Waker>,
}

#[derive(Debug)]
struct ManualState {
    instant: Instant,
    utc: DateTime<Utc>,
    timers: BTreeMap<u64, ManualTimer>,
    next_timer_id: u64,
    sleep_log: Vec<Duration>,
}

/// Simulated clock. Time only moves when [`ManualClock::advance`] or
/// [`ManualClock::advance_to_next_timer`] is called; sleeping futures are woken
/// as their deadlines pass.
#[derive(Clone, Debug)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                instant: Instant::now(),
                utc: start,
                timers: BTreeMap::new(),
                next_timer_id: 0,
                sleep_log: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves time forward and wakes every timer whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        let wakers = {
            let mut state = self.lock();
            state.instant += duration;
            if let Ok(delta) = chrono::Duration::from_std(duration)
                && let Some(next) = state.utc.checked_add_signed(delta)
            {
                state.utc = next;
            }
            let now = state.instant;

            let expired: Vec<u64> = state
                .timers
                .iter()
                .filter(|(_, timer)| timer.deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            expired
                .into_iter()
                .filter_map(|id| state.timers.remove(&id).and_then(|timer| timer.waker))
                .collect::<Vec<_>>()
        };

        for waker in wakers {
            waker.wake();
        }
    }

    /// Advances to the earliest pending deadline, returning how far time moved.
    pub fn advance_to_next_timer(&self) -> Option<Duration> {
        let step = {
            let state = self.lock();
            let next = state.timers.values().map(|timer| timer.deadline).min()?;
            next.saturating_duration_since(state.instant)
        };
        self.advance(step);
        Some(step)
    }

    /// Number of sleeps currently waiting on this clock.
    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Every duration passed to [`Clock::sleep`], in call order.
    pub fn sleep_log(&self) -> Vec<Duration> {
        self.lock().sleep_log.clone()
    }

    /// Simulated time elapsed since `since`.
    pub fn elapsed_since(&self, since: Instant) -> Duration {
        self.lock().instant.saturating_duration_since(since)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.lock().instant
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.lock().utc
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let deadline = {
            let mut state = self.lock();
            state.sleep_log.push(duration);
            state.instant + duration
        };
        Box::pin(ManualSleep {
            clock: self.clone(),
            deadline,
            timer_id: None,
        })
    }
}

struct ManualSleep {
    clock: ManualClock,
    deadline: Instant,
    timer_id: Option<u64>,
}

impl Future for ManualSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut state = this.clock.lock();

        if state.instant >= this.deadline {
            if let Some(id) = this.timer_id.take() {
                state.timers.remove(&id);
            }
            return Poll::Ready(());
        }

        match this.timer_id {
            Some(id) => {
                if let Some(timer) = state.timers.get_mut(&id) {
                    timer.waker = Some(cx.waker().clone());
                }
            }
            None => {
                let id = state.next_timer_id;
                state.next_timer_id += 1;
                state.timers.insert(
                    id,
                    ManualTimer {
                        deadline: this.deadline,
                        waker: Some(cx.waker().clone()),
                    },
                );
                this.timer_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for ManualSleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer_id.take() {
            self.clock.lock().timers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn manual_sleep_fires_only_after_advance() {
        let clock = ManualClock::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let sleeper = clock.clone();
        let hits = Arc::clone(&counter);
        let handle = tokio::spawn(async move {
            sleeper.sleep(Duration::from_secs(5)).await;
            hits.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(clock.pending_timers(), 1);

        clock.advance(Duration::from_millis(4_999));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(1));
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test]
    async fn advance_to_next_timer_steps_through_deadlines() {
        let clock = ManualClock::new();
        for secs in [10, 5, 15] {
            let sleeper = clock.clone();
            tokio::spawn(async move {
                sleeper.sleep(Duration::from_secs(secs)).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(clock.pending_timers(), 3);

        assert_eq!(clock.advance_to_next_timer(), Some(Duration::from_secs(5)));
        assert_eq!(clock.pending_timers(), 2);
        assert_eq!(clock.advance_to_next_timer(), Some(Duration::from_secs(5)));
        assert_eq!(clock.advance_to_next_timer(), Some(Duration::from_secs(5)));
        assert_eq!(clock.advance_to_next_timer(), None);

        let mut requested = clock.sleep_log();
        requested.sort();
        assert_eq!(
            requested,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15)
            ]
        );
    }

    #[tokio::test]
    async fn dropped_sleep_unregisters_timer() {
        let clock = ManualClock::new();
        let result = tokio::time::timeout(
            Duration::from_millis(10),
            clock.sleep(Duration::from_secs(60)),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn utc_tracks_advances() {
        let start = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::starting_at(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.utc_now(), start + chrono::Duration::seconds(90));
    }
}
