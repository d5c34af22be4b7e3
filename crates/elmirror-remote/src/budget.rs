use crate::RemoteError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Process-wide outbound request budget.
///
/// A fixed window: at most `limit` requests per `window`, fully replenished
/// when the window rolls over. Share it between runs with an `Arc` so a
/// server doing periodic syncs never exceeds the upstream quota.
#[derive(Debug)]
pub struct RateBudget {
    limit: Option<u32>,
    window: Duration,
    state: Mutex<Window>,
    rolled: Condvar,
    consumed: AtomicU64,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

impl RateBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: Some(limit),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
            rolled: Condvar::new(),
            consumed: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: None,
            ..Self::new(0, Duration::ZERO)
        }
    }

    /// Take one unit, blocking until the window rolls over if none is left.
    ///
    /// Returns `BudgetExhausted` without waiting when the next replenishment
    /// would land after `deadline`.
    pub fn acquire(&self, deadline: Option<Instant>) -> Result<(), RemoteError> {
        let Some(limit) = self.limit else {
            self.consumed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let mut state = self.lock();
        loop {
            let now = Instant::now();
            if now >= state.started + self.window {
                state.started = now;
                state.used = 0;
                self.rolled.notify_all();
            }
            if state.used < limit {
                state.used += 1;
                self.consumed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let next = state.started + self.window;
            if deadline.is_some_and(|d| next > d) {
                return Err(RemoteError::BudgetExhausted);
            }
            debug!(
                "request budget spent, waiting {:?} for the next window",
                next - now
            );
            state = self
                .rolled
                .wait_timeout(state, next - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Total units handed out over the budget's lifetime.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Units left in the current window; `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        let limit = self.limit?;
        let state = self.lock();
        if Instant::now() >= state.started + self.window {
            return Some(limit);
        }
        Some(limit.saturating_sub(state.used))
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
