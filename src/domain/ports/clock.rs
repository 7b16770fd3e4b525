//! Clock abstraction so time-driven components (Capacity Monitor,
//! Scheduler poll loop, `resumeAfter` gate) can be driven deterministically
//! in tests instead of calling `Utc::now()` directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend until the given wall-clock instant (or return immediately
    /// if it is already past).
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Production clock: real wall-clock time, real sleeps.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let now = Utc::now();
        if deadline > now {
            let dur = (deadline - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(dur).await;
        }
    }
}

/// Test clock: wall-clock time is whatever `advance()` last set it to.
/// Sleepers are woken by a shared `Notify` each time the clock moves, so
/// scenarios like "advance to 18:00:01Z" in §8 run without real delay.
#[derive(Clone)]
pub struct VirtualClock {
    now: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
    notify: std::sync::Arc<tokio::sync::Notify>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(start)),
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
        self.notify.notify_waiters();
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let next = *self.now.lock().unwrap() + delta;
        self.set(next);
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        loop {
            if self.now() >= deadline {
                return;
            }
            self.notify.notified().await;
        }
    }
}
