//! Clock abstraction for testable time-dependent logic
//!
//! Every suspension point of a migration (poll ticks, retry backoff, drain delay)
//! goes through [`Clock::sleep`]. Production code uses `SystemClock`, which
//! delegates to `chrono::Utc::now()` and `tokio::time::sleep`. Tests use
//! `MockClock`, whose `sleep` advances virtual time instantly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Trait for reading the current time and waiting
///
/// Injected via `Context` to allow tests to control time.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Production clock
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Time elapsed on `clock` since `start`, clamped at zero
pub fn elapsed_since(clock: &dyn Clock, start: DateTime<Utc>) -> Duration {
    clock
        .now()
        .signed_duration_since(start)
        .to_std()
        .unwrap_or_default()
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    sleeps: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
            sleeps: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("MockClock lock poisoned") = now;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("MockClock lock poisoned").clone()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .expect("MockClock lock poisoned")
            .push(duration);
        self.advance(chrono::Duration::from_std(duration).expect("sleep duration out of range"));
    }
}
