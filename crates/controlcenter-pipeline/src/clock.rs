use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use time::OffsetDateTime;

/// Source of wall-clock time for everything that reasons about log time
/// against "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn sleep(
        &self,
        duration: Duration,
    ) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn sleep(
        &self,
        duration: Duration,
    ) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock. `sleep` advances the time instead of waiting.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<OffsetDateTime>,
}

impl FakeClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(
        &self,
        duration: Duration,
    ) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += duration;
    }

    pub fn set(
        &self,
        time: OffsetDateTime,
    ) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sleep(
        &self,
        duration: Duration,
    ) -> BoxFuture<'_, ()> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[tokio::test]
    async fn fake_clock_sleep_advances_time() {
        let clock = FakeClock::new(datetime!(2020-10-10 00:00:00 UTC));
        clock.sleep(Duration::from_secs(3)).await;
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), datetime!(2020-10-10 00:00:03.5 UTC));
    }
}
