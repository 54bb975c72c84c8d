// File: testing-framework/src/orchestrator/clock.rs
//
// Clock Abstraction
//
// The crash grace window, the recovery wait and the liveness poll all go
// through this trait. Production runs use `SystemClock`; tests inject a
// `PausedClock` on a paused tokio runtime so a 30 s recovery wait completes
// instantly and deterministically.

use std::future::Future;
use std::pin::Pin;
use tokio::time::{self, Duration, Instant};

/// Source of time for every scenario wait
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use pcn_testing_framework::orchestrator::{Clock, PausedClock};
///
/// #[tokio::test(start_paused = true)]
/// async fn recovery_wait_is_instant() {
///     let clock: Arc<dyn Clock> = Arc::new(PausedClock::new());
///     let start = clock.now();
///     clock.sleep(Duration::from_secs(30)).await;
///     assert_eq!(clock.now() - start, Duration::from_secs(30));
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Sleep for `d`
    ///
    /// On a paused runtime the sleep resolves as soon as every task is idle,
    /// with time auto-advanced by tokio.
    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Time elapsed since `start`
    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

/// Real time, backed by tokio's timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

/// Test clock for a paused tokio runtime
///
/// Requires `#[tokio::test(start_paused = true)]` (or a manual
/// `tokio::time::pause()`); `advance` panics on an unpaused runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct PausedClock;

impl PausedClock {
    /// Create a paused clock
    pub fn new() -> Self {
        Self
    }

    /// Move time forward by `d`, firing every timer that expires on the way
    pub async fn advance(&self, d: Duration) {
        time::advance(d).await;
    }
}

impl Clock for PausedClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_advance() {
        let clock = PausedClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(3)).await;
        assert_eq!(clock.elapsed_since(start), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_sized_sleep_is_instant() {
        let clock: Arc<dyn Clock> = Arc::new(PausedClock::new());
        let wall = std::time::Instant::now();
        let start = clock.now();

        clock.sleep(Duration::from_secs(30)).await;

        assert_eq!(clock.elapsed_since(start), Duration::from_secs(30));
        assert!(wall.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_pending_until_advanced() {
        let clock = PausedClock::new();
        let mut sleep = clock.sleep(Duration::from_millis(500));

        clock.advance(Duration::from_millis(499)).await;
        assert!(futures::poll!(sleep.as_mut()).is_pending());

        clock.advance(Duration::from_millis(1)).await;
        assert!(futures::poll!(sleep.as_mut()).is_ready());
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(10)).await;
        assert!(clock.elapsed_since(start) >= Duration::from_millis(10));
    }
}
