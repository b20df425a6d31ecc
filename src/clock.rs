use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use tokio::time::Instant;

/// Virtualizable time source. The engine never calls `tokio::time` directly
/// so that deadline multiplexing is deterministic under test.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;

    /// Resolves once `duration` has elapsed according to this clock.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Resolves once `deadline` has been reached according to this clock.
    /// Default impl in terms of `now`/`sleep` so implementors only need to
    /// provide those two primitives.
    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.sleep(deadline.saturating_duration_since(self.now()))
    }
}

/// Default clock: wall time via `tokio::time`, so tests that pause the
/// tokio runtime's clock (`#[tokio::test(start_paused = true)]`) get
/// deterministic election timing for free.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
