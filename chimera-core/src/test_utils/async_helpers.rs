//! Async test helpers
//!
//! A short timeout constant and helpers for stepping paused tokio time.

use tokio::time::Duration;

/// Short timeout for tests that should fail fast (100ms)
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Step size used by [`advance`]
const STEP: Duration = Duration::from_millis(100);

/// Advance paused time by `total`, letting spawned tasks run at every step
///
/// A single `time::advance` would fire each interval once even when the
/// jump spans several periods, and spawned fetch tasks would not get polled
/// between ticks.
pub async fn advance(total: Duration) {
    let mut remaining = total;
    while !remaining.is_zero() {
        let step = remaining.min(STEP);
        tokio::time::advance(step).await;
        settle().await;
        remaining -= step;
    }
}

/// Yield enough times for freshly spawned tasks to run to their next await
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_advance_fires_each_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            interval.tick().await;
            loop {
                interval.tick().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        settle().await;

        advance(Duration::from_secs(2)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        task.abort();
    }
}
