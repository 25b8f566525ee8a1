//! NodeContext for a running node: tokio timers, system clock.

use crate::NodeContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Production context.
///
/// Wall-clock time is read once at construction and then advanced by the
/// monotonic clock, so timestamps issued by one node never go backwards
/// when the system clock is stepped.
pub struct TokioContext {
    started: Instant,
    started_at: SystemTime,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Wall-clock time at which this context was created.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.started_at + self.started.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_advances_monotonic_clock() {
        let ctx = TokioContext::new();
        let before = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        assert!(ctx.now() - before >= Duration::from_millis(10));
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let ctx = TokioContext::new();
        let mut last = ctx.unix_millis();
        for _ in 0..1000 {
            let next = ctx.unix_millis();
            assert!(next >= last);
            last = next;
        }
        assert!(ctx.system_time() >= ctx.started_at());
        // Anything after 2020-01-01
        assert!(last > 1_577_836_800_000);
    }

    #[test]
    fn test_production_is_unseeded() {
        assert_eq!(TokioContext::shared().seed(), 0);
    }
}
