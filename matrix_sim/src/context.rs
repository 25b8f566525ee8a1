//! Simulation context implementing NodeContext for deterministic runs.

use async_trait::async_trait;
use matrix_env::NodeContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by deterministic time and RNG.
///
/// - A virtual clock that only moves when advanced
/// - A seeded ChaCha8 RNG shared by everything in the run
/// - Simulated sleep that advances virtual time
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    pub fn set_time(&self, time_ns: u64) {
        *self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner) = time_ns;
    }

    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the run's RNG.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl NodeContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping in simulation is just advancing the clock.
        self.advance_time(duration);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_unix_millis_follows_virtual_clock() {
        let ctx = SimContext::new(1);
        assert_eq!(ctx.unix_millis(), 1_704_067_200_000);
        ctx.advance_time(Duration::from_millis(250));
        assert_eq!(ctx.unix_millis(), 1_704_067_200_250);
    }

    #[test]
    fn test_rng_is_seeded() {
        let a: Vec<u32> = {
            let ctx = SimContext::new(7);
            (0..4).map(|_| ctx.with_rng(|r| r.gen())).collect()
        };
        let b: Vec<u32> = {
            let ctx = SimContext::new(7);
            (0..4).map(|_| ctx.with_rng(|r| r.gen())).collect()
        };
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_sleep_advances_time() {
        let ctx = SimContext::new(3);
        ctx.sleep(Duration::from_secs(2)).await;
        assert_eq!(ctx.now(), Duration::from_secs(2));
        assert_eq!(ctx.seed(), 3);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();
        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
    }
}
