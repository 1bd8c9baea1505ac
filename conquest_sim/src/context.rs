//! Simulation context implementing ConquestContext for deterministic runs.

use async_trait::async_trait;
use conquest_env::ConquestContext;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2024-01-01 00:00:00 UTC, virtual time zero.
pub const SIM_EPOCH_MS: i64 = 1_704_067_200_000;

/// Simulation context backed by a virtual clock.
///
/// - The clock only moves when advanced (by `sleep`, the scripted
///   location source, or the scenario itself)
/// - Clones share the same clock
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Milliseconds since `SIM_EPOCH_MS`
    virtual_time_ms: Arc<Mutex<i64>>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ms: Arc::new(Mutex::new(0)),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    fn clock(&self) -> MutexGuard<'_, i64> {
        self.virtual_time_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        *self.clock() += duration.as_millis() as i64;
    }

    /// Moves the clock forward to `unix_ms`; never moves it back.
    pub fn advance_to(&self, unix_ms: i64) {
        let mut time = self.clock();
        *time = (*time).max(unix_ms - SIM_EPOCH_MS);
    }

    /// Milliseconds of virtual time elapsed.
    pub fn elapsed_ms(&self) -> i64 {
        *self.clock()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ms: Arc::clone(&self.virtual_time_ms),
        }
    }
}

#[async_trait]
impl ConquestContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms().max(0) as u64)
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(SIM_EPOCH_MS as u64) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Virtual time jumps; yield so other tasks observe the new time
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }


    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);
        assert_eq!(ctx.unix_millis(), SIM_EPOCH_MS);

        ctx.advance_time(Duration::from_secs(1));
        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.unix_millis(), SIM_EPOCH_MS + 1500);
    }

    #[test]
    fn test_advance_to_never_rewinds() {
        let ctx = SimContext::new(1);
        ctx.advance_to(SIM_EPOCH_MS + 10_000);
        ctx.advance_to(SIM_EPOCH_MS + 5_000);
        assert_eq!(ctx.elapsed_ms(), 10_000);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();
        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
        assert_eq!(ctx2.seed(), 42);
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_clock() {
        let ctx = SimContext::new(7);
        ctx.sleep(Duration::from_secs(3600)).await;
        assert_eq!(ctx.now(), Duration::from_secs(3600));
    }
}
