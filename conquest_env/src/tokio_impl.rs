//! Production implementations backed by Tokio.

use crate::location::{LocationSignal, LocationSource};
use crate::ConquestContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex};

/// Production context backed by Tokio and the system clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConquestContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }


    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

/// Location source fed through a Tokio channel.
///
/// The platform callback holds the sender; the runtime drains the receiver.
/// The single receiver serializes fixes in arrival order.
pub struct ChannelLocationSource {
    receiver: Mutex<mpsc::Receiver<LocationSignal>>,
}

impl ChannelLocationSource {
    /// Creates a source and the sender half the platform callback uses.
    pub fn channel(capacity: usize) -> (mpsc::Sender<LocationSignal>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                receiver: Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl LocationSource for ChannelLocationSource {
    async fn next_signal(&self) -> Option<LocationSignal> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, PathPoint};

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
        assert!(ctx.unix_millis() > 0);
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }

    #[tokio::test]
    async fn test_channel_source_preserves_order() {
        let (tx, source) = ChannelLocationSource::channel(8);
        let coord = Coordinate::new(1.0, 2.0).unwrap();

        tx.send(LocationSignal::Fix(PathPoint::new(coord, 1, 5.0))).await.unwrap();
        tx.send(LocationSignal::PermissionDenied).await.unwrap();
        tx.send(LocationSignal::Fix(PathPoint::new(coord, 2, 5.0))).await.unwrap();
        drop(tx);

        match source.next_signal().await {
            Some(LocationSignal::Fix(p)) => assert_eq!(p.timestamp_ms, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(source.next_signal().await, Some(LocationSignal::PermissionDenied));
        match source.next_signal().await {
            Some(LocationSignal::Fix(p)) => assert_eq!(p.timestamp_ms, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(source.next_signal().await, None);
    }
}
