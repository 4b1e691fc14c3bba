use portable_atomic::{AtomicF32, Ordering};
use serde::ser::Serializer;
use serde::Serialize;
use tokio::time::Duration;

/// Exponentially weighted moving average of request latency, in milliseconds.
#[derive(Debug)]
pub struct EwmaLatency {
    ewma_ms: AtomicF32,
    /// weight of the most recent sample. 0 < alpha <= 1
    alpha: f32,
}

impl EwmaLatency {
    pub fn new(alpha: f32, start_ms: f32) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha));

        Self {
            ewma_ms: AtomicF32::new(start_ms),
            alpha,
        }
    }

    #[inline]
    pub fn record(&self, duration: Duration) {
        self.record_ms(duration.as_secs_f32() * 1000.0);
    }

    pub fn record_ms(&self, ms: f32) {
        // a CAS loop. precision lost to racing writers doesn't matter here
        self.ewma_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(old + self.alpha * (ms - old))
            })
            .ok();
    }

    /// the current average, in milliseconds
    #[inline]
    pub fn value(&self) -> f32 {
        self.ewma_ms.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f32(self.value().max(0.0) / 1000.0)
    }
}

impl Default for EwmaLatency {
    fn default() -> Self {
        // weigh the last ~10 samples
        Self::new(0.1, 0.0)
    }
}

impl Serialize for EwmaLatency {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f32(self.value())
    }
}
