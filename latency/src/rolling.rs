use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    start: Instant,
    sum: f64,
    count: u64,
}

/// Time-bucketed counter over a sliding window.
///
/// Values older than `bucket_width * num_buckets` fall out of every sum.
/// Writers and readers both prune, so an idle window decays to zero without
/// a background task.
#[derive(Debug)]
pub struct RollingWindow {
    bucket_width: Duration,
    num_buckets: usize,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl RollingWindow {
    pub fn new(bucket_width: Duration, num_buckets: usize) -> Self {
        debug_assert!(num_buckets > 0);

        Self {
            bucket_width,
            num_buckets,
            buckets: Mutex::new(VecDeque::with_capacity(num_buckets + 1)),
        }
    }

    /// window covering the last `span`, split into one-second buckets
    pub fn with_span(span: Duration) -> Self {
        let num_buckets = span.as_secs().max(1) as usize;

        Self::new(Duration::from_secs(1), num_buckets)
    }

    pub fn add(&self, value: f64) {
        let now = Instant::now();

        let mut buckets = self.buckets.lock();

        match buckets.back_mut() {
            Some(bucket) if now.duration_since(bucket.start) < self.bucket_width => {
                bucket.sum += value;
                bucket.count += 1;
            }
            _ => {
                buckets.push_back(Bucket {
                    start: now,
                    sum: value,
                    count: 1,
                });
            }
        }

        Self::prune(&mut buckets, now, self.bucket_width, self.num_buckets);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1.0);
    }

    pub fn sum(&self) -> f64 {
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        Self::prune(&mut buckets, now, self.bucket_width, self.num_buckets);

        buckets.iter().map(|b| b.sum).sum()
    }

    pub fn count(&self) -> u64 {
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        Self::prune(&mut buckets, now, self.bucket_width, self.num_buckets);

        buckets.iter().map(|b| b.count).sum()
    }

    /// mean of all values currently inside the window. 0.0 when empty
    pub fn avg(&self) -> f64 {
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        Self::prune(&mut buckets, now, self.bucket_width, self.num_buckets);

        let count: u64 = buckets.iter().map(|b| b.count).sum();

        if count == 0 {
            return 0.0;
        }

        let sum: f64 = buckets.iter().map(|b| b.sum).sum();

        sum / count as f64
    }

    fn prune(buckets: &mut VecDeque<Bucket>, now: Instant, width: Duration, num_buckets: usize) {
        let span = width * num_buckets as u32;

        while let Some(front) = buckets.front() {
            if now.duration_since(front.start) > span {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn values_expire_as_the_window_slides() {
        let window = RollingWindow::new(Duration::from_secs(1), 10);

        window.add(5.0);
        window.add(7.0);

        assert_eq!(window.sum(), 12.0);
        assert_eq!(window.count(), 2);
        assert_eq!(window.avg(), 6.0);

        advance(Duration::from_secs(5)).await;

        window.add(3.0);
        assert_eq!(window.sum(), 15.0);

        advance(Duration::from_secs(6)).await;

        // the first two buckets are now outside the window
        assert_eq!(window.sum(), 3.0);
        assert_eq!(window.count(), 1);

        advance(Duration::from_secs(11)).await;

        assert_eq!(window.sum(), 0.0);
        assert_eq!(window.avg(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_bucket_accumulates() {
        let window = RollingWindow::with_span(Duration::from_secs(30));

        for _ in 0..10 {
            window.incr();
        }

        assert_eq!(window.count(), 10);
        assert_eq!(window.sum(), 10.0);
    }
}
