//! Bucketed sliding windows used for backend health and zero-height tracking.

use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// A sum and count of samples observed over the trailing `length` of time.
///
/// Samples are grouped into fixed-size buckets so memory stays bounded no matter how many samples
/// are added.
#[derive(Debug)]
pub struct SlidingWindow {
    epoch: Instant,
    bucket_size: Duration,
    num_buckets: u64,
    buckets: Mutex<VecDeque<Bucket>>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    slot: u64,
    sum: f64,
    count: u64,
}

impl SlidingWindow {
    /// Creates a window of the given length split into `num_buckets` buckets.
    pub fn new(length: Duration, num_buckets: u32) -> Self {
        let num_buckets = num_buckets.max(1);
        Self {
            epoch: Instant::now(),
            bucket_size: (length / num_buckets).max(Duration::from_millis(1)),
            num_buckets: num_buckets as u64,
            buckets: Mutex::new(VecDeque::with_capacity(num_buckets as usize)),
        }
    }

    /// Creates a window with one-second buckets.
    pub fn with_length(length: Duration) -> Self {
        Self::new(length, length.as_secs().clamp(1, 600) as u32)
    }

    /// Adds a sample.
    pub fn add(&self, value: f64) {
        self.add_at(Instant::now(), value)
    }

    /// Adds a sample with value one.
    pub fn incr(&self) {
        self.add(1.0)
    }

    /// Sum of the samples in the window.
    pub fn sum(&self) -> f64 {
        self.sum_at(Instant::now())
    }

    /// Number of samples in the window.
    pub fn count(&self) -> u64 {
        self.count_at(Instant::now())
    }

    /// Average of the samples in the window, zero if there are none.
    pub fn avg(&self) -> f64 {
        let now = Instant::now();
        let count = self.count_at(now);
        if count == 0 { 0.0 } else { self.sum_at(now) / count as f64 }
    }

    /// Drops all samples.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    pub(crate) fn add_at(&self, now: Instant, value: f64) {
        let slot = self.slot(now);
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, slot);
        match buckets.back_mut() {
            Some(bucket) if bucket.slot == slot => {
                bucket.sum += value;
                bucket.count += 1;
            }
            _ => buckets.push_back(Bucket { slot, sum: value, count: 1 }),
        }
    }

    pub(crate) fn sum_at(&self, now: Instant) -> f64 {
        let slot = self.slot(now);
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, slot);
        buckets.iter().map(|bucket| bucket.sum).sum()
    }

    pub(crate) fn count_at(&self, now: Instant) -> u64 {
        let slot = self.slot(now);
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, slot);
        buckets.iter().map(|bucket| bucket.count).sum()
    }

    fn slot(&self, now: Instant) -> u64 {
        (now.saturating_duration_since(self.epoch).as_nanos() / self.bucket_size.as_nanos()) as u64
    }

    fn evict(&self, buckets: &mut VecDeque<Bucket>, slot: u64) {
        while buckets.front().is_some_and(|bucket| bucket.slot + self.num_buckets <= slot) {
            buckets.pop_front();
        }
    }
}
