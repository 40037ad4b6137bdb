//! Cache metrics.

use metrics::{counter, histogram};
use std::time::Duration;

/// Cache metrics collector, labelled by driver.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    driver: &'static str,
}

impl CacheMetrics {
    /// Create a new metrics collector for a cache driver.
    pub const fn new(driver: &'static str) -> Self {
        Self { driver }
    }

    /// Record a cache hit.
    pub fn record_hit(&self, method: &str) {
        counter!("proxyd_cache_hits_total", "driver" => self.driver, "method" => method.to_string())
            .increment(1);
    }

    /// Record a cache miss.
    pub fn record_miss(&self, method: &str) {
        counter!(
            "proxyd_cache_misses_total",
            "driver" => self.driver,
            "method" => method.to_string()
        )
        .increment(1);
    }

    /// Record a stored entry.
    pub fn record_put(&self, method: &str) {
        counter!("proxyd_cache_puts_total", "driver" => self.driver, "method" => method.to_string())
            .increment(1);
    }

    /// Record a driver error.
    pub fn record_error(&self) {
        counter!("proxyd_cache_errors_total", "driver" => self.driver).increment(1);
    }

    /// Record entries dropped by a shallow flush.
    pub fn record_flush(&self, entries: u64) {
        counter!("proxyd_cache_flushed_entries_total", "driver" => self.driver).increment(entries);
    }

    /// Record the duration of a driver lookup.
    pub fn record_get_duration(&self, duration: Duration) {
        histogram!("proxyd_cache_get_duration_seconds", "driver" => self.driver)
            .record(duration.as_secs_f64());
    }
}
