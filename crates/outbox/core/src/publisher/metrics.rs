//! Publisher counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of processing one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub processed: usize,
    pub published: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl ProcessResult {
    pub fn empty() -> Self {
        Self {
            processed: 0,
            published: 0,
            failed: 0,
            duration: Duration::ZERO,
        }
    }

    /// Share of processed messages that were published; 1.0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            1.0
        } else {
            self.published as f64 / self.processed as f64
        }
    }
}

/// Cumulative counters since the publisher started.
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    processed: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    fetch_errors: AtomicU64,
    update_errors: AtomicU64,
    last_batch_duration_ms: AtomicU64,
}

impl PublisherMetrics {
    pub fn record_batch(&self, result: &ProcessResult) {
        self.processed
            .fetch_add(result.processed as u64, Ordering::Relaxed);
        self.published
            .fetch_add(result.published as u64, Ordering::Relaxed);
        self.failed.fetch_add(result.failed as u64, Ordering::Relaxed);
        self.last_batch_duration_ms
            .store(result.duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_error(&self) {
        self.update_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            update_errors: self.update_errors.load(Ordering::Relaxed),
            last_batch_duration: Duration::from_millis(
                self.last_batch_duration_ms.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Point-in-time copy of [`PublisherMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub published: u64,
    pub failed: u64,
    pub fetch_errors: u64,
    pub update_errors: u64,
    pub last_batch_duration: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} published={} failed={} fetch_errors={} update_errors={} last_batch={}ms",
            self.processed,
            self.published,
            self.failed,
            self.fetch_errors,
            self.update_errors,
            self.last_batch_duration.as_millis()
        )
    }
}
