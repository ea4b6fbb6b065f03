//! Shared counters for the worker pool.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-local pipeline metrics, updated by every worker.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_processing_ms: AtomicU64,
    last_processed_at: RwLock<Option<DateTime<Utc>>>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration: Duration) {
        self.record(duration);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.record(duration);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        *self
            .last_processed_at
            .write()
            .expect("metrics lock poisoned") = Some(Utc::now());
    }

    /// Consistent-enough snapshot for the control surface.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total_processing_ms = self.total_processing_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            processed,
            succeeded,
            failed,
            total_processing_ms,
            average_processing_ms: if processed > 0 {
                total_processing_ms as f64 / processed as f64
            } else {
                0.0
            },
            success_rate: if processed > 0 {
                succeeded as f64 / processed as f64
            } else {
                1.0
            },
            last_processed_at: *self
                .last_processed_at
                .read()
                .expect("metrics lock poisoned"),
        }
    }
}

/// Point-in-time view of [`WorkerMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_processing_ms: u64,
    pub average_processing_ms: f64,
    pub success_rate: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}
