//! Lock-free publisher counters and periodic reporting
//!
//! All atomics use Relaxed ordering: these are statistical counters only
//! and are never used for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector
pub struct Metrics {
    /// Samples received from the sensor source (monotonic)
    samples_total: AtomicU64,
    /// Samples rejected for non-finite lat/lon (monotonic)
    samples_rejected: AtomicU64,
    /// Messages handed to the broker directly (monotonic)
    published_total: AtomicU64,
    /// Messages published since last report (reset on report)
    published_since_report: AtomicU64,
    /// Messages put into the offline queue (monotonic)
    queued_total: AtomicU64,
    /// Oldest messages dropped on queue overflow (monotonic)
    queue_dropped: AtomicU64,
    /// Queued messages published by a drain (monotonic)
    drained_total: AtomicU64,
    /// Direct publish attempts that failed or timed out (monotonic)
    publish_failures: AtomicU64,
    /// Session id rotations (monotonic)
    session_rotations: AtomicU64,
    /// Successful broker connections, initial included (monotonic)
    connections_total: AtomicU64,
    /// Current offline queue depth (snapshot)
    queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_total: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            published_total: AtomicU64::new(0),
            published_since_report: AtomicU64::new(0),
            queued_total: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            drained_total: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            session_rotations: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample(&self) {
        self.samples_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_rejected(&self) {
        self.samples_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_published(&self) {
        self.published_total.fetch_add(1, Ordering::Relaxed);
        self.published_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queued(&self) {
        self.queued_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_dropped(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_drained(&self, count: u64) {
        self.drained_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_rotation(&self) {
        self.session_rotations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn samples_total(&self) -> u64 {
        self.samples_total.load(Ordering::Relaxed)
    }

    pub fn samples_rejected(&self) -> u64 {
        self.samples_rejected.load(Ordering::Relaxed)
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    pub fn queued_total(&self) -> u64 {
        self.queued_total.load(Ordering::Relaxed)
    }

    pub fn queue_dropped(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }

    pub fn drained_total(&self) -> u64 {
        self.drained_total.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn session_rotations(&self) -> u64 {
        self.session_rotations.load(Ordering::Relaxed)
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Snapshot all counters, resetting only the per-report publish count
    pub fn report(&self) -> MetricsSummary {
        let published_count = self.published_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let publish_per_sec = if elapsed.as_secs_f64() > 0.0 {
            published_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            samples_total: self.samples_total(),
            samples_rejected: self.samples_rejected(),
            published_total: self.published_total(),
            publish_per_sec,
            queued_total: self.queued_total(),
            queue_dropped: self.queue_dropped(),
            drained_total: self.drained_total(),
            publish_failures: self.publish_failures(),
            session_rotations: self.session_rotations(),
            connections_total: self.connections_total(),
            queue_depth: self.queue_depth(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub samples_total: u64,
    pub samples_rejected: u64,
    pub published_total: u64,
    /// Direct publishes per second since the previous report
    pub publish_per_sec: f64,
    pub queued_total: u64,
    pub queue_dropped: u64,
    pub drained_total: u64,
    pub publish_failures: u64,
    pub session_rotations: u64,
    pub connections_total: u64,
    pub queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_total,
            samples_rejected = %self.samples_rejected,
            published_total = %self.published_total,
            publish_per_sec = format!("{:.1}", self.publish_per_sec),
            queued_total = %self.queued_total,
            queue_dropped = %self.queue_dropped,
            drained_total = %self.drained_total,
            publish_failures = %self.publish_failures,
            session_rotations = %self.session_rotations,
            connections = %self.connections_total,
            queue_depth = %self.queue_depth,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.published_total(), 0);
        assert_eq!(metrics.queued_total(), 0);
        assert_eq!(metrics.queue_depth(), 0);
    }

    #[test]
    fn test_record_counters() {
        let metrics = Metrics::new();
        metrics.record_sample();
        metrics.record_sample();
        metrics.record_published();
        metrics.record_queued();
        metrics.record_queue_dropped();
        metrics.record_drained(3);
        metrics.record_drained(2);
        metrics.set_queue_depth(7);

        assert_eq!(metrics.samples_total(), 2);
        assert_eq!(metrics.published_total(), 1);
        assert_eq!(metrics.queued_total(), 1);
        assert_eq!(metrics.queue_dropped(), 1);
        assert_eq!(metrics.drained_total(), 5);
        assert_eq!(metrics.queue_depth(), 7);
    }

    #[test]
    fn test_report_resets_periodic_only() {
        let metrics = Metrics::new();
        metrics.record_published();
        metrics.record_published();
        metrics.record_session_rotation();

        let summary = metrics.report();
        assert_eq!(summary.published_total, 2);
        assert_eq!(summary.session_rotations, 1);
        assert_eq!(metrics.published_since_report.load(Ordering::Relaxed), 0);

        // Monotonic counters survive the report
        let summary = metrics.report();
        assert_eq!(summary.published_total, 2);
        assert_eq!(summary.publish_per_sec, 0.0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_queued();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.queued_total(), 8_000);
    }
}
