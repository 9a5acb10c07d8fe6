// Harness metrics
//
// Invariant: every accepted submission lands in exactly one status counter, and
// workspaces_created == workspaces_destroyed once the dispatcher is idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::types::ExecutionStatus;

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can go up or down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency histogram with fixed buckets (upper bounds in seconds)
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new_latency() -> Self {
        let bounds = vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
        let buckets = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} histogram\n"));
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            out.push_str(&format!(
                "{name}_bucket{{le=\"{bound}\"}} {}\n",
                bucket.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        out.push_str(&format!(
            "{name}_sum {}\n",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        out.push_str(&format!("{name}_count {}\n", self.count()));
    }
}

/// Counters owned by one dispatcher
#[derive(Debug)]
pub struct HarnessMetrics {
    pub submissions_accepted: Counter,
    pub submissions_rejected: Counter,
    pub queue_timeouts: Counter,

    pub status_success: Counter,
    pub status_build_failed: Counter,
    pub status_runtime_error: Counter,
    pub status_timed_out: Counter,
    pub status_resource_exceeded: Counter,
    pub status_startup_failed: Counter,
    pub status_internal_error: Counter,

    pub forced_kills: Counter,
    pub workspaces_created: Counter,
    pub workspaces_destroyed: Counter,
    pub cleanup_deferred: Counter,
    pub cleanup_abandoned: Counter,

    pub queued: Gauge,
    pub running: Gauge,

    pub queue_wait: Histogram,
    pub execution_latency: Histogram,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submissions_accepted: u64,
    pub submissions_rejected: u64,
    pub queue_timeouts: u64,
    pub completed: u64,
    pub forced_kills: u64,
    pub workspaces_created: u64,
    pub workspaces_destroyed: u64,
    pub cleanup_deferred: u64,
    pub cleanup_abandoned: u64,
    pub queued: u64,
    pub running: u64,
}

impl HarnessMetrics {
    pub fn new() -> Self {
        Self {
            submissions_accepted: Counter::new(),
            submissions_rejected: Counter::new(),
            queue_timeouts: Counter::new(),
            status_success: Counter::new(),
            status_build_failed: Counter::new(),
            status_runtime_error: Counter::new(),
            status_timed_out: Counter::new(),
            status_resource_exceeded: Counter::new(),
            status_startup_failed: Counter::new(),
            status_internal_error: Counter::new(),
            forced_kills: Counter::new(),
            workspaces_created: Counter::new(),
            workspaces_destroyed: Counter::new(),
            cleanup_deferred: Counter::new(),
            cleanup_abandoned: Counter::new(),
            queued: Gauge::new(),
            running: Gauge::new(),
            queue_wait: Histogram::new_latency(),
            execution_latency: Histogram::new_latency(),
        }
    }

    fn status_counter(&self, status: ExecutionStatus) -> &Counter {
        match status {
            ExecutionStatus::Success => &self.status_success,
            ExecutionStatus::BuildFailed => &self.status_build_failed,
            ExecutionStatus::RuntimeError => &self.status_runtime_error,
            ExecutionStatus::TimedOut => &self.status_timed_out,
            ExecutionStatus::ResourceExceeded => &self.status_resource_exceeded,
            ExecutionStatus::SandboxStartupFailed => &self.status_startup_failed,
            ExecutionStatus::InternalError => &self.status_internal_error,
        }
    }

    pub fn record_status(&self, status: ExecutionStatus) {
        self.status_counter(status).inc();
    }

    pub fn status_count(&self, status: ExecutionStatus) -> u64 {
        self.status_counter(status).get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        const ALL: [ExecutionStatus; 7] = [
            ExecutionStatus::Success,
            ExecutionStatus::BuildFailed,
            ExecutionStatus::RuntimeError,
            ExecutionStatus::TimedOut,
            ExecutionStatus::ResourceExceeded,
            ExecutionStatus::SandboxStartupFailed,
            ExecutionStatus::InternalError,
        ];
        MetricsSnapshot {
            submissions_accepted: self.submissions_accepted.get(),
            submissions_rejected: self.submissions_rejected.get(),
            queue_timeouts: self.queue_timeouts.get(),
            completed: ALL.iter().map(|s| self.status_count(*s)).sum(),
            forced_kills: self.forced_kills.get(),
            workspaces_created: self.workspaces_created.get(),
            workspaces_destroyed: self.workspaces_destroyed.get(),
            cleanup_deferred: self.cleanup_deferred.get(),
            cleanup_abandoned: self.cleanup_abandoned.get(),
            queued: self.queued.get(),
            running: self.running.get(),
        }
    }

    /// Prometheus text exposition
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("runbox_submissions_accepted_total", "Submissions accepted", &self.submissions_accepted),
            ("runbox_submissions_rejected_total", "Submissions rejected at admission", &self.submissions_rejected),
            ("runbox_queue_timeouts_total", "Submissions whose deadline expired in the queue", &self.queue_timeouts),
            ("runbox_forced_kills_total", "Sandboxes terminated by the limiter", &self.forced_kills),
            ("runbox_workspaces_created_total", "Workspaces created", &self.workspaces_created),
            ("runbox_workspaces_destroyed_total", "Workspaces destroyed", &self.workspaces_destroyed),
            ("runbox_cleanup_deferred_total", "Workspace removals handed to the janitor", &self.cleanup_deferred),
            ("runbox_cleanup_abandoned_total", "Workspace removals given up on", &self.cleanup_abandoned),
        ];
        for (name, help, counter) in counters {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n", counter.get()));
        }

        out.push_str("# HELP runbox_results_total Results by status\n");
        out.push_str("# TYPE runbox_results_total counter\n");
        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::BuildFailed,
            ExecutionStatus::RuntimeError,
            ExecutionStatus::TimedOut,
            ExecutionStatus::ResourceExceeded,
            ExecutionStatus::SandboxStartupFailed,
            ExecutionStatus::InternalError,
        ] {
            out.push_str(&format!(
                "runbox_results_total{{status=\"{}\"}} {}\n",
                status,
                self.status_count(status)
            ));
        }

        out.push_str("# HELP runbox_sandboxes Sandboxes by state\n");
        out.push_str("# TYPE runbox_sandboxes gauge\n");
        out.push_str(&format!("runbox_sandboxes{{state=\"queued\"}} {}\n", self.queued.get()));
        out.push_str(&format!("runbox_sandboxes{{state=\"running\"}} {}\n", self.running.get()));

        self.queue_wait
            .render("runbox_queue_wait_seconds", "Time spent waiting for a slot", &mut out);
        self.execution_latency
            .render("runbox_execution_seconds", "Acceptance to result latency", &mut out);
        out
    }
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counters() {
        let metrics = HarnessMetrics::new();
        metrics.record_status(ExecutionStatus::Success);
        metrics.record_status(ExecutionStatus::Success);
        metrics.record_status(ExecutionStatus::TimedOut);
        assert_eq!(metrics.status_count(ExecutionStatus::Success), 2);
        assert_eq!(metrics.snapshot().completed, 3);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_latency();
        histogram.observe(Duration::from_millis(3));
        histogram.observe(Duration::from_millis(700));
        let mut out = String::new();
        histogram.render("h", "test", &mut out);
        assert!(out.contains("h_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("h_bucket{le=\"1\"} 2"));
        assert!(out.contains("h_count 2"));
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = HarnessMetrics::new();
        metrics.submissions_accepted.inc();
        metrics.record_status(ExecutionStatus::ResourceExceeded);
        let text = metrics.export_prometheus();
        assert!(text.contains("runbox_submissions_accepted_total 1"));
        assert!(text.contains("runbox_results_total{status=\"resource_exceeded\"} 1"));
        assert!(text.contains("# TYPE runbox_queue_wait_seconds histogram"));
    }
}
