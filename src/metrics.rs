//! Loop metrics for monitoring and observability.
//!
//! Each engine loop owns a [`LoopMetrics`] collector. The counters mirror the
//! ones a native loop exposes (iterations, events, events waiting, idle time)
//! and add per-trampoline and per-status completion counts.

use crate::error::Status;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of a loop's metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Loop iterations completed
    pub loop_count: u64,
    /// Events dispatched from the poll phase
    pub events: u64,
    /// Completions waiting when the last poll phase started
    pub events_waiting: u64,
    /// Time spent blocked in poll, in nanoseconds
    pub idle_time_ns: u64,
    /// Trampoline invocations by kind
    pub trampolines: HashMap<String, u64>,
    /// Request completions by status
    pub completions: HashMap<String, u64>,
}

impl MetricsSnapshot {
    /// Total trampoline invocations
    pub fn total_trampolines(&self) -> u64 {
        self.trampolines.values().sum()
    }
}

/// Metrics collector for one loop
#[derive(Debug, Default)]
pub struct LoopMetrics {
    loop_count: AtomicU64,
    events: AtomicU64,
    events_waiting: AtomicU64,
    idle_time_ns: AtomicU64,
    trampolines: parking_lot::Mutex<HashMap<&'static str, u64>>,
    completions: parking_lot::Mutex<HashMap<&'static str, u64>>,
}

impl LoopMetrics {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_iteration(&self) {
        self.loop_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_events(&self, count: usize) {
        self.events.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_events_waiting(&self, count: usize) {
        self.events_waiting.store(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_idle_time(&self, waited: Duration) {
        self.idle_time_ns
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_trampoline(&self, kind: &'static str) {
        *self.trampolines.lock().entry(kind).or_insert(0) += 1;
    }

    pub(crate) fn record_completion(&self, status: &Status) {
        let key = match status {
            Ok(()) => "ok",
            Err(e) => e.name(),
        };
        *self.completions.lock().entry(key).or_insert(0) += 1;
    }

    /// Loop iterations completed
    pub fn loop_count(&self) -> u64 {
        self.loop_count.load(Ordering::Relaxed)
    }

    /// Events dispatched from the poll phase
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Completions waiting when the last poll phase started
    pub fn events_waiting(&self) -> u64 {
        self.events_waiting.load(Ordering::Relaxed)
    }

    /// Time spent blocked in poll
    pub fn idle_time(&self) -> Duration {
        Duration::from_nanos(self.idle_time_ns.load(Ordering::Relaxed))
    }

    /// Invocations of one trampoline kind
    pub fn trampolines(&self, kind: &str) -> u64 {
        self.trampolines.lock().get(kind).copied().unwrap_or(0)
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            loop_count: self.loop_count(),
            events: self.events(),
            events_waiting: self.events_waiting(),
            idle_time_ns: self.idle_time_ns.load(Ordering::Relaxed),
            trampolines: self
                .trampolines
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            completions: self
                .completions
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.loop_count.store(0, Ordering::Relaxed);
        self.events.store(0, Ordering::Relaxed);
        self.events_waiting.store(0, Ordering::Relaxed);
        self.idle_time_ns.store(0, Ordering::Relaxed);
        self.trampolines.lock().clear();
        self.completions.lock().clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP nexus_loop_iterations_total Loop iterations\n");
        output.push_str("# TYPE nexus_loop_iterations_total counter\n");
        output.push_str(&format!("nexus_loop_iterations_total {}\n", snapshot.loop_count));

        output.push_str("\n# HELP nexus_loop_events_total Events dispatched from poll\n");
        output.push_str("# TYPE nexus_loop_events_total counter\n");
        output.push_str(&format!("nexus_loop_events_total {}\n", snapshot.events));

        output.push_str("\n# HELP nexus_loop_events_waiting Completions waiting at last poll\n");
        output.push_str("# TYPE nexus_loop_events_waiting gauge\n");
        output.push_str(&format!("nexus_loop_events_waiting {}\n", snapshot.events_waiting));

        output.push_str("\n# HELP nexus_loop_idle_time_ns Time blocked in poll\n");
        output.push_str("# TYPE nexus_loop_idle_time_ns counter\n");
        output.push_str(&format!("nexus_loop_idle_time_ns {}\n", snapshot.idle_time_ns));

        output.push_str("\n# HELP nexus_trampolines_total Trampoline invocations\n");
        output.push_str("# TYPE nexus_trampolines_total counter\n");
        let mut trampolines: Vec<_> = snapshot.trampolines.into_iter().collect();
        trampolines.sort();
        for (kind, count) in trampolines {
            output.push_str(&format!(
                "nexus_trampolines_total{{kind=\"{}\"}} {}\n",
                kind, count
            ));
        }

        output.push_str("\n# HELP nexus_completions_total Request completions by status\n");
        output.push_str("# TYPE nexus_completions_total counter\n");
        let mut completions: Vec<_> = snapshot.completions.into_iter().collect();
        completions.sort();
        for (status, count) in completions {
            output.push_str(&format!(
                "nexus_completions_total{{status=\"{}\"}} {}\n",
                status, count
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Errno;

    #[test]
    fn test_metrics_collector() {
        let metrics = LoopMetrics::new();
        metrics.record_iteration();
        metrics.record_iteration();
        metrics.record_events(3);
        metrics.record_trampoline("timer");
        metrics.record_trampoline("timer");
        metrics.record_completion(&Ok(()));
        metrics.record_completion(&Err(Errno::Canceled));

        assert_eq!(metrics.loop_count(), 2);
        assert_eq!(metrics.events(), 3);
        assert_eq!(metrics.trampolines("timer"), 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_trampolines(), 2);
        assert_eq!(snapshot.completions.get("ECANCELED"), Some(&1));
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = LoopMetrics::new();
        metrics.record_trampoline("close");
        metrics.add_idle_time(Duration::from_micros(5));

        let output = metrics.to_prometheus();
        assert!(output.contains("nexus_loop_iterations_total 0"));
        assert!(output.contains("nexus_trampolines_total{kind=\"close\"} 1"));
        assert!(output.contains("nexus_loop_idle_time_ns 5000"));
    }

    #[test]
    fn test_reset() {
        let metrics = LoopMetrics::new();
        metrics.record_events(4);
        metrics.set_events_waiting(2);
        metrics.reset();
        assert_eq!(metrics.events(), 0);
        assert_eq!(metrics.events_waiting(), 0);
        assert!(metrics.snapshot().trampolines.is_empty());
    }
}
