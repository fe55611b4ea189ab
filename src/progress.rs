//! Progress Monitor: live per-run counters and ETA.
//!
//! Tracks in-flight task/token counters and an EMA-smoothed throughput
//! estimate, optionally exposing them as Prometheus gauges for a
//! run-scoped metrics registry.

use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time snapshot of a run's progress.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_in_flight: u64,
    pub tokens_consumed: u64,
    /// Exponential moving average of completions per second.
    pub throughput_ema: f64,
    /// Estimated seconds remaining, or `None` if throughput is zero or
    /// the total is unknown.
    pub eta_secs: Option<f64>,
}

struct EmaState {
    value: f64,
    last_sample_at: Instant,
    last_completed: u64,
}

/// Tracks progress for one run and optionally exports it via Prometheus.
pub struct ProgressMonitor {
    tasks_total: u64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_in_flight: AtomicU64,
    tokens_consumed: AtomicU64,
    ema: parking_lot::Mutex<EmaState>,
    metrics: Option<Metrics>,
}

struct Metrics {
    completed_gauge: IntGauge,
    failed_gauge: IntGauge,
    in_flight_gauge: IntGauge,
    tokens_counter: IntCounter,
}

/// EMA smoothing factor; higher weights recent samples more heavily.
const EMA_ALPHA: f64 = 0.3;

impl ProgressMonitor {
    #[must_use]
    pub fn new(tasks_total: u64) -> Self {
        Self {
            tasks_total,
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_in_flight: AtomicU64::new(0),
            tokens_consumed: AtomicU64::new(0),
            ema: parking_lot::Mutex::new(EmaState {
                value: 0.0,
                last_sample_at: Instant::now(),
                last_completed: 0,
            }),
            metrics: None,
        }
    }

    /// Same as [`ProgressMonitor::new`], additionally registering gauges
    /// on `registry` under the `storybench_*` namespace.
    pub fn with_registry(
        tasks_total: u64,
        registry: &Registry,
    ) -> prometheus::Result<Self> {
        let completed_gauge = IntGauge::new("storybench_tasks_completed", "completed tasks")?;
        let failed_gauge = IntGauge::new("storybench_tasks_failed", "failed tasks")?;
        let in_flight_gauge = IntGauge::new("storybench_tasks_in_flight", "in-flight tasks")?;
        let tokens_counter = IntCounter::new("storybench_tokens_consumed", "tokens consumed")?;

        registry.register(Box::new(completed_gauge.clone()))?;
        registry.register(Box::new(failed_gauge.clone()))?;
        registry.register(Box::new(in_flight_gauge.clone()))?;
        registry.register(Box::new(tokens_counter.clone()))?;

        let mut monitor = Self::new(tasks_total);
        monitor.metrics = Some(Metrics {
            completed_gauge,
            failed_gauge,
            in_flight_gauge,
            tokens_counter,
        });
        Ok(monitor)
    }

    pub fn task_started(&self) {
        self.tasks_in_flight.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.in_flight_gauge.inc();
        }
    }

    pub fn task_completed(&self, tokens: u64) {
        self.tasks_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.tokens_consumed.fetch_add(tokens, Ordering::SeqCst);
        self.update_ema();
        if let Some(metrics) = &self.metrics {
            metrics.in_flight_gauge.dec();
            metrics.completed_gauge.inc();
            metrics.tokens_counter.inc_by(tokens);
        }
    }

    pub fn task_failed(&self) {
        self.tasks_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.in_flight_gauge.dec();
            metrics.failed_gauge.inc();
        }
    }

    fn update_ema(&self) {
        let mut state = self.ema.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_sample_at).as_secs_f64();
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let delta = completed.saturating_sub(state.last_completed) as f64;

        if elapsed > 0.0 {
            let instantaneous_rate = delta / elapsed;
            state.value = EMA_ALPHA * instantaneous_rate + (1.0 - EMA_ALPHA) * state.value;
        }
        state.last_sample_at = now;
        state.last_completed = completed;
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let tasks_completed = self.tasks_completed.load(Ordering::SeqCst);
        let tasks_failed = self.tasks_failed.load(Ordering::SeqCst);
        let throughput_ema = self.ema.lock().value;
        let remaining = self
            .tasks_total
            .saturating_sub(tasks_completed)
            .saturating_sub(tasks_failed);
        let eta_secs = if throughput_ema > 0.0 {
            Some(remaining as f64 / throughput_ema)
        } else {
            None
        };

        ProgressSnapshot {
            tasks_total: self.tasks_total,
            tasks_completed,
            tasks_failed,
            tasks_in_flight: self.tasks_in_flight.load(Ordering::SeqCst),
            tokens_consumed: self.tokens_consumed.load(Ordering::SeqCst),
            throughput_ema,
            eta_secs,
        }
    }
}

/// Shared handle for passing one monitor across worker tasks.
pub type SharedProgressMonitor = Arc<ProgressMonitor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_completed_and_failed_independently() {
        let monitor = ProgressMonitor::new(10);
        monitor.task_started();
        monitor.task_completed(42);
        monitor.task_started();
        monitor.task_failed();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_in_flight, 0);
        assert_eq!(snapshot.tokens_consumed, 42);
    }

    #[test]
    fn eta_is_none_before_any_throughput_sample() {
        let monitor = ProgressMonitor::new(10);
        assert_eq!(monitor.snapshot().eta_secs, None);
    }

    #[test]
    fn registering_with_a_registry_exposes_prometheus_gauges() {
        let registry = Registry::new();
        let monitor = ProgressMonitor::with_registry(5, &registry).unwrap();
        monitor.task_started();
        monitor.task_completed(10);
        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "storybench_tasks_completed"));
    }
}
