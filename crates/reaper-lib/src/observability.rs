//! Observability infrastructure for the reaper
//!
//! Provides:
//! - Prometheus metrics (cycle timings, pods observed, terminations, command failures)
//! - Structured logging of reaper events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for cycle duration (in seconds). Cycles are dominated
/// by external calls capped at 30s each.
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<ReaperMetricsInner> = OnceLock::new();

struct ReaperMetricsInner {
    cycles_total: IntCounter,
    cycle_errors_total: IntCounter,
    cycle_duration_seconds: Histogram,
    pods_observed: IntGauge,
    unknown_age_total: IntCounter,
    terminations_total: IntCounterVec,
    command_failures_total: IntCounter,
}

impl ReaperMetricsInner {
    fn new() -> Self {
        Self {
            cycles_total: register_int_counter!(
                "gpu_reaper_cycles_total",
                "Reconciliation cycles completed"
            )
            .expect("Failed to register cycles_total"),

            cycle_errors_total: register_int_counter!(
                "gpu_reaper_cycle_errors_total",
                "Reconciliation cycles that ended early with an error"
            )
            .expect("Failed to register cycle_errors_total"),

            cycle_duration_seconds: register_histogram!(
                "gpu_reaper_cycle_duration_seconds",
                "Wall time of one reconciliation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            pods_observed: register_int_gauge!(
                "gpu_reaper_pods_observed",
                "GPU pods found in non-excluded namespaces in the last cycle"
            )
            .expect("Failed to register pods_observed"),

            unknown_age_total: register_int_counter!(
                "gpu_reaper_unknown_age_total",
                "Pods skipped because their age could not be determined"
            )
            .expect("Failed to register unknown_age_total"),

            terminations_total: register_int_counter_vec!(
                "gpu_reaper_terminations_total",
                "Termination attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register terminations_total"),

            command_failures_total: register_int_counter!(
                "gpu_reaper_command_failures_total",
                "External commands that failed or timed out"
            )
            .expect("Failed to register command_failures_total"),
        }
    }
}

/// Handle to the process-wide reaper metrics. Clones share the same metrics.
#[derive(Clone)]
pub struct ReaperMetrics {
    _private: (),
}

impl Default for ReaperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaperMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ReaperMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ReaperMetricsInner {
        GLOBAL_METRICS.get_or_init(ReaperMetricsInner::new)
    }

    pub fn observe_cycle(&self, duration_secs: f64) {
        self.inner().cycles_total.inc();
        self.inner().cycle_duration_seconds.observe(duration_secs);
    }

    pub fn inc_cycle_errors(&self) {
        self.inner().cycle_errors_total.inc();
    }

    pub fn set_pods_observed(&self, count: i64) {
        self.inner().pods_observed.set(count);
    }

    pub fn inc_unknown_age(&self) {
        self.inner().unknown_age_total.inc();
    }

    pub fn record_termination(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .terminations_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_command_failures(&self) {
        self.inner().command_failures_total.inc();
    }

    /// Every registered metric in the Prometheus text exposition format
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Render a duration in hours the way operators read it:
/// minutes below an hour, hours below a day, days beyond.
pub fn format_duration(hours: f64) -> String {
    if hours < 1.0 {
        format!("{} minutes", (hours * 60.0) as i64)
    } else if hours < 24.0 {
        format!("{:.1} hours", hours)
    } else {
        format!("{:.1} days", hours / 24.0)
    }
}

/// An error and its sources on one line, outermost first
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Structured logger for reaper events
#[derive(Clone)]
pub struct StructuredLogger {
    mode: String,
}

impl StructuredLogger {
    pub fn new(mode: impl Into<String>) -> Self {
        Self { mode: mode.into() }
    }

    pub fn log_startup(&self, version: &str, interval_secs: u64, excluded_namespaces: &[&str]) {
        info!(
            event = "reaper_started",
            mode = %self.mode,
            version = %version,
            interval_secs = interval_secs,
            excluded_namespaces = %excluded_namespaces.join(", "),
            "Starting GPU notebook reaper"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "reaper_shutdown",
            mode = %self.mode,
            reason = %reason,
            "Shutting down gracefully"
        );
    }

    /// Per-pod status, logged every cycle whatever the decision
    pub fn log_pod_status(&self, pod: &str, namespace: &str, age_hours: f64, window: &str, remaining_hours: f64) {
        let (until_termination, overdue_by) = if remaining_hours > 0.0 {
            (Some(format_duration(remaining_hours)), None)
        } else {
            (None, Some(format_duration(-remaining_hours)))
        };

        info!(
            event = "pod_status",
            pod = %pod,
            namespace = %namespace,
            age = %format_duration(age_hours),
            age_hours = age_hours,
            termination_window = %window,
            time_until_termination = until_termination.as_deref(),
            exceeded_window_by = overdue_by.as_deref(),
            "Pod status"
        );
    }

    pub fn log_termination(&self, pod: &str, namespace: &str, window: &str, success: bool) {
        if success {
            info!(
                event = "pod_terminated",
                mode = %self.mode,
                pod = %pod,
                namespace = %namespace,
                termination_window = %window,
                "Successfully terminated pod"
            );
        } else {
            error!(
                event = "pod_termination_failed",
                mode = %self.mode,
                pod = %pod,
                namespace = %namespace,
                termination_window = %window,
                "Failed to terminate pod"
            );
        }
    }

    pub fn log_unknown_age(&self, pod: &str, namespace: &str) {
        warn!(
            event = "pod_age_unknown",
            pod = %pod,
            namespace = %namespace,
            "Pod age unknown, skipping this cycle"
        );
    }

    pub fn log_cycle(&self, pods: usize, terminated: usize, failed: usize, elapsed_ms: u128) {
        info!(
            event = "cycle_completed",
            pods = pods,
            terminated = terminated,
            termination_failures = failed,
            elapsed_ms = elapsed_ms as u64,
            "Check cycle complete"
        );
    }
}
