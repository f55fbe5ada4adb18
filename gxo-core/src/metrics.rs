//! Prometheus metrics (spec §6.5). The registry is owned by the caller
//! (the CLI, or an embedding host process) and handed to the engine by
//! reference, matching the rest of the ambient stack's "library never owns
//! process-wide singletons" rule.
//!
//! Series names and labels are stable — do not rename a series or reorder
//! its label set without treating it as a breaking change for dashboards.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounterVec, IntGauge, Registry,
};

pub struct Metrics {
    /// Playbook runs, by (name, status).
    pub playbook_runs_total: IntCounterVec,
    /// Whole-playbook wall-clock duration, by name.
    pub playbook_duration_seconds: HistogramVec,
    /// Task instance wall-clock duration, by (playbook, task, type).
    pub task_duration_seconds: HistogramVec,
    /// Task runs reaching a terminal state, by (playbook, task, type, status).
    pub task_runs_total: IntCounterVec,
    /// Tasks currently dispatched to a worker permit.
    pub active_workers: IntGauge,
    /// Records dropped or evicted by a channel overflow policy, by producer.
    pub channel_drops_total: IntCounterVec,
    /// Secret template function invocations, by secret key.
    pub secrets_accessed_total: IntCounterVec,
    /// Register-time summaries that contained at least one tracked secret
    /// and were redacted before being written to state, by task.
    pub secrets_redacted_total: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            playbook_runs_total: register_int_counter_vec_with_registry!(
                "gxo_playbook_runs_total",
                "Playbook runs that reached a terminal outcome",
                &["name", "status"],
                registry
            )?,
            playbook_duration_seconds: register_histogram_vec_with_registry!(
                "gxo_playbook_duration_seconds",
                "Whole-playbook wall-clock duration",
                &["name"],
                registry
            )?,
            task_duration_seconds: register_histogram_vec_with_registry!(
                "gxo_task_duration_seconds",
                "Task instance wall-clock duration",
                &["playbook", "task", "type"],
                registry
            )?,
            task_runs_total: register_int_counter_vec_with_registry!(
                "gxo_task_runs_total",
                "Tasks that reached a terminal state",
                &["playbook", "task", "type", "status"],
                registry
            )?,
            active_workers: register_int_gauge_with_registry!(
                "gxo_active_workers",
                "Tasks currently holding a worker permit",
                registry
            )?,
            channel_drops_total: register_int_counter_vec_with_registry!(
                "gxo_channel_drops_total",
                "Records dropped by a channel overflow policy",
                &["producer"],
                registry
            )?,
            secrets_accessed_total: register_int_counter_vec_with_registry!(
                "gxo_secrets_accessed_total",
                "Secret template function invocations",
                &["secret_key"],
                registry
            )?,
            secrets_redacted_total: register_int_counter_vec_with_registry!(
                "gxo_secrets_redacted_total",
                "Registered summaries redacted because they contained a tracked secret",
                &["task"],
                registry
            )?,
        })
    }
}

impl Default for Metrics {
    /// A self-contained instance backed by its own throwaway registry, for
    /// callers (mainly tests and `EngineDeps::default`) that do not need to
    /// export these series anywhere.
    fn default() -> Self {
        Self::new(&Registry::new()).expect("metrics registration against a fresh registry cannot conflict")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_conflict() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics
            .task_runs_total
            .with_label_values(&["pb", "t", "mock", "Completed"])
            .inc();
        assert_eq!(
            metrics
                .task_runs_total
                .with_label_values(&["pb", "t", "mock", "Completed"])
                .get(),
            1
        );
    }

    #[test]
    fn default_is_self_contained() {
        let a = Metrics::default();
        let b = Metrics::default();
        a.active_workers.inc();
        assert_eq!(a.active_workers.get(), 1);
        assert_eq!(b.active_workers.get(), 0);
    }
}
