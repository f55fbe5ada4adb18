//! The execution report returned from a completed run (spec §4.7).

use crate::runner::TaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Success,
    PartialFailure,
    Failure,
    Cancelled,
    DeadlineExceeded,
    Stalled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub internal_id: String,
    pub name: Option<String>,
    pub status: TaskStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Correlates this report with the run's tracing spans and log lines.
    /// Filled in by [`crate::orchestrator::run_playbook`]; empty on a
    /// report built directly by a unit test.
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub status: OverallStatus,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub tasks: HashMap<String, TaskResult>,
    /// Non-empty only when `status` is `Failure` from a record/task-level
    /// error not already detailed per-task — e.g. a fatal builder error
    /// discovered before any task ran.
    pub message: Option<String>,
}

impl ExecutionReport {
    /// Roll up per-task results into the aggregate status per spec §4.7:
    /// any `Failed` task without `ignore_errors` covering it yields
    /// `PartialFailure` (some succeeded) or `Failure` (none did); all
    /// `Completed`/`Skipped` yields `Success`.
    pub fn from_tasks(tasks: HashMap<String, TaskResult>) -> Self {
        let total_tasks = tasks.len();
        let completed = tasks.values().filter(|t| t.status == TaskStatus::Completed).count();
        let failed = tasks.values().filter(|t| t.status == TaskStatus::Failed).count();
        let skipped = tasks.values().filter(|t| t.status == TaskStatus::Skipped).count();

        let status = if failed == 0 {
            OverallStatus::Success
        } else if completed > 0 || skipped > 0 {
            OverallStatus::PartialFailure
        } else {
            OverallStatus::Failure
        };

        let now = chrono::Utc::now();
        Self {
            run_id: String::new(),
            started_at: now,
            finished_at: now,
            status,
            total_tasks,
            completed,
            failed,
            skipped,
            tasks,
            message: None,
        }
    }

    pub fn context_terminal(status: OverallStatus, message: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            run_id: String::new(),
            started_at: now,
            finished_at: now,
            status,
            total_tasks: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            tasks: HashMap::new(),
            message: Some(message.into()),
        }
    }

    /// Stamp the run identity and timing window. Called once by the
    /// orchestrator after the report's task-level contents are final.
    pub fn with_run_metadata(mut self, run_id: String, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.run_id = run_id;
        self.started_at = started_at;
        self.finished_at = chrono::Utc::now();
        self
    }

    /// Exit-code mapping used by the CLI: zero only on full success.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            OverallStatus::Success => 0,
            OverallStatus::PartialFailure => 1,
            OverallStatus::Failure => 2,
            OverallStatus::Cancelled => 130,
            OverallStatus::DeadlineExceeded => 124,
            OverallStatus::Stalled => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> TaskResult {
        TaskResult {
            internal_id: "t".to_string(),
            name: Some("t".to_string()),
            status,
            error: None,
        }
    }

    #[test]
    fn all_completed_is_success() {
        let mut tasks = HashMap::new();
        tasks.insert("a".to_string(), task(TaskStatus::Completed));
        tasks.insert("b".to_string(), task(TaskStatus::Skipped));
        let report = ExecutionReport::from_tasks(tasks);
        assert_eq!(report.status, OverallStatus::Success);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn mixed_outcomes_is_partial_failure() {
        let mut tasks = HashMap::new();
        tasks.insert("a".to_string(), task(TaskStatus::Completed));
        tasks.insert("b".to_string(), task(TaskStatus::Failed));
        let report = ExecutionReport::from_tasks(tasks);
        assert_eq!(report.status, OverallStatus::PartialFailure);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn all_failed_is_failure() {
        let mut tasks = HashMap::new();
        tasks.insert("a".to_string(), task(TaskStatus::Failed));
        let report = ExecutionReport::from_tasks(tasks);
        assert_eq!(report.status, OverallStatus::Failure);
        assert_eq!(report.exit_code(), 2);
    }
}
