//! Metrics sink contract and the sinks shipped with the engine.
//!
//! Every method is infallible by signature: a sink that cannot emit must
//! swallow the problem, so metrics can never change a task's outcome.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// Outcome label attached to executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failed",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    /// One task invocation of `kind`, finished with `outcome` after `duration`.
    fn record_task_execution(&self, kind: &str, outcome: Outcome, duration: Duration);

    fn record_task_retry(&self, kind: &str, task: &str);

    fn record_error(&self, error_type: &str);

    /// A workflow reached a terminal phase.
    fn record_workflow_execution(&self, workflow: &str, outcome: Outcome, duration: Duration);

    fn set_active_workflows(&self, count: usize);

    /// Keys waiting in the work queue.
    fn set_queue_depth(&self, depth: usize);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_task_execution(&self, _: &str, _: Outcome, _: Duration) {}
    fn record_task_retry(&self, _: &str, _: &str) {}
    fn record_error(&self, _: &str) {}
    fn record_workflow_execution(&self, _: &str, _: Outcome, _: Duration) {}
    fn set_active_workflows(&self, _: usize) {}
    fn set_queue_depth(&self, _: usize) {}
}

/// Emits every observation as a structured `tracing` event under the
/// `metrics` target, for log-based collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_task_execution(&self, kind: &str, outcome: Outcome, duration: Duration) {
        debug!(
            target: "metrics",
            metric = "workflow_task_execution",
            task_type = kind,
            status = outcome.as_str(),
            duration_seconds = duration.as_secs_f64(),
        );
    }

    fn record_task_retry(&self, kind: &str, task: &str) {
        debug!(target: "metrics", metric = "workflow_task_retries_total", task_type = kind, task_name = task);
    }

    fn record_error(&self, error_type: &str) {
        debug!(target: "metrics", metric = "workflow_errors_total", error_type);
    }

    fn record_workflow_execution(&self, workflow: &str, outcome: Outcome, duration: Duration) {
        debug!(
            target: "metrics",
            metric = "workflow_execution",
            workflow_name = workflow,
            status = outcome.as_str(),
            duration_seconds = duration.as_secs_f64(),
        );
    }

    fn set_active_workflows(&self, count: usize) {
        debug!(target: "metrics", metric = "workflow_active_count", count);
    }

    fn set_queue_depth(&self, depth: usize) {
        debug!(target: "metrics", metric = "workflow_task_queue_size", depth);
    }
}

/// A single observation captured by [`RecordingMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    TaskExecution { kind: String, outcome: Outcome },
    TaskRetry { kind: String, task: String },
    Error(String),
    WorkflowExecution { workflow: String, outcome: Outcome },
    ActiveWorkflows(usize),
    QueueDepth(usize),
}

/// Test double that keeps every observation in memory (durations dropped).
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    observations: Mutex<Vec<Observation>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().clone()
    }

    pub fn task_executions(&self, kind: &str, outcome: Outcome) -> usize {
        self.observations
            .lock()
            .iter()
            .filter(|o| {
                matches!(o, Observation::TaskExecution { kind: k, outcome: out }
                    if k == kind && *out == outcome)
            })
            .count()
    }

    pub fn retries(&self) -> usize {
        self.observations
            .lock()
            .iter()
            .filter(|o| matches!(o, Observation::TaskRetry { .. }))
            .count()
    }

    pub fn errors(&self) -> usize {
        self.observations
            .lock()
            .iter()
            .filter(|o| matches!(o, Observation::Error(_)))
            .count()
    }

    fn push(&self, observation: Observation) {
        self.observations.lock().push(observation);
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_task_execution(&self, kind: &str, outcome: Outcome, _duration: Duration) {
        self.push(Observation::TaskExecution {
            kind: kind.to_owned(),
            outcome,
        });
    }

    fn record_task_retry(&self, kind: &str, task: &str) {
        self.push(Observation::TaskRetry {
            kind: kind.to_owned(),
            task: task.to_owned(),
        });
    }

    fn record_error(&self, error_type: &str) {
        self.push(Observation::Error(error_type.to_owned()));
    }

    fn record_workflow_execution(&self, workflow: &str, outcome: Outcome, _duration: Duration) {
        self.push(Observation::WorkflowExecution {
            workflow: workflow.to_owned(),
            outcome,
        });
    }

    fn set_active_workflows(&self, count: usize) {
        self.push(Observation::ActiveWorkflows(count));
    }

    fn set_queue_depth(&self, depth: usize) {
        self.push(Observation::QueueDepth(depth));
    }
}
