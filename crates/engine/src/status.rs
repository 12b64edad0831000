//! `StatusTracker`: the phase/condition state machine of one workflow.
//!
//! ```text
//! Pending ──initialize──▶ Initializing ──start_task──▶ Running ──▶ Completed
//!                                                        │  ▲
//!                                                        ▼  │ start_task (retry pass)
//!                                                       Failed
//! Running/Initializing ──handle_timeout(TIME_OUT)──▶ TimedOut
//! ```
//!
//! Conditions are only ever appended. A terminal condition is appended when
//! the workflow *enters* that phase, never again while it stays there.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::models::{
    Condition, ConditionType, Task, TaskPhase, TaskStatus, TimeoutPolicy, Workflow, WorkflowPhase,
};
use crate::EngineError;

/// What `handle_timeout` decided when it did not fail the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// `ALERT_ONLY`: nothing changed, the workflow keeps running.
    Alert,
    /// `RETRY`: status was reset and the workflow starts over.
    Restarted,
}

/// Mutates the status of one workflow.
pub struct StatusTracker<'a> {
    workflow: &'a mut Workflow,
}

impl<'a> StatusTracker<'a> {
    pub fn new(workflow: &'a mut Workflow) -> Self {
        Self { workflow }
    }

    /// Enter `Initializing`: reset start time and task statuses, append `Started`.
    pub fn initialize_workflow(&mut self) {
        let now = Utc::now();
        let status = &mut self.workflow.status;
        status.phase = WorkflowPhase::Initializing;
        status.start_time = Some(now);
        status.tasks.clear();
        status.conditions.push(Condition {
            condition_type: ConditionType::Started,
            status: true,
            last_transition_time: now,
            reason: "WorkflowStarted".into(),
            message: "Workflow initialization started".into(),
        });
        info!(workflow = %self.workflow.metadata.key(), "workflow initialized");
    }

    /// Record `task` as running and move the workflow to `Running`.
    ///
    /// A task that already has a status entry (a retry pass) gets that entry
    /// reset instead of a duplicate appended.
    pub fn start_task(&mut self, task: &Task) {
        let now = Utc::now();
        let status = &mut self.workflow.status;
        match status.tasks.iter_mut().find(|t| t.name == task.name) {
            Some(existing) => {
                existing.phase = TaskPhase::Running;
                existing.start_time = now;
                existing.finish_time = None;
                existing.error = None;
            }
            None => status.tasks.push(TaskStatus {
                name: task.name.clone(),
                phase: TaskPhase::Running,
                start_time: now,
                finish_time: None,
                error: None,
                retries: 0,
            }),
        }
        status.phase = WorkflowPhase::Running;
        debug!(task = %task.name, "task started");
    }

    /// Finish task `name` as `Completed`, or `Failed` when `error` is set,
    /// then recompute the workflow phase.
    pub fn complete_task(&mut self, name: &str, error: Option<&str>) {
        let phase = if error.is_some() {
            TaskPhase::Failed
        } else {
            TaskPhase::Completed
        };
        self.finish_task(name, phase, error);
    }

    /// Finish an optional task that failed; it does not fail the workflow.
    pub fn skip_task(&mut self, name: &str, error: &str) {
        self.finish_task(name, TaskPhase::Skipped, Some(error));
    }

    pub fn record_retries(&mut self, name: &str, retries: u32) {
        if let Some(entry) = self.task_entry(name) {
            entry.retries = retries;
        }
    }

    /// Recompute the workflow phase from its task statuses.
    ///
    /// A workflow with no tasks, or with every task completed or skipped,
    /// moves to `Completed`. Final phases are left alone.
    pub fn settle(&mut self) {
        if !self.workflow.status.phase.is_final() {
            self.update_workflow_status();
        }
    }

    fn task_entry(&mut self, name: &str) -> Option<&mut TaskStatus> {
        self.workflow.status.tasks.iter_mut().find(|t| t.name == name)
    }

    fn finish_task(&mut self, name: &str, phase: TaskPhase, error: Option<&str>) {
        match self.task_entry(name) {
            Some(entry) => {
                entry.finish_time = Some(Utc::now());
                entry.phase = phase;
                entry.error = error.map(str::to_owned);
            }
            None => warn!(task = name, "finishing a task that was never started"),
        }
        self.update_workflow_status();
    }

    fn update_workflow_status(&mut self) {
        let status = &self.workflow.status;
        let any_failed = status.tasks.iter().any(|t| t.phase == TaskPhase::Failed);
        let all_done = self.workflow.spec.tasks.iter().all(|task| {
            status
                .task(&task.name)
                .is_some_and(|entry| entry.phase.is_done())
        });

        if any_failed {
            self.transition(
                WorkflowPhase::Failed,
                ConditionType::Failed,
                "TaskFailed",
                "One or more tasks failed".into(),
            );
        } else if all_done {
            self.transition(
                WorkflowPhase::Completed,
                ConditionType::Completed,
                "WorkflowCompleted",
                "All tasks completed successfully".into(),
            );
        } else {
            self.workflow.status.phase = WorkflowPhase::Running;
        }
    }

    /// Move to `phase`, appending a condition only on entry.
    fn transition(
        &mut self,
        phase: WorkflowPhase,
        condition_type: ConditionType,
        reason: &str,
        message: String,
    ) {
        let status = &mut self.workflow.status;
        if status.phase == phase {
            return;
        }
        status.phase = phase;
        status.conditions.push(Condition {
            condition_type,
            status: true,
            last_transition_time: Utc::now(),
            reason: reason.to_owned(),
            message,
        });
        info!(workflow = %self.workflow.metadata.key(), ?phase, reason, "workflow phase changed");
    }

    /// Whether the workflow has outlived its timeout, as of now.
    pub fn check_timeout(&self) -> bool {
        self.check_timeout_at(Utc::now())
    }

    /// Whether more than `timeoutSeconds` elapsed between start and `now`.
    /// Always false when the timeout is 0 or the workflow has not started.
    pub fn check_timeout_at(&self, now: DateTime<Utc>) -> bool {
        let limit = self.workflow.spec.timeout_seconds;
        if limit == 0 {
            return false;
        }
        let Some(started) = self.workflow.status.start_time else {
            return false;
        };
        let elapsed = now.signed_duration_since(started);
        elapsed > chrono::Duration::seconds(i64::try_from(limit).unwrap_or(i64::MAX))
    }

    /// Apply the workflow's timeout policy.
    ///
    /// # Errors
    /// - [`EngineError::WorkflowTimedOut`] under `TIME_OUT`; the workflow is
    ///   moved to `TimedOut`.
    /// - [`EngineError::UnknownTimeoutPolicy`] for any unrecognised policy.
    pub fn handle_timeout(&mut self) -> Result<TimeoutAction, EngineError> {
        let seconds = self.workflow.spec.timeout_seconds;
        match &self.workflow.spec.timeout_policy {
            TimeoutPolicy::TimeOut => {
                self.transition(
                    WorkflowPhase::TimedOut,
                    ConditionType::Failed,
                    "WorkflowTimeout",
                    format!("Workflow exceeded timeout of {seconds} seconds"),
                );
                Err(EngineError::WorkflowTimedOut { seconds })
            }
            TimeoutPolicy::AlertOnly => {
                warn!(
                    workflow = %self.workflow.metadata.key(),
                    timeout_seconds = seconds,
                    "workflow exceeded its timeout (alert only)"
                );
                Ok(TimeoutAction::Alert)
            }
            TimeoutPolicy::Retry => {
                self.initialize_workflow();
                Ok(TimeoutAction::Restarted)
            }
            TimeoutPolicy::Other(policy) => Err(EngineError::UnknownTimeoutPolicy(policy.clone())),
        }
    }
}
