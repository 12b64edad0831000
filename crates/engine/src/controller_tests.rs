//! Tests for the workflow controller.
//!
//! Tasks run through `ScriptedExecutor`, which answers from a per-task script
//! and records the order tasks were executed in.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, ControllerConfig, ResumePolicy, WorkflowEvent};
use crate::executor::{Execution, TaskExecutor};
use crate::metrics::{Observation, Outcome, RecordingMetrics};
use crate::models::{
    ConditionType, Task, TaskKind, TaskPhase, TimeoutPolicy, Workflow, WorkflowPhase,
};
use crate::EngineError;

#[derive(Default)]
struct ScriptedExecutor {
    /// Answers per task name; a task with no (remaining) script succeeds.
    script: Mutex<HashMap<String, VecDeque<Result<u32, String>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn failing_once(task: &str) -> Self {
        let executor = Self::default();
        executor.script.lock().insert(
            task.to_owned(),
            VecDeque::from([Err("connection refused".to_owned())]),
        );
        executor
    }

    fn always_failing(task: &str) -> Self {
        let executor = Self::default();
        executor.script.lock().insert(
            task.to_owned(),
            VecDeque::from(vec![Err("boom".to_owned()); 64]),
        );
        executor
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, _workflow: &Workflow) -> Result<Execution, EngineError> {
        self.calls.lock().push(task.name.clone());
        let answer = self
            .script
            .lock()
            .get_mut(&task.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(0));
        match answer {
            Ok(retries) => Ok(Execution { retries }),
            Err(message) => Err(EngineError::RetriesExhausted {
                task: task.name.clone(),
                attempts: 3,
                message,
            }),
        }
    }
}

struct Fixture {
    controller: Controller,
    executor: Arc<ScriptedExecutor>,
    metrics: Arc<RecordingMetrics>,
}

fn fixture(executor: ScriptedExecutor, resume_policy: ResumePolicy) -> Fixture {
    let executor = Arc::new(executor);
    let metrics = Arc::new(RecordingMetrics::new());
    let controller = Controller::new(
        executor.clone(),
        metrics.clone(),
        ControllerConfig { resume_policy },
    );
    Fixture {
        controller,
        executor,
        metrics,
    }
}

fn workflow(tasks: &[&str]) -> Workflow {
    Workflow::new(
        "orders",
        tasks.iter().map(|n| Task::new(*n, TaskKind::Simple)).collect(),
    )
}

const KEY: &str = "default/orders";

fn condition_types(wf: &Workflow) -> Vec<ConditionType> {
    wf.status.conditions.iter().map(|c| c.condition_type).collect()
}

/// A workflow that started `elapsed_secs` ago with a 1s timeout.
fn overdue(policy: TimeoutPolicy, elapsed_secs: i64) -> Workflow {
    let mut wf = workflow(&["a"]);
    wf.spec.timeout_policy = policy;
    wf.spec.timeout_seconds = 1;
    wf.status.phase = WorkflowPhase::Running;
    wf.status.start_time = Some(Utc::now() - chrono::Duration::seconds(elapsed_secs));
    wf
}

// ============================================================
// Happy path and idempotency
// ============================================================

#[tokio::test]
async fn unknown_key_syncs_as_noop() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller.sync("default/ghost").await.unwrap();
    assert!(f.executor.calls().is_empty());
}

#[tokio::test]
async fn tasks_run_in_order_and_workflow_completes() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(workflow(&["a", "b", "c"])))
        .unwrap();

    f.controller.sync(KEY).await.unwrap();

    assert_eq!(f.executor.calls(), ["a", "b", "c"]);
    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
    assert_eq!(
        condition_types(&wf),
        [ConditionType::Started, ConditionType::Completed]
    );
    assert!(wf
        .status
        .tasks
        .iter()
        .all(|t| t.phase == TaskPhase::Completed && t.finish_time.is_some()));
    assert!(f.controller.is_settled());
    assert!(f.metrics.observations().contains(&Observation::WorkflowExecution {
        workflow: "orders".into(),
        outcome: Outcome::Success,
    }));
}

#[tokio::test]
async fn workflow_without_tasks_completes() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller.apply(WorkflowEvent::Added(workflow(&[]))).unwrap();

    f.controller.sync(KEY).await.unwrap();
    f.controller.sync(KEY).await.unwrap();

    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
    assert_eq!(
        condition_types(&wf),
        [ConditionType::Started, ConditionType::Completed]
    );
    assert!(f.controller.is_settled());
    assert!(f.executor.calls().is_empty());
}

#[tokio::test]
async fn resync_of_completed_workflow_changes_nothing() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller.apply(WorkflowEvent::Added(workflow(&["a"]))).unwrap();
    f.controller.sync(KEY).await.unwrap();
    let before = f.controller.workflow(KEY).unwrap();

    f.controller.sync(KEY).await.unwrap();

    assert_eq!(f.executor.calls(), ["a"]);
    assert_eq!(f.controller.workflow(KEY).unwrap(), before);
}

// ============================================================
// Failure, resume and restart
// ============================================================

#[tokio::test]
async fn failed_task_aborts_remaining_tasks() {
    let f = fixture(ScriptedExecutor::failing_once("b"), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(workflow(&["a", "b", "c"])))
        .unwrap();

    let err = f.controller.sync(KEY).await.unwrap_err();

    assert!(matches!(err, EngineError::TaskFailed { ref task, .. } if task == "b"));
    assert_eq!(f.executor.calls(), ["a", "b"]);
    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Failed);
    assert!(wf.status.task("c").is_none());
    let b = wf.status.task("b").unwrap();
    assert_eq!(b.phase, TaskPhase::Failed);
    assert_eq!(b.retries, 2);
    assert!(b.error.as_deref().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn resync_resumes_from_first_incomplete_task() {
    let f = fixture(ScriptedExecutor::failing_once("b"), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(workflow(&["a", "b", "c"])))
        .unwrap();
    assert!(f.controller.sync(KEY).await.is_err());

    f.controller.sync(KEY).await.unwrap();

    assert_eq!(f.executor.calls(), ["a", "b", "b", "c"]);
    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
    assert_eq!(wf.status.tasks.len(), 3);
    assert_eq!(
        condition_types(&wf),
        [
            ConditionType::Started,
            ConditionType::Failed,
            ConditionType::Completed
        ]
    );
}

#[tokio::test]
async fn restart_all_reruns_completed_tasks() {
    let f = fixture(ScriptedExecutor::failing_once("b"), ResumePolicy::RestartAll);
    f.controller
        .apply(WorkflowEvent::Added(workflow(&["a", "b", "c"])))
        .unwrap();
    assert!(f.controller.sync(KEY).await.is_err());

    f.controller.sync(KEY).await.unwrap();

    assert_eq!(f.executor.calls(), ["a", "b", "a", "b", "c"]);
    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
    assert_eq!(
        condition_types(&wf)
            .iter()
            .filter(|c| **c == ConditionType::Started)
            .count(),
        2
    );
}

#[tokio::test]
async fn optional_task_failure_does_not_fail_workflow() {
    let f = fixture(ScriptedExecutor::always_failing("b"), ResumePolicy::default());
    let mut wf = workflow(&["a", "b", "c"]);
    wf.spec.tasks[1] = Task::new("b", TaskKind::Simple).optional();
    f.controller.apply(WorkflowEvent::Added(wf)).unwrap();

    f.controller.sync(KEY).await.unwrap();

    assert_eq!(f.executor.calls(), ["a", "b", "c"]);
    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
    let b = wf.status.task("b").unwrap();
    assert_eq!(b.phase, TaskPhase::Skipped);
    assert!(b.error.is_some());
}

// ============================================================
// Change notifications
// ============================================================

#[tokio::test]
async fn update_preserves_observed_status() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller.apply(WorkflowEvent::Added(workflow(&["a"]))).unwrap();
    f.controller.sync(KEY).await.unwrap();

    let mut updated = workflow(&["a"]);
    updated.spec.description = "nightly run".into();
    f.controller.apply(WorkflowEvent::Updated(updated)).unwrap();

    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.spec.description, "nightly run");
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
}

#[tokio::test]
async fn deleted_workflow_syncs_as_noop() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller.apply(WorkflowEvent::Added(workflow(&["a"]))).unwrap();
    f.controller
        .apply(WorkflowEvent::Deleted(KEY.to_owned()))
        .unwrap();

    f.controller.sync(KEY).await.unwrap();

    assert!(f.controller.workflow(KEY).is_none());
    assert!(f.executor.calls().is_empty());
}

#[test]
fn duplicate_task_names_are_rejected() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    let err = f
        .controller
        .apply(WorkflowEvent::Added(workflow(&["a", "a"])))
        .unwrap_err();

    assert!(matches!(err, EngineError::DuplicateTaskName(_)));
    assert!(f.controller.workflow(KEY).is_none());
}

// ============================================================
// Timeouts
// ============================================================

#[tokio::test]
async fn time_out_policy_terminates_without_running_tasks() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(overdue(TimeoutPolicy::TimeOut, 10)))
        .unwrap();

    let err = f.controller.sync(KEY).await.unwrap_err();
    assert!(err.is_terminal());

    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::TimedOut);
    assert_eq!(wf.status.conditions.len(), 1);
    assert_eq!(wf.status.conditions[0].reason, "WorkflowTimeout");
    assert!(f.executor.calls().is_empty());

    // Settled: a later sync is a no-op.
    f.controller.sync(KEY).await.unwrap();
    assert_eq!(f.controller.workflow(KEY).unwrap().status.conditions.len(), 1);
}

#[tokio::test]
async fn alert_only_policy_keeps_running() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(overdue(TimeoutPolicy::AlertOnly, 10)))
        .unwrap();

    f.controller.sync(KEY).await.unwrap();

    assert_eq!(f.executor.calls(), ["a"]);
    assert_eq!(
        f.controller.workflow(KEY).unwrap().status.phase,
        WorkflowPhase::Completed
    );
    assert!(f
        .metrics
        .observations()
        .contains(&Observation::Error("workflow_timeout".into())));
}

#[tokio::test]
async fn retry_policy_restarts_workflow() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(overdue(TimeoutPolicy::Retry, 10)))
        .unwrap();

    f.controller.sync(KEY).await.unwrap();

    let wf = f.controller.workflow(KEY).unwrap();
    assert_eq!(wf.status.phase, WorkflowPhase::Completed);
    assert_eq!(condition_types(&wf)[0], ConditionType::Started);
    let restarted = wf.status.start_time.unwrap();
    assert!(Utc::now() - restarted < chrono::Duration::seconds(5));
}

// ============================================================
// Worker loop
// ============================================================

#[tokio::test]
async fn terminal_error_is_not_requeued() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(overdue(TimeoutPolicy::TimeOut, 10)))
        .unwrap();

    assert!(f.controller.process_next_item().await);

    assert_eq!(f.controller.queue().num_requeues(&KEY.to_owned()), 0);
    assert!(f.controller.queue().is_empty());
}

#[tokio::test]
async fn failed_sync_is_requeued_with_backoff() {
    let f = fixture(ScriptedExecutor::failing_once("a"), ResumePolicy::default());
    f.controller.apply(WorkflowEvent::Added(workflow(&["a"]))).unwrap();

    assert!(f.controller.process_next_item().await);

    assert_eq!(f.controller.queue().num_requeues(&KEY.to_owned()), 1);
}

#[tokio::test]
async fn workers_retry_until_workflow_completes() {
    let f = fixture(ScriptedExecutor::failing_once("b"), ResumePolicy::default());
    f.controller
        .apply(WorkflowEvent::Added(workflow(&["a", "b"])))
        .unwrap();

    let shutdown = CancellationToken::new();
    let controller = f.controller.clone();
    let token = shutdown.clone();
    let running = tokio::spawn(async move { controller.run(2, token).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while f
            .controller
            .workflow(KEY)
            .is_some_and(|wf| wf.status.phase != WorkflowPhase::Completed)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workflow did not complete");

    shutdown.cancel();
    running.await.unwrap();

    assert_eq!(f.executor.calls(), ["a", "b", "b"]);
    assert!(f.controller.queue().is_shutting_down());
}

struct PanickingExecutor;

#[async_trait]
impl TaskExecutor for PanickingExecutor {
    async fn execute(&self, task: &Task, _workflow: &Workflow) -> Result<Execution, EngineError> {
        panic!("executor bug while running {}", task.name);
    }
}

#[tokio::test]
async fn panicking_sync_releases_key_and_requeues() {
    let metrics = Arc::new(RecordingMetrics::new());
    let controller = Controller::new(
        Arc::new(PanickingExecutor),
        metrics.clone(),
        ControllerConfig::default(),
    );
    controller.apply(WorkflowEvent::Added(workflow(&["a"]))).unwrap();

    assert!(controller.process_next_item().await);

    assert_eq!(controller.queue().num_requeues(&KEY.to_owned()), 1);
    assert!(metrics
        .observations()
        .contains(&Observation::Error("sync_panic".into())));

    // Released: the rate-limited re-add hands the key out again.
    let again = tokio::time::timeout(Duration::from_secs(5), controller.queue().get())
        .await
        .expect("key was never handed out again");
    assert_eq!(again.as_deref(), Some(KEY));
}

#[tokio::test]
async fn queue_depth_is_reported_when_an_item_is_taken() {
    let f = fixture(ScriptedExecutor::default(), ResumePolicy::default());
    f.controller.apply(WorkflowEvent::Added(workflow(&["a"]))).unwrap();
    let mut other = workflow(&["a"]);
    other.metadata.name = "billing".into();
    f.controller.apply(WorkflowEvent::Added(other)).unwrap();

    assert!(f.controller.process_next_item().await);

    assert!(f
        .metrics
        .observations()
        .contains(&Observation::QueueDepth(1)));
}
