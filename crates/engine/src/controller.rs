//! Workflow controller.
//!
//! The controller keeps an in-memory index of workflows keyed by
//! `namespace/name` and reconciles each one towards completion:
//! 1. Change notifications (`apply`) upsert the index and enqueue the key.
//! 2. A fixed pool of workers pulls keys off the [`WorkQueue`] and `sync`s them.
//! 3. A failed sync goes back on the queue through the rate limiter; a
//!    successful or terminal one is forgotten.
//!
//! The queue guarantees a key is never synced by two workers at once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use queue::WorkQueue;

use crate::dag::validate_workflow;
use crate::executor::TaskExecutor;
use crate::metrics::{MetricsSink, Outcome};
use crate::models::{Workflow, WorkflowPhase};
use crate::status::{StatusTracker, TimeoutAction};
use crate::EngineError;

/// Where a sync picks up after a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Skip tasks that already completed (or were skipped).
    #[default]
    ResumeFromFirstIncomplete,
    /// Re-initialize a failed workflow and run every task again.
    RestartAll,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub resume_policy: ResumePolicy,
}

/// A change notification for one workflow.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Added(Workflow),
    /// Replaces metadata and spec; the observed status is kept.
    Updated(Workflow),
    /// Carries the `namespace/name` key.
    Deleted(String),
}

/// Cheap to clone; clones share the index and the queue.
#[derive(Clone)]
pub struct Controller {
    workflows: Arc<DashMap<String, Workflow>>,
    queue: WorkQueue<String>,
    executor: Arc<dyn TaskExecutor>,
    metrics: Arc<dyn MetricsSink>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        metrics: Arc<dyn MetricsSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            workflows: Arc::new(DashMap::new()),
            queue: WorkQueue::new(),
            executor,
            metrics,
            config,
        }
    }

    /// Apply a change notification.
    ///
    /// # Errors
    /// [`EngineError::DuplicateTaskName`] when an added or updated workflow
    /// repeats a task name; the index is left untouched.
    pub fn apply(&self, event: WorkflowEvent) -> Result<(), EngineError> {
        match event {
            WorkflowEvent::Added(workflow) | WorkflowEvent::Updated(workflow) => {
                validate_workflow(&workflow.spec)?;
                let key = workflow.key();
                match self.workflows.entry(key.clone()) {
                    Entry::Occupied(mut entry) => {
                        let existing = entry.get_mut();
                        existing.metadata = workflow.metadata;
                        existing.spec = workflow.spec;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(workflow);
                    }
                }
                debug!(%key, "workflow enqueued");
                self.queue.add(key);
            }
            WorkflowEvent::Deleted(key) => {
                if self.workflows.remove(&key).is_some() {
                    info!(%key, "workflow deleted");
                }
                self.queue.forget(&key);
            }
        }
        self.metrics.set_active_workflows(self.active_workflows());
        Ok(())
    }

    /// Run `workers` reconciliation workers until `shutdown` is cancelled,
    /// then drain: each worker finishes its current item and exits.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) {
        info!(workers, "starting workflow controller");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let controller = self.clone();
                tokio::spawn(async move {
                    while controller.process_next_item().await {}
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();

        shutdown.cancelled().await;
        info!("shutting down workflow controller");
        self.queue.shut_down();

        for result in join_all(handles).await {
            if let Err(err) = result {
                error!(error = %err, "worker terminated abnormally");
            }
        }
        info!("workflow controller stopped");
    }

    /// Sync one key off the queue. Returns `false` once the queue shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.metrics.set_queue_depth(self.queue.len());

        // A panicking sync must still reach `done`, or the key stays claimed.
        let Ok(result) = AssertUnwindSafe(self.sync(&key)).catch_unwind().await else {
            error!(%key, "sync panicked, requeueing");
            self.metrics.record_error("sync_panic");
            self.queue.add_rate_limited(key.clone());
            self.queue.done(&key);
            return true;
        };

        match result {
            Ok(()) => self.queue.forget(&key),
            Err(err) if err.is_terminal() => {
                warn!(%key, error = %err, "workflow reached a terminal error");
                self.metrics.record_error(err.label());
                self.queue.forget(&key);
            }
            Err(err) => {
                error!(%key, error = %err, requeues = self.queue.num_requeues(&key), "sync failed, requeueing");
                self.metrics.record_error(err.label());
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }

    /// Reconcile the workflow stored under `key`.
    #[instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> Result<(), EngineError> {
        let Some(mut workflow) = self.workflows.get(key).map(|entry| entry.value().clone()) else {
            debug!("workflow no longer exists");
            return Ok(());
        };

        match workflow.status.phase {
            phase if phase.is_final() => {
                debug!(?phase, "workflow already settled");
                return Ok(());
            }
            WorkflowPhase::Pending => {
                StatusTracker::new(&mut workflow).initialize_workflow();
                self.store_status(key, &workflow);
            }
            WorkflowPhase::Failed if self.config.resume_policy == ResumePolicy::RestartAll => {
                info!("restarting failed workflow from the first task");
                StatusTracker::new(&mut workflow).initialize_workflow();
                self.store_status(key, &workflow);
            }
            _ => {}
        }

        if StatusTracker::new(&mut workflow).check_timeout() {
            let result = StatusTracker::new(&mut workflow).handle_timeout();
            self.store_status(key, &workflow);
            match result {
                Ok(TimeoutAction::Alert) => self.metrics.record_error("workflow_timeout"),
                Ok(TimeoutAction::Restarted) => info!("workflow restarted after timeout"),
                Err(err) => {
                    self.finish(&workflow);
                    return Err(err);
                }
            }
        }

        let tasks = workflow.spec.tasks.clone();
        for task in &tasks {
            if workflow
                .status
                .task(&task.name)
                .is_some_and(|status| status.phase.is_done())
            {
                debug!(task = %task.name, "task already done, skipping");
                continue;
            }

            StatusTracker::new(&mut workflow).start_task(task);
            self.store_status(key, &workflow);

            let result = self.executor.execute(task, &workflow).await;

            let mut tracker = StatusTracker::new(&mut workflow);
            match result {
                Ok(execution) => {
                    tracker.record_retries(&task.name, execution.retries);
                    tracker.complete_task(&task.name, None);
                }
                Err(err) if task.optional => {
                    warn!(task = %task.name, error = %err, "optional task failed, skipping");
                    tracker.record_retries(&task.name, err.retries());
                    tracker.skip_task(&task.name, &err.to_string());
                }
                Err(err) => {
                    tracker.record_retries(&task.name, err.retries());
                    tracker.complete_task(&task.name, Some(&err.to_string()));
                    self.store_status(key, &workflow);
                    self.finish(&workflow);
                    return Err(EngineError::TaskFailed {
                        task: task.name.clone(),
                        source: Box::new(err),
                    });
                }
            }
            self.store_status(key, &workflow);
        }

        // Every task is done here; an empty task list completes on this path.
        StatusTracker::new(&mut workflow).settle();
        self.store_status(key, &workflow);
        self.finish(&workflow);
        Ok(())
    }

    /// Snapshot of the workflow stored under `key`.
    pub fn workflow(&self, key: &str) -> Option<Workflow> {
        self.workflows.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of every workflow, ordered by key.
    pub fn workflows(&self) -> Vec<Workflow> {
        let mut all: Vec<Workflow> = self.workflows.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(Workflow::key);
        all
    }

    /// Every indexed workflow is in a terminal phase.
    pub fn is_settled(&self) -> bool {
        self.workflows
            .iter()
            .all(|entry| entry.status.phase.is_terminal())
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    fn active_workflows(&self) -> usize {
        self.workflows
            .iter()
            .filter(|entry| !entry.status.phase.is_terminal())
            .count()
    }

    /// Write back the status only; metadata and spec may have been updated
    /// while the sync was running.
    fn store_status(&self, key: &str, workflow: &Workflow) {
        if let Some(mut entry) = self.workflows.get_mut(key) {
            entry.status = workflow.status.clone();
        }
    }

    fn finish(&self, workflow: &Workflow) {
        let phase = workflow.status.phase;
        if !phase.is_terminal() {
            return;
        }
        let duration = workflow
            .status
            .start_time
            .and_then(|start| (Utc::now() - start).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let outcome = if phase == WorkflowPhase::Completed {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        info!(workflow = %workflow.key(), ?phase, ?duration, "workflow finished");
        self.metrics
            .record_workflow_execution(workflow.name(), outcome, duration);
        self.metrics.set_active_workflows(self.active_workflows());
    }
}
