//! `LocalBatchScheduler`: a [`BatchScheduler`] that runs jobs as local
//! processes.
//!
//! Meant for development and single-host deployments: the job's `command` is
//! spawned directly with its `env`; the container `image` is only recorded.
//! A failing process is restarted up to `backoff_limit` times before the job
//! is reported as failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::traits::{BatchScheduler, JobEvent, JobKey, JobSpec, JobWatch};
use crate::NodeError;

const WATCH_BUFFER: usize = 16;

type Subscribers = HashMap<JobKey, Vec<(u64, mpsc::Sender<JobEvent>)>>;

#[derive(Debug, Default, Clone)]
pub struct LocalBatchScheduler {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl LocalBatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live watches, across all jobs.
    pub fn active_watches(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }

    fn publish(subscribers: &Mutex<Subscribers>, key: &JobKey, event: JobEvent) {
        let senders: Vec<_> = subscribers
            .lock()
            .get(key)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        for tx in senders {
            // A full or closed channel means the watcher is gone or not reading.
            let _ = tx.try_send(event.clone());
        }
    }

    async fn run_job(spec: &JobSpec) -> JobEvent {
        let Some((program, args)) = spec.command.split_first() else {
            return JobEvent::Failed {
                message: "job has an empty command".into(),
            };
        };

        let mut last_error = String::new();
        for attempt in 0..=spec.backoff_limit {
            let status = Command::new(program)
                .args(args)
                .envs(&spec.env)
                .kill_on_drop(true)
                .status()
                .await;

            match status {
                Ok(status) if status.success() => return JobEvent::Succeeded,
                Ok(status) => last_error = format!("process exited with {status}"),
                Err(e) => last_error = format!("failed to spawn '{program}': {e}"),
            }
            if attempt < spec.backoff_limit {
                warn!(job = %spec.key, attempt, error = %last_error, "job attempt failed, restarting");
            }
        }

        JobEvent::Failed {
            message: last_error,
        }
    }
}

#[async_trait]
impl BatchScheduler for LocalBatchScheduler {
    async fn watch(&self, key: &JobKey) -> Result<JobWatch, NodeError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, tx));

        let subscribers = Arc::clone(&self.subscribers);
        let key = key.clone();
        Ok(JobWatch::new(rx, move || {
            let mut subs = subscribers.lock();
            if let Some(list) = subs.get_mut(&key) {
                list.retain(|(sub_id, _)| *sub_id != id);
                if list.is_empty() {
                    subs.remove(&key);
                }
            }
            debug!(job = %key, "job watch released");
        }))
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobKey, NodeError> {
        if spec.command.is_empty() {
            return Err(NodeError::Fatal(format!("job {} has an empty command", spec.key)));
        }
        info!(job = %spec.key, image = %spec.image, "submitting local job");

        let subscribers = Arc::clone(&self.subscribers);
        let spec = spec.clone();
        let key = spec.key.clone();
        tokio::spawn(async move {
            Self::publish(&subscribers, &spec.key, JobEvent::Running);
            let outcome = Self::run_job(&spec).await;
            Self::publish(&subscribers, &spec.key, outcome);
        });

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str, command: &[&str], backoff_limit: u32) -> JobSpec {
        JobSpec {
            key: JobKey {
                namespace: "default".into(),
                name: name.into(),
            },
            labels: BTreeMap::new(),
            image: "busybox".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            backoff_limit,
        }
    }

    async fn final_event(watch: &mut JobWatch) -> JobEvent {
        loop {
            match watch.next().await.expect("stream open") {
                JobEvent::Running => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn successful_process_reports_succeeded() {
        let scheduler = LocalBatchScheduler::new();
        let job = spec("ok", &["sh", "-c", "test \"$GREETING\" = hi"], 0);

        let mut watch = scheduler.watch(&job.key).await.unwrap();
        scheduler.submit(&job).await.unwrap();

        assert_eq!(final_event(&mut watch).await, JobEvent::Succeeded);
    }

    #[tokio::test]
    async fn failing_process_reports_failed_after_backoff() {
        let scheduler = LocalBatchScheduler::new();
        let job = spec("bad", &["sh", "-c", "exit 3"], 1);

        let mut watch = scheduler.watch(&job.key).await.unwrap();
        scheduler.submit(&job).await.unwrap();

        assert!(matches!(final_event(&mut watch).await, JobEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn dropping_watch_releases_subscription() {
        let scheduler = LocalBatchScheduler::new();
        let key = spec("w", &["true"], 0).key;

        let watch = scheduler.watch(&key).await.unwrap();
        assert_eq!(scheduler.active_watches(), 1);
        drop(watch);
        assert_eq!(scheduler.active_watches(), 0);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let scheduler = LocalBatchScheduler::new();
        let err = scheduler.submit(&spec("empty", &[], 0)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
