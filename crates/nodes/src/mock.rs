//! Test doubles for every backend contract.
//!
//! Useful in unit and integration tests where a real backend is either
//! unavailable or irrelevant. Each double records the calls it receives and
//! answers from a script supplied at construction time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::traits::{
    BatchScheduler, ExecutableTask, FunctionInvoker, FunctionOutput, HttpClient, HttpRequest,
    HttpResponse, JobEvent, JobKey, JobSpec, JobWatch, TaskContext,
};
use crate::{NodeError, ParamMap};

/// Pops the next scripted answer, repeating the last one once the script runs dry.
fn next_scripted<T: Clone>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut script = script.lock();
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Scripted [`HttpClient`]: each call consumes one entry of the script.
pub struct MockHttpClient {
    script: Mutex<VecDeque<Result<u16, NodeError>>>,
    /// All requests seen (in call order).
    pub calls: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockHttpClient {
    pub fn new(script: Vec<Result<u16, NodeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always answer with `status`.
    pub fn with_status(status: u16) -> Self {
        Self::new(vec![Ok(status)])
    }

    /// Answer with each status in turn, then keep repeating the last.
    pub fn with_statuses(statuses: &[u16]) -> Self {
        Self::new(statuses.iter().copied().map(Ok).collect())
    }

    /// Always fail at the transport level.
    pub fn unreachable() -> Self {
        Self::new(vec![Err(NodeError::Retryable("connection refused".into()))])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, NodeError> {
        self.calls.lock().push(request.clone());
        match next_scripted(&self.script).unwrap_or(Ok(200)) {
            Ok(status) => Ok(HttpResponse { status }),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// Scripted [`FunctionInvoker`].
pub struct MockFunctionInvoker {
    script: Mutex<VecDeque<Result<FunctionOutput, NodeError>>>,
    /// `(function, payload)` of every invocation.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockFunctionInvoker {
    pub fn new(script: Vec<Result<FunctionOutput, NodeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(vec![Ok(FunctionOutput::default())])
    }

    /// The function runs but always reports `message` as its error.
    pub fn reporting_error(message: impl Into<String>) -> Self {
        Self::new(vec![Ok(FunctionOutput {
            payload: Value::Null,
            function_error: Some(message.into()),
        })])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl FunctionInvoker for MockFunctionInvoker {
    async fn invoke(&self, function: &str, payload: &Value) -> Result<FunctionOutput, NodeError> {
        self.calls.lock().push((function.to_owned(), payload.clone()));
        next_scripted(&self.script).unwrap_or_else(|| Ok(FunctionOutput::default()))
    }
}

// ---------------------------------------------------------------------------
// Batch jobs
// ---------------------------------------------------------------------------

/// What the mock scheduler does with a submitted job.
#[derive(Debug, Clone)]
pub enum JobBehaviour {
    /// Emit `Running` then `Succeeded`.
    Succeed,
    /// Emit `Running` then `Failed`.
    Fail(String),
    /// Emit `Running` and nothing else.
    Hang,
    /// Reject the submission.
    Reject(NodeError),
}

/// In-memory [`BatchScheduler`] with a fixed behaviour for every job.
pub struct MockBatchScheduler {
    behaviour: JobBehaviour,
    watches: Arc<Mutex<Vec<(JobKey, mpsc::Sender<JobEvent>)>>>,
    live_watches: Arc<AtomicUsize>,
    /// Every job submitted (in call order).
    pub submitted: Arc<Mutex<Vec<JobSpec>>>,
}

impl MockBatchScheduler {
    pub fn new(behaviour: JobBehaviour) -> Self {
        Self {
            behaviour,
            watches: Arc::new(Mutex::new(Vec::new())),
            live_watches: Arc::new(AtomicUsize::new(0)),
            submitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Watches that have been opened and not yet dropped.
    pub fn live_watches(&self) -> usize {
        self.live_watches.load(Ordering::SeqCst)
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

#[async_trait]
impl BatchScheduler for MockBatchScheduler {
    async fn watch(&self, key: &JobKey) -> Result<JobWatch, NodeError> {
        let (tx, rx) = mpsc::channel(8);
        self.watches.lock().push((key.clone(), tx));
        self.live_watches.fetch_add(1, Ordering::SeqCst);

        let live = Arc::clone(&self.live_watches);
        Ok(JobWatch::new(rx, move || {
            live.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    async fn submit(&self, spec: &JobSpec) -> Result<JobKey, NodeError> {
        if let JobBehaviour::Reject(err) = &self.behaviour {
            return Err(err.clone());
        }
        self.submitted.lock().push(spec.clone());

        let events = match &self.behaviour {
            JobBehaviour::Succeed => vec![JobEvent::Running, JobEvent::Succeeded],
            JobBehaviour::Fail(message) => vec![
                JobEvent::Running,
                JobEvent::Failed {
                    message: message.clone(),
                },
            ],
            JobBehaviour::Hang | JobBehaviour::Reject(_) => vec![JobEvent::Running],
        };

        let senders: Vec<_> = self
            .watches
            .lock()
            .iter()
            .filter(|(key, _)| *key == spec.key)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            for event in &events {
                let _ = tx.try_send(event.clone());
            }
        }

        Ok(spec.key.clone())
    }
}

// ---------------------------------------------------------------------------
// SIMPLE task logic
// ---------------------------------------------------------------------------

/// Behaviour injected into `MockTask` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    Succeed,
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock [`ExecutableTask`] that records every call it receives.
pub struct MockTask {
    /// Label used in test assertions.
    pub name: String,
    pub behaviour: MockBehaviour,
    /// Simulated work time before answering.
    pub delay: Duration,
    /// All parameter maps seen by this task (in call order).
    pub calls: Arc<Mutex<Vec<ParamMap>>>,
}

impl MockTask {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Succeed)
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times this task has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ExecutableTask for MockTask {
    async fn execute(&self, params: &ParamMap, _ctx: &TaskContext) -> Result<(), NodeError> {
        self.calls.lock().push(params.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behaviour {
            MockBehaviour::Succeed => Ok(()),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
        }
    }
}
