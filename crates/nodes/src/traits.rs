//! Backend contracts: what the task executor needs from its environment.
//!
//! The executor never talks to a concrete HTTP stack, function runtime or job
//! scheduler; it talks to these traits. Production implementations live in
//! the sibling modules, test doubles in [`crate::mock`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{NodeError, ParamMap};

/// Shared context passed to every backend call.
///
/// Defined here (in the nodes crate) so both the engine and individual backend
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// `namespace/name` key of the owning workflow.
    pub workflow_key: String,
    pub workflow_name: String,
    pub namespace: String,
    pub task_name: String,
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// A fully built outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub content_type: String,
    pub body: Option<Vec<u8>>,
    /// Client-side bound on the whole call.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
}

/// Sends HTTP requests.
///
/// Implementations return `Err(NodeError::Retryable)` for transport failures
/// and `Ok` with whatever status the server answered; classifying the status
/// is the executor's job.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, NodeError>;
}

// ---------------------------------------------------------------------------
// Function invocation
// ---------------------------------------------------------------------------

/// Result of a function invocation that reached the function runtime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionOutput {
    pub payload: Value,
    /// Set when the function itself reported an error.
    pub function_error: Option<String>,
}

/// Invokes serverless functions with a JSON payload.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, function: &str, payload: &Value) -> Result<FunctionOutput, NodeError>;
}

// ---------------------------------------------------------------------------
// Batch jobs
// ---------------------------------------------------------------------------

/// Identity of a submitted batch job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Description of a job handed to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub key: JobKey,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// How many times the scheduler may restart a failing job.
    pub backoff_limit: u32,
}

/// Lifecycle notification for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Running,
    Succeeded,
    Failed { message: String },
}

/// A live subscription to the events of one job.
///
/// The subscription is released when the watch is dropped, so every exit path
/// of the consumer (completion, failure, deadline, early `?`) unsubscribes.
pub struct JobWatch {
    events: mpsc::Receiver<JobEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl JobWatch {
    pub fn new(events: mpsc::Receiver<JobEvent>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Next event, or `None` once the scheduler closed the stream.
    pub async fn next(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for JobWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobWatch")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Submits batch jobs and streams their completion events.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Subscribe to events of the job identified by `key`.
    ///
    /// Subscribing before the job exists is allowed, so callers can watch
    /// first and submit second without missing a fast completion.
    async fn watch(&self, key: &JobKey) -> Result<JobWatch, NodeError>;

    async fn submit(&self, spec: &JobSpec) -> Result<JobKey, NodeError>;
}

// ---------------------------------------------------------------------------
// User-supplied task logic
// ---------------------------------------------------------------------------

/// Externally registered logic behind `SIMPLE` tasks.
#[async_trait]
pub trait ExecutableTask: Send + Sync {
    async fn execute(&self, params: &ParamMap, ctx: &TaskContext) -> Result<(), NodeError>;
}
