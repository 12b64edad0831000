//! Task execution.
//!
//! `DefaultTaskExecutor` runs one task against its backend:
//! 1. Decodes the task's input parameters into the shape its kind needs.
//! 2. Calls the backend through the `nodes` traits, retrying transient
//!    failures per the task's retry policy.
//! 3. Times every invocation, fork-join children included, and reports it
//!    to the metrics sink.
//!
//! The executor never touches workflow status; the controller does that.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use nodes::{
    params_to_json, BatchScheduler, ExecutableTask, FunctionInvoker, HttpClient, HttpRequest,
    JobEvent, JobKey, JobSpec, JobWatch, NodeError, ParamValue, TaskContext,
};

use crate::metrics::{MetricsSink, Outcome};
use crate::models::{Task, TaskKind, Workflow};
use crate::retry::{run_with_retry, Backoff};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// `FIXED` retry delay and first `EXPONENTIAL_BACKOFF` delay.
    pub retry_base_delay: Duration,
    /// Upper bound on a single retry delay.
    pub max_retry_delay: Duration,
    /// How deep fork-join tasks may nest.
    pub max_fork_depth: usize,
    /// HTTP timeout for tasks with `timeoutSeconds: 0`.
    pub default_http_timeout: Duration,
    /// Batch job deadline for tasks with `timeoutSeconds: 0`.
    pub default_job_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            max_fork_depth: 8,
            default_http_timeout: nodes::http::DEFAULT_HTTP_TIMEOUT,
            default_job_timeout: Duration::from_secs(3600),
        }
    }
}

impl ExecutorConfig {
    fn backoff(&self) -> Backoff {
        Backoff {
            base: self.retry_base_delay,
            max: self.max_retry_delay,
        }
    }
}

// ---------------------------------------------------------------------------
// Backends and SIMPLE task registry
// ---------------------------------------------------------------------------

/// The external systems tasks run against.
#[derive(Clone)]
pub struct Backends {
    pub http: Arc<dyn HttpClient>,
    pub functions: Arc<dyn FunctionInvoker>,
    pub batch: Arc<dyn BatchScheduler>,
}

/// Maps task names to the `ExecutableTask` run for `SIMPLE` tasks.
#[derive(Clone, Default)]
pub struct SimpleTaskRegistry {
    handlers: HashMap<String, Arc<dyn ExecutableTask>>,
    fallback: Option<Arc<dyn ExecutableTask>>,
}

impl SimpleTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, task_name: impl Into<String>, handler: Arc<dyn ExecutableTask>) -> Self {
        self.handlers.insert(task_name.into(), handler);
        self
    }

    /// Handler for SIMPLE tasks with no handler of their own.
    pub fn with_default(mut self, handler: Arc<dyn ExecutableTask>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn resolve(&self, task_name: &str) -> Option<&Arc<dyn ExecutableTask>> {
        self.handlers.get(task_name).or(self.fallback.as_ref())
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// A successful task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Execution {
    /// Retries spent before the final, successful attempt.
    pub retries: u32,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, workflow: &Workflow) -> Result<Execution, EngineError>;
}

pub struct DefaultTaskExecutor {
    backends: Backends,
    simple_tasks: SimpleTaskRegistry,
    metrics: Arc<dyn MetricsSink>,
    config: ExecutorConfig,
}

#[async_trait]
impl TaskExecutor for DefaultTaskExecutor {
    #[instrument(skip_all, fields(workflow = %workflow.key(), task = %task.name, kind = %task.kind))]
    async fn execute(&self, task: &Task, workflow: &Workflow) -> Result<Execution, EngineError> {
        self.execute_at_depth(task, workflow, 0).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpParams {
    uri: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_content_type")]
    content_type: String,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_owned()
}

fn default_content_type() -> String {
    "application/json".to_owned()
}

#[derive(Debug, Deserialize)]
struct JobParams {
    image: String,
    #[serde(default)]
    command: Vec<String>,
    /// Scalars of any type; each value is rendered to text.
    #[serde(default)]
    env: BTreeMap<String, ParamValue>,
}

impl DefaultTaskExecutor {
    pub fn new(backends: Backends, metrics: Arc<dyn MetricsSink>, config: ExecutorConfig) -> Self {
        Self {
            backends,
            simple_tasks: SimpleTaskRegistry::default(),
            metrics,
            config,
        }
    }

    pub fn with_simple_tasks(mut self, registry: SimpleTaskRegistry) -> Self {
        self.simple_tasks = registry;
        self
    }

    /// Run and time one invocation. Boxed because fork-join recurses.
    fn execute_at_depth<'a>(
        &'a self,
        task: &'a Task,
        workflow: &'a Workflow,
        depth: usize,
    ) -> BoxFuture<'a, Result<Execution, EngineError>> {
        async move {
            let started = Instant::now();
            let result = self.dispatch(task, workflow, depth).await;
            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(err) => {
                    self.metrics.record_error(err.label());
                    Outcome::Failure
                }
            };
            self.metrics
                .record_task_execution(task.kind.as_str(), outcome, started.elapsed());
            result
        }
        .boxed()
    }

    async fn dispatch(
        &self,
        task: &Task,
        workflow: &Workflow,
        depth: usize,
    ) -> Result<Execution, EngineError> {
        match &task.kind {
            TaskKind::Http => self.execute_http(task).await,
            TaskKind::FunctionInvoke => self.execute_function(task).await,
            TaskKind::Simple => self.execute_simple(task, workflow).await,
            TaskKind::ForkJoin => self.execute_fork_join(task, workflow, depth).await,
            TaskKind::BatchJob => self.execute_batch_job(task, workflow).await,
            TaskKind::Unsupported(kind) => Err(EngineError::UnsupportedTaskKind(kind.clone())),
        }
    }

    async fn execute_http(&self, task: &Task) -> Result<Execution, EngineError> {
        let params: HttpParams = decode_param(task, "http")?;
        let body = params.body.map(|body| match body {
            Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        });
        let request = HttpRequest {
            method: params.method,
            uri: params.uri,
            content_type: params.content_type,
            body,
            timeout: task_timeout(task, self.config.default_http_timeout),
        };

        let http = &self.backends.http;
        let request = &request;
        let retried = run_with_retry(task, &self.config.backoff(), self.metrics.as_ref(), || async move {
            let response = http.send(request).await?;
            match response.status {
                s if s >= 500 => Err(NodeError::Retryable(format!("server error: status {s}"))),
                s if s >= 400 => Err(NodeError::Fatal(format!("client error: status {s}"))),
                _ => Ok(()),
            }
        })
        .await?;

        debug!(uri = %request.uri, retries = retried.retries, "http task succeeded");
        Ok(Execution {
            retries: retried.retries,
        })
    }

    async fn execute_function(&self, task: &Task) -> Result<Execution, EngineError> {
        let function = task
            .input_parameters
            .get("functionName")
            .and_then(|v| v.as_str())
            .unwrap_or(&task.name);
        let payload = params_to_json(&task.input_parameters);

        let invoker = &self.backends.functions;
        let payload = &payload;
        let retried = run_with_retry(task, &self.config.backoff(), self.metrics.as_ref(), || async move {
            let output = invoker.invoke(function, payload).await?;
            match output.function_error {
                Some(err) => Err(NodeError::Retryable(format!("function error: {err}"))),
                None => Ok(()),
            }
        })
        .await?;

        Ok(Execution {
            retries: retried.retries,
        })
    }

    async fn execute_simple(&self, task: &Task, workflow: &Workflow) -> Result<Execution, EngineError> {
        let Some(handler) = self.simple_tasks.resolve(&task.name) else {
            debug!(task = %task.name, "no handler registered for simple task");
            return Ok(Execution::default());
        };

        let ctx = TaskContext {
            workflow_key: workflow.key(),
            workflow_name: workflow.name().to_owned(),
            namespace: workflow.metadata.namespace.clone(),
            task_name: task.name.clone(),
        };
        let params = &task.input_parameters;
        let ctx = &ctx;
        let retried = run_with_retry(task, &self.config.backoff(), self.metrics.as_ref(), || async move {
            handler.execute(params, ctx).await
        })
        .await?;

        Ok(Execution {
            retries: retried.retries,
        })
    }

    /// Run every child concurrently and wait for all of them.
    async fn execute_fork_join(
        &self,
        task: &Task,
        workflow: &Workflow,
        depth: usize,
    ) -> Result<Execution, EngineError> {
        if depth >= self.config.max_fork_depth {
            return Err(EngineError::NestingTooDeep {
                task: task.name.clone(),
                max_depth: self.config.max_fork_depth,
            });
        }

        let children = task
            .input_parameters
            .get("forkTasks")
            .and_then(|v| v.as_list())
            .ok_or_else(|| EngineError::InvalidParameters {
                task: task.name.clone(),
                message: "'forkTasks' must be a list of tasks".into(),
            })?;

        info!(task = %task.name, children = children.len(), "forking");

        let branches = children.iter().enumerate().map(|(i, raw)| async move {
            let child: Task = match raw.decode() {
                Ok(child) => child,
                Err(err) => {
                    let name = raw
                        .as_map()
                        .and_then(|m| m.get("name"))
                        .and_then(|n| n.as_str())
                        .map_or_else(|| format!("#{i}"), str::to_owned);
                    return Err(format!("fork task {name} failed: {}", err.message()));
                }
            };
            self.execute_at_depth(&child, workflow, depth + 1)
                .await
                .map_err(|err| format!("fork task {} failed: {err}", child.name))
        });

        let failures: Vec<String> = join_all(branches)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if failures.is_empty() {
            Ok(Execution::default())
        } else {
            warn!(task = %task.name, failed = failures.len(), "fork-join children failed");
            Err(EngineError::ForkJoin {
                task: task.name.clone(),
                failures,
            })
        }
    }

    async fn execute_batch_job(&self, task: &Task, workflow: &Workflow) -> Result<Execution, EngineError> {
        let params: JobParams = decode_param(task, "job")?;
        let mut labels = BTreeMap::new();
        labels.insert("workflow".to_owned(), workflow.name().to_owned());
        labels.insert("task".to_owned(), task.name.clone());

        let spec = JobSpec {
            key: JobKey {
                namespace: workflow.metadata.namespace.clone(),
                name: format!("{}-{}", workflow.name(), task.name),
            },
            labels,
            image: params.image,
            command: params.command,
            env: params
                .env
                .into_iter()
                .map(|(name, value)| (name, value.to_string()))
                .collect(),
            backoff_limit: task.retry_count,
        };

        // Subscribe first so a fast job cannot finish unobserved.
        let batch = &self.backends.batch;
        let mut watch = batch
            .watch(&spec.key)
            .await
            .map_err(|e| EngineError::from_node(&task.name, 1, e))?;
        batch
            .submit(&spec)
            .await
            .map_err(|e| EngineError::from_node(&task.name, 1, e))?;
        info!(job = %spec.key, "batch job submitted");

        let deadline = task_timeout(task, self.config.default_job_timeout);
        match tokio::time::timeout(deadline, wait_for_job(&mut watch)).await {
            Ok(Ok(())) => Ok(Execution::default()),
            Ok(Err(message)) => Err(EngineError::TaskFatal {
                task: task.name.clone(),
                message,
            }),
            Err(_) => Err(EngineError::JobTimedOut {
                task: task.name.clone(),
                seconds: deadline.as_secs(),
            }),
        }
    }
}

async fn wait_for_job(watch: &mut JobWatch) -> Result<(), String> {
    while let Some(event) = watch.next().await {
        match event {
            JobEvent::Running => debug!("batch job running"),
            JobEvent::Succeeded => return Ok(()),
            JobEvent::Failed { message } => return Err(format!("job failed: {message}")),
        }
    }
    Err("job event stream closed".to_owned())
}

fn task_timeout(task: &Task, default: Duration) -> Duration {
    match task.timeout_seconds {
        0 => default,
        secs => Duration::from_secs(secs),
    }
}

fn decode_param<T: DeserializeOwned>(task: &Task, key: &str) -> Result<T, EngineError> {
    let invalid = |message: String| EngineError::InvalidParameters {
        task: task.name.clone(),
        message,
    };
    task.input_parameters
        .get(key)
        .ok_or_else(|| invalid(format!("missing '{key}' parameter")))?
        .decode()
        .map_err(|e| invalid(e.message().to_owned()))
}
