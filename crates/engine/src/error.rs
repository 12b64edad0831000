//! Engine-level error types.

use thiserror::Error;

use nodes::NodeError;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more tasks share the same name.
    #[error("duplicate task name: '{0}'")]
    DuplicateTaskName(String),

    /// A `dependsOn` entry references a task that doesn't exist.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// Topological sort detected a cycle.
    #[error("task dependencies contain a cycle")]
    CycleDetected,

    // ------ Task execution errors ------

    /// The task's kind has no backend.
    #[error("unsupported task type: {0}")]
    UnsupportedTaskKind(String),

    /// Input parameters could not be decoded for the task's kind.
    #[error("invalid parameters for task '{task}': {message}")]
    InvalidParameters { task: String, message: String },

    /// A permanent backend failure; no retry was attempted.
    #[error("task '{task}' failed: {message}")]
    TaskFatal { task: String, message: String },

    /// A transient failure that persisted through every attempt.
    #[error("task '{task}' failed after {attempts} attempt(s): {message}")]
    RetriesExhausted {
        task: String,
        attempts: u32,
        message: String,
    },

    /// A batch job did not finish before its deadline.
    #[error("job for task '{task}' timed out after {seconds}s")]
    JobTimedOut { task: String, seconds: u64 },

    /// One or more fork-join children failed.
    #[error("fork-join task '{task}' errors: [{}]", .failures.join("; "))]
    ForkJoin { task: String, failures: Vec<String> },

    /// Fork-join nesting went deeper than the configured bound.
    #[error("task '{task}' exceeds maximum fork-join depth of {max_depth}")]
    NestingTooDeep { task: String, max_depth: usize },

    // ------ Workflow errors ------

    /// A task of the workflow failed; remaining tasks were not run.
    #[error("failed to execute task '{task}': {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The workflow outlived its timeout under the `TIME_OUT` policy.
    #[error("workflow timed out after {seconds} seconds")]
    WorkflowTimedOut { seconds: u64 },

    #[error("unknown timeout policy: {0}")]
    UnknownTimeoutPolicy(String),
}

impl EngineError {
    /// Map a backend error for `task` onto the engine taxonomy.
    pub(crate) fn from_node(task: &str, attempts: u32, err: NodeError) -> Self {
        match err {
            NodeError::Fatal(message) => EngineError::TaskFatal {
                task: task.to_owned(),
                message,
            },
            NodeError::Retryable(message) => EngineError::RetriesExhausted {
                task: task.to_owned(),
                attempts,
                message,
            },
        }
    }

    /// Retrying the whole workflow cannot change the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::WorkflowTimedOut { .. })
    }

    /// Short label used as the `error_type` of error metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::DuplicateTaskName(_)
            | EngineError::UnknownDependency { .. }
            | EngineError::CycleDetected => "validation",
            EngineError::UnsupportedTaskKind(_) => "unsupported_task_type",
            EngineError::InvalidParameters { .. } => "invalid_parameters",
            EngineError::TaskFatal { .. } => "task_fatal",
            EngineError::RetriesExhausted { .. } => "retries_exhausted",
            EngineError::JobTimedOut { .. } => "job_timeout",
            EngineError::ForkJoin { .. } => "fork_join",
            EngineError::NestingTooDeep { .. } => "nesting_too_deep",
            EngineError::TaskFailed { .. } => "task_failed",
            EngineError::WorkflowTimedOut { .. } => "workflow_timeout",
            EngineError::UnknownTimeoutPolicy(_) => "timeout_policy",
        }
    }

    /// Retries spent before this error was returned.
    pub fn retries(&self) -> u32 {
        match self {
            EngineError::RetriesExhausted { attempts, .. } => attempts.saturating_sub(1),
            _ => 0,
        }
    }
}

/// Errors surfaced synchronously by the template registry.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The `(name, version)` pair is already registered.
    #[error("template {name} version {version} already exists")]
    Conflict { name: String, version: u32 },

    #[error("template {0} not found")]
    NotFound(String),

    #[error("version {version} not found for template {name}")]
    VersionNotFound { name: String, version: u32 },

    #[error("required parameter {0} not provided")]
    MissingParameter(String),

    /// The template itself is malformed (names, dependencies).
    #[error("invalid template {name}: {source}")]
    Invalid {
        name: String,
        #[source]
        source: EngineError,
    },
}
