//! `engine` crate: workflow models, validation, task execution, status
//! tracking, templates and the reconciling controller.

pub mod controller;
pub mod dag;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod status;
pub mod templates;

pub use controller::{Controller, ControllerConfig, ResumePolicy, WorkflowEvent};
pub use dag::{validate_template, validate_workflow};
pub use error::{EngineError, TemplateError};
pub use executor::{
    Backends, DefaultTaskExecutor, Execution, ExecutorConfig, SimpleTaskRegistry, TaskExecutor,
};
pub use metrics::{MetricsSink, NoopMetrics, TracingMetrics};
pub use models::{
    ResourceMeta, Task, TaskKind, TimeoutPolicy, Workflow, WorkflowPhase, WorkflowTemplate,
};
pub use status::{StatusTracker, TimeoutAction};
pub use templates::TemplateRegistry;

#[cfg(test)]
mod controller_tests;
