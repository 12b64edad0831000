//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow and a workflow
//! template look like in memory. Field names serialise in camelCase so the
//! same documents can be read from JSON/YAML workflow manifests.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nodes::{ParamMap, ParamValue};

fn default_namespace() -> String {
    "default".to_owned()
}

fn is_false(b: &bool) -> bool {
    !*b
}

// ---------------------------------------------------------------------------
// ResourceMeta
// ---------------------------------------------------------------------------

/// Identity and labels shared by workflows and templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ResourceMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            generate_name: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// `namespace/name`, the key workflows are indexed and queued under.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Backend a task runs against.
///
/// Unknown strings are preserved as `Unsupported` so that the executor, not
/// the manifest parser, reports them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Http,
    FunctionInvoke,
    Simple,
    ForkJoin,
    BatchJob,
    Unsupported(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Http => "HTTP",
            TaskKind::FunctionInvoke => "FUNCTION_INVOKE",
            TaskKind::Simple => "SIMPLE",
            TaskKind::ForkJoin => "FORK_JOIN",
            TaskKind::BatchJob => "BATCH_JOB",
            TaskKind::Unsupported(s) => s,
        }
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "HTTP" => TaskKind::Http,
            "FUNCTION_INVOKE" | "LAMBDA" => TaskKind::FunctionInvoke,
            "SIMPLE" => TaskKind::Simple,
            "FORK_JOIN" => TaskKind::ForkJoin,
            "BATCH_JOB" | "KUBERNETES_JOB" => TaskKind::BatchJob,
            _ => TaskKind::Unsupported(s),
        }
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay strategy between attempts. Unknown values behave as `FIXED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryLogic {
    ExponentialBackoff,
    // `serde(other)` has to sit on the last variant.
    #[default]
    #[serde(other)]
    Fixed,
}

/// What happens when a workflow outlives `timeoutSeconds`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TimeoutPolicy {
    /// Terminate the workflow.
    #[default]
    TimeOut,
    /// Keep running; only raise an alert.
    AlertOnly,
    /// Start the workflow over.
    Retry,
    /// Anything else; rejected when a timeout has to be handled.
    Other(String),
}

impl TimeoutPolicy {
    pub fn as_str(&self) -> &str {
        match self {
            TimeoutPolicy::TimeOut => "TIME_OUT",
            TimeoutPolicy::AlertOnly => "ALERT_ONLY",
            TimeoutPolicy::Retry => "RETRY",
            TimeoutPolicy::Other(s) => s,
        }
    }
}

impl From<String> for TimeoutPolicy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "TIME_OUT" => TimeoutPolicy::TimeOut,
            "ALERT_ONLY" => TimeoutPolicy::AlertOnly,
            "RETRY" => TimeoutPolicy::Retry,
            _ => TimeoutPolicy::Other(s),
        }
    }
}

impl From<TimeoutPolicy> for String {
    fn from(policy: TimeoutPolicy) -> Self {
        policy.as_str().to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowPhase {
    /// Accepted but not yet initialised by the controller.
    #[default]
    Pending,
    Initializing,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl WorkflowPhase {
    /// `Completed` and `TimedOut` are final; `Failed` is retried by the controller.
    pub fn is_final(self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::TimedOut)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowPhase::Completed | WorkflowPhase::Failed | WorkflowPhase::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Running,
    Completed,
    Failed,
    /// An optional task that failed; does not fail the workflow.
    Skipped,
}

impl TaskPhase {
    /// Nothing left to do for this task.
    pub fn is_done(self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Started,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique within the workflow; joins the task to its status entry.
    pub name: String,
    #[serde(rename = "taskType")]
    pub kind: TaskKind,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_logic: RetryLogic,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "ParamMap::is_empty")]
    pub input_parameters: ParamMap,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            retry_count: 0,
            retry_logic: RetryLogic::Fixed,
            timeout_seconds: 0,
            input_parameters: ParamMap::new(),
            optional: false,
        }
    }

    pub fn with_retries(mut self, count: u32, logic: RetryLogic) -> Self {
        self.retry_count = count;
        self.retry_logic = logic;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.input_parameters.insert(name.into(), value.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    /// 0 disables the workflow timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub name: String,
    pub phase: TaskPhase,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
}

/// An immutable record of a phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
    /// Append-only history.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl WorkflowStatus {
    /// First status entry for `name`.
    pub fn task(&self, name: &str) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// A complete workflow: identity, desired state and observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ResourceMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            metadata: ResourceMeta::new(name),
            spec: WorkflowSpec {
                tasks,
                ..WorkflowSpec::default()
            },
            status: WorkflowStatus::default(),
        }
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A declared template parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Free-form type tag (`string`, `number`, …); informational.
    #[serde(rename = "type", default)]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,
}

/// Task blueprint; `input_template` values may reference parameters by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub name: String,
    #[serde(rename = "taskType")]
    pub kind: TaskKind,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_logic: RetryLogic,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "ParamMap::is_empty")]
    pub input_template: ParamMap,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    /// Names of tasks this one must follow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub tasks: Vec<TaskTemplate>,
}

/// A versioned, parameterised workflow blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub metadata: ResourceMeta,
    pub spec: TemplateSpec,
}

impl WorkflowTemplate {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> u32 {
        self.spec.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_manifest_parses_with_defaults() {
        let wf: Workflow = serde_json::from_value(json!({
            "metadata": { "name": "orders" },
            "spec": {
                "timeoutPolicy": "ALERT_ONLY",
                "timeoutSeconds": 60,
                "tasks": [
                    { "name": "notify", "taskType": "HTTP", "retryCount": 2,
                      "retryLogic": "EXPONENTIAL_BACKOFF",
                      "inputParameters": { "http": { "uri": "http://x" } } },
                    { "name": "legacy", "taskType": "LAMBDA", "retryLogic": "LINEAR" },
                    { "name": "odd", "taskType": "TELEPORT", "optional": true }
                ]
            }
        }))
        .unwrap();

        assert_eq!(wf.key(), "default/orders");
        assert_eq!(wf.spec.timeout_policy, TimeoutPolicy::AlertOnly);
        assert_eq!(wf.status.phase, WorkflowPhase::Pending);

        let tasks = &wf.spec.tasks;
        assert_eq!(tasks[0].retry_logic, RetryLogic::ExponentialBackoff);
        assert_eq!(tasks[1].kind, TaskKind::FunctionInvoke);
        assert_eq!(tasks[1].retry_logic, RetryLogic::Fixed);
        assert_eq!(tasks[2].kind, TaskKind::Unsupported("TELEPORT".into()));
        assert!(tasks[2].optional);
    }

    #[test]
    fn unknown_timeout_policy_is_kept_verbatim() {
        let policy: TimeoutPolicy = serde_json::from_value(json!("PAGE_SOMEONE")).unwrap();
        assert_eq!(policy, TimeoutPolicy::Other("PAGE_SOMEONE".into()));
        assert_eq!(serde_json::to_value(&policy).unwrap(), json!("PAGE_SOMEONE"));
    }

    #[test]
    fn condition_serialises_type_field() {
        let cond = Condition {
            condition_type: ConditionType::Started,
            status: true,
            last_transition_time: Utc::now(),
            reason: "WorkflowStarted".into(),
            message: "started".into(),
        };
        let value = serde_json::to_value(&cond).unwrap();
        assert_eq!(value["type"], json!("Started"));
        assert!(value["lastTransitionTime"].is_string());
    }
}
