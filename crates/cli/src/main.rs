//! `workflow-controller` CLI entry-point.
//!
//! Available sub-commands:
//! - `run`: load workflow files and reconcile them until Ctrl-C.
//! - `instantiate`: create a workflow from a template file.
//! - `validate`: validate a workflow or template file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use engine::{
    Backends, Controller, ControllerConfig, DefaultTaskExecutor, ExecutorConfig, MetricsSink,
    ResumePolicy, TemplateRegistry, TracingMetrics, Workflow, WorkflowEvent, WorkflowTemplate,
};
use nodes::{HttpFunctionInvoker, LocalBatchScheduler, ParamMap, ParamValue, ReqwestHttpClient};

#[derive(Parser)]
#[command(
    name = "workflow-controller",
    about = "Reconciles declarative workflows against HTTP, function and batch backends",
    version
)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, env = "WORKFLOW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply workflow files and reconcile them.
    Run {
        /// Workflow files (JSON or YAML), each holding one workflow or a list.
        files: Vec<PathBuf>,
        #[arg(long, env = "WORKFLOW_WORKERS", default_value_t = 2)]
        workers: usize,
        #[arg(long, env = "WORKFLOW_RETRY_BASE_DELAY_MS", default_value_t = 1000)]
        retry_base_delay_ms: u64,
        /// Base URL of the function gateway used by FUNCTION_INVOKE tasks.
        #[arg(long, env = "FUNCTION_ENDPOINT", default_value = "http://localhost:9000")]
        function_endpoint: String,
        /// Re-run every task of a failed workflow instead of resuming.
        #[arg(long)]
        restart_failed: bool,
        /// Stop once every workflow reached a terminal phase.
        #[arg(long)]
        exit_on_completion: bool,
    },
    /// Register the templates of a file and print an instantiated workflow.
    Instantiate {
        #[arg(long)]
        template: PathBuf,
        /// Template to instantiate; defaults to the first one in the file.
        #[arg(long)]
        name: Option<String>,
        /// Version to instantiate; defaults to the latest.
        #[arg(long)]
        version: Option<u32>,
        /// Parameter as `key=value`; JSON values are parsed, anything else is a string.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, ParamValue)>,
    },
    /// Validate a workflow (or, with --template, a template) file.
    Validate {
        path: PathBuf,
        #[arg(long)]
        template: bool,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            files,
            workers,
            retry_base_delay_ms,
            function_endpoint,
            restart_failed,
            exit_on_completion,
        } => {
            let client = reqwest::Client::builder()
                .timeout(nodes::http::DEFAULT_HTTP_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?;
            let backends = Backends {
                http: Arc::new(ReqwestHttpClient::from_client(client.clone())),
                functions: Arc::new(HttpFunctionInvoker::new(client, function_endpoint)),
                batch: Arc::new(LocalBatchScheduler::new()),
            };
            let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
            let executor = DefaultTaskExecutor::new(
                backends,
                metrics.clone(),
                ExecutorConfig {
                    retry_base_delay: Duration::from_millis(retry_base_delay_ms),
                    ..ExecutorConfig::default()
                },
            );
            let resume_policy = if restart_failed {
                ResumePolicy::RestartAll
            } else {
                ResumePolicy::ResumeFromFirstIncomplete
            };
            let controller =
                Controller::new(Arc::new(executor), metrics, ControllerConfig { resume_policy });

            for path in &files {
                let workflows: Vec<Workflow> = load::<OneOrMany<Workflow>>(path)?.into();
                for workflow in workflows {
                    let key = workflow.key();
                    if let Err(e) = controller.apply(WorkflowEvent::Added(workflow)) {
                        error!(%key, error = %e, "rejected workflow");
                    }
                }
            }

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("received Ctrl-C");
                        on_signal.cancel();
                    }
                    Err(e) => error!(error = %e, "cannot listen for Ctrl-C"),
                }
            });
            if exit_on_completion {
                let watched = controller.clone();
                let on_settled = shutdown.clone();
                tokio::spawn(async move {
                    while !watched.is_settled() {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    info!("all workflows settled");
                    on_settled.cancel();
                });
            }

            controller.run(workers, shutdown).await;
            println!("{}", serde_json::to_string_pretty(&controller.workflows())?);
        }
        Command::Instantiate {
            template,
            name,
            version,
            params,
        } => {
            let templates: Vec<WorkflowTemplate> =
                load::<OneOrMany<WorkflowTemplate>>(&template)?.into();
            let Some(first) = templates.first().map(|t| t.name().to_owned()) else {
                bail!("{} contains no templates", template.display());
            };

            let registry = TemplateRegistry::new();
            for tpl in templates {
                registry.add_template(tpl)?;
            }
            let params: ParamMap = params.into_iter().collect();
            let workflow = registry.instantiate(name.as_deref().unwrap_or(&first), version, &params)?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        Command::Validate { path, template } => {
            if template {
                for tpl in Vec::from(load::<OneOrMany<WorkflowTemplate>>(&path)?) {
                    let order = engine::validate_template(&tpl.spec)
                        .with_context(|| format!("template {} is invalid", tpl.name()))?;
                    println!("template {} v{} is valid, task order: {order:?}", tpl.name(), tpl.version());
                }
            } else {
                for wf in Vec::from(load::<OneOrMany<Workflow>>(&path)?) {
                    engine::validate_workflow(&wf.spec)
                        .with_context(|| format!("workflow {} is invalid", wf.key()))?;
                    println!("workflow {} is valid ({} tasks)", wf.key(), wf.spec.tasks.len());
                }
            }
        }
    }
    Ok(())
}

/// Read a JSON or YAML document, picked by file extension.
fn load<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let parsed = if yaml {
        serde_yaml::from_str(&content).map_err(anyhow::Error::from)
    } else {
        serde_json::from_str(&content).map_err(anyhow::Error::from)
    };
    parsed.with_context(|| format!("cannot parse {}", path.display()))
}

fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| ParamValue::from(value));
    Ok((key.to_owned(), value))
}
