//! Versioned workflow templates and their instantiation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use nodes::{ParamMap, ParamValue};

use crate::dag::validate_template;
use crate::error::TemplateError;
use crate::models::{
    ResourceMeta, Task, TimeoutPolicy, Workflow, WorkflowSpec, WorkflowStatus, WorkflowTemplate,
};

/// Timeout given to every workflow created from a template.
pub const TEMPLATE_WORKFLOW_TIMEOUT_SECONDS: u64 = 3600;

type Versions = BTreeMap<u32, Arc<WorkflowTemplate>>;

/// Thread-safe store of templates keyed by `(name, version)`.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Versions>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template.
    ///
    /// # Errors
    /// - [`TemplateError::Invalid`] if task names repeat or dependencies are
    ///   unknown or cyclic.
    /// - [`TemplateError::Conflict`] if the `(name, version)` pair exists.
    pub fn add_template(&self, template: WorkflowTemplate) -> Result<(), TemplateError> {
        validate_template(&template.spec).map_err(|source| TemplateError::Invalid {
            name: template.name().to_owned(),
            source,
        })?;

        let mut templates = self.templates.write();
        let versions = templates.entry(template.name().to_owned()).or_default();
        if versions.contains_key(&template.version()) {
            return Err(TemplateError::Conflict {
                name: template.name().to_owned(),
                version: template.version(),
            });
        }
        info!(template = template.name(), version = template.version(), "template registered");
        versions.insert(template.version(), Arc::new(template));
        Ok(())
    }

    pub fn get_template(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Arc<WorkflowTemplate>, TemplateError> {
        let templates = self.templates.read();
        let versions = templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_owned()))?;
        versions
            .get(&version)
            .cloned()
            .ok_or_else(|| TemplateError::VersionNotFound {
                name: name.to_owned(),
                version,
            })
    }

    /// Highest registered version of `name`.
    pub fn get_latest_version(&self, name: &str) -> Result<Arc<WorkflowTemplate>, TemplateError> {
        self.templates
            .read()
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| TemplateError::NotFound(name.to_owned()))
    }

    /// Look up a template (latest when `version` is `None`) and instantiate it.
    pub fn instantiate(
        &self,
        name: &str,
        version: Option<u32>,
        params: &ParamMap,
    ) -> Result<Workflow, TemplateError> {
        let template = match version {
            Some(v) => self.get_template(name, v)?,
            None => self.get_latest_version(name)?,
        };
        self.create_workflow_from_template(&template, params)
    }

    /// Build a fresh `Pending` workflow from `template`.
    ///
    /// Each parameter resolves to the caller's value, else its default. A
    /// top-level input value that is a string equal to a declared parameter
    /// name is replaced by that parameter's value; nothing else is rewritten.
    ///
    /// # Errors
    /// [`TemplateError::MissingParameter`] for a required parameter with no
    /// value and no default.
    pub fn create_workflow_from_template(
        &self,
        template: &WorkflowTemplate,
        params: &ParamMap,
    ) -> Result<Workflow, TemplateError> {
        let mut resolved = ParamMap::new();
        for param in &template.spec.parameters {
            match params.get(&param.name).or(param.default.as_ref()) {
                Some(value) => {
                    resolved.insert(param.name.clone(), value.clone());
                }
                None if param.required => {
                    return Err(TemplateError::MissingParameter(param.name.clone()));
                }
                None => {}
            }
        }

        let tasks = template
            .spec
            .tasks
            .iter()
            .map(|tt| Task {
                name: tt.name.clone(),
                kind: tt.kind.clone(),
                retry_count: tt.retry_count,
                retry_logic: tt.retry_logic,
                timeout_seconds: tt.timeout_seconds,
                input_parameters: substitute(&tt.input_template, &resolved),
                optional: tt.optional,
            })
            .collect();

        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let mut labels = BTreeMap::new();
        labels.insert("template".to_owned(), template.name().to_owned());
        labels.insert("templateVersion".to_owned(), template.version().to_string());

        Ok(Workflow {
            metadata: ResourceMeta {
                name: format!("{}-{suffix}", template.name()),
                namespace: template.metadata.namespace.clone(),
                generate_name: Some(format!("{}-", template.name())),
                labels,
            },
            spec: WorkflowSpec {
                description: template.spec.description.clone(),
                version: template.version(),
                owner_email: None,
                timeout_policy: TimeoutPolicy::TimeOut,
                timeout_seconds: TEMPLATE_WORKFLOW_TIMEOUT_SECONDS,
                tasks,
            },
            status: WorkflowStatus::default(),
        })
    }

    /// Remove one version; the name disappears with its last version.
    pub fn delete_template(&self, name: &str, version: u32) -> Result<(), TemplateError> {
        let mut templates = self.templates.write();
        let versions = templates
            .get_mut(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_owned()))?;
        if versions.remove(&version).is_none() {
            return Err(TemplateError::VersionNotFound {
                name: name.to_owned(),
                version,
            });
        }
        if versions.is_empty() {
            templates.remove(name);
        }
        Ok(())
    }

    /// Snapshot of every template, ordered by name then version.
    pub fn list_templates(&self) -> Vec<Arc<WorkflowTemplate>> {
        let templates = self.templates.read();
        let mut names: Vec<&String> = templates.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| templates[name].values().cloned())
            .collect()
    }
}

fn substitute(input: &ParamMap, resolved: &ParamMap) -> ParamMap {
    input
        .iter()
        .map(|(key, value)| {
            let value = match value {
                ParamValue::String(s) => resolved.get(s).cloned().unwrap_or_else(|| value.clone()),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Parameter, TaskKind, TaskTemplate, TemplateSpec, WorkflowPhase};
    use crate::EngineError;

    fn param(name: &str, required: bool, default: Option<ParamValue>) -> Parameter {
        Parameter {
            name: name.into(),
            description: String::new(),
            param_type: "string".into(),
            required,
            default,
        }
    }

    fn task_template(name: &str, input: ParamMap, deps: &[&str]) -> TaskTemplate {
        TaskTemplate {
            name: name.into(),
            kind: TaskKind::Http,
            retry_count: 2,
            retry_logic: Default::default(),
            timeout_seconds: 30,
            input_template: input,
            optional: false,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn template(name: &str, version: u32) -> WorkflowTemplate {
        let mut input = ParamMap::new();
        input.insert("target".into(), "url".into());
        input.insert("region".into(), "region".into());
        input.insert("literal".into(), "not-a-param".into());
        input.insert("count".into(), ParamValue::Integer(3));

        WorkflowTemplate {
            metadata: ResourceMeta::new(name).in_namespace("ops"),
            spec: TemplateSpec {
                version,
                description: "deploy".into(),
                parameters: vec![
                    param("url", true, None),
                    param("region", false, Some("eu-west-1".into())),
                ],
                tasks: vec![task_template("call", input, &[])],
            },
        }
    }

    #[test]
    fn duplicate_version_conflicts() {
        let registry = TemplateRegistry::new();
        registry.add_template(template("deploy", 1)).unwrap();

        let mut clash = template("deploy", 1);
        clash.spec.description = "rollback".into();
        clash.spec.tasks = vec![task_template("undo", ParamMap::new(), &[])];
        assert!(matches!(
            registry.add_template(clash),
            Err(TemplateError::Conflict { version: 1, .. })
        ));

        let stored = registry.get_template("deploy", 1).unwrap();
        assert_eq!(stored.spec.description, "deploy");
        assert_eq!(stored.spec.tasks[0].name, "call");
        assert_eq!(registry.list_templates().len(), 1);
    }

    #[test]
    fn lookups_distinguish_missing_name_and_version() {
        let registry = TemplateRegistry::new();
        registry.add_template(template("deploy", 1)).unwrap();
        registry.add_template(template("deploy", 3)).unwrap();
        registry.add_template(template("deploy", 2)).unwrap();

        assert_eq!(registry.get_latest_version("deploy").unwrap().version(), 3);
        assert_eq!(registry.get_template("deploy", 2).unwrap().version(), 2);
        assert!(matches!(
            registry.get_template("deploy", 9),
            Err(TemplateError::VersionNotFound { version: 9, .. })
        ));
        assert!(matches!(
            registry.get_latest_version("nope"),
            Err(TemplateError::NotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn cyclic_template_is_rejected() {
        let mut tpl = template("loop", 1);
        tpl.spec.tasks = vec![
            task_template("a", ParamMap::new(), &["b"]),
            task_template("b", ParamMap::new(), &["a"]),
        ];
        let err = TemplateRegistry::new().add_template(tpl).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Invalid {
                source: EngineError::CycleDetected,
                ..
            }
        ));
    }

    #[test]
    fn instantiation_substitutes_declared_parameters_only() {
        let registry = TemplateRegistry::new();
        registry.add_template(template("deploy", 1)).unwrap();

        let mut params = ParamMap::new();
        params.insert("url".into(), "http://svc/deploy".into());
        let wf = registry.instantiate("deploy", None, &params).unwrap();

        assert!(wf.metadata.name.starts_with("deploy-"));
        assert_eq!(wf.metadata.name.len(), "deploy-".len() + 8);
        assert_eq!(wf.metadata.generate_name.as_deref(), Some("deploy-"));
        assert_eq!(wf.metadata.namespace, "ops");
        assert_eq!(wf.metadata.labels["template"], "deploy");
        assert_eq!(wf.metadata.labels["templateVersion"], "1");
        assert_eq!(wf.spec.timeout_policy, TimeoutPolicy::TimeOut);
        assert_eq!(wf.spec.timeout_seconds, 3600);
        assert_eq!(wf.status.phase, WorkflowPhase::Pending);

        let task = &wf.spec.tasks[0];
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.timeout_seconds, 30);
        let input = &task.input_parameters;
        assert_eq!(input["target"], ParamValue::from("http://svc/deploy"));
        assert_eq!(input["region"], ParamValue::from("eu-west-1"));
        assert_eq!(input["literal"], ParamValue::from("not-a-param"));
        assert_eq!(input["count"], ParamValue::Integer(3));
    }

    #[test]
    fn missing_required_parameter_fails() {
        let registry = TemplateRegistry::new();
        registry.add_template(template("deploy", 1)).unwrap();
        assert!(matches!(
            registry.instantiate("deploy", Some(1), &ParamMap::new()),
            Err(TemplateError::MissingParameter(name)) if name == "url"
        ));

        let templates = registry.list_templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].name(), "deploy");
        assert_eq!(templates[0].version(), 1);
    }

    #[test]
    fn two_instantiations_get_distinct_names() {
        let registry = TemplateRegistry::new();
        let tpl = template("deploy", 1);
        let mut params = ParamMap::new();
        params.insert("url".into(), "x".into());

        let a = registry.create_workflow_from_template(&tpl, &params).unwrap();
        let b = registry.create_workflow_from_template(&tpl, &params).unwrap();
        assert_ne!(a.metadata.name, b.metadata.name);
        assert!(registry.list_templates().is_empty());
    }

    #[test]
    fn delete_prunes_name_with_last_version() {
        let registry = TemplateRegistry::new();
        registry.add_template(template("b", 1)).unwrap();
        registry.add_template(template("a", 2)).unwrap();
        registry.add_template(template("a", 1)).unwrap();

        let listed: Vec<(String, u32)> = registry
            .list_templates()
            .iter()
            .map(|t| (t.name().to_owned(), t.version()))
            .collect();
        assert_eq!(
            listed,
            vec![("a".into(), 1), ("a".into(), 2), ("b".into(), 1)]
        );

        registry.delete_template("b", 1).unwrap();
        assert!(matches!(
            registry.get_latest_version("b"),
            Err(TemplateError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete_template("a", 7),
            Err(TemplateError::VersionNotFound { .. })
        ));
    }
}
