//! Task graph validation. Run this before admitting a workflow or template.
//!
//! Rules enforced:
//! 1. Task names must be unique (they join a task to its status entry).
//! 2. Every `dependsOn` entry must name a task of the same template.
//! 3. The dependency graph must be acyclic (topological sort must succeed).
//!
//! Template validation returns the task names in a dependency-respecting
//! order; ties keep the declared order.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{TemplateSpec, WorkflowSpec};
use crate::EngineError;

fn ensure_unique<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), EngineError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(EngineError::DuplicateTaskName(name.to_owned()));
        }
    }
    Ok(())
}

/// Validate a workflow spec.
///
/// # Errors
/// [`EngineError::DuplicateTaskName`] if two tasks share a name.
pub fn validate_workflow(spec: &WorkflowSpec) -> Result<(), EngineError> {
    ensure_unique(spec.tasks.iter().map(|t| t.name.as_str()))
}

/// Validate a template's tasks and return them in dependency order.
///
/// # Errors
/// - [`EngineError::DuplicateTaskName`] if two tasks share a name.
/// - [`EngineError::UnknownDependency`] if `dependsOn` names a missing task.
/// - [`EngineError::CycleDetected`] if the dependencies are cyclic.
pub fn validate_template(spec: &TemplateSpec) -> Result<Vec<String>, EngineError> {
    ensure_unique(spec.tasks.iter().map(|t| t.name.as_str()))?;

    let position: HashMap<&str, usize> = spec
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    // Kahn's algorithm over task indices.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); spec.tasks.len()];
    let mut in_degree: Vec<usize> = vec![0; spec.tasks.len()];

    for (i, task) in spec.tasks.iter().enumerate() {
        for dep in &task.depends_on {
            let &from = position.get(dep.as_str()).ok_or_else(|| EngineError::UnknownDependency {
                task: task.name.clone(),
                dependency: dep.clone(),
            })?;
            dependents[from].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: VecDeque<usize> = (0..spec.tasks.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut sorted = Vec::with_capacity(spec.tasks.len());

    while let Some(i) = ready.pop_front() {
        sorted.push(spec.tasks[i].name.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if sorted.len() != spec.tasks.len() {
        return Err(EngineError::CycleDetected);
    }
    Ok(sorted)
}
