//! Execution document parsing and structural validation.
//!
//! Converts YAML execution documents into an `ExecutionSpec` and checks every
//! constraint that can be decided without building the graph: unique names,
//! dangling dependents, mutually exclusive work descriptions, volume shape and
//! numeric limits. Cycle detection lives in `graph`.

use std::collections::HashSet;
use std::path::Path;

use genegraph_types::execution::{CommandsIter, ExecutionSpec, Task, TaskWork};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Reasons an execution is rejected at submission. The execution never starts.
#[derive(Debug, Error)]
pub enum GraphValidationError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution declares no tasks")]
    Empty,

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("duplicate task name: '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{target}'")]
    DanglingDependency { task: String, target: String },

    #[error("cycle detected involving tasks: {}", .vertices.join(" -> "))]
    Cycle { vertices: Vec<String> },

    #[error("task '{task}' is invalid: {reason}")]
    InvalidTask { task: String, reason: String },
}

impl GraphValidationError {
    /// Task names the error is about, for user-facing reports.
    pub fn offending_tasks(&self) -> Vec<&str> {
        match self {
            Self::InvalidName { name, .. } => vec![name],
            Self::DuplicateTask(name) => vec![name],
            Self::DanglingDependency { task, target } => vec![task, target],
            Self::Cycle { vertices } => vertices.iter().map(String::as_str).collect(),
            Self::InvalidTask { task, .. } => vec![task],
            Self::Parse(_) | Self::Io(_) | Self::Empty => Vec::new(),
        }
    }

    fn invalid_task(task: &Task, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            task: task.name.clone(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A named execution as written by users: `name` plus the `ExecutionSpec` fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDocument {
    pub name: String,
    #[serde(flatten)]
    pub spec: ExecutionSpec,
}

/// Parse a YAML document into a structurally valid `ExecutionDocument`.
pub fn parse_execution_yaml(yaml: &str) -> Result<ExecutionDocument, GraphValidationError> {
    let doc: ExecutionDocument =
        serde_yaml_ng::from_str(yaml).map_err(|e| GraphValidationError::Parse(e.to_string()))?;
    validate_name(&doc.name)?;
    validate_spec(&doc.spec)?;
    Ok(doc)
}

/// Load an execution document from a YAML file.
pub fn load_execution_file(path: &Path) -> Result<ExecutionDocument, GraphValidationError> {
    let content = std::fs::read_to_string(path)?;
    parse_execution_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Execution and task names: non-empty ASCII alphanumerics, `-` and `_`.
///
/// The `.` is reserved for fan-out child names (`<task>.<index>`), so a child
/// can never collide with a declared task.
pub fn validate_name(name: &str) -> Result<(), GraphValidationError> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        "only ASCII alphanumerics, '-' and '_' are allowed"
    } else {
        return Ok(());
    };
    Err(GraphValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Validate structural constraints on an `ExecutionSpec`.
///
/// Checks:
/// - At least one task exists and every task name is valid and unique
/// - Every dependent target names a declared task
/// - Exactly one of `command_set` / `commands_iter` is set
/// - `commands_iter` has exactly one element source, and `from_result`
///   reads a declared dependent
/// - Volumes have an absolute mount path and a claim
/// - `parallelism` >= 1 and `active_deadline_seconds` > 0 when set
/// - Conditions are non-empty
pub fn validate_spec(spec: &ExecutionSpec) -> Result<(), GraphValidationError> {
    if spec.tasks.is_empty() {
        return Err(GraphValidationError::Empty);
    }

    let mut names = HashSet::new();
    for task in &spec.tasks {
        validate_name(&task.name)?;
        if !names.insert(task.name.as_str()) {
            return Err(GraphValidationError::DuplicateTask(task.name.clone()));
        }
    }

    for task in &spec.tasks {
        for target in task.dependent_targets() {
            if !names.contains(target) {
                return Err(GraphValidationError::DanglingDependency {
                    task: task.name.clone(),
                    target: target.to_string(),
                });
            }
        }
        validate_task(task)?;
    }

    if spec.parallelism == Some(0) {
        return Err(GraphValidationError::InvalidTask {
            task: "<execution>".to_string(),
            reason: "parallelism must be >= 1".to_string(),
        });
    }

    Ok(())
}

fn validate_task(task: &Task) -> Result<(), GraphValidationError> {
    match task.work() {
        None => {
            return Err(GraphValidationError::invalid_task(
                task,
                "exactly one of command_set and commands_iter must be set",
            ));
        }
        Some(TaskWork::Iter(iter)) => validate_iter(task, iter)?,
        Some(TaskWork::Commands(_)) => {}
    }

    for (name, volume) in &task.volumes {
        if !volume.mount_path.starts_with('/') {
            return Err(GraphValidationError::invalid_task(
                task,
                format!("volume '{name}' mount_path must be absolute"),
            ));
        }
        if volume.mount_from.pvc.is_empty() {
            return Err(GraphValidationError::invalid_task(
                task,
                format!("volume '{name}' has no claim"),
            ));
        }
    }

    if task.parallelism == Some(0) {
        return Err(GraphValidationError::invalid_task(task, "parallelism must be >= 1"));
    }
    if task.active_deadline_seconds == Some(0) {
        return Err(GraphValidationError::invalid_task(
            task,
            "active_deadline_seconds must be > 0",
        ));
    }
    if let Some(condition) = &task.condition {
        if condition.expression.trim().is_empty() {
            return Err(GraphValidationError::invalid_task(task, "condition is empty"));
        }
        if task.dependents.is_empty() {
            return Err(GraphValidationError::invalid_task(
                task,
                "condition requires at least one dependent",
            ));
        }
    }

    Ok(())
}

fn validate_iter(task: &Task, iter: &CommandsIter) -> Result<(), GraphValidationError> {
    if iter.command.trim().is_empty() {
        return Err(GraphValidationError::invalid_task(task, "commands_iter.command is empty"));
    }

    let sources = [
        !iter.vars.is_empty(),
        !iter.vars_iter.is_empty(),
        iter.from_result.is_some(),
    ];
    if sources.iter().filter(|set| **set).count() != 1 {
        return Err(GraphValidationError::invalid_task(
            task,
            "commands_iter needs exactly one of vars, vars_iter and from_result",
        ));
    }

    if let Some(source) = &iter.from_result {
        if !task.dependent_targets().any(|t| t == source.task) {
            return Err(GraphValidationError::invalid_task(
                task,
                format!("from_result reads '{}', which is not a dependent", source.task),
            ));
        }
        if source.separator.is_empty() {
            return Err(GraphValidationError::invalid_task(task, "from_result separator is empty"));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{command_task, fan_out_task, spec_of};
    use genegraph_types::execution::{Condition, ResultSource, Volume, VolumeSource};

    #[test]
    fn test_parse_yaml_document() {
        let yaml = r#"
name: wgs-sample-7
parallelism: 8
node_selector:
  pool: batch
tasks:
  - name: align
    image: bwa:0.7
    command_set: ["bwa mem ref.fa r1.fq r2.fq > /data/aln.sam"]
  - name: call
    image: gatk:4
    commands_iter:
      command: "gatk HaplotypeCaller -L chr${1}"
      vars_iter:
        - ["range(1,23)"]
    parallelism: 4
    dependents:
      - target: align
"#;
        let doc = parse_execution_yaml(yaml).unwrap();
        assert_eq!(doc.name, "wgs-sample-7");
        assert_eq!(doc.spec.tasks.len(), 2);
        assert_eq!(doc.spec.parallelism, Some(8));
        assert_eq!(doc.spec.node_selector["pool"], "batch");
        assert!(doc.spec.task("call").unwrap().is_fan_out());
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_execution_yaml("name: [").unwrap_err();
        assert!(matches!(err, GraphValidationError::Parse(_)));
    }

    #[test]
    fn test_validation_rejects_empty_spec() {
        let err = validate_spec(&ExecutionSpec::default()).unwrap_err();
        assert!(matches!(err, GraphValidationError::Empty));
    }

    #[test]
    fn test_validation_rejects_duplicate_task_names() {
        let spec = spec_of(vec![command_task("a", &[]), command_task("a", &[])]);
        let err = validate_spec(&spec).unwrap_err();
        assert!(matches!(err, GraphValidationError::DuplicateTask(ref n) if n == "a"));
        assert_eq!(err.offending_tasks(), vec!["a"]);
    }

    #[test]
    fn test_validation_rejects_dangling_dependency() {
        let spec = spec_of(vec![command_task("a", &["missing"])]);
        let err = validate_spec(&spec).unwrap_err();
        assert_eq!(err.to_string(), "task 'a' depends on unknown task 'missing'");
    }

    #[test]
    fn test_validation_rejects_reserved_characters() {
        let spec = spec_of(vec![command_task("split.0", &[])]);
        let err = validate_spec(&spec).unwrap_err();
        assert!(matches!(err, GraphValidationError::InvalidName { .. }));
        assert!(validate_name("").is_err());
        assert!(validate_name("call_variants-2").is_ok());
    }

    #[test]
    fn test_validation_rejects_both_work_descriptions() {
        let mut task = fan_out_task("a", &[], &["1", "2"]);
        task.command_set = vec!["true".to_string()];
        let err = validate_spec(&spec_of(vec![task])).unwrap_err();
        assert!(err.to_string().contains("exactly one of command_set"));
    }

    #[test]
    fn test_validation_rejects_missing_work_description() {
        let mut task = command_task("a", &[]);
        task.command_set.clear();
        assert!(validate_spec(&spec_of(vec![task])).is_err());
    }

    #[test]
    fn test_validation_rejects_multiple_element_sources() {
        let mut task = fan_out_task("a", &[], &["x"]);
        if let Some(iter) = task.commands_iter.as_mut() {
            iter.vars_iter = vec![vec!["range(0,3)".to_string()]];
        }
        let err = validate_spec(&spec_of(vec![task])).unwrap_err();
        assert!(err.to_string().contains("exactly one of vars"));
    }

    #[test]
    fn test_validation_requires_result_source_to_be_dependent() {
        let mut task = fan_out_task("b", &[], &["x"]);
        if let Some(iter) = task.commands_iter.as_mut() {
            iter.vars.clear();
            iter.from_result = Some(ResultSource {
                task: "a".to_string(),
                separator: "\n".to_string(),
            });
        }
        let spec = spec_of(vec![command_task("a", &[]), task]);
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("not a dependent"));
    }

    #[test]
    fn test_validation_rejects_relative_mount_path() {
        let mut task = command_task("a", &[]);
        task.volumes.insert(
            "data".to_string(),
            Volume {
                mount_path: "data".to_string(),
                mount_from: VolumeSource {
                    pvc: "claim".to_string(),
                },
            },
        );
        let err = validate_spec(&spec_of(vec![task])).unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut task = command_task("a", &[]);
        task.active_deadline_seconds = Some(0);
        assert!(validate_spec(&spec_of(vec![task])).is_err());

        let mut spec = spec_of(vec![command_task("a", &[])]);
        spec.parallelism = Some(0);
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_validation_rejects_condition_without_dependents() {
        let mut task = command_task("a", &[]);
        task.condition = Some(Condition {
            expression: "true".to_string(),
        });
        let err = validate_spec(&spec_of(vec![task])).unwrap_err();
        assert!(err.to_string().contains("requires at least one dependent"));
    }

    #[test]
    fn test_load_execution_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.yaml");
        std::fs::write(
            &path,
            "name: tiny\ntasks:\n  - name: hello\n    command_set: [\"echo hi\"]\n",
        )
        .unwrap();
        let doc = load_execution_file(&path).unwrap();
        assert_eq!(doc.name, "tiny");

        let err = load_execution_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, GraphValidationError::Io(_)));
    }
}
