//! Execution domain types.
//!
//! An `Execution` is one submitted workflow instance: an immutable
//! `ExecutionSpec` (the declared task graph) plus a mutable `ExecutionStatus`
//! that only the engine writes. Scheduling hints (node selector, affinity,
//! tolerations) and resource quantities are opaque passthrough values for the
//! job backend; the engine never interprets them.
//!
//! All types derive `Clone` as a deep copy: nested maps, vectors and optional
//! structs are owned, so a working copy never aliases the stored spec.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::vertex::{VertexPhase, VertexStatus};

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One submitted workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// User-chosen name, unique within the engine.
    pub name: String,
    /// UUIDv7 assigned at submission.
    pub uid: Uuid,
    /// When the execution was submitted.
    pub created_at: DateTime<Utc>,
    /// Declared task graph. Immutable after submission.
    pub spec: ExecutionSpec,
    /// Runtime state. Written only by the engine.
    #[serde(default)]
    pub status: ExecutionStatus,
}

impl Execution {
    /// Create a freshly submitted execution with an empty status.
    pub fn new(name: impl Into<String>, spec: ExecutionSpec) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::now_v7(),
            created_at: Utc::now(),
            spec,
            status: ExecutionStatus::default(),
        }
    }

    /// Look up a declared task by name.
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.spec.task(name)
    }
}

// ---------------------------------------------------------------------------
// ExecutionSpec
// ---------------------------------------------------------------------------

/// The declared task graph of an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Flat task list; edges are declared on each task via `dependents`.
    pub tasks: Vec<Task>,
    /// Default node selector merged into every job (task keys win).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Default affinity for jobs whose task declares none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Value>,
    /// Default tolerations for jobs whose task declares none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Value>,
    /// Maximum number of vertices Running at once across the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    /// Join policy for dependent edges that do not declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_policy: Option<JoinPolicy>,
}

impl ExecutionSpec {
    /// Look up a task by name.
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A named node of the declared graph.
///
/// Exactly one of `command_set` and `commands_iter` describes the work; the
/// graph builder rejects tasks that set both or neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the execution.
    pub name: String,
    /// Container image or runtime identifier, forwarded to the backend.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Fixed command set run by a single vertex.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_set: Vec<String>,
    /// Iteration template expanded into one child vertex per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands_iter: Option<CommandsIter>,
    /// Shared storage mounted into the job, keyed by volume name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Volume>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Value>,
    /// Wall-clock budget for a vertex, measured from its first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<u64>,
    /// Total number of attempts before the vertex is Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<u32>,
    /// Maximum number of fan-out children Running at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    /// Upstream edges of this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<Dependent>,
    /// Gate evaluated against the recorded results of the dependents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// Borrowed view of a task's work description.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskWork<'a> {
    Commands(&'a [String]),
    Iter(&'a CommandsIter),
}

impl Task {
    /// The task's work description, or `None` when both or neither field is set.
    pub fn work(&self) -> Option<TaskWork<'_>> {
        match (&self.commands_iter, self.command_set.is_empty()) {
            (Some(iter), true) => Some(TaskWork::Iter(iter)),
            (None, false) => Some(TaskWork::Commands(&self.command_set)),
            _ => None,
        }
    }

    /// Whether this task fans out into child vertices.
    pub fn is_fan_out(&self) -> bool {
        self.commands_iter.is_some()
    }

    /// Names of all upstream tasks, in declaration order.
    pub fn dependent_targets(&self) -> impl Iterator<Item = &str> {
        self.dependents.iter().map(|d| d.target.as_str())
    }
}

// ---------------------------------------------------------------------------
// Dependent edges
// ---------------------------------------------------------------------------

/// A directed edge from an upstream task to the task that declares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    /// Name of the upstream task.
    pub target: String,
    #[serde(default)]
    pub kind: DependentKind,
    /// Overrides the execution/engine join policy for this edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinPolicy>,
}

impl Dependent {
    /// A plain completion edge using the default join policy.
    pub fn on(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind: DependentKind::Completion,
            join: None,
        }
    }
}

/// How a dependent edge is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentKind {
    /// The upstream task must finish; its outcome is joined per the join policy.
    #[default]
    Completion,
    /// The upstream task must finish; its outcome only feeds the condition.
    ConditionInput,
}

/// How the outcome of a completion edge gates the downstream task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// AND-join: every upstream must succeed, a failed or skipped upstream
    /// skips the downstream task.
    #[default]
    AllSucceeded,
    /// Any terminal outcome unblocks the downstream task.
    RunRegardless,
}

/// Conditional gate attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// JEXL expression over `tasks.<dependent>.{phase,output,reason,outputs}`.
    pub expression: String,
}

// ---------------------------------------------------------------------------
// Fan-out template
// ---------------------------------------------------------------------------

/// Iteration template: one concrete command per element.
///
/// Exactly one element source (`vars`, `vars_iter`, `from_result`) is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsIter {
    /// Command template with `${1}`..`${n}` and `${index}` placeholders.
    pub command: String,
    /// Explicit rows; each row is one element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<Vec<String>>,
    /// Value lists combined as a cartesian product. `range(a,b[,step])`
    /// entries expand to integers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars_iter: Vec<Vec<String>>,
    /// Elements read from the recorded output of a dependent task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_result: Option<ResultSource>,
}

/// Reads fan-out elements from the output of an upstream task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSource {
    pub task: String,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    "\n".to_string()
}

// ---------------------------------------------------------------------------
// Volumes and resources
// ---------------------------------------------------------------------------

/// Shared storage mounted into a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Absolute path inside the job.
    pub mount_path: String,
    pub mount_from: VolumeSource,
}

/// Backing claim of a volume. Only the backend interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSource {
    pub pvc: String,
}

/// CPU/memory quantities forwarded verbatim to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Aggregate phase of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable runtime record of an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub phase: ExecutionPhase,
    /// Most specific reason behind the current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the phase is terminal and no vertex is still active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Vertex name -> status. Task vertices use the task name, fan-out
    /// children use `<task>.<index>`.
    #[serde(default)]
    pub vertices: BTreeMap<String, VertexStatus>,
    /// Number of reconciliation passes applied.
    #[serde(default)]
    pub passes: u64,
}

impl ExecutionStatus {
    pub fn vertex(&self, name: &str) -> Option<&VertexStatus> {
        self.vertices.get(name)
    }

    /// Whether any vertex has reached Failed.
    pub fn has_failure(&self) -> bool {
        self.vertices.values().any(|v| v.phase == VertexPhase::Failed)
    }

    /// Vertices currently holding the Running phase, excluding fan-out
    /// parents (which only aggregate their children).
    pub fn running_jobs(&self) -> impl Iterator<Item = &VertexStatus> {
        self.vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Running && !v.is_fan_out_parent())
    }

    /// Terminal phase reached and nothing left running.
    pub fn is_settled(&self) -> bool {
        self.phase.is_terminal() && self.finished_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
tasks:
  - name: align
    image: bwa:0.7
    command_set:
      - "bwa mem ref.fa reads.fq > /data/out.sam"
    volumes:
      data:
        mount_path: /data
        mount_from:
          pvc: sample-pvc
    resources:
      cpu: "2"
      memory: 4Gi
    backoff_limit: 2
  - name: split
    commands_iter:
      command: "sort -k ${1} /data/out.sam"
      vars_iter:
        - ["range(1,4)"]
    parallelism: 2
    dependents:
      - target: align
  - name: report
    command_set: ["echo done"]
    dependents:
      - target: split
        join: run_regardless
      - target: align
        kind: condition_input
    condition:
      expression: "tasks.align.phase == 'succeeded'"
parallelism: 4
"#;

    #[test]
    fn test_spec_parses_from_yaml() {
        let spec: ExecutionSpec = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert_eq!(spec.tasks.len(), 3);
        assert_eq!(spec.parallelism, Some(4));

        let align = spec.task("align").unwrap();
        assert_eq!(align.backoff_limit, Some(2));
        assert_eq!(align.volumes["data"].mount_from.pvc, "sample-pvc");
        assert_eq!(align.resources.memory.as_deref(), Some("4Gi"));
        assert!(matches!(align.work(), Some(TaskWork::Commands(c)) if c.len() == 1));

        let split = spec.task("split").unwrap();
        assert!(split.is_fan_out());
        assert_eq!(split.dependents[0].kind, DependentKind::Completion);
        assert_eq!(split.dependents[0].join, None);

        let report = spec.task("report").unwrap();
        assert_eq!(report.dependents[0].join, Some(JoinPolicy::RunRegardless));
        assert_eq!(report.dependents[1].kind, DependentKind::ConditionInput);
        assert!(report.condition.is_some());
    }

    #[test]
    fn test_work_rejects_both_or_neither() {
        let mut task = Task {
            name: "t".to_string(),
            ..Default::default()
        };
        assert!(task.work().is_none());

        task.command_set = vec!["true".to_string()];
        task.commands_iter = Some(CommandsIter::default());
        assert!(task.work().is_none());
    }

    #[test]
    fn test_result_source_defaults_to_newline_separator() {
        let src: ResultSource = serde_json::from_str(r#"{"task":"a"}"#).unwrap();
        assert_eq!(src.separator, "\n");
    }

    #[test]
    fn test_cloned_spec_does_not_alias_original() {
        let spec: ExecutionSpec = serde_yaml_ng::from_str(SAMPLE).unwrap();
        let mut copy = spec.clone();
        copy.tasks[0].command_set.push("extra".to_string());
        copy.tasks[0].node_selector.insert("zone".to_string(), "a".to_string());

        assert_eq!(spec.tasks[0].command_set.len(), 1);
        assert!(spec.tasks[0].node_selector.is_empty());
        assert_ne!(spec, copy);
    }

    #[test]
    fn test_settled_requires_terminal_phase_and_finish_time() {
        let mut status = ExecutionStatus {
            phase: ExecutionPhase::Failed,
            ..Default::default()
        };
        assert!(!status.is_settled());
        status.finished_at = Some(Utc::now());
        assert!(status.is_settled());
    }
}
