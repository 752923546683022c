//! Vertex runtime records.
//!
//! A vertex is one concrete schedulable unit: a declared task, or one child
//! produced by fan-out. Its `VertexStatus` lives in the execution's status map
//! keyed by vertex name, and parents reference their children by name only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// VertexPhase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a vertex.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal. `Retrying` is the waiting
/// period between a failed attempt and the next submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexPhase {
    #[default]
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl VertexPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Still waiting on the backend or on a retry timer.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for VertexPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for VertexPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown vertex phase: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure causes and attempts
// ---------------------------------------------------------------------------

/// Why a vertex ended up Failed (or why an attempt failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The backend reported the job as failed.
    BackendReported,
    /// The backend refused or could not accept the submission.
    SubmissionFailed,
    /// `active_deadline_seconds` elapsed while Running.
    DeadlineExceeded,
    /// The last allowed attempt failed.
    RetryExhausted,
    /// The task's condition could not be evaluated.
    ConditionError,
    /// The iteration template could not be expanded.
    FanOutError,
    /// A fan-out child failed.
    ChildFailed,
    /// The execution failed elsewhere before this fan-out parent finished.
    ExecutionAborted,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BackendReported => "backend_reported",
            Self::SubmissionFailed => "submission_failed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::RetryExhausted => "retry_exhausted",
            Self::ConditionError => "condition_error",
            Self::FanOutError => "fan_out_error",
            Self::ChildFailed => "child_failed",
            Self::ExecutionAborted => "execution_aborted",
        };
        f.write_str(s)
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    SubmissionFailed,
    DeadlineExceeded,
}

impl AttemptOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Succeeded)
    }
}

/// History entry for one attempt of a vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// `None` when the submission itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Opaque identifier the backend returned for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(pub String);

impl BackendHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// VertexStatus
// ---------------------------------------------------------------------------

/// Mutable runtime record of one vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexStatus {
    /// Vertex name: the task name, or `<task>.<index>` for a fan-out child.
    pub name: String,
    /// Task this vertex was created from.
    pub task: String,
    /// Fan-out parent, for children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Element index within the parent's expansion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub phase: VertexPhase,
    /// Rendered command set for fan-out children. Task vertices run the
    /// task's own `command_set`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    /// First time the vertex entered Running. Not reset by retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    /// Earliest time a Retrying vertex may be released back to Pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    /// Result recorded from the backend on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Handle of the job currently submitted for this vertex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<BackendHandle>,
    /// Names of the fan-out children spawned from this vertex.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl VertexStatus {
    /// A fresh Pending vertex for a declared task.
    pub fn for_task(task: impl Into<String>, now: DateTime<Utc>) -> Self {
        let task = task.into();
        Self {
            name: task.clone(),
            task,
            parent: None,
            index: None,
            phase: VertexPhase::Pending,
            command_set: Vec::new(),
            attempts: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
            last_transition_at: now,
            next_attempt_at: None,
            reason: None,
            failure: None,
            output: None,
            handle: None,
            children: Vec::new(),
        }
    }

    /// A fresh Pending fan-out child.
    pub fn for_child(
        name: impl Into<String>,
        parent: &str,
        index: usize,
        command_set: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent.to_string()),
            index: Some(index),
            command_set,
            ..Self::for_task(parent, now)
        }
    }

    pub fn is_fan_out_parent(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Number of attempts that ended in failure.
    pub fn failed_attempts(&self) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.outcome.is_failure())
            .count() as u32
    }

    /// Attempt number the next submission will carry.
    pub fn next_attempt(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }
}
