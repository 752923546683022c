//! Job backend port.
//!
//! The engine never runs task payloads itself. It submits one job per vertex
//! attempt to a `JobBackend`, polls it on later passes and cancels it on
//! deadline or deletion. The backend is the only source of truth about job
//! progress, and all three calls must return without waiting for the job.

use std::collections::BTreeMap;

use genegraph_types::execution::{ExecutionSpec, ResourceRequirements, Task, Volume};
use genegraph_types::vertex::{BackendHandle, VertexStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BackendError {
    /// The job could not be accepted. Retried under the task's backoff.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// Status could not be read. The vertex stays Running until a later poll.
    #[error("poll failed: {0}")]
    Poll(String),

    #[error("cancel failed: {0}")]
    Cancel(String),

    #[error("unknown job handle '{0}'")]
    UnknownHandle(BackendHandle),
}

// ---------------------------------------------------------------------------
// Job description
// ---------------------------------------------------------------------------

/// Everything a backend needs to run one attempt of one vertex.
///
/// Scheduling hints, resources and volumes are copied verbatim from the `ExecutionSpec`;
/// the engine does not interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub execution: String,
    pub vertex: String,
    pub task: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub image: String,
    pub command_set: Vec<String>,
    pub volumes: BTreeMap<String, Volume>,
    pub resources: ResourceRequirements,
    /// Execution defaults merged with the task's selector (task keys win).
    pub node_selector: BTreeMap<String, String>,
    pub affinity: Option<Value>,
    pub tolerations: Vec<Value>,
    pub active_deadline_seconds: Option<u64>,
}

impl JobSpec {
    /// Build the job for the next attempt of `vertex`.
    ///
    /// Fan-out children run their rendered command set; task vertices run the
    /// task's own.
    pub fn for_vertex(
        execution: &str,
        spec: &ExecutionSpec,
        task: &Task,
        vertex: &VertexStatus,
    ) -> Self {
        let mut node_selector = spec.node_selector.clone();
        node_selector.extend(task.node_selector.iter().map(|(k, v)| (k.clone(), v.clone())));

        let command_set = if vertex.is_child() {
            vertex.command_set.clone()
        } else {
            task.command_set.clone()
        };

        Self {
            execution: execution.to_string(),
            vertex: vertex.name.clone(),
            task: task.name.clone(),
            attempt: vertex.next_attempt(),
            image: task.image.clone(),
            command_set,
            volumes: task.volumes.clone(),
            resources: task.resources.clone(),
            node_selector,
            affinity: task.affinity.clone().or_else(|| spec.affinity.clone()),
            tolerations: if task.tolerations.is_empty() {
                spec.tolerations.clone()
            } else {
                task.tolerations.clone()
            },
            active_deadline_seconds: task.active_deadline_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Job reports
// ---------------------------------------------------------------------------

/// State of a job as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Result of polling one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub state: JobState,
    pub reason: Option<String>,
    /// Result text recorded on the vertex when the job succeeded.
    pub output: Option<String>,
}

impl JobReport {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            reason: None,
            output: None,
        }
    }

    pub fn succeeded(output: Option<String>) -> Self {
        Self {
            state: JobState::Succeeded,
            reason: None,
            output,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            reason: Some(reason.into()),
            output: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Job execution backend. Must be safe for concurrent use by every
/// execution's reconciliation loop.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobBackend: Send + Sync {
    /// Submit a job and return its handle without waiting for it to run.
    fn submit(
        &self,
        job: &JobSpec,
    ) -> impl std::future::Future<Output = Result<BackendHandle, BackendError>> + Send;

    /// Read the current state of a submitted job.
    fn poll(
        &self,
        handle: &BackendHandle,
    ) -> impl std::future::Future<Output = Result<JobReport, BackendError>> + Send;

    /// Stop a job. `Ok` is the backend's acknowledgement that the job will
    /// not make further progress. Cancelling a finished job is acknowledged.
    fn cancel(
        &self,
        handle: &BackendHandle,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Release storage retained for an execution after all its jobs are
    /// cancelled.
    fn release_volumes(
        &self,
        _execution: &str,
        _volumes: &[Volume],
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send {
        async { Ok(()) }
    }
}
