//! Execution controller: submission, per-execution reconciliation loops,
//! status queries, deletion and resume after restart.
//!
//! Each execution is driven by its own loop that runs one reconciliation
//! pass, persists the resulting status snapshot and sleeps for the resync
//! interval. Passes for the same execution are serialized by a per-name lock,
//! while different executions reconcile concurrently up to
//! `max_concurrent_executions`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use genegraph_types::config::EngineConfig;
use genegraph_types::error::RepositoryError;
use genegraph_types::event::EngineEvent;
use genegraph_types::execution::{Execution, ExecutionSpec, ExecutionStatus, Volume};
use genegraph_types::vertex::VertexPhase;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, JobBackend};
use crate::event::EventBus;
use crate::repository::ExecutionRepository;

use super::definition::{validate_name, GraphValidationError};
use super::graph::build_graph;
use super::reconcile::{PassReport, Reconciler};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Graph(#[from] GraphValidationError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("execution '{0}' not found")]
    NotFound(String),

    #[error("execution '{0}' already exists")]
    AlreadyExists(String),

    #[error("execution '{0}' is already being reconciled")]
    AlreadyRunning(String),

    /// Some running jobs did not acknowledge cancellation. The execution is
    /// kept so deletion can be retried.
    #[error("execution '{execution}' kept: {} job(s) did not acknowledge cancellation", failures.len())]
    CancelUnacknowledged {
        execution: String,
        failures: Vec<String>,
    },

    #[error("controller is shutting down")]
    Shutdown,
}

// ---------------------------------------------------------------------------
// ExecutionController
// ---------------------------------------------------------------------------

/// Drives executions to completion against a job backend.
///
/// Generic over `B: JobBackend` and `R: ExecutionRepository` so the same
/// controller runs against the local process backend and SQLite in the
/// binary, and against in-memory fakes in tests.
pub struct ExecutionController<B: JobBackend, R: ExecutionRepository> {
    backend: Arc<B>,
    repo: Arc<R>,
    config: EngineConfig,
    event_bus: EventBus,
    /// Serializes passes and deletion for one execution.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Cancellation tokens of running loops keyed by execution name.
    loops: DashMap<String, CancellationToken>,
    permits: Semaphore,
}

impl<B, R> ExecutionController<B, R>
where
    B: JobBackend + 'static,
    R: ExecutionRepository + 'static,
{
    pub fn new(backend: Arc<B>, repo: Arc<R>, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        let permits = Semaphore::new(config.max_concurrent_executions.max(1));
        Self {
            backend,
            repo,
            config,
            event_bus,
            locks: DashMap::new(),
            loops: DashMap::new(),
            permits,
        }
    }

    /// Event bus carrying submission, transition and phase events.
    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry of an execution that no longer exists, unless a
    /// newer entry already replaced `lock`.
    fn forget_lock(&self, name: &str, lock: &Arc<Mutex<()>>) {
        self.locks.remove_if(name, |_, held| Arc::ptr_eq(held, lock));
    }

    /// Validate and store a new execution. Nothing runs until a loop is
    /// started for it.
    pub async fn submit(&self, name: &str, spec: ExecutionSpec) -> Result<Execution, ControllerError> {
        validate_name(name)?;
        build_graph(&spec)?;

        let execution = Execution::new(name, spec);
        self.repo.create(&execution).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => ControllerError::AlreadyExists(name.to_string()),
            other => ControllerError::Repository(other),
        })?;

        tracing::info!(
            execution = name,
            uid = %execution.uid,
            tasks = execution.spec.tasks.len(),
            "execution submitted"
        );
        self.event_bus.publish(EngineEvent::ExecutionSubmitted {
            execution: name.to_string(),
            uid: execution.uid,
            tasks: execution.spec.tasks.len(),
        });
        Ok(execution)
    }

    /// Run one reconciliation pass at `now` and persist its result.
    pub async fn reconcile_once(&self, name: &str, now: DateTime<Utc>) -> Result<PassReport, ControllerError> {
        self.pass(name, now).await.map(|(report, _)| report)
    }

    async fn pass(&self, name: &str, now: DateTime<Utc>) -> Result<(PassReport, ExecutionStatus), ControllerError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let Some(mut execution) = self.repo.get(name).await? else {
            self.forget_lock(name, &lock);
            return Err(ControllerError::NotFound(name.to_string()));
        };

        let report = Reconciler::new(self.backend.as_ref(), &self.config)
            .reconcile(&mut execution, now)
            .await;

        self.repo
            .update_status(name, &execution.status)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => ControllerError::NotFound(name.to_string()),
                other => ControllerError::Repository(other),
            })?;

        self.publish_report(name, &report, &execution.status, now);
        Ok((report, execution.status))
    }

    fn publish_report(&self, name: &str, report: &PassReport, status: &ExecutionStatus, now: DateTime<Utc>) {
        for change in &report.changes {
            self.event_bus.publish(EngineEvent::VertexTransitioned {
                execution: name.to_string(),
                vertex: change.vertex.clone(),
                from: change.from,
                to: change.to,
                reason: change.reason.clone(),
                at: now,
            });
        }
        for (vertex, children) in &report.expansions {
            self.event_bus.publish(EngineEvent::FanOutExpanded {
                execution: name.to_string(),
                vertex: vertex.clone(),
                children: children.clone(),
            });
        }
        if let Some((from, to)) = report.phase_change {
            self.event_bus.publish(EngineEvent::ExecutionPhaseChanged {
                execution: name.to_string(),
                from,
                to,
                message: status.message.clone(),
            });
        }
    }

    /// Reconcile `name` every resync interval until its status settles.
    ///
    /// Returns the final status, or the last status seen when the loop was
    /// stopped by deletion or shutdown.
    pub async fn run_to_completion(&self, name: &str) -> Result<ExecutionStatus, ControllerError> {
        let token = CancellationToken::new();
        match self.loops.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ControllerError::AlreadyRunning(name.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let result = self.drive(name, &token).await;
        self.loops.remove(name);
        result
    }

    async fn drive(&self, name: &str, token: &CancellationToken) -> Result<ExecutionStatus, ControllerError> {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| ControllerError::Shutdown)?,
            _ = token.cancelled() => return self.status(name).await.map(|e| e.status),
        };
        let interval = Duration::from_millis(self.config.resync_interval_ms);

        tracing::debug!(execution = name, "reconciliation loop started");
        loop {
            let (_, status) = self.pass(name, Utc::now()).await?;
            if status.is_settled() {
                tracing::info!(execution = name, phase = %status.phase, passes = status.passes, "execution settled");
                return Ok(status);
            }

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(execution = name, "reconciliation loop stopped");
                    return Ok(status);
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Start a background loop for `name`.
    pub fn spawn(self: &Arc<Self>, name: &str) -> JoinHandle<Result<ExecutionStatus, ControllerError>> {
        let controller = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = controller.run_to_completion(&name).await;
            if let Err(e) = &result {
                tracing::warn!(execution = name.as_str(), error = %e, "reconciliation loop ended with error");
            }
            result
        })
    }

    /// Start loops for every stored execution that has not settled. Used
    /// after a restart; passes recompute everything from persisted status.
    pub async fn resume_all(
        self: &Arc<Self>,
    ) -> Result<Vec<(String, JoinHandle<Result<ExecutionStatus, ControllerError>>)>, ControllerError> {
        let executions = self.repo.list().await?;
        let mut handles = Vec::new();
        for execution in executions {
            if execution.status.is_settled() || self.loops.contains_key(&execution.name) {
                continue;
            }
            tracing::info!(execution = execution.name.as_str(), phase = %execution.status.phase, "resuming execution");
            let handle = self.spawn(&execution.name);
            handles.push((execution.name, handle));
        }
        Ok(handles)
    }

    /// Owned snapshot of an execution.
    pub async fn status(&self, name: &str) -> Result<Execution, ControllerError> {
        self.repo
            .get(name)
            .await?
            .ok_or_else(|| ControllerError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Execution>, ControllerError> {
        Ok(self.repo.list().await?)
    }

    /// Delete an execution.
    ///
    /// Every Running job is cancelled first. If any cancellation is not
    /// acknowledged the execution is kept and its loop keeps running;
    /// otherwise volumes are released and the record is removed.
    ///
    /// Acknowledgement is only as strong as the backend's `cancel`. The local
    /// process backend treats a handle it no longer tracks (a job from before
    /// a restart, or one already reaped) as cancelled, so such a process is
    /// not stopped by deletion.
    pub async fn delete(&self, name: &str) -> Result<(), ControllerError> {
        let lock = self.lock_for(name);
        let guard = lock.lock().await;

        let execution = match self.status(name).await {
            Ok(execution) => execution,
            Err(e) => {
                if matches!(e, ControllerError::NotFound(_)) {
                    self.forget_lock(name, &lock);
                }
                return Err(e);
            }
        };
        let mut failures = Vec::new();
        for vertex in execution
            .status
            .vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Running)
        {
            let Some(handle) = &vertex.handle else {
                continue;
            };
            if let Err(e) = self.backend.cancel(handle).await {
                tracing::warn!(execution = name, vertex = vertex.name.as_str(), error = %e, "job cancellation failed");
                failures.push(format!("{}: {e}", vertex.name));
            }
        }
        if !failures.is_empty() {
            return Err(ControllerError::CancelUnacknowledged {
                execution: name.to_string(),
                failures,
            });
        }

        if let Some((_, token)) = self.loops.remove(name) {
            token.cancel();
        }

        let volumes: Vec<Volume> = execution
            .spec
            .tasks
            .iter()
            .flat_map(|t| t.volumes.values().cloned())
            .collect();
        self.backend.release_volumes(name, &volumes).await?;
        self.repo.delete(name).await?;
        drop(guard);
        self.forget_lock(name, &lock);

        tracing::info!(execution = name, "execution deleted");
        self.event_bus.publish(EngineEvent::ExecutionDeleted {
            execution: name.to_string(),
        });
        Ok(())
    }

    /// Stop every loop and refuse new ones.
    pub fn shutdown(&self) {
        self.permits.close();
        for entry in self.loops.iter() {
            entry.value().cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
