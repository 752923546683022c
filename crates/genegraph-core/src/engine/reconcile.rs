//! Reconciliation scheduler: advances one execution by exactly one pass.
//!
//! A pass recomputes everything from the execution's current status, so it
//! can be replayed after a restart and repeated without effect when the
//! backend reports nothing new. Steps, in order:
//!
//! 1. Gate every task that has no vertex yet against the status snapshot
//!    taken at the start of the pass.
//! 2. Expand fan-out parents that became eligible.
//! 3. Release Retrying vertices whose backoff elapsed, failing those whose
//!    active deadline already passed.
//! 4. Submit runnable Pending vertices within the execution and fan-out
//!    parallelism budgets.
//! 5. Poll Running jobs (deadline first) and apply the reported outcome.
//! 6. Settle fan-out parents from their children, and once a failed
//!    execution has nothing left running, skip whatever never started.
//! 7. Aggregate the execution phase.
//!
//! Once any vertex has Failed only failure-tolerant tasks advance: those
//! reading a dependent through a `condition_input` edge or joining one with
//! `run_regardless`. Every other task that has not started is skipped.
//!
//! Every per-vertex error is recorded on that vertex or logged; none aborts
//! the pass.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use genegraph_types::config::EngineConfig;
use genegraph_types::execution::{Execution, ExecutionPhase, ExecutionSpec, ExecutionStatus, JoinPolicy};
use genegraph_types::vertex::{FailureCause, VertexPhase, VertexStatus};

use crate::backend::{JobBackend, JobSpec, JobState};

use super::condition::{tolerates_failure, ConditionEvaluator, Gate};
use super::fanout::FanOutExpander;
use super::graph::{build_graph, ExecutionGraph};
use super::retry::RetryPolicy;
use super::status::StatusAggregator;
use super::vertex::{VertexEvent, VertexStateMachine};

/// Reason recorded on vertices skipped because the execution already failed.
pub const EXECUTION_FAILED: &str = "execution failed";

/// Reason recorded on fan-out parents whose iteration produced no elements.
pub const NO_ITERATION_ELEMENTS: &str = "no iteration elements";

// ---------------------------------------------------------------------------
// PassReport
// ---------------------------------------------------------------------------

/// One vertex phase change made during a pass. `from` is `None` when the
/// vertex was created by the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexChange {
    pub vertex: String,
    pub from: Option<VertexPhase>,
    pub to: VertexPhase,
    pub reason: Option<String>,
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub changes: Vec<VertexChange>,
    /// Fan-out parents expanded in this pass with their children.
    pub expansions: Vec<(String, Vec<String>)>,
    pub submitted: usize,
    pub poll_errors: usize,
    pub phase_change: Option<(ExecutionPhase, ExecutionPhase)>,
}

impl PassReport {
    /// True when the pass changed nothing observable.
    pub fn is_quiet(&self) -> bool {
        self.changes.is_empty() && self.expansions.is_empty() && self.phase_change.is_none()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Runs reconciliation passes against a job backend.
pub struct Reconciler<'a, B: JobBackend> {
    backend: &'a B,
    config: &'a EngineConfig,
}

/// Per-pass working state.
struct Pass<'p> {
    execution: &'p str,
    spec: &'p ExecutionSpec,
    graph: &'p ExecutionGraph,
    config: &'p EngineConfig,
    now: DateTime<Utc>,
    report: PassReport,
}

impl<'a, B: JobBackend> Reconciler<'a, B> {
    pub fn new(backend: &'a B, config: &'a EngineConfig) -> Self {
        Self { backend, config }
    }

    /// Advance `execution` by one pass.
    pub async fn reconcile(&self, execution: &mut Execution, now: DateTime<Utc>) -> PassReport {
        let Execution {
            name, spec, status, ..
        } = execution;
        let name: &str = name;
        let spec: &ExecutionSpec = spec;

        if status.is_settled() {
            return PassReport::default();
        }

        let graph = match build_graph(spec) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::warn!(execution = name, error = %e, "execution graph is invalid");
                let from = status.phase;
                status.phase = ExecutionPhase::Failed;
                status.message = Some(e.to_string());
                status.finished_at.get_or_insert(now);
                status.passes += 1;
                return PassReport {
                    phase_change: (from != ExecutionPhase::Failed)
                        .then_some((from, ExecutionPhase::Failed)),
                    ..Default::default()
                };
            }
        };

        let mut pass = Pass {
            execution: name,
            spec,
            graph: &graph,
            config: self.config,
            now,
            report: PassReport::default(),
        };

        pass.gate_new_tasks(status);
        pass.expand_fan_outs(status);
        pass.release_retries(status);
        let submitted = self.submit_runnable(&mut pass, status).await;
        self.poll_running(&mut pass, status, &submitted).await;
        pass.settle_parents(status);
        if pass.settle_failed(status) {
            pass.settle_parents(status);
        }

        status.passes += 1;
        pass.report.phase_change = StatusAggregator::aggregate(spec, status, now);
        if let Some((from, to)) = pass.report.phase_change {
            tracing::info!(
                execution = name,
                from = %from,
                to = %to,
                message = status.message.as_deref().unwrap_or(""),
                "execution phase changed"
            );
        }
        pass.report
    }

    /// Step 4: submit Pending job vertices within parallelism budgets.
    async fn submit_runnable(&self, pass: &mut Pass<'_>, status: &mut ExecutionStatus) -> HashSet<String> {
        let spec = pass.spec;
        let mut submitted = HashSet::new();
        let failing = status.has_failure();

        let mut running_total = status.running_jobs().count();
        let mut running_by_parent: HashMap<String, usize> = HashMap::new();
        for v in status.running_jobs() {
            if let Some(parent) = &v.parent {
                *running_by_parent.entry(parent.clone()).or_default() += 1;
            }
        }

        for name in pass.runnable(status) {
            if let Some(cap) = spec.parallelism {
                if running_total >= cap as usize {
                    break;
                }
            }

            let Some(vertex) = status.vertices.get(&name) else {
                continue;
            };
            let Some(task) = spec.task(&vertex.task) else {
                continue;
            };
            if failing && !tolerates_failure(task, pass.default_join()) {
                continue;
            }
            if let (Some(parent), Some(cap)) = (&vertex.parent, task.parallelism) {
                if running_by_parent.get(parent).copied().unwrap_or(0) >= cap as usize {
                    continue;
                }
            }

            let job = JobSpec::for_vertex(pass.execution, spec, task, vertex);
            let event = match self.backend.submit(&job).await {
                Ok(handle) => {
                    tracing::debug!(
                        execution = pass.execution,
                        vertex = name.as_str(),
                        attempt = job.attempt,
                        handle = %handle,
                        "job submitted"
                    );
                    running_total += 1;
                    if let Some(parent) = &vertex.parent {
                        *running_by_parent.entry(parent.clone()).or_default() += 1;
                    }
                    pass.report.submitted += 1;
                    submitted.insert(name.clone());
                    VertexEvent::Submit { handle }
                }
                Err(e) => {
                    tracing::warn!(
                        execution = pass.execution,
                        vertex = name.as_str(),
                        attempt = job.attempt,
                        error = %e,
                        "job submission failed"
                    );
                    VertexEvent::SubmitFailed {
                        reason: e.to_string(),
                    }
                }
            };
            pass.apply(status, &name, event);
        }

        submitted
    }

    /// Step 5: poll Running jobs not submitted in this pass.
    async fn poll_running(&self, pass: &mut Pass<'_>, status: &mut ExecutionStatus, skip: &HashSet<String>) {
        let running: Vec<String> = status
            .running_jobs()
            .filter(|v| !skip.contains(&v.name))
            .map(|v| v.name.clone())
            .collect();

        for name in running {
            let Some(vertex) = status.vertices.get(&name) else {
                continue;
            };
            let expired = pass.expired_deadline(vertex);
            let Some(handle) = vertex.handle.clone() else {
                pass.apply(
                    status,
                    &name,
                    VertexEvent::Reject {
                        reason: "running without a backend handle".to_string(),
                        cause: FailureCause::BackendReported,
                    },
                );
                continue;
            };

            if let Some(seconds) = expired {
                if let Err(e) = self.backend.cancel(&handle).await {
                    tracing::warn!(
                        execution = pass.execution,
                        vertex = name.as_str(),
                        error = %e,
                        "cancel after deadline failed"
                    );
                }
                pass.apply(status, &name, VertexEvent::DeadlineExceeded { seconds });
                continue;
            }

            match self.backend.poll(&handle).await {
                Ok(report) => {
                    let event = match report.state {
                        JobState::Pending | JobState::Running => continue,
                        JobState::Succeeded => VertexEvent::Complete {
                            output: report.output,
                        },
                        JobState::Failed => VertexEvent::Fail {
                            reason: report.reason.unwrap_or_else(|| "job failed".to_string()),
                        },
                    };
                    pass.apply(status, &name, event);
                }
                Err(e) => {
                    pass.report.poll_errors += 1;
                    tracing::warn!(
                        execution = pass.execution,
                        vertex = name.as_str(),
                        error = %e,
                        "job poll failed"
                    );
                }
            }
        }
    }
}

impl Pass<'_> {
    fn default_join(&self) -> JoinPolicy {
        self.spec
            .join_policy
            .unwrap_or(self.config.default_join_policy)
    }

    /// Whether the vertices of `task_name` keep advancing after a failure.
    fn tolerant(&self, task_name: &str) -> bool {
        self.spec
            .task(task_name)
            .is_some_and(|t| tolerates_failure(t, self.default_join()))
    }

    /// The active deadline of `vertex`'s task once it has passed, counted
    /// from the vertex's first start so retries share one budget.
    fn expired_deadline(&self, vertex: &VertexStatus) -> Option<u64> {
        let seconds = self.spec.task(&vertex.task)?.active_deadline_seconds?;
        let started = vertex.started_at?;
        (self.now >= started + Duration::seconds(seconds as i64)).then_some(seconds)
    }

    fn policy_for(&self, task_name: &str) -> RetryPolicy {
        match self.spec.task(task_name) {
            Some(task) => RetryPolicy::for_task(
                task,
                self.config.default_backoff_limit,
                &self.config.backoff,
            ),
            None => RetryPolicy {
                limit: self.config.default_backoff_limit.max(1),
                backoff: self.config.backoff.clone(),
            },
        }
    }

    /// Apply `event` to vertex `name`, recording the change. Illegal
    /// transitions are logged and leave the vertex untouched.
    fn apply(&mut self, status: &mut ExecutionStatus, name: &str, event: VertexEvent) {
        let Some(vertex) = status.vertices.get_mut(name) else {
            return;
        };
        let policy = self.policy_for(&vertex.task);
        let mut machine = VertexStateMachine::new(vertex, &policy);
        match machine.apply(event, self.now) {
            Ok(transition) => {
                tracing::debug!(
                    execution = self.execution,
                    vertex = name,
                    from = %transition.from,
                    to = %transition.to,
                    "vertex transitioned"
                );
                self.report.changes.push(VertexChange {
                    vertex: name.to_string(),
                    from: Some(transition.from),
                    to: transition.to,
                    reason: vertex.reason.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(execution = self.execution, error = %e, "ignored vertex event");
            }
        }
    }

    /// Insert a fresh Pending vertex for `task`.
    fn create(&mut self, status: &mut ExecutionStatus, task: &str) {
        status
            .vertices
            .insert(task.to_string(), VertexStatus::for_task(task, self.now));
        self.report.changes.push(VertexChange {
            vertex: task.to_string(),
            from: None,
            to: VertexPhase::Pending,
            reason: None,
        });
    }

    /// Step 1: create vertices for tasks whose gate opened.
    fn gate_new_tasks(&mut self, status: &mut ExecutionStatus) {
        let snapshot = status.vertices.clone();
        let failing = status.has_failure();
        let evaluator = ConditionEvaluator::new(self.execution);
        let default_join = self.default_join();
        let (graph, spec) = (self.graph, self.spec);

        for name in graph.topological_order() {
            if status.vertices.contains_key(name) {
                continue;
            }
            let Some(task) = spec.task(name) else {
                continue;
            };

            match evaluator.gate(task, &snapshot, default_join) {
                Ok(Gate::Block(_)) => {}
                Ok(Gate::Proceed) if !failing || tolerates_failure(task, default_join) => {
                    self.create(status, name)
                }
                Ok(Gate::Proceed) => {
                    self.create(status, name);
                    self.skip(status, name, EXECUTION_FAILED.to_string());
                }
                Ok(Gate::Skip(reason)) => {
                    self.create(status, name);
                    self.skip(status, name, reason);
                }
                Err(e) => {
                    tracing::warn!(execution = self.execution, task = name.as_str(), error = %e, "condition failed");
                    self.create(status, name);
                    self.apply(
                        status,
                        name,
                        VertexEvent::Reject {
                            reason: e.to_string(),
                            cause: FailureCause::ConditionError,
                        },
                    );
                }
            }
        }
    }

    fn skip(&mut self, status: &mut ExecutionStatus, name: &str, reason: String) {
        self.apply(status, name, VertexEvent::Skip { reason });
    }

    /// Step 2: expand eligible fan-out parents.
    fn expand_fan_outs(&mut self, status: &mut ExecutionStatus) {
        let failing = status.has_failure();
        let spec = self.spec;
        let parents: Vec<String> = status
            .vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Pending && !v.is_child())
            .filter(|v| spec.task(&v.task).is_some_and(|t| t.is_fan_out()))
            .filter(|v| !failing || self.tolerant(&v.task))
            .map(|v| v.name.clone())
            .collect();

        for name in parents {
            let Some(task) = spec.task(&name) else {
                continue;
            };
            match FanOutExpander.expand(task, &mut status.vertices, self.now) {
                Ok(expansion) => {
                    self.apply(status, &name, VertexEvent::Expand);
                    if expansion.children.is_empty() {
                        self.apply(status, &name, VertexEvent::Complete { output: None });
                        if let Some(parent) = status.vertices.get_mut(&name) {
                            parent.reason = Some(NO_ITERATION_ELEMENTS.to_string());
                        }
                        continue;
                    }
                    if expansion.created {
                        tracing::info!(
                            execution = self.execution,
                            task = name.as_str(),
                            children = expansion.children.len(),
                            "fan-out expanded"
                        );
                        for child in &expansion.children {
                            self.report.changes.push(VertexChange {
                                vertex: child.clone(),
                                from: None,
                                to: VertexPhase::Pending,
                                reason: None,
                            });
                        }
                        self.report.expansions.push((name.clone(), expansion.children));
                    }
                }
                Err(e) => {
                    tracing::warn!(execution = self.execution, task = name.as_str(), error = %e, "fan-out failed");
                    self.apply(
                        status,
                        &name,
                        VertexEvent::Reject {
                            reason: e.to_string(),
                            cause: FailureCause::FanOutError,
                        },
                    );
                }
            }
        }
    }

    /// Step 3: move Retrying vertices back to Pending once their delay
    /// elapsed. A vertex past its active deadline fails instead of getting
    /// another attempt.
    fn release_retries(&mut self, status: &mut ExecutionStatus) {
        let failing = status.has_failure();
        let retrying: Vec<(String, Option<u64>, bool)> = status
            .vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Retrying)
            .filter(|v| !failing || self.tolerant(&v.task))
            .map(|v| {
                let due = v.next_attempt_at.is_none_or(|at| at <= self.now);
                (v.name.clone(), self.expired_deadline(v), due)
            })
            .collect();

        for (name, expired, due) in retrying {
            if let Some(seconds) = expired {
                self.apply(status, &name, VertexEvent::DeadlineExceeded { seconds });
            } else if due {
                self.apply(status, &name, VertexEvent::ReleaseRetry);
            }
        }
    }

    /// Pending job vertices in topological order of their task, children by
    /// index.
    fn runnable(&self, status: &ExecutionStatus) -> Vec<String> {
        let rank: HashMap<&str, usize> = self
            .graph
            .topological_order()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut pending: Vec<&VertexStatus> = status
            .vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Pending && !v.is_fan_out_parent())
            .filter(|v| {
                v.is_child() || self.spec.task(&v.task).is_some_and(|t| !t.is_fan_out())
            })
            .collect();
        pending.sort_by_key(|v| (rank.get(v.task.as_str()).copied().unwrap_or(usize::MAX), v.index));
        pending.into_iter().map(|v| v.name.clone()).collect()
    }

    /// Step 6a: settle Running fan-out parents from their children.
    fn settle_parents(&mut self, status: &mut ExecutionStatus) {
        let parents: Vec<(String, Vec<String>)> = status
            .vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Running && v.is_fan_out_parent())
            .map(|v| (v.name.clone(), v.children.clone()))
            .collect();

        for (name, children) in parents {
            let child_states: Vec<&VertexStatus> =
                children.iter().filter_map(|c| status.vertices.get(c)).collect();

            let event = if let Some(failed) = child_states.iter().find(|c| c.phase == VertexPhase::Failed) {
                VertexEvent::Reject {
                    reason: format!(
                        "child '{}' failed: {}",
                        failed.name,
                        failed.reason.as_deref().unwrap_or("unknown")
                    ),
                    cause: FailureCause::ChildFailed,
                }
            } else if child_states.iter().any(|c| c.phase.is_active()) {
                continue;
            } else if child_states.iter().all(|c| c.phase == VertexPhase::Succeeded) {
                let outputs: Vec<&str> = child_states.iter().filter_map(|c| c.output.as_deref()).collect();
                VertexEvent::Complete {
                    output: (!outputs.is_empty()).then(|| outputs.join("\n")),
                }
            } else {
                VertexEvent::Reject {
                    reason: EXECUTION_FAILED.to_string(),
                    cause: FailureCause::ExecutionAborted,
                }
            };
            self.apply(status, &name, event);
        }
    }

    /// Step 6b: once a failed execution has no running jobs, skip every
    /// vertex that never started and record the remaining tasks as skipped.
    /// Failure-tolerant tasks are left to the gate. Returns whether anything
    /// was skipped.
    fn settle_failed(&mut self, status: &mut ExecutionStatus) -> bool {
        if !status.has_failure() || status.running_jobs().next().is_some() {
            return false;
        }

        let waiting: Vec<String> = status
            .vertices
            .values()
            .filter(|v| matches!(v.phase, VertexPhase::Pending | VertexPhase::Retrying))
            .filter(|v| !self.tolerant(&v.task))
            .map(|v| v.name.clone())
            .collect();
        let graph = self.graph;
        let unstarted: Vec<String> = graph
            .topological_order()
            .iter()
            .filter(|t| !status.vertices.contains_key(t.as_str()) && !self.tolerant(t))
            .cloned()
            .collect();

        let changed = !waiting.is_empty() || !unstarted.is_empty();
        for name in waiting {
            self.skip(status, &name, EXECUTION_FAILED.to_string());
        }
        for name in unstarted {
            self.create(status, &name);
            self.skip(status, &name, EXECUTION_FAILED.to_string());
        }
        changed
    }
}

/// Names of the vertices of `status` currently in `phase`, sorted.
pub fn vertices_in(status: &ExecutionStatus, phase: VertexPhase) -> Vec<&str> {
    status
        .vertices
        .values()
        .filter(|v| v.phase == phase)
        .map(|v| v.name.as_str())
        .collect()
}
