//! Status aggregator: derives the execution phase from its vertices.
//!
//! - `Failed` as soon as any vertex is Failed (fail-fast). The message names
//!   the earliest-finished failed job vertex and its reason.
//! - `Succeeded` once every declared task has a vertex and every vertex is
//!   Succeeded or Skipped.
//! - `Running` otherwise.
//!
//! `finished_at` is stamped once the phase is terminal, every declared task has
//! a vertex and no vertex is still active. A failed execution therefore only
//! settles after its running jobs end and its failure-tolerant tasks are
//! resolved.

use chrono::{DateTime, Utc};
use genegraph_types::execution::{ExecutionPhase, ExecutionSpec, ExecutionStatus};
use genegraph_types::vertex::{VertexPhase, VertexStatus};

/// Stateless aggregator.
pub struct StatusAggregator;

impl StatusAggregator {
    /// Recompute `status.phase`, `message` and `finished_at`.
    ///
    /// Returns `(from, to)` when the phase changed.
    pub fn aggregate(
        spec: &ExecutionSpec,
        status: &mut ExecutionStatus,
        now: DateTime<Utc>,
    ) -> Option<(ExecutionPhase, ExecutionPhase)> {
        let from = status.phase;

        let (phase, message) = if let Some(failed) = Self::most_specific_failure(status) {
            let reason = failed.reason.as_deref().unwrap_or("failed");
            (ExecutionPhase::Failed, Some(format!("{}: {reason}", failed.name)))
        } else if Self::all_resolved(spec, status) {
            (ExecutionPhase::Succeeded, None)
        } else {
            (ExecutionPhase::Running, None)
        };

        status.phase = phase;
        status.message = message;
        if status.started_at.is_none() {
            status.started_at = Some(now);
        }

        let active = status.vertices.values().any(|v| v.phase.is_active());
        let covered = spec.tasks.iter().all(|t| status.vertices.contains_key(&t.name));
        if phase.is_terminal() && covered && !active {
            status.finished_at.get_or_insert(now);
        }

        (from != phase).then_some((from, phase))
    }

    /// Earliest-finished failed vertex, preferring vertices that ran jobs
    /// over fan-out parents (whose reason only points at a child).
    fn most_specific_failure(status: &ExecutionStatus) -> Option<&VertexStatus> {
        status
            .vertices
            .values()
            .filter(|v| v.phase == VertexPhase::Failed)
            .min_by_key(|v| (v.is_fan_out_parent(), v.finished_at, v.name.clone()))
    }

    fn all_resolved(spec: &ExecutionSpec, status: &ExecutionStatus) -> bool {
        spec.tasks.iter().all(|t| status.vertices.contains_key(&t.name))
            && status
                .vertices
                .values()
                .all(|v| matches!(v.phase, VertexPhase::Succeeded | VertexPhase::Skipped))
    }
}
