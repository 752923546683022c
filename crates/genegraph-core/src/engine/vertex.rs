//! Vertex state machine.
//!
//! ```text
//! Pending --Submit--> Running --Complete--> Succeeded
//!    |                   |
//!    |                   +--Fail (attempts left)--> Retrying --ReleaseRetry--> Pending
//!    |                   |                             +--DeadlineExceeded--> Failed
//!    |                   +--Fail (exhausted) / DeadlineExceeded / Reject--> Failed
//!    +--Skip--> Skipped
//!    +--SubmitFailed--> Retrying | Failed
//!    +--Reject--> Failed
//! ```
//!
//! Every transition stamps `last_transition_at`; terminal transitions also
//! record `finished_at` and a reason. Terminal phases accept no events.

use chrono::{DateTime, Utc};
use genegraph_types::vertex::{
    AttemptOutcome, AttemptRecord, BackendHandle, FailureCause, VertexPhase, VertexStatus,
};
use thiserror::Error;

use super::retry::RetryPolicy;

/// Inputs that drive a vertex between phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertexEvent {
    /// The backend accepted a job for this vertex.
    Submit { handle: BackendHandle },
    /// A fan-out parent materialized its children.
    Expand,
    /// The backend reported success, or a parent's children all succeeded.
    Complete { output: Option<String> },
    /// The backend reported the job as failed.
    Fail { reason: String },
    /// The backend refused the submission.
    SubmitFailed { reason: String },
    /// `active_deadline_seconds` elapsed while Running.
    DeadlineExceeded { seconds: u64 },
    /// The retry delay elapsed.
    ReleaseRetry,
    /// Gating decided the vertex will never run.
    Skip { reason: String },
    /// Non-retryable failure decided by the engine.
    Reject { reason: String, cause: FailureCause },
}

impl VertexEvent {
    /// Short name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Submit { .. } => "submit",
            Self::Expand => "expand",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::SubmitFailed { .. } => "submit_failed",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::ReleaseRetry => "release_retry",
            Self::Skip { .. } => "skip",
            Self::Reject { .. } => "reject",
        }
    }
}

/// A phase change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: VertexPhase,
    pub to: VertexPhase,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("vertex '{vertex}' cannot handle '{event}' in phase {from}")]
    InvalidTransition {
        vertex: String,
        from: VertexPhase,
        event: &'static str,
    },
}

/// Applies events to one borrowed `VertexStatus`.
///
/// Created per event by the reconciler; it never outlives a pass.
pub struct VertexStateMachine<'a> {
    vertex: &'a mut VertexStatus,
    policy: &'a RetryPolicy,
}

impl<'a> VertexStateMachine<'a> {
    pub fn new(vertex: &'a mut VertexStatus, policy: &'a RetryPolicy) -> Self {
        Self { vertex, policy }
    }

    pub fn phase(&self) -> VertexPhase {
        self.vertex.phase
    }

    /// Apply `event` at time `now`.
    pub fn apply(
        &mut self,
        event: VertexEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        use VertexPhase::*;

        let from = self.vertex.phase;
        let event_type = event.event_type();
        let to = match (from, event) {
            (Pending, VertexEvent::Submit { handle }) => {
                self.vertex.handle = Some(handle);
                self.vertex.started_at.get_or_insert(now);
                self.vertex.next_attempt_at = None;
                self.vertex.reason = None;
                Running
            }
            (Pending, VertexEvent::Expand) => {
                self.vertex.started_at.get_or_insert(now);
                Running
            }
            (Running, VertexEvent::Complete { output }) => {
                self.close_attempt(AttemptOutcome::Succeeded, None, now);
                self.vertex.output = output;
                self.finish(None, None, now);
                Succeeded
            }
            (Running, VertexEvent::Fail { reason }) => {
                self.close_attempt(AttemptOutcome::Failed, Some(reason.clone()), now);
                self.after_failure(reason, FailureCause::BackendReported, now)
            }
            (Pending, VertexEvent::SubmitFailed { reason }) => {
                self.record_attempt(None, AttemptOutcome::SubmissionFailed, Some(reason.clone()), now);
                self.after_failure(reason, FailureCause::SubmissionFailed, now)
            }
            (Running | Retrying, VertexEvent::DeadlineExceeded { seconds }) => {
                let reason = format!("active deadline of {seconds}s exceeded");
                self.vertex.next_attempt_at = None;
                self.close_attempt(AttemptOutcome::DeadlineExceeded, Some(reason.clone()), now);
                self.finish(Some(reason), Some(FailureCause::DeadlineExceeded), now);
                Failed
            }
            (Retrying, VertexEvent::ReleaseRetry) => {
                self.vertex.next_attempt_at = None;
                Pending
            }
            (Pending | Retrying, VertexEvent::Skip { reason }) => {
                self.vertex.next_attempt_at = None;
                self.finish(Some(reason), None, now);
                Skipped
            }
            (Pending | Running, VertexEvent::Reject { reason, cause }) => {
                if from == Running {
                    self.close_attempt(AttemptOutcome::Failed, Some(reason.clone()), now);
                }
                self.finish(Some(reason), Some(cause), now);
                Failed
            }
            (from, _) => {
                return Err(TransitionError::InvalidTransition {
                    vertex: self.vertex.name.clone(),
                    from,
                    event: event_type,
                });
            }
        };

        self.vertex.phase = to;
        self.vertex.last_transition_at = now;
        Ok(Transition { from, to })
    }

    /// Decide between Retrying and Failed after a failed attempt.
    fn after_failure(
        &mut self,
        reason: String,
        cause: FailureCause,
        now: DateTime<Utc>,
    ) -> VertexPhase {
        let failures = self.vertex.failed_attempts();
        if self.policy.should_retry(failures) {
            let delay = self.policy.delay_for(failures);
            self.vertex.next_attempt_at = Some(now + delay);
            self.vertex.handle = None;
            self.vertex.reason = Some(format!(
                "attempt {failures}/{} failed: {reason}",
                self.policy.limit
            ));
            VertexPhase::Retrying
        } else {
            let cause = if self.policy.limit > 1 {
                FailureCause::RetryExhausted
            } else {
                cause
            };
            self.finish(Some(reason), Some(cause), now);
            VertexPhase::Failed
        }
    }

    /// Record the end of the attempt that entered Running at
    /// `last_transition_at`. Fan-out parents run no jobs and keep no attempts.
    fn close_attempt(&mut self, outcome: AttemptOutcome, reason: Option<String>, now: DateTime<Utc>) {
        if self.vertex.handle.is_none() {
            return;
        }
        let started = self.vertex.last_transition_at;
        self.record_attempt(Some(started), outcome, reason, now);
    }

    fn record_attempt(
        &mut self,
        started_at: Option<DateTime<Utc>>,
        outcome: AttemptOutcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        let attempt = self.vertex.next_attempt();
        self.vertex.attempts.push(AttemptRecord {
            attempt,
            started_at,
            finished_at: now,
            outcome,
            reason,
        });
    }

    fn finish(&mut self, reason: Option<String>, cause: Option<FailureCause>, now: DateTime<Utc>) {
        self.vertex.finished_at = Some(now);
        self.vertex.reason = reason;
        self.vertex.failure = cause;
        self.vertex.handle = None;
    }
}
