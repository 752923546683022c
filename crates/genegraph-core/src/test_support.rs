//! Builders and a scripted in-process backend shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use genegraph_types::execution::{CommandsIter, Dependent, ExecutionSpec, Task, Volume};
use genegraph_types::vertex::{BackendHandle, VertexPhase, VertexStatus};

use crate::backend::{BackendError, JobBackend, JobReport, JobSpec};

/// A task running the single command `run <name>`.
pub fn command_task(name: &str, deps: &[&str]) -> Task {
    Task {
        name: name.to_string(),
        image: "alpine:3".to_string(),
        command_set: vec![format!("run {name}")],
        dependents: deps.iter().map(|d| Dependent::on(*d)).collect(),
        ..Default::default()
    }
}

/// A task whose only command appends `tag` to the backend log on success.
pub fn append_task(name: &str, deps: &[&str], tag: &str) -> Task {
    Task {
        command_set: vec![format!("append {tag}")],
        ..command_task(name, deps)
    }
}

/// A fan-out task with one element per var, rendering
/// `process ${1} #${index}`.
pub fn fan_out_task(name: &str, deps: &[&str], vars: &[&str]) -> Task {
    Task {
        name: name.to_string(),
        image: "alpine:3".to_string(),
        commands_iter: Some(CommandsIter {
            command: "process ${1} #${index}".to_string(),
            vars: vars.iter().map(|v| vec![v.to_string()]).collect(),
            ..Default::default()
        }),
        dependents: deps.iter().map(|d| Dependent::on(*d)).collect(),
        ..Default::default()
    }
}

pub fn spec_of(tasks: Vec<Task>) -> ExecutionSpec {
    ExecutionSpec {
        tasks,
        ..Default::default()
    }
}

/// A task vertex forced into `phase`.
pub fn vertex(name: &str, phase: VertexPhase) -> VertexStatus {
    let mut v = VertexStatus::for_task(name, Utc::now());
    v.phase = phase;
    v
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

/// Scripted result of one attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed(Option<String>),
    Fail(String),
    RejectSubmit(String),
    /// Stays Running until cancelled.
    Hang,
}

#[derive(Debug)]
struct MockJob {
    spec: JobSpec,
    outcome: Outcome,
    polls_left: u32,
    cancelled: bool,
    finished: bool,
}

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<Outcome>>,
    jobs: HashMap<BackendHandle, MockJob>,
    submissions: Vec<JobSpec>,
    cancelled: Vec<BackendHandle>,
    released: Vec<String>,
    log: Vec<String>,
    next_id: u64,
    run_polls: u32,
    fail_cancel: bool,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-process backend whose per-vertex outcomes are scripted by the test.
/// Unscripted attempts succeed without output.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive attempts of `vertex`.
    pub fn script(&self, vertex: &str, outcomes: Vec<Outcome>) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(vertex.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Number of polls that report Running before a job reports its outcome.
    pub fn set_run_polls(&self, polls: u32) {
        self.state.lock().unwrap().run_polls = polls;
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.state.lock().unwrap().fail_cancel = fail;
    }

    pub fn submissions(&self) -> Vec<JobSpec> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn submitted_vertices(&self) -> Vec<String> {
        self.submissions().into_iter().map(|j| j.vertex).collect()
    }

    pub fn cancelled(&self) -> Vec<BackendHandle> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    /// Tags appended by `append <tag>` commands, in completion order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Highest number of jobs that were submitted and not yet reported
    /// finished or cancelled.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

impl JobBackend for MockBackend {
    async fn submit(&self, job: &JobSpec) -> Result<BackendHandle, BackendError> {
        let mut state = self.state.lock().unwrap();
        let outcome = state
            .scripts
            .get_mut(&job.vertex)
            .and_then(|q| q.pop_front())
            .unwrap_or(Outcome::Succeed(None));
        if let Outcome::RejectSubmit(reason) = outcome {
            return Err(BackendError::Submission(reason));
        }

        state.next_id += 1;
        let handle = BackendHandle::new(format!("job-{}", state.next_id));
        state.submissions.push(job.clone());
        let polls_left = state.run_polls;
        state.jobs.insert(
            handle.clone(),
            MockJob {
                spec: job.clone(),
                outcome,
                polls_left,
                cancelled: false,
                finished: false,
            },
        );
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(handle)
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<JobReport, BackendError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let job = state
            .jobs
            .get_mut(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.clone()))?;

        if job.cancelled {
            return Ok(JobReport::failed("cancelled"));
        }
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(JobReport::running());
        }

        let report = match &job.outcome {
            Outcome::Hang => return Ok(JobReport::running()),
            Outcome::Succeed(output) => {
                if !job.finished {
                    for command in &job.spec.command_set {
                        if let Some(tag) = command.strip_prefix("append ") {
                            state.log.push(tag.to_string());
                        }
                    }
                }
                JobReport::succeeded(output.clone())
            }
            Outcome::Fail(reason) => JobReport::failed(reason.clone()),
            Outcome::RejectSubmit(reason) => JobReport::failed(reason.clone()),
        };
        if !job.finished {
            job.finished = true;
            state.in_flight -= 1;
        }
        Ok(report)
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_cancel {
            return Err(BackendError::Cancel(format!("{handle} did not acknowledge")));
        }
        let state = &mut *state;
        let job = state
            .jobs
            .get_mut(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.clone()))?;
        if !job.cancelled && !job.finished {
            state.in_flight -= 1;
        }
        job.cancelled = true;
        state.cancelled.push(handle.clone());
        Ok(())
    }

    async fn release_volumes(&self, execution: &str, _volumes: &[Volume]) -> Result<(), BackendError> {
        self.state.lock().unwrap().released.push(execution.to_string());
        Ok(())
    }
}
