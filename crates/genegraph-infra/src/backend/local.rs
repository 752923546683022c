//! Local process backend.
//!
//! Runs each job's command set on the host with `sh -c`, one command after
//! another, in a detached tokio task. `submit` returns as soon as the task is
//! spawned; `poll` reads the last recorded state; `cancel` kills the running
//! process. The container image is not used: this backend is for single-host
//! runs and tests of execution specs.
//!
//! A finished job's report is handed out by exactly one `poll` and then
//! forgotten, so the job table only holds jobs whose outcome has not been
//! read yet.
//!
//! Volume mount paths appearing in commands are rewritten to
//! `<volume_root>/<claim>` so tasks sharing a claim share files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use genegraph_core::backend::{BackendError, JobBackend, JobReport, JobSpec, JobState};
use genegraph_types::execution::Volume;
use genegraph_types::vertex::BackendHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Number of stderr characters kept in a failure reason.
const STDERR_TAIL_CHARS: usize = 512;

struct LocalJob {
    execution: String,
    report: JobReport,
    cancel: CancellationToken,
}

/// Job backend that runs commands as local child processes.
#[derive(Clone)]
pub struct LocalProcessBackend {
    volume_root: PathBuf,
    jobs: Arc<DashMap<BackendHandle, LocalJob>>,
}

impl LocalProcessBackend {
    pub fn new(volume_root: impl Into<PathBuf>) -> Self {
        Self {
            volume_root: volume_root.into(),
            jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn volume_root(&self) -> &Path {
        &self.volume_root
    }

    /// Host directory backing a volume claim.
    pub fn claim_dir(&self, claim: &str) -> PathBuf {
        self.volume_root.join(claim)
    }

    /// Replace every mount path in `command` with its host directory. Longer
    /// mount paths are substituted first so nested mounts resolve correctly.
    fn rewrite_command(&self, command: &str, job: &JobSpec) -> String {
        let mut volumes: Vec<&Volume> = job.volumes.values().collect();
        volumes.sort_by_key(|v| std::cmp::Reverse(v.mount_path.len()));

        let mut rewritten = command.to_string();
        for volume in volumes {
            let host = self.claim_dir(&volume.mount_from.pvc);
            rewritten = rewritten.replace(&volume.mount_path, &host.display().to_string());
        }
        rewritten
    }
}

impl JobBackend for LocalProcessBackend {
    async fn submit(&self, job: &JobSpec) -> Result<BackendHandle, BackendError> {
        if job.command_set.is_empty() {
            return Err(BackendError::Submission(format!(
                "job for '{}' has no commands",
                job.vertex
            )));
        }

        let mut claim_dirs = Vec::with_capacity(job.volumes.len());
        for volume in job.volumes.values() {
            claim_dirs.push(self.claim_dir(&volume.mount_from.pvc));
        }
        let commands: Vec<String> = job
            .command_set
            .iter()
            .map(|c| self.rewrite_command(c, job))
            .collect();

        let handle = BackendHandle::new(format!("local-{}", Uuid::now_v7()));
        let cancel = CancellationToken::new();
        self.jobs.insert(
            handle.clone(),
            LocalJob {
                execution: job.execution.clone(),
                report: JobReport::running(),
                cancel: cancel.clone(),
            },
        );

        tracing::debug!(
            execution = job.execution.as_str(),
            vertex = job.vertex.as_str(),
            attempt = job.attempt,
            handle = %handle,
            image = job.image.as_str(),
            "starting local job"
        );

        let jobs = Arc::clone(&self.jobs);
        let env = vec![
            ("GENEGRAPH_EXECUTION", job.execution.clone()),
            ("GENEGRAPH_VERTEX", job.vertex.clone()),
            ("GENEGRAPH_TASK", job.task.clone()),
            ("GENEGRAPH_ATTEMPT", job.attempt.to_string()),
        ];
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let report = tokio::select! {
                report = run_commands(&commands, &claim_dirs, &env) => report,
                _ = cancel.cancelled() => JobReport::failed("cancelled"),
            };
            if let Some(mut entry) = jobs.get_mut(&task_handle) {
                if entry.report.state == JobState::Running {
                    entry.report = report;
                }
            }
        });

        Ok(handle)
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<JobReport, BackendError> {
        let finished = |_: &BackendHandle, job: &LocalJob| {
            !matches!(job.report.state, JobState::Pending | JobState::Running)
        };
        if let Some((_, job)) = self.jobs.remove_if(handle, finished) {
            return Ok(job.report);
        }
        // Jobs do not survive a restart of this process; report them lost so
        // the attempt is retried.
        Ok(self
            .jobs
            .get(handle)
            .map(|job| job.report.clone())
            .unwrap_or_else(|| JobReport::failed("job lost: backend restarted")))
    }

    /// Unknown handles are treated as already stopped: after a restart this
    /// backend has no way to reach a process it did not spawn.
    async fn cancel(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        if let Some(mut job) = self.jobs.get_mut(handle) {
            job.cancel.cancel();
            if job.report.state == JobState::Running {
                job.report = JobReport::failed("cancelled");
            }
        }
        Ok(())
    }

    async fn release_volumes(&self, execution: &str, volumes: &[Volume]) -> Result<(), BackendError> {
        self.jobs.retain(|_, job| {
            let keep = job.execution != execution;
            if !keep {
                job.cancel.cancel();
            }
            keep
        });
        tracing::debug!(
            execution,
            claims = volumes.len(),
            "released local job records; claim directories are kept"
        );
        Ok(())
    }
}

/// Run `commands` in order, stopping at the first failure. The trimmed stdout
/// of all commands is the job output.
async fn run_commands(commands: &[String], claim_dirs: &[PathBuf], env: &[(&str, String)]) -> JobReport {
    for dir in claim_dirs {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return JobReport::failed(format!("failed to prepare {}: {e}", dir.display()));
        }
    }

    let mut stdout = String::new();
    for command in commands {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => return JobReport::failed(format!("failed to spawn `{command}`: {e}")),
        };

        stdout.push_str(&String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .trim()
                .chars()
                .rev()
                .take(STDERR_TAIL_CHARS)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let reason = if tail.is_empty() {
                format!("`{command}` exited with {code}")
            } else {
                format!("`{command}` exited with {code}: {tail}")
            };
            return JobReport::failed(reason);
        }
    }

    let output = stdout.trim();
    JobReport::succeeded((!output.is_empty()).then(|| output.to_string()))
}
