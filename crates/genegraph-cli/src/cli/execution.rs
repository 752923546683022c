//! Execution lifecycle commands: run, validate, delete and resume.

use std::path::Path;

use anyhow::{bail, Context, Result};
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use genegraph_core::engine::definition::validate_name;
use genegraph_core::engine::graph::build_graph;
use genegraph_core::engine::{load_execution_file, GraphValidationError};
use genegraph_types::event::EngineEvent;
use genegraph_types::execution::{ExecutionPhase, ExecutionStatus};

use super::status::{print_summary, styled_phase};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Submit the execution in `file` and reconcile it until it settles.
///
/// Exits with an error when the execution ends Failed. Ctrl+C stops the loop
/// and leaves the execution stored for `resume`.
pub async fn run(
    state: &AppState,
    file: &Path,
    name: Option<String>,
    detach: bool,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let document = load_document(file)?;
    let name = name.unwrap_or(document.name);
    let execution = state.controller.submit(&name, document.spec).await?;

    if detach {
        if json {
            let out = serde_json::json!({
                "name": execution.name,
                "uid": execution.uid.to_string(),
                "phase": execution.status.phase,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else if !quiet {
            println!();
            println!(
                "  {} Submitted execution '{}'",
                style("*").green().bold(),
                style(&execution.name).cyan()
            );
            println!("  Start it with: {}", style("genegraphd resume").cyan());
            println!();
        }
        return Ok(());
    }

    if !json && !quiet {
        println!();
        println!(
            "  {} Running '{}' ({} tasks)",
            style("▶").cyan().bold(),
            style(&execution.name).cyan(),
            execution.spec.tasks.len()
        );
        println!("  {}", style("Press Ctrl+C to stop; the execution can be resumed").dim());
        println!();
    }

    let printer = (!json && !quiet).then(|| spawn_progress_printer(state));
    let handle = state.controller.spawn(&name);

    let outcome = tokio::select! {
        result = handle => Some(result.context("reconciliation task panicked")??),
        _ = crate::shutdown_signal() => None,
    };
    if let Some(printer) = printer {
        printer.abort();
    }

    let Some(status) = outcome else {
        state.controller.shutdown();
        if !quiet {
            eprintln!();
            eprintln!(
                "  {} Stopped. Resume with {}",
                style("!").yellow().bold(),
                style("genegraphd resume").cyan()
            );
        }
        return Ok(());
    };

    let execution = state.controller.status(&name).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else if !quiet {
        print_summary(&execution);
    }

    ensure_succeeded(&name, &status)
}

fn ensure_succeeded(name: &str, status: &ExecutionStatus) -> Result<()> {
    match status.phase {
        ExecutionPhase::Failed => bail!(
            "execution '{name}' failed: {}",
            status.message.as_deref().unwrap_or("unknown reason")
        ),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check an execution file without storing it.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let result = load_document(file).and_then(|document| {
        validate_name(&document.name)?;
        let graph = build_graph(&document.spec)?;
        Ok((document, graph))
    });

    let (document, graph) = match result {
        Ok(ok) => ok,
        Err(err) => {
            let tasks: Vec<String> = err
                .downcast_ref::<GraphValidationError>()
                .map(|e| e.offending_tasks().into_iter().map(str::to_string).collect())
                .unwrap_or_default();
            if json {
                let out = serde_json::json!({
                    "valid": false,
                    "error": err.to_string(),
                    "tasks": tasks,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            return Err(err);
        }
    };

    let fan_outs: Vec<&str> = document
        .spec
        .tasks
        .iter()
        .filter(|t| t.is_fan_out())
        .map(|t| t.name.as_str())
        .collect();

    if json {
        let out = serde_json::json!({
            "valid": true,
            "name": document.name,
            "tasks": graph.len(),
            "roots": graph.roots(),
            "order": graph.topological_order(),
            "fan_out": fan_outs,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} '{}' is valid",
            style("✓").green().bold(),
            style(&document.name).cyan()
        );
        println!("  Tasks:   {}", graph.len());
        println!("  Roots:   {}", graph.roots().join(", "));
        println!("  Order:   {}", graph.topological_order().join(" → "));
        if !fan_outs.is_empty() {
            println!("  Fan-out: {}", fan_outs.join(", "));
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn delete(state: &AppState, name: &str, json: bool) -> Result<()> {
    state.controller.delete(name).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": name }));
    } else {
        println!(
            "  {} Deleted execution '{}'",
            style("✓").green().bold(),
            style(name).cyan()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

/// Restart loops for every unsettled execution and wait for them.
pub async fn resume(state: &AppState, json: bool, quiet: bool) -> Result<()> {
    let handles = state.controller.resume_all().await?;

    if handles.is_empty() {
        if json {
            println!("[]");
        } else if !quiet {
            println!("  Nothing to resume.");
        }
        return Ok(());
    }

    if !json && !quiet {
        println!();
        println!(
            "  {} Resuming {} execution{}",
            style("▶").cyan().bold(),
            handles.len(),
            if handles.len() == 1 { "" } else { "s" }
        );
        println!();
    }

    let printer = (!json && !quiet).then(|| spawn_progress_printer(state));
    let wait_all = async {
        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = handle.await.context("reconciliation task panicked")?;
            results.push((name, result));
        }
        anyhow::Ok(results)
    };

    let results = tokio::select! {
        results = wait_all => results?,
        _ = crate::shutdown_signal() => {
            state.controller.shutdown();
            if let Some(printer) = printer {
                printer.abort();
            }
            return Ok(());
        }
    };
    if let Some(printer) = printer {
        printer.abort();
    }

    let mut failed = Vec::new();
    let mut rows = Vec::with_capacity(results.len());
    for (name, result) in results {
        match result {
            Ok(status) => {
                if status.phase == ExecutionPhase::Failed {
                    failed.push(name.clone());
                }
                if !json && !quiet {
                    println!("  {} {}", style(&name).cyan(), styled_phase(status.phase));
                }
                rows.push(serde_json::json!({ "name": name, "phase": status.phase }));
            }
            Err(e) => {
                failed.push(name.clone());
                if !json && !quiet {
                    println!("  {} {}", style(&name).cyan(), style(e.to_string()).red());
                }
                rows.push(serde_json::json!({ "name": name, "error": e.to_string() }));
            }
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }

    if !failed.is_empty() {
        bail!("{} execution(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_document(file: &Path) -> Result<genegraph_core::engine::ExecutionDocument> {
    load_execution_file(file).with_context(|| format!("Failed to load {}", file.display()))
}

/// Print engine events as they arrive until aborted.
fn spawn_progress_printer(state: &AppState) -> JoinHandle<()> {
    let mut rx = state.controller.events().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress printer lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn describe_event(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::VertexTransitioned {
            execution,
            vertex,
            from,
            to,
            reason,
            at,
        } => {
            let from = from.map_or_else(|| "new".to_string(), |p| p.to_string());
            let reason = reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            Some(format!(
                "  {} {}/{} {} → {}{}",
                style(at.format("%H:%M:%S")).dim(),
                execution,
                style(vertex).bold(),
                from,
                to,
                reason
            ))
        }
        EngineEvent::FanOutExpanded {
            execution,
            vertex,
            children,
        } => Some(format!(
            "  {} {}/{} expanded into {} children",
            style("⑂").cyan(),
            execution,
            style(vertex).bold(),
            children.len()
        )),
        EngineEvent::ExecutionPhaseChanged {
            execution, from, to, ..
        } => Some(format!(
            "  {} {} {} → {}",
            style("◆").cyan(),
            style(execution).cyan(),
            from,
            styled_phase(*to)
        )),
        EngineEvent::ExecutionSubmitted { .. } | EngineEvent::ExecutionDeleted { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genegraph_types::vertex::VertexPhase;

    fn write_file(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_validate_accepts_diamond() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(
            tmp.path(),
            "diamond.yaml",
            r#"
name: diamond
tasks:
  - name: a
    image: alpine:3
    command_set: ["echo a"]
  - name: b
    image: alpine:3
    command_set: ["echo b"]
    dependents: [{target: a}]
  - name: c
    image: alpine:3
    command_set: ["echo c"]
    dependents: [{target: a}]
  - name: d
    image: alpine:3
    command_set: ["echo d"]
    dependents: [{target: b}, {target: c}]
"#,
        );
        validate(&path, true).unwrap();
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(
            tmp.path(),
            "cycle.yaml",
            r#"
name: loop
tasks:
  - name: a
    image: alpine:3
    command_set: ["echo a"]
    dependents: [{target: b}]
  - name: b
    image: alpine:3
    command_set: ["echo b"]
    dependents: [{target: a}]
"#,
        );
        let err = validate(&path, true).unwrap_err();
        let graph_err = err.downcast_ref::<GraphValidationError>().unwrap();
        assert!(matches!(graph_err, GraphValidationError::Cycle { .. }));
    }

    #[test]
    fn test_failed_status_is_an_error() {
        let status = ExecutionStatus {
            phase: ExecutionPhase::Failed,
            message: Some("child 'b' failed".to_string()),
            ..Default::default()
        };
        let err = ensure_succeeded("wgs", &status).unwrap_err();
        assert!(err.to_string().contains("child 'b' failed"));

        let ok = ExecutionStatus {
            phase: ExecutionPhase::Succeeded,
            ..Default::default()
        };
        ensure_succeeded("wgs", &ok).unwrap();
    }

    #[test]
    fn test_transition_line_mentions_vertex_and_reason() {
        let event = EngineEvent::VertexTransitioned {
            execution: "wgs".to_string(),
            vertex: "align".to_string(),
            from: Some(VertexPhase::Running),
            to: VertexPhase::Retrying,
            reason: Some("exit 1".to_string()),
            at: chrono::Utc::now(),
        };
        let line = console::strip_ansi_codes(&describe_event(&event).unwrap()).to_string();
        assert!(line.contains("wgs/align running → retrying (exit 1)"), "{line}");

        let submitted = EngineEvent::ExecutionSubmitted {
            execution: "wgs".to_string(),
            uid: uuid::Uuid::now_v7(),
            tasks: 2,
        };
        assert!(describe_event(&submitted).is_none());
    }
}
