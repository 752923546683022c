//! `status` and `list` output.

use anyhow::Result;
use chrono::{DateTime, Utc};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use genegraph_types::execution::{Execution, ExecutionPhase};
use genegraph_types::vertex::{VertexPhase, VertexStatus};

use crate::state::AppState;

/// Show one execution with a row per vertex.
pub async fn show_status(state: &AppState, name: &str, json: bool) -> Result<()> {
    let execution = state.controller.status(name).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    print_summary(&execution);

    if execution.status.vertices.is_empty() {
        println!("  {}", style("No vertices created yet.").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Vertex").fg(Color::White),
        Cell::new("Phase").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Duration").fg(Color::White),
        Cell::new("Reason").fg(Color::White),
    ]);

    for vertex in ordered_vertices(&execution) {
        let name = if vertex.is_child() {
            format!("  {}", vertex.name)
        } else {
            vertex.name.clone()
        };
        table.add_row(vec![
            Cell::new(name),
            vertex_phase_cell(vertex.phase),
            Cell::new(vertex.attempts.len()),
            Cell::new(format_duration(vertex.started_at, vertex.finished_at)),
            Cell::new(vertex.reason.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

/// List stored executions, oldest first.
pub async fn list_executions(state: &AppState, json: bool) -> Result<()> {
    let executions = state.controller.list().await?;

    if json {
        let rows: Vec<_> = executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name,
                    "uid": e.uid.to_string(),
                    "phase": e.status.phase,
                    "tasks": e.spec.tasks.len(),
                    "vertices": e.status.vertices.len(),
                    "created_at": e.created_at,
                    "message": e.status.message,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions yet. Start one with:");
        println!("    {}", style("genegraphd run <file.yaml>").cyan());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name").fg(Color::White),
        Cell::new("Phase").fg(Color::White),
        Cell::new("Progress").fg(Color::White),
        Cell::new("Created").fg(Color::White),
        Cell::new("Message").fg(Color::White),
    ]);

    for execution in &executions {
        table.add_row(vec![
            Cell::new(&execution.name).fg(Color::Cyan),
            execution_phase_cell(execution.status.phase),
            Cell::new(progress(execution)),
            Cell::new(format_relative_time(&execution.created_at)),
            Cell::new(execution.status.message.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
    println!(
        "  {} execution{}",
        executions.len(),
        if executions.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

pub(crate) fn print_summary(execution: &Execution) {
    let status = &execution.status;
    println!();
    println!(
        "  {} {}",
        style(&execution.name).cyan().bold(),
        styled_phase(status.phase)
    );
    println!("  UID:      {}", execution.uid);
    println!("  Tasks:    {}", execution.spec.tasks.len());
    println!("  Progress: {}", progress(execution));
    println!("  Passes:   {}", status.passes);
    if let Some(started) = status.started_at {
        println!(
            "  Duration: {}",
            format_duration(Some(started), status.finished_at)
        );
    }
    if let Some(message) = &status.message {
        println!("  Message:  {}", style(message).yellow());
    }
    println!();
}

/// Fan-out children are listed right after their parent.
fn ordered_vertices(execution: &Execution) -> Vec<&VertexStatus> {
    let status = &execution.status;
    let mut ordered = Vec::with_capacity(status.vertices.len());
    for vertex in status.vertices.values().filter(|v| !v.is_child()) {
        ordered.push(vertex);
        for child in &vertex.children {
            if let Some(child) = status.vertex(child) {
                ordered.push(child);
            }
        }
    }
    ordered
}

/// `done/total` over the vertices that exist so far.
fn progress(execution: &Execution) -> String {
    let vertices = &execution.status.vertices;
    let done = vertices.values().filter(|v| v.phase.is_terminal()).count();
    format!("{done}/{} vertices", vertices.len())
}

pub(crate) fn styled_phase(phase: ExecutionPhase) -> console::StyledObject<String> {
    let text = phase.to_string();
    match phase {
        ExecutionPhase::Pending => style(text).dim(),
        ExecutionPhase::Running => style(text).cyan(),
        ExecutionPhase::Succeeded => style(text).green().bold(),
        ExecutionPhase::Failed => style(text).red().bold(),
    }
}

fn execution_phase_cell(phase: ExecutionPhase) -> Cell {
    let color = match phase {
        ExecutionPhase::Pending => Color::DarkGrey,
        ExecutionPhase::Running => Color::Cyan,
        ExecutionPhase::Succeeded => Color::Green,
        ExecutionPhase::Failed => Color::Red,
    };
    Cell::new(phase).fg(color)
}

fn vertex_phase_cell(phase: VertexPhase) -> Cell {
    let (label, color) = match phase {
        VertexPhase::Pending => ("○ pending", Color::DarkGrey),
        VertexPhase::Running => ("● running", Color::Cyan),
        VertexPhase::Retrying => ("↻ retrying", Color::Yellow),
        VertexPhase::Succeeded => ("✓ succeeded", Color::Green),
        VertexPhase::Failed => ("✗ failed", Color::Red),
        VertexPhase::Skipped => ("- skipped", Color::DarkGrey),
    };
    Cell::new(label).fg(color)
}

fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let diff = Utc::now() - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}

/// Elapsed time between `started` and `finished` (or now, while running).
fn format_duration(started: Option<DateTime<Utc>>, finished: Option<DateTime<Utc>>) -> String {
    let Some(started) = started else {
        return "-".to_string();
    };
    let secs = (finished.unwrap_or_else(Utc::now) - started).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}
