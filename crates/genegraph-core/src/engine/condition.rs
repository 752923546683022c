//! Condition evaluator: decides whether a task may activate.
//!
//! Gating combines the join policy of each dependent edge with the task's
//! optional JEXL `Condition`. Evaluation reads only already-recorded vertex
//! results and never mutates them, so it is safe to repeat on every pass.
//!
//! Recorded outputs are always passed as context objects, never interpolated
//! into expression strings.

use std::collections::BTreeMap;

use genegraph_types::execution::{DependentKind, JoinPolicy, Task};
use genegraph_types::vertex::{VertexPhase, VertexStatus};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A condition that can never be evaluated. The task is failed, not retried.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition '{expression}' failed to evaluate: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("invalid condition context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Outcome of gating one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// All dependents are settled and satisfied; the task may run.
    Proceed,
    /// The task will never run. Carries the reason recorded on the vertex.
    Skip(String),
    /// Some dependent is not terminal yet; ask again next pass.
    Block(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Gates tasks against the recorded state of their dependents.
///
/// The JEXL evaluator is built per evaluation so no evaluator state is held
/// across reconciliation passes.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    execution: String,
}

impl ConditionEvaluator {
    pub fn new(execution: impl Into<String>) -> Self {
        Self {
            execution: execution.into(),
        }
    }

    /// Decide whether `task` may activate given the `vertices` snapshot.
    ///
    /// Order of checks:
    /// 1. Any AND-joined completion dependent that is Failed or Skipped skips
    ///    the task immediately, without waiting for the others.
    /// 2. Any dependent that is not terminal (or has no vertex yet) blocks.
    /// 3. The condition, when present, decides between Proceed and Skip.
    pub fn gate(
        &self,
        task: &Task,
        vertices: &BTreeMap<String, VertexStatus>,
        default_join: JoinPolicy,
    ) -> Result<Gate, ConditionError> {
        for dep in &task.dependents {
            if dep.kind != DependentKind::Completion {
                continue;
            }
            if dep.join.unwrap_or(default_join) != JoinPolicy::AllSucceeded {
                continue;
            }
            match vertices.get(&dep.target).map(|v| v.phase) {
                Some(VertexPhase::Failed) => {
                    return Ok(Gate::Skip(format!("dependent '{}' failed", dep.target)));
                }
                Some(VertexPhase::Skipped) => {
                    return Ok(Gate::Skip(format!("dependent '{}' was skipped", dep.target)));
                }
                _ => {}
            }
        }

        for dep in &task.dependents {
            let terminal = vertices
                .get(&dep.target)
                .is_some_and(|v| v.phase.is_terminal());
            if !terminal {
                return Ok(Gate::Block(format!("waiting on '{}'", dep.target)));
            }
        }

        let Some(condition) = &task.condition else {
            return Ok(Gate::Proceed);
        };

        let context = self.build_context(task, vertices);
        if evaluate_bool(&condition.expression, &context)? {
            Ok(Gate::Proceed)
        } else {
            Ok(Gate::Skip(format!(
                "condition '{}' evaluated to false",
                condition.expression
            )))
        }
    }

    /// Build the JSON object a condition evaluates against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "tasks": {
    ///     "<dependent>": {
    ///       "phase": "succeeded",
    ///       "output": "...",
    ///       "reason": null,
    ///       "outputs": ["<child output>", ...]
    ///     }
    ///   },
    ///   "execution": { "name": "..." }
    /// }
    /// ```
    ///
    /// Only the task's declared dependents are visible. `outputs` holds the
    /// children's outputs in index order for fan-out dependents and the single
    /// output otherwise.
    pub fn build_context(&self, task: &Task, vertices: &BTreeMap<String, VertexStatus>) -> Value {
        let mut tasks = Map::new();
        for target in task.dependent_targets() {
            let Some(vertex) = vertices.get(target) else {
                continue;
            };
            let outputs: Vec<Value> = if vertex.is_fan_out_parent() {
                vertex
                    .children
                    .iter()
                    .filter_map(|child| vertices.get(child))
                    .map(|child| json!(child.output))
                    .collect()
            } else {
                vertex.output.iter().map(|o| json!(o)).collect()
            };
            tasks.insert(
                target.to_string(),
                json!({
                    "phase": vertex.phase.to_string(),
                    "output": vertex.output,
                    "reason": vertex.reason,
                    "outputs": outputs,
                }),
            );
        }

        json!({
            "tasks": tasks,
            "execution": { "name": self.execution },
        })
    }
}

/// Whether `task` may still run after another vertex of the execution has
/// failed: it reads a dependent through a `condition_input` edge, or joins a
/// completion edge with `run_regardless`.
pub fn tolerates_failure(task: &Task, default_join: JoinPolicy) -> bool {
    task.dependents.iter().any(|dep| match dep.kind {
        DependentKind::ConditionInput => true,
        DependentKind::Completion => {
            dep.join.unwrap_or(default_join) == JoinPolicy::RunRegardless
        }
    })
}

// ---------------------------------------------------------------------------
// JEXL
// ---------------------------------------------------------------------------

/// Evaluate `expression` against `context`, coercing the result to a boolean
/// with JavaScript-like truthiness.
pub fn evaluate_bool(expression: &str, context: &Value) -> Result<bool, ConditionError> {
    if !context.is_object() {
        return Err(ConditionError::InvalidContext(
            "context must be a JSON object".to_string(),
        ));
    }

    let result = evaluator()
        .eval_in_context(expression, context)
        .map_err(|e| ConditionError::EvalFailed {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;

    Ok(truthy(&result))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn str_arg(args: &[Value], i: usize) -> &str {
    args.get(i).and_then(|v| v.as_str()).unwrap_or("")
}

/// JEXL evaluator with the transforms conditions are allowed to use.
fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).to_uppercase()))
        })
        .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
        .with_transform("lines", |args: &[Value]| {
            let lines: Vec<&str> = str_arg(args, 0)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            Ok(json!(lines))
        })
        .with_transform("split", |args: &[Value]| {
            let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
            let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
            Ok(json!(parts))
        })
        .with_transform("contains", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
        })
        .with_transform("startsWith", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
        })
        .with_transform("endsWith", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
        })
        .with_transform("number", |args: &[Value]| {
            let n = match args.first() {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
                _ => 0.0,
            };
            Ok(json!(n))
        })
        .with_transform("not", |args: &[Value]| {
            Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{command_task, vertex};
    use chrono::Utc;
    use genegraph_types::execution::{Condition, Dependent};

    fn conditional(name: &str, deps: &[&str], expression: &str) -> Task {
        let mut task = command_task(name, deps);
        task.condition = Some(Condition {
            expression: expression.to_string(),
        });
        task
    }

    fn snapshot(entries: Vec<VertexStatus>) -> BTreeMap<String, VertexStatus> {
        entries.into_iter().map(|v| (v.name.clone(), v)).collect()
    }

    fn gate(task: &Task, vertices: &BTreeMap<String, VertexStatus>) -> Gate {
        ConditionEvaluator::new("exec")
            .gate(task, vertices, JoinPolicy::AllSucceeded)
            .unwrap()
    }

    #[test]
    fn test_root_task_proceeds() {
        assert_eq!(gate(&command_task("a", &[]), &BTreeMap::new()), Gate::Proceed);
    }

    #[test]
    fn test_blocks_until_all_dependents_terminal() {
        let task = command_task("d", &["b", "c"]);
        let vertices = snapshot(vec![vertex("b", VertexPhase::Succeeded)]);
        assert!(matches!(gate(&task, &vertices), Gate::Block(r) if r.contains("'c'")));

        let vertices = snapshot(vec![
            vertex("b", VertexPhase::Succeeded),
            vertex("c", VertexPhase::Running),
        ]);
        assert!(matches!(gate(&task, &vertices), Gate::Block(_)));

        let vertices = snapshot(vec![
            vertex("b", VertexPhase::Succeeded),
            vertex("c", VertexPhase::Succeeded),
        ]);
        assert_eq!(gate(&task, &vertices), Gate::Proceed);
    }

    #[test]
    fn test_retrying_dependent_blocks() {
        let task = command_task("d", &["b"]);
        let vertices = snapshot(vec![vertex("b", VertexPhase::Retrying)]);
        assert!(matches!(gate(&task, &vertices), Gate::Block(_)));
    }

    #[test]
    fn test_failed_dependent_skips_without_waiting() {
        let task = command_task("d", &["b", "c"]);
        let vertices = snapshot(vec![
            vertex("b", VertexPhase::Failed),
            vertex("c", VertexPhase::Running),
        ]);
        assert_eq!(
            gate(&task, &vertices),
            Gate::Skip("dependent 'b' failed".to_string())
        );
    }

    #[test]
    fn test_skipped_dependent_propagates() {
        let task = command_task("e", &["d"]);
        let vertices = snapshot(vec![vertex("d", VertexPhase::Skipped)]);
        assert!(matches!(gate(&task, &vertices), Gate::Skip(r) if r.contains("skipped")));
    }

    #[test]
    fn test_run_regardless_edge_proceeds_after_failure() {
        let mut task = command_task("cleanup", &[]);
        task.dependents.push(Dependent {
            join: Some(JoinPolicy::RunRegardless),
            ..Dependent::on("b")
        });
        let vertices = snapshot(vec![vertex("b", VertexPhase::Failed)]);
        assert_eq!(gate(&task, &vertices), Gate::Proceed);
    }

    #[test]
    fn test_tolerates_failure_by_edge_kind() {
        let plain = command_task("d", &["a"]);
        assert!(!tolerates_failure(&plain, JoinPolicy::AllSucceeded));
        assert!(tolerates_failure(&plain, JoinPolicy::RunRegardless));

        let mut cleanup = command_task("cleanup", &[]);
        cleanup.dependents.push(Dependent {
            join: Some(JoinPolicy::RunRegardless),
            ..Dependent::on("a")
        });
        assert!(tolerates_failure(&cleanup, JoinPolicy::AllSucceeded));

        let mut alert = command_task("alert", &[]);
        alert.dependents.push(Dependent {
            kind: DependentKind::ConditionInput,
            ..Dependent::on("a")
        });
        assert!(tolerates_failure(&alert, JoinPolicy::AllSucceeded));

        assert!(!tolerates_failure(&command_task("root", &[]), JoinPolicy::RunRegardless));
    }

    #[test]
    fn test_default_join_policy_is_configurable() {
        let task = command_task("d", &["b"]);
        let vertices = snapshot(vec![vertex("b", VertexPhase::Failed)]);
        let gate = ConditionEvaluator::new("exec")
            .gate(&task, &vertices, JoinPolicy::RunRegardless)
            .unwrap();
        assert_eq!(gate, Gate::Proceed);
    }

    #[test]
    fn test_condition_false_skips() {
        let task = conditional("c", &["a"], "tasks.a.output == 'yes'");
        let mut a = vertex("a", VertexPhase::Succeeded);
        a.output = Some("no".to_string());
        let vertices = snapshot(vec![a]);
        assert!(matches!(gate(&task, &vertices), Gate::Skip(r) if r.contains("evaluated to false")));
    }

    #[test]
    fn test_condition_true_proceeds() {
        let task = conditional(
            "c",
            &["a"],
            "tasks.a.phase == 'succeeded' && (tasks.a.output|trim) == 'yes'",
        );
        let mut a = vertex("a", VertexPhase::Succeeded);
        a.output = Some(" yes ".to_string());
        assert_eq!(gate(&task, &snapshot(vec![a])), Gate::Proceed);
    }

    #[test]
    fn test_condition_input_sees_failed_dependent() {
        let mut task = conditional("alert", &[], "tasks.qc.phase == 'failed'");
        task.dependents.push(Dependent {
            kind: DependentKind::ConditionInput,
            ..Dependent::on("qc")
        });
        let vertices = snapshot(vec![vertex("qc", VertexPhase::Failed)]);
        assert_eq!(gate(&task, &vertices), Gate::Proceed);

        let vertices = snapshot(vec![vertex("qc", VertexPhase::Succeeded)]);
        assert!(matches!(gate(&task, &vertices), Gate::Skip(_)));
    }

    #[test]
    fn test_condition_not_evaluated_while_blocked() {
        let task = conditional("c", &["a"], "this is not jexl ((");
        let vertices = snapshot(vec![vertex("a", VertexPhase::Running)]);
        assert!(matches!(gate(&task, &vertices), Gate::Block(_)));
    }

    #[test]
    fn test_malformed_condition_is_an_error() {
        let task = conditional("c", &["a"], "tasks.a.output ==");
        let vertices = snapshot(vec![vertex("a", VertexPhase::Succeeded)]);
        let err = ConditionEvaluator::new("exec")
            .gate(&task, &vertices, JoinPolicy::AllSucceeded)
            .unwrap_err();
        assert!(matches!(err, ConditionError::EvalFailed { .. }));
    }

    #[test]
    fn test_context_only_exposes_dependents() {
        let task = command_task("c", &["a"]);
        let mut a = vertex("a", VertexPhase::Succeeded);
        a.output = Some("42".to_string());
        let vertices = snapshot(vec![a, vertex("z", VertexPhase::Succeeded)]);
        let ctx = ConditionEvaluator::new("exec").build_context(&task, &vertices);
        assert_eq!(ctx["tasks"]["a"]["output"], "42");
        assert_eq!(ctx["tasks"]["a"]["outputs"], json!(["42"]));
        assert!(ctx["tasks"].get("z").is_none());
        assert_eq!(ctx["execution"]["name"], "exec");
    }

    #[test]
    fn test_context_collects_fan_out_outputs_in_index_order() {
        let now = Utc::now();
        let mut parent = vertex("split", VertexPhase::Succeeded);
        parent.children = vec!["split.0".to_string(), "split.1".to_string()];
        let mut c0 = VertexStatus::for_child("split.0", "split", 0, vec![], now);
        c0.output = Some("x".to_string());
        let mut c1 = VertexStatus::for_child("split.1", "split", 1, vec![], now);
        c1.output = Some("y".to_string());
        let vertices = snapshot(vec![parent, c0, c1]);

        let task = conditional("merge", &["split"], "(tasks.split.outputs|length) == 2");
        let ctx = ConditionEvaluator::new("exec").build_context(&task, &vertices);
        assert_eq!(ctx["tasks"]["split"]["outputs"], json!(["x", "y"]));
        assert_eq!(gate(&task, &vertices), Gate::Proceed);
    }

    #[test]
    fn test_evaluate_bool_truthiness() {
        let ctx = json!({ "s": "", "n": 3.0, "list": [] });
        assert!(!evaluate_bool("s", &ctx).unwrap());
        assert!(evaluate_bool("n", &ctx).unwrap());
        assert!(evaluate_bool("list", &ctx).unwrap());
        assert!(evaluate_bool("('7'|number) > 5", &ctx).unwrap());
        assert!(evaluate_bool("x", &json!([])).is_err());
    }
}
