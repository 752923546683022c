//! Graph builder: compiles an `ExecutionSpec` into a validated DAG.
//!
//! Uses `petgraph` to model task dependencies as a directed graph with an
//! edge from each upstream task to the task that declares it as a dependent.
//! Topological sort detects cycles; Tarjan's SCC algorithm names the tasks
//! taking part in the reported cycle.

use std::collections::HashMap;

use genegraph_types::execution::ExecutionSpec;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use super::definition::{validate_spec, GraphValidationError};

// ---------------------------------------------------------------------------
// ExecutionGraph
// ---------------------------------------------------------------------------

/// Adjacency structure and topological order of an execution's tasks.
///
/// Built once per reconciliation pass from the immutable spec; it never holds
/// vertex state.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl ExecutionGraph {
    /// Task names in a dependency-respecting order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Tasks with no dependents, in topological order. Immediately eligible.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.dependents_of(name).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Upstream tasks named by `task`'s dependent edges.
    pub fn dependents_of(&self, task: &str) -> Vec<&str> {
        self.neighbors(task, Direction::Incoming)
    }

    /// Tasks that declare `task` as one of their dependents.
    pub fn downstream_of(&self, task: &str) -> Vec<&str> {
        self.neighbors(task, Direction::Outgoing)
    }

    pub fn contains(&self, task: &str) -> bool {
        self.index.contains_key(task)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn neighbors(&self, task: &str, dir: Direction) -> Vec<&str> {
        let Some(&idx) = self.index.get(task) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Validate `spec` and compile it into an `ExecutionGraph`.
///
/// Fails with the first structural problem found (see `validate_spec`) or,
/// when the dependent edges contain a cycle, with `GraphValidationError::Cycle`
/// naming the tasks on it in declaration order.
pub fn build_graph(spec: &ExecutionSpec) -> Result<ExecutionGraph, GraphValidationError> {
    validate_spec(spec)?;

    let mut graph = DiGraph::<String, ()>::new();
    let mut index = HashMap::with_capacity(spec.tasks.len());
    for task in &spec.tasks {
        let idx = graph.add_node(task.name.clone());
        index.insert(task.name.clone(), idx);
    }

    for task in &spec.tasks {
        let to = index[task.name.as_str()];
        for target in task.dependent_targets() {
            let from = *index.get(target).ok_or_else(|| {
                GraphValidationError::DanglingDependency {
                    task: task.name.clone(),
                    target: target.to_string(),
                }
            })?;
            graph.add_edge(from, to, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| GraphValidationError::Cycle {
        vertices: cycle_members(&graph, cycle.node_id(), spec),
    })?;

    let order = sorted.into_iter().map(|idx| graph[idx].clone()).collect();
    Ok(ExecutionGraph {
        graph,
        index,
        order,
    })
}

/// Tasks in the strongly connected component containing `start`, in
/// declaration order.
fn cycle_members(graph: &DiGraph<String, ()>, start: NodeIndex, spec: &ExecutionSpec) -> Vec<String> {
    let component = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .unwrap_or_else(|| vec![start]);

    let mut members: Vec<&str> = component.iter().map(|idx| graph[*idx].as_str()).collect();
    members.sort_by_key(|name| spec.tasks.iter().position(|t| t.name == *name));
    members.into_iter().map(String::from).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
