//! Fan-out expander: materializes iteration templates into child vertices.
//!
//! A task whose work is a `CommandsIter` becomes a parent vertex. When it is
//! first eligible the expander computes its element list, renders one command
//! per element and records one Pending child per element, named
//! `<task>.<index>`. The parent's `children` list doubles as the expansion
//! marker: a parent with children is never expanded again.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use genegraph_types::execution::{CommandsIter, Task};
use genegraph_types::vertex::VertexStatus;
use thiserror::Error;

/// Upper bound on the elements one iteration template may produce.
pub const MAX_FAN_OUT_ELEMENTS: usize = 100_000;

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("task '{0}' has no iteration template")]
    NotFanOut(String),

    #[error("no vertex recorded for '{0}'")]
    UnknownVertex(String),

    #[error(
        "invalid range '{0}': expected range(start,end[,step]) with a non-zero step and at most {max} elements",
        max = MAX_FAN_OUT_ELEMENTS
    )]
    InvalidRange(String),

    #[error("iteration yields {count} elements, more than the limit of {limit}")]
    TooManyElements { count: u128, limit: usize },

    #[error("result source '{0}' has not been recorded")]
    MissingResult(String),

    #[error("placeholder '${{{placeholder}}}' has no value in element {index}")]
    Placeholder { placeholder: String, index: usize },
}

/// Result of asking the expander to expand a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// Child names in index order.
    pub children: Vec<String>,
    /// `false` when the parent had already been expanded.
    pub created: bool,
}

/// Stateless fan-out helper.
#[derive(Debug, Clone, Copy, Default)]
pub struct FanOutExpander;

impl FanOutExpander {
    /// Deterministic child vertex name.
    pub fn child_name(parent: &str, index: usize) -> String {
        format!("{parent}.{index}")
    }

    /// Expand `task` into child vertices inside `vertices`.
    ///
    /// The parent vertex must already exist. Re-invocation on an expanded
    /// parent returns its existing children without touching the map. An
    /// empty element list yields an empty, `created` expansion; the caller
    /// decides how to settle such a parent.
    pub fn expand(
        &self,
        task: &Task,
        vertices: &mut BTreeMap<String, VertexStatus>,
        now: DateTime<Utc>,
    ) -> Result<Expansion, FanOutError> {
        let iter = task
            .commands_iter
            .as_ref()
            .ok_or_else(|| FanOutError::NotFanOut(task.name.clone()))?;

        let existing = vertices
            .get(&task.name)
            .ok_or_else(|| FanOutError::UnknownVertex(task.name.clone()))?;
        if existing.is_fan_out_parent() {
            return Ok(Expansion {
                children: existing.children.clone(),
                created: false,
            });
        }

        let elements = self.elements(iter, vertices)?;
        let mut commands = Vec::with_capacity(elements.len());
        for (index, element) in elements.iter().enumerate() {
            commands.push(self.render_command(&iter.command, element, index)?);
        }

        let mut children = Vec::with_capacity(commands.len());
        for (index, command) in commands.into_iter().enumerate() {
            let name = Self::child_name(&task.name, index);
            vertices
                .entry(name.clone())
                .or_insert_with(|| VertexStatus::for_child(&name, &task.name, index, vec![command], now));
            children.push(name);
        }

        if let Some(parent) = vertices.get_mut(&task.name) {
            parent.children = children.clone();
        }

        Ok(Expansion {
            children,
            created: true,
        })
    }

    /// Compute the element list of an iteration template.
    ///
    /// Each element is a row of positional values bound to `${1}`..`${n}`.
    pub fn elements(
        &self,
        iter: &CommandsIter,
        vertices: &BTreeMap<String, VertexStatus>,
    ) -> Result<Vec<Vec<String>>, FanOutError> {
        if !iter.vars.is_empty() {
            return Ok(iter.vars.clone());
        }

        if !iter.vars_iter.is_empty() {
            let mut axes = Vec::with_capacity(iter.vars_iter.len());
            for list in &iter.vars_iter {
                let mut values = Vec::new();
                for entry in list {
                    values.extend(expand_entry(entry)?);
                }
                axes.push(values);
            }
            let count = axes.iter().map(|a| a.len() as u128).product::<u128>();
            if count > MAX_FAN_OUT_ELEMENTS as u128 {
                return Err(FanOutError::TooManyElements {
                    count,
                    limit: MAX_FAN_OUT_ELEMENTS,
                });
            }
            return Ok(cartesian(&axes));
        }

        if let Some(source) = &iter.from_result {
            let vertex = vertices
                .get(&source.task)
                .ok_or_else(|| FanOutError::MissingResult(source.task.clone()))?;
            let output = vertex.output.as_deref().unwrap_or("");
            return Ok(output
                .split(source.separator.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| vec![s.to_string()])
                .collect());
        }

        Ok(Vec::new())
    }

    /// Substitute `${index}` and `${1}`..`${n}` in `template`.
    ///
    /// Unknown placeholder names are left untouched so shell variables like
    /// `${HOME}` pass through.
    pub fn render_command(
        &self,
        template: &str,
        element: &[String],
        index: usize,
    ) -> Result<String, FanOutError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let key = &after[..end];

            if key == "index" {
                out.push_str(&index.to_string());
            } else if let Ok(position) = key.parse::<usize>() {
                let value = position
                    .checked_sub(1)
                    .and_then(|i| element.get(i))
                    .ok_or_else(|| FanOutError::Placeholder {
                        placeholder: key.to_string(),
                        index,
                    })?;
                out.push_str(value);
            } else {
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// Expand one `vars_iter` entry: `range(start,end[,step])` or a literal.
fn expand_entry(entry: &str) -> Result<Vec<String>, FanOutError> {
    let trimmed = entry.trim();
    let Some(args) = trimmed
        .strip_prefix("range(")
        .and_then(|s| s.strip_suffix(')'))
    else {
        return Ok(vec![entry.to_string()]);
    };

    let invalid = || FanOutError::InvalidRange(entry.to_string());
    let nums = args
        .split(',')
        .map(|n| n.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;

    let (start, end, step) = match nums.as_slice() {
        [start, end] => (*start, *end, 1),
        [start, end, step] => (*start, *end, *step),
        _ => return Err(invalid()),
    };
    if step == 0 {
        return Err(invalid());
    }

    let span = i128::from(end) - i128::from(start);
    let stride = i128::from(step);
    let count = if span.signum() == stride.signum() {
        (span.abs() + stride.abs() - 1) / stride.abs()
    } else {
        0
    };
    if count > MAX_FAN_OUT_ELEMENTS as i128 {
        return Err(invalid());
    }

    let mut values = Vec::with_capacity(count as usize);
    let mut next = Some(start);
    while let Some(n) = next.filter(|n| (step > 0 && *n < end) || (step < 0 && *n > end)) {
        values.push(n.to_string());
        next = n.checked_add(step);
    }
    Ok(values)
}

/// Cartesian product of `axes`, first axis varying slowest.
fn cartesian(axes: &[Vec<String>]) -> Vec<Vec<String>> {
    axes.iter().fold(vec![Vec::new()], |acc, axis| {
        acc.iter()
            .flat_map(|prefix| {
                axis.iter().map(move |value| {
                    let mut row = prefix.clone();
                    row.push(value.clone());
                    row
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fan_out_task, vertex};
    use genegraph_types::execution::ResultSource;
    use genegraph_types::vertex::VertexPhase;

    fn with_parent(task: &Task) -> BTreeMap<String, VertexStatus> {
        let mut map = BTreeMap::new();
        map.insert(task.name.clone(), vertex(&task.name, VertexPhase::Pending));
        map
    }

    #[test]
    fn test_expand_creates_named_children() {
        let task = fan_out_task("split", &[], &["a", "b", "c"]);
        let mut vertices = with_parent(&task);
        let expansion = FanOutExpander
            .expand(&task, &mut vertices, Utc::now())
            .unwrap();

        assert!(expansion.created);
        assert_eq!(expansion.children, vec!["split.0", "split.1", "split.2"]);
        assert_eq!(vertices["split"].children, expansion.children);
        let child = &vertices["split.1"];
        assert_eq!(child.parent.as_deref(), Some("split"));
        assert_eq!(child.command_set, vec!["process b #1".to_string()]);
        assert_eq!(child.phase, VertexPhase::Pending);
    }

    #[test]
    fn test_expand_is_idempotent() {
        let task = fan_out_task("split", &[], &["a", "b"]);
        let mut vertices = with_parent(&task);
        let first = FanOutExpander.expand(&task, &mut vertices, Utc::now()).unwrap();
        let snapshot = vertices.clone();

        let second = FanOutExpander.expand(&task, &mut vertices, Utc::now()).unwrap();
        assert!(!second.created);
        assert_eq!(first.children, second.children);
        assert_eq!(vertices, snapshot);
        assert_eq!(vertices["split"].children.len(), 2);
    }

    #[test]
    fn test_expand_requires_parent_vertex() {
        let task = fan_out_task("split", &[], &["a"]);
        let err = FanOutExpander
            .expand(&task, &mut BTreeMap::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, FanOutError::UnknownVertex(_)));
    }

    #[test]
    fn test_vars_iter_is_cartesian_with_ranges() {
        let iter = CommandsIter {
            command: "run ${1} ${2}".to_string(),
            vars_iter: vec![
                vec!["range(1,3)".to_string()],
                vec!["x".to_string(), "y".to_string()],
            ],
            ..Default::default()
        };
        let elements = FanOutExpander.elements(&iter, &BTreeMap::new()).unwrap();
        let flat: Vec<String> = elements.iter().map(|e| e.join(" ")).collect();
        assert_eq!(flat, vec!["1 x", "1 y", "2 x", "2 y"]);
    }

    #[test]
    fn test_range_with_step_and_descending() {
        assert_eq!(expand_entry("range(0,10,4)").unwrap(), vec!["0", "4", "8"]);
        assert_eq!(expand_entry("range(3,0,-1)").unwrap(), vec!["3", "2", "1"]);
        assert!(expand_entry("range(5,1)").unwrap().is_empty());
        assert!(matches!(
            expand_entry("range(1,5,0)"),
            Err(FanOutError::InvalidRange(_))
        ));
        assert!(expand_entry("range(a,b)").is_err());
        assert_eq!(expand_entry("chr1").unwrap(), vec!["chr1"]);

        let near_max = format!("range({},{},5)", i64::MAX - 1, i64::MAX);
        assert_eq!(expand_entry(&near_max).unwrap(), vec![(i64::MAX - 1).to_string()]);
        let near_min = format!("range({},{},-5)", i64::MIN + 1, i64::MIN);
        assert_eq!(expand_entry(&near_min).unwrap(), vec![(i64::MIN + 1).to_string()]);

        assert!(matches!(
            expand_entry(&format!("range(0,{})", i64::MAX)),
            Err(FanOutError::InvalidRange(_))
        ));
        assert!(matches!(
            expand_entry(&format!("range({},{})", i64::MIN, i64::MAX)),
            Err(FanOutError::InvalidRange(_))
        ));
        assert_eq!(expand_entry("range(0,100000)").unwrap().len(), MAX_FAN_OUT_ELEMENTS);
        assert!(expand_entry("range(0,100001)").is_err());
    }

    #[test]
    fn test_cartesian_product_is_capped() {
        let iter = CommandsIter {
            command: "run ${1} ${2}".to_string(),
            vars_iter: vec![
                vec!["range(0,1000)".to_string()],
                vec!["range(0,1000)".to_string()],
            ],
            ..Default::default()
        };
        let err = FanOutExpander.elements(&iter, &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            FanOutError::TooManyElements {
                count: 1_000_000,
                ..
            }
        ));
    }

    #[test]
    fn test_from_result_splits_recorded_output() {
        let iter = CommandsIter {
            command: "fetch ${1}".to_string(),
            from_result: Some(ResultSource {
                task: "list".to_string(),
                separator: "\n".to_string(),
            }),
            ..Default::default()
        };
        let mut list = vertex("list", VertexPhase::Succeeded);
        list.output = Some("s1\n  s2 \n\ns3\n".to_string());
        let vertices = BTreeMap::from([("list".to_string(), list)]);

        let elements = FanOutExpander.elements(&iter, &vertices).unwrap();
        assert_eq!(elements, vec![vec!["s1"], vec!["s2"], vec!["s3"]]);

        let err = FanOutExpander.elements(&iter, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, FanOutError::MissingResult(_)));
    }

    #[test]
    fn test_render_command_placeholders() {
        let element = vec!["chr1".to_string(), "hg38".to_string()];
        let rendered = FanOutExpander
            .render_command("call -L ${1} -R ${2}.fa -o /out/${index}.vcf $HOME ${HOME}", &element, 7)
            .unwrap();
        assert_eq!(rendered, "call -L chr1 -R hg38.fa -o /out/7.vcf $HOME ${HOME}");

        let err = FanOutExpander
            .render_command("x ${3}", &element, 0)
            .unwrap_err();
        assert!(err.to_string().contains("${3}"));

        let unterminated = FanOutExpander.render_command("echo ${1", &element, 0).unwrap();
        assert_eq!(unterminated, "echo ${1");
    }

    #[test]
    fn test_empty_elements_expand_to_nothing() {
        let mut task = fan_out_task("split", &[], &[]);
        if let Some(iter) = task.commands_iter.as_mut() {
            iter.vars_iter = vec![vec!["range(0,0)".to_string()]];
        }
        let mut vertices = with_parent(&task);
        let expansion = FanOutExpander.expand(&task, &mut vertices, Utc::now()).unwrap();
        assert!(expansion.created);
        assert!(expansion.children.is_empty());
        assert_eq!(vertices.len(), 1);
    }
}
