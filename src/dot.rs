//! Graphviz rendering of the dependency graph.

use eyre::{Context, Result};
use std::collections::HashSet;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::storage::Direction;
use crate::store::Store;
use crate::types::{Dependency, DependencyType, Status, Task};

const TITLE_WIDTH: usize = 30;

fn status_color(status: Status) -> Option<&'static str> {
    match status {
        Status::Closed | Status::Tombstone => Some("#4a5568"),
        Status::InProgress => Some("#3182ce"),
        Status::Blocked => Some("#e53e3e"),
        Status::Deferred => Some("#d69e2e"),
        Status::Pinned => Some("#805ad5"),
        Status::Open => None,
    }
}

fn priority_color(priority: u8) -> &'static str {
    match priority {
        0 => "#e53e3e",
        1 => "#ed8936",
        2 => "#48bb78",
        3 => "#4299e1",
        _ => "#a0aec0",
    }
}

/// Fill colour: status first, then priority for open tasks.
fn node_color(task: &Task) -> &'static str {
    status_color(task.status).unwrap_or_else(|| priority_color(task.priority))
}

fn edge_style(dep: &Dependency) -> String {
    let (color, style) = match dep.dep_type {
        DependencyType::Blocks => ("#e53e3e", "bold"),
        DependencyType::ParentChild => ("#3182ce", "dashed"),
        DependencyType::Related => ("#a0aec0", "dotted"),
        DependencyType::DiscoveredFrom => ("#805ad5", "dotted"),
    };
    format!("color=\"{}\", style={}", color, style)
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let head: String = s.chars().take(width - 3).collect();
    format!("{}...", head)
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Render tasks (all of them when `task_ids` is `None`) and the edges between
/// them as a DOT digraph. Closed and tombstoned tasks are dropped unless
/// `include_closed` is set.
pub fn to_dot(store: &Store, task_ids: Option<&[String]>, include_closed: bool) -> Result<String> {
    let ids = match task_ids {
        Some(ids) => ids.to_vec(),
        None => store.all_task_ids()?,
    };

    let mut tasks = Vec::new();
    for id in &ids {
        if let Some(task) = store.get(id)? {
            if include_closed || !task.is_closed() {
                tasks.push(task);
            }
        }
    }

    let mut lines = vec![
        "digraph dependencies {".to_string(),
        "  rankdir=TB;".to_string(),
        "  node [shape=box, style=filled];".to_string(),
        String::new(),
    ];

    for task in &tasks {
        let label = format!("{}\\n{}", task.id, escape(&truncate(&task.title, TITLE_WIDTH)));
        lines.push(format!(
            "  \"{}\" [label=\"{}\", fillcolor=\"{}\"];",
            task.id,
            label,
            node_color(task)
        ));
    }

    lines.push(String::new());

    let present: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &tasks {
        for dep in store.dependencies(&task.id, Direction::Outgoing)? {
            if present.contains(dep.target_id.as_str()) {
                lines.push(format!(
                    "  \"{}\" -> \"{}\" [{}];",
                    dep.source_id,
                    dep.target_id,
                    edge_style(&dep)
                ));
            }
        }
    }

    lines.push("}".to_string());
    Ok(lines.join("\n"))
}

/// Render through the external `dot -Tsvg` command, with a transparent background.
pub fn to_svg(store: &Store, task_ids: Option<&[String]>, include_closed: bool) -> Result<String> {
    let dot = to_dot(store, task_ids, include_closed)?;

    let mut child = Command::new("dot")
        .arg("-Tsvg")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to run Graphviz 'dot' (is it installed?)")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(dot.as_bytes()).context("Failed to write to dot")?;
    }

    let output = child.wait_with_output().context("Failed to wait for dot")?;
    if !output.status.success() {
        eyre::bail!("Graphviz error: {}", String::from_utf8_lossy(&output.stderr));
    }

    let svg = String::from_utf8(output.stdout).context("dot produced invalid UTF-8")?;
    Ok(svg.replace("fill=\"white\"", "fill=\"none\""))
}
