//! Blocking-graph engine: cycle checks and blocked-set computation.
//!
//! Task IDs are interned into integer handles so traversals run over plain
//! adjacency vectors instead of re-querying SQLite per node.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::{DependencyType, Status};

/// Adjacency index over tasks and dependency edges, keyed by arena handles.
#[derive(Debug, Default)]
pub struct GraphIndex {
    ids: Vec<String>,
    handles: HashMap<String, usize>,
    status: Vec<Option<Status>>,
    outgoing: Vec<Vec<(usize, DependencyType)>>,
    incoming: Vec<Vec<(usize, DependencyType)>>,
}

impl GraphIndex {
    /// Build from `(id, status)` task pairs and `(source, target, type)` edges.
    ///
    /// Edges may reference IDs with no task row; such nodes carry no status.
    pub fn build<'a>(
        tasks: impl IntoIterator<Item = (&'a str, Status)>,
        edges: impl IntoIterator<Item = (&'a str, &'a str, DependencyType)>,
    ) -> Self {
        let mut index = Self::default();
        for (id, status) in tasks {
            let handle = index.intern(id);
            index.status[handle] = Some(status);
        }
        for (source, target, dep_type) in edges {
            index.add_edge(source, target, dep_type);
        }
        index
    }

    fn intern(&mut self, id: &str) -> usize {
        if let Some(&handle) = self.handles.get(id) {
            return handle;
        }
        let handle = self.ids.len();
        self.ids.push(id.to_string());
        self.handles.insert(id.to_string(), handle);
        self.status.push(None);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        handle
    }

    pub fn add_edge(&mut self, source: &str, target: &str, dep_type: DependencyType) {
        let s = self.intern(source);
        let t = self.intern(target);
        self.outgoing[s].push((t, dep_type));
        self.incoming[t].push((s, dep_type));
    }

    /// Whether a `source -> target` blocking edge would close a cycle:
    /// breadth-first from `target` along outgoing blocking edges, looking for `source`.
    pub fn would_create_cycle(&self, source: &str, target: &str) -> bool {
        if source == target {
            return true;
        }
        let (Some(&start), Some(&goal)) = (self.handles.get(target), self.handles.get(source)) else {
            return false;
        };

        let mut visited = vec![false; self.ids.len()];
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            if node == goal {
                return true;
            }
            if std::mem::replace(&mut visited[node], true) {
                continue;
            }
            for &(next, dep_type) in &self.outgoing[node] {
                if dep_type.is_blocking() && !visited[next] {
                    queue.push_back(next);
                }
            }
        }

        false
    }

    /// IDs of open tasks that are currently blocked.
    ///
    /// A task is blocked when an incoming blocking edge comes from an existing
    /// source that is not closed/tombstoned, or from a `parent-child` source
    /// that is itself blocked. `blocks` edges do not propagate their source's
    /// blocked state.
    pub fn blocked_set(&self) -> HashSet<String> {
        let mut blocked = vec![false; self.ids.len()];
        let mut worklist = VecDeque::new();

        // Directly blocked by an active source
        for node in 0..self.ids.len() {
            let direct = self.incoming[node].iter().any(|&(source, dep_type)| {
                dep_type.is_blocking() && self.status[source].is_some_and(|s| !s.is_terminal())
            });
            if direct {
                blocked[node] = true;
                worklist.push_back(node);
            }
        }

        // Propagate through parent-child edges only
        while let Some(node) = worklist.pop_front() {
            if self.status[node].is_none() {
                continue;
            }
            for &(child, dep_type) in &self.outgoing[node] {
                if dep_type == DependencyType::ParentChild && !blocked[child] {
                    blocked[child] = true;
                    worklist.push_back(child);
                }
            }
        }

        (0..self.ids.len())
            .filter(|&node| blocked[node] && self.status[node] == Some(Status::Open))
            .map(|node| self.ids[node].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DependencyType::*;

    fn index(tasks: &[(&'static str, Status)], edges: &[(&'static str, &'static str, DependencyType)]) -> GraphIndex {
        GraphIndex::build(tasks.iter().copied(), edges.iter().copied())
    }

    #[test]
    fn test_cycle_detection_chain() {
        let idx = index(
            &[("a", Status::Open), ("b", Status::Open), ("c", Status::Open)],
            &[("a", "b", Blocks), ("b", "c", Blocks)],
        );
        assert!(idx.would_create_cycle("c", "a"));
        assert!(!idx.would_create_cycle("a", "c"));
    }

    #[test]
    fn test_cycle_detection_ignores_non_blocking_edges() {
        let idx = index(
            &[("a", Status::Open), ("b", Status::Open)],
            &[("a", "b", Related)],
        );
        assert!(!idx.would_create_cycle("b", "a"));
    }

    #[test]
    fn test_cycle_detection_through_parent_child() {
        let idx = index(
            &[("p", Status::Open), ("c", Status::Open)],
            &[("p", "c", ParentChild)],
        );
        assert!(idx.would_create_cycle("c", "p"));
    }

    #[test]
    fn test_blocks_edge_blocks_only_while_source_active() {
        let idx = index(&[("a", Status::Open), ("b", Status::Open)], &[("a", "b", Blocks)]);
        assert_eq!(idx.blocked_set(), HashSet::from(["b".to_string()]));

        let idx = index(&[("a", Status::Closed), ("b", Status::Open)], &[("a", "b", Blocks)]);
        assert!(idx.blocked_set().is_empty());
    }

    #[test]
    fn test_blocks_does_not_propagate_blocked_state() {
        // b is blocked by a but closed, so its edge to c is inactive
        let idx = index(
            &[("a", Status::Open), ("b", Status::Closed), ("c", Status::Open)],
            &[("a", "b", Blocks), ("b", "c", Blocks)],
        );
        assert!(idx.blocked_set().is_empty());
    }

    #[test]
    fn test_parent_child_propagates_parent_blocked_state() {
        // gp open -> blocks -> parent (closed but blocked) -> parent-child -> child
        let idx = index(
            &[("gp", Status::Open), ("parent", Status::Closed), ("child", Status::Open)],
            &[("gp", "parent", Blocks), ("parent", "child", ParentChild)],
        );
        assert_eq!(idx.blocked_set(), HashSet::from(["child".to_string()]));
    }

    #[test]
    fn test_missing_source_does_not_block() {
        let idx = index(&[("b", Status::Open)], &[("ghost", "b", Blocks)]);
        assert!(idx.blocked_set().is_empty());
    }

    #[test]
    fn test_only_open_tasks_reported() {
        let idx = index(
            &[("a", Status::Open), ("b", Status::InProgress)],
            &[("a", "b", Blocks)],
        );
        assert!(idx.blocked_set().is_empty());
    }
}
