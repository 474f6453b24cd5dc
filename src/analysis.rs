//! Read-only analytics over the dependency graph.

use eyre::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::query::Filter;
use crate::store::{Store, StoreError};
use crate::types::{Dependency, Status, Task};

/// Minimum in- or out-degree for an open task to count as a bottleneck.
const BOTTLENECK_DEGREE: usize = 3;

/// Which way `dependency_tree` walks from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeDirection {
    /// Towards the tasks blocking the root (incoming blocking edges)
    Blocking,
    /// Towards the tasks that depend on the root (all outgoing edges)
    Dependents,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub priority: u8,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottleneck {
    pub id: String,
    pub title: String,
    pub incoming: usize,
    pub outgoing: usize,
}

/// Aggregate graph health counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphAnalysis {
    pub total_tasks: usize,
    pub open_tasks: usize,
    pub ready_tasks: usize,
    pub blocked_tasks: usize,
    /// Tasks whose `parent_id` points at a missing task
    pub orphan_tasks: usize,
    pub bottlenecks: Vec<Bottleneck>,
}

/// Snapshot of every task and edge, with adjacency lists for traversal.
pub struct DependencyGraph<'a> {
    store: &'a Store,
    tasks: HashMap<String, Task>,
    outgoing: HashMap<String, Vec<Dependency>>,
    incoming: HashMap<String, Vec<Dependency>>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(store: &'a Store) -> Result<Self> {
        let tasks = store
            .list(&Filter::new().everything())?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        let mut outgoing: HashMap<String, Vec<Dependency>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<Dependency>> = HashMap::new();
        for dep in store.all_dependencies()? {
            outgoing.entry(dep.source_id.clone()).or_default().push(dep.clone());
            incoming.entry(dep.target_id.clone()).or_default().push(dep);
        }

        Ok(Self {
            store,
            tasks,
            outgoing,
            incoming,
        })
    }

    fn outgoing(&self, id: &str) -> &[Dependency] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    fn incoming(&self, id: &str) -> &[Dependency] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Nested tree rooted at `task_id`, at most `max_depth` levels deep.
    ///
    /// Each branch carries its own visited set, so a task reachable along two
    /// paths appears under both.
    pub fn dependency_tree(&self, task_id: &str, direction: TreeDirection, max_depth: usize) -> Result<Option<TreeNode>> {
        let root = self
            .tasks
            .get(task_id)
            .ok_or_else(|| eyre::eyre!(StoreError::TaskNotFound(task_id.to_string())))?;
        Ok(self.tree_node(root, direction, max_depth, &mut Vec::new()))
    }

    fn tree_node(&self, task: &Task, direction: TreeDirection, remaining: usize, path: &mut Vec<String>) -> Option<TreeNode> {
        if remaining == 0 || path.contains(&task.id) {
            return None;
        }
        path.push(task.id.clone());

        let related: Vec<&str> = match direction {
            TreeDirection::Blocking => self
                .incoming(&task.id)
                .iter()
                .filter(|dep| dep.is_blocking())
                .map(|dep| dep.source_id.as_str())
                .collect(),
            TreeDirection::Dependents => self
                .outgoing(&task.id)
                .iter()
                .map(|dep| dep.target_id.as_str())
                .collect(),
        };

        let children = related
            .into_iter()
            .filter_map(|id| self.tasks.get(id))
            .filter_map(|child| self.tree_node(child, direction, remaining - 1, path))
            .collect();

        path.pop();
        Some(TreeNode {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            priority: task.priority,
            children,
        })
    }

    /// Every task that transitively blocks `task_id`, nearest first.
    pub fn all_blockers(&self, task_id: &str) -> Vec<&Task> {
        self.collect_related(task_id, |id| {
            self.incoming(id)
                .iter()
                .filter(|dep| dep.is_blocking())
                .map(|dep| dep.source_id.as_str())
                .collect()
        })
    }

    /// Every task transitively blocked by `task_id`, nearest first.
    pub fn all_blocked(&self, task_id: &str) -> Vec<&Task> {
        self.collect_related(task_id, |id| {
            self.outgoing(id)
                .iter()
                .filter(|dep| dep.is_blocking())
                .map(|dep| dep.target_id.as_str())
                .collect()
        })
    }

    fn collect_related<'s>(&'s self, start: &str, neighbours: impl Fn(&str) -> Vec<&'s str>) -> Vec<&'s Task> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut result = Vec::new();

        if let Some((id, _)) = self.tasks.get_key_value(start) {
            visited.insert(id.as_str());
            queue.push_back(id.as_str());
        }

        while let Some(current) = queue.pop_front() {
            for next in neighbours(current) {
                if !visited.insert(next) {
                    continue;
                }
                if let Some(task) = self.tasks.get(next) {
                    result.push(task);
                    queue.push_back(next);
                }
            }
        }

        result
    }

    /// Longest chain of blocking edges starting at `root_id`, root first.
    /// Ties go to the first child encountered.
    pub fn critical_path(&self, root_id: &str) -> Vec<&Task> {
        let mut memo: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_progress: HashSet<&str> = HashSet::new();
        self.longest_path(root_id, &mut memo, &mut in_progress)
            .into_iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    fn longest_path<'s>(
        &'s self,
        id: &str,
        memo: &mut HashMap<&'s str, Vec<&'s str>>,
        in_progress: &mut HashSet<&'s str>,
    ) -> Vec<&'s str> {
        let Some((key, _)) = self.tasks.get_key_value(id) else {
            return Vec::new();
        };
        let key = key.as_str();
        if let Some(path) = memo.get(key) {
            return path.clone();
        }
        if !in_progress.insert(key) {
            return Vec::new();
        }

        let mut longest: Vec<&str> = Vec::new();
        for dep in self.outgoing(key).iter().filter(|dep| dep.is_blocking()) {
            let candidate = self.longest_path(&dep.target_id, memo, in_progress);
            if candidate.len() > longest.len() {
                longest = candidate;
            }
        }

        in_progress.remove(key);
        let mut path = vec![key];
        path.extend(longest);
        memo.insert(key, path.clone());
        path
    }

    /// Listed tasks with no incoming blocking edge.
    pub fn root_tasks(&self) -> Result<Vec<Task>> {
        let targets: HashSet<&str> = self
            .outgoing
            .values()
            .flatten()
            .filter(|dep| dep.is_blocking())
            .map(|dep| dep.target_id.as_str())
            .collect();
        Ok(self
            .store
            .list(&Filter::new())?
            .into_iter()
            .filter(|task| !targets.contains(task.id.as_str()))
            .collect())
    }

    /// Listed tasks with no outgoing blocking edge.
    pub fn leaf_tasks(&self) -> Result<Vec<Task>> {
        let sources: HashSet<&str> = self
            .outgoing
            .values()
            .flatten()
            .filter(|dep| dep.is_blocking())
            .map(|dep| dep.source_id.as_str())
            .collect();
        Ok(self
            .store
            .list(&Filter::new())?
            .into_iter()
            .filter(|task| !sources.contains(task.id.as_str()))
            .collect())
    }

    pub fn analyze(&self) -> Result<GraphAnalysis> {
        let listed = self.store.list(&Filter::new())?;
        let open: Vec<&Task> = listed.iter().filter(|task| task.is_open()).collect();

        let orphan_tasks = listed
            .iter()
            .filter(|task| {
                task.parent_id
                    .as_deref()
                    .is_some_and(|parent| !self.tasks.contains_key(parent))
            })
            .count();

        let mut bottlenecks: Vec<Bottleneck> = open
            .iter()
            .map(|task| Bottleneck {
                id: task.id.clone(),
                title: task.title.clone(),
                incoming: self.incoming(&task.id).len(),
                outgoing: self.outgoing(&task.id).len(),
            })
            .filter(|b| b.incoming >= BOTTLENECK_DEGREE || b.outgoing >= BOTTLENECK_DEGREE)
            .collect();
        bottlenecks.sort_by_key(|b| std::cmp::Reverse(b.incoming + b.outgoing));

        Ok(GraphAnalysis {
            total_tasks: self.tasks.len(),
            open_tasks: open.len(),
            ready_tasks: self.store.ready()?.len(),
            blocked_tasks: self.store.blocked()?.len(),
            orphan_tasks,
            bottlenecks,
        })
    }
}
