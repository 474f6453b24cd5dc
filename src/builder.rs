//! Builder pattern API for creating tasks.

use crate::store::Store;
use crate::types::{Dependency, DependencyType, Status, Task, TaskType};
use eyre::{Context, Result};

/// Builder for creating a task together with its labels and edges.
///
/// # Example
///
/// ```ignore
/// let task = store.build("Implement feature")
///     .priority(1)
///     .label("backend")
///     .blocked_by(&design.id)
///     .description("Add the new authentication flow")
///     .create()?;
/// ```
pub struct TaskBuilder<'a> {
    store: &'a mut Store,
    task: Task,
    parent_id: Option<String>,
    labels: Vec<String>,
    blocked_by: Vec<String>,
    blocks: Vec<String>,
    related: Vec<String>,
}

impl<'a> TaskBuilder<'a> {
    /// Create a new builder with the given title.
    pub fn new(store: &'a mut Store, title: impl Into<String>) -> Self {
        Self {
            store,
            task: Task::new(title),
            parent_id: None,
            labels: Vec::new(),
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            related: Vec::new(),
        }
    }

    /// Set the priority (0=critical, 4=backlog).
    pub fn priority(mut self, priority: u8) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task.task_type = task_type;
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.task.status = status;
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.task.assignee = Some(assignee.into());
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.task.description = description.into();
        self
    }

    /// Create as a hierarchical child of `parent_id`.
    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.task.ephemeral = true;
        self
    }

    /// Add a label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Add multiple labels.
    pub fn labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels.extend(labels.into_iter().map(|l| l.into()));
        self
    }

    /// The new task waits on `id`.
    pub fn blocked_by(mut self, id: impl Into<String>) -> Self {
        self.blocked_by.push(id.into());
        self
    }

    /// `id` waits on the new task.
    pub fn blocks(mut self, id: impl Into<String>) -> Self {
        self.blocks.push(id.into());
        self
    }

    pub fn related_to(mut self, id: impl Into<String>) -> Self {
        self.related.push(id.into());
        self
    }

    /// Create the task, its labels and its edges. If any edge is rejected the
    /// task is removed again.
    pub fn create(self) -> Result<Task> {
        let TaskBuilder {
            store,
            task,
            parent_id,
            labels,
            blocked_by,
            blocks,
            related,
        } = self;

        let task = match parent_id {
            Some(parent_id) => store.create_child(&parent_id, task),
            None => store.create(task),
        }
        .context("Failed to create task")?;

        let attached = attach(store, &task.id, &labels, &blocked_by, &blocks, &related);
        if let Err(e) = attached {
            store.delete(&task.id)?;
            return Err(e);
        }

        store.get_required(&task.id)
    }
}

fn attach(
    store: &mut Store,
    id: &str,
    labels: &[String],
    blocked_by: &[String],
    blocks: &[String],
    related: &[String],
) -> Result<()> {
    for name in labels {
        store.add_label(id, name)?;
    }
    for blocker in blocked_by {
        store.add_dependency(Dependency::blocks(blocker.as_str(), id))?;
    }
    for blocked in blocks {
        store.add_dependency(Dependency::blocks(id, blocked.as_str()))?;
    }
    for other in related {
        store.add_dependency(Dependency::new(id, other.as_str(), DependencyType::Related))?;
    }
    Ok(())
}

/// Extension trait to add builder method to Store.
pub trait StoreBuilderExt {
    /// Start building a new task with the given title.
    fn build(&mut self, title: impl Into<String>) -> TaskBuilder<'_>;
}

impl StoreBuilderExt for Store {
    fn build(&mut self, title: impl Into<String>) -> TaskBuilder<'_> {
        TaskBuilder::new(self, title)
    }
}
