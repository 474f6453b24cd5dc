//! High-level store API for TrakFlow.

use chrono::{DateTime, TimeDelta, Utc};
use eyre::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::IdConfig;
use crate::id::{generate_child_id, generate_id, is_valid_id};
use crate::query::Filter;
use crate::storage::{DB_FILE, Direction, Storage};
use crate::types::{Comment, Dependency, DependencyType, Label, Status, Task, ValidationError, now};

/// Storage directory name.
pub const TRAK_FLOW_DIR: &str = ".trak_flow";

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Task not found.
    TaskNotFound(String),
    /// Adding this blocking edge would close a cycle.
    DependencyCycle { source_id: String, target_id: String },
    /// Validation error.
    Validation(ValidationError),
    /// A Plan-only operation was given an ordinary task.
    NotAPlan(String),
    AlreadyAPlan(String),
    /// Only ephemeral workflows can be discarded.
    NotEphemeral(String),
    /// Ephemeral tasks cannot become plans.
    EphemeralPlan(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::TaskNotFound(id) => write!(f, "task not found: {}", id),
            StoreError::DependencyCycle { source_id, target_id } => write!(
                f,
                "adding dependency {} -> {} would create a cycle",
                source_id, target_id
            ),
            StoreError::Validation(e) => write!(f, "validation error: {}", e),
            StoreError::NotAPlan(id) => write!(f, "task {} is not a plan", id),
            StoreError::AlreadyAPlan(id) => write!(f, "task {} is already a plan", id),
            StoreError::NotEphemeral(id) => write!(f, "workflow {} is not ephemeral", id),
            StoreError::EphemeralPlan(id) => write!(f, "ephemeral task {} cannot become a plan", id),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        StoreError::Validation(e)
    }
}

fn invalid(e: ValidationError) -> eyre::Report {
    eyre::eyre!(StoreError::Validation(e))
}

fn not_found(id: &str) -> eyre::Report {
    eyre::eyre!(StoreError::TaskNotFound(id.to_string()))
}

/// `now - age`, failing when the age is outside the representable range.
fn cutoff_before(age: Option<TimeDelta>, describe: impl Fn() -> String) -> Result<DateTime<Utc>> {
    age.and_then(|age| now().checked_sub_signed(age))
        .ok_or_else(|| eyre::eyre!("Age out of range: {}", describe()))
}

/// The main TrakFlow store: the SQLite cache plus the dirty flag that tells
/// the caller whether the durable log needs a new export.
pub struct Store {
    storage: Storage,
    id_config: IdConfig,
    dirty: bool,
}

impl Store {
    /// Initialize a new store in the given directory.
    pub fn init(root: &Path) -> Result<Self> {
        let dir = root.join(TRAK_FLOW_DIR);
        fs::create_dir_all(&dir).context("Failed to create .trak_flow directory")?;
        let storage = Storage::open(&dir.join(DB_FILE))?;
        Ok(Self::from_storage(storage))
    }

    /// Open an existing store.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(TRAK_FLOW_DIR);
        if !dir.exists() {
            eyre::bail!("No .trak_flow directory found. Run 'tf init' first.");
        }
        let storage = Storage::open(&dir.join(DB_FILE))?;
        Ok(Self::from_storage(storage))
    }

    /// A store backed by an in-memory cache.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_storage(Storage::open_in_memory()?))
    }

    fn from_storage(storage: Storage) -> Self {
        Self {
            storage,
            id_config: IdConfig::default(),
            dirty: false,
        }
    }

    /// Use the given ID policy for new task IDs.
    pub fn with_id_config(mut self, id_config: IdConfig) -> Self {
        self.id_config = id_config;
        self
    }

    pub fn id_config(&self) -> &IdConfig {
        &self.id_config
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Validate, allocate an ID if the task has none, and insert.
    pub fn create(&mut self, mut task: Task) -> Result<Task> {
        task.validate().map_err(invalid)?;

        if !task.id.is_empty() && !is_valid_id(&task.id) {
            return Err(invalid(ValidationError::InvalidId(task.id)));
        }
        if task.id.is_empty() {
            let existing: HashSet<String> = self.storage.all_task_ids()?.into_iter().collect();
            task.id = generate_id(&self.id_config, &existing);
        }
        task.update_content_hash();

        self.storage.insert_task(&task).context("Failed to persist task")?;
        self.dirty = true;
        Ok(task)
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        self.storage.get_task(id)
    }

    /// Get a task by ID, failing with `TaskNotFound` when absent.
    pub fn get_required(&self, id: &str) -> Result<Task> {
        self.storage.get_task(id)?.ok_or_else(|| not_found(id))
    }

    /// Validate, touch and overwrite an existing task.
    pub fn update(&mut self, mut task: Task) -> Result<Task> {
        task.validate().map_err(invalid)?;

        let previous = self.get_required(&task.id)?;
        task.touch();
        self.storage.update_task(&task).context("Failed to persist task update")?;

        if previous.status != task.status {
            self.storage.rebuild_blocked_cache()?;
        }
        self.dirty = true;
        Ok(task)
    }

    /// Close a task, recording the reason in its notes.
    pub fn close(&mut self, id: &str, reason: Option<&str>) -> Result<Task> {
        let mut task = self.get_required(id)?;
        task.close(reason);
        self.update(task)
    }

    pub fn reopen(&mut self, id: &str, reason: Option<&str>) -> Result<Task> {
        let mut task = self.get_required(id)?;
        task.reopen(reason);
        self.update(task)
    }

    /// Change a task's status. Closing through here also stamps `closed_at`.
    pub fn set_status(&mut self, id: &str, status: Status) -> Result<Task> {
        let mut task = self.get_required(id)?;
        match status {
            Status::Closed => task.close(None),
            Status::Open => task.reopen(None),
            other => task.status = other,
        }
        self.update(task)
    }

    /// Append an `[ACTION] message` trace entry to a task's notes.
    pub fn append_trace(&mut self, id: &str, action: &str, message: &str) -> Result<Task> {
        let mut task = self.get_required(id)?;
        task.append_trace(action, message);
        self.update(task)
    }

    /// Delete a task with its edges, labels and comments. Children are kept.
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let removed = self.storage.delete_task(id)?;
        if removed {
            self.storage.rebuild_blocked_cache()?;
            self.dirty = true;
        }
        Ok(removed)
    }

    /// List tasks matching the filter, most urgent and most recently touched first.
    pub fn list(&self, filter: &Filter) -> Result<Vec<Task>> {
        self.storage.query_tasks(filter)
    }

    pub fn count(&self, filter: &Filter) -> Result<usize> {
        self.storage.count_tasks(filter)
    }

    pub fn all_task_ids(&self) -> Result<Vec<String>> {
        self.storage.all_task_ids()
    }

    /// Direct children, in creation order.
    pub fn children(&self, parent_id: &str) -> Result<Vec<Task>> {
        self.storage.child_tasks(parent_id)
    }

    /// Create `task` as the next hierarchical child of `parent_id`, linked by
    /// a `parent-child` dependency. The child row, its edge and the counter
    /// bump are written together or not at all.
    pub fn create_child(&mut self, parent_id: &str, mut task: Task) -> Result<Task> {
        if !self.storage.task_exists(parent_id)? {
            return Err(not_found(parent_id));
        }
        task.validate().map_err(invalid)?;

        let index = self.storage.next_child_index(parent_id)?;
        task.id = generate_child_id(parent_id, index);
        task.parent_id = Some(parent_id.to_string());
        task.update_content_hash();

        let edge = Dependency::new(parent_id, &task.id, DependencyType::ParentChild);
        self.storage.insert_child(&task, index, &edge)?;
        self.storage.rebuild_blocked_cache()?;
        self.dirty = true;
        Ok(task)
    }

    /// Open, non-ephemeral, non-plan tasks that nothing blocks.
    pub fn ready(&self) -> Result<Vec<Task>> {
        self.storage.ready_tasks()
    }

    /// Open, non-ephemeral, non-plan tasks in the blocked-cache.
    pub fn blocked(&self) -> Result<Vec<Task>> {
        self.storage.blocked_tasks()
    }

    /// Tasks not updated for `days` days, oldest first.
    pub fn stale(&self, days: i64, status: Option<Status>) -> Result<Vec<Task>> {
        let cutoff = cutoff_before(TimeDelta::try_days(days), || format!("{} days", days))?;
        self.storage.stale_tasks(cutoff, status)
    }

    /// Delete ephemeral tasks created more than `max_age_hours` ago.
    pub fn garbage_collect_ephemeral(&mut self, max_age_hours: i64) -> Result<usize> {
        let cutoff = cutoff_before(TimeDelta::try_hours(max_age_hours), || format!("{} hours", max_age_hours))?;
        let ids = self.storage.ephemeral_ids_before(cutoff)?;

        for id in &ids {
            self.storage.delete_task(id)?;
        }
        if !ids.is_empty() {
            self.storage.rebuild_blocked_cache()?;
            self.dirty = true;
            log::info!("Garbage collected {} ephemeral task(s)", ids.len());
        }
        Ok(ids.len())
    }

    /// Turn an existing task into a Plan: open, persistent.
    pub fn mark_as_plan(&mut self, id: &str) -> Result<Task> {
        let mut task = self.get_required(id)?;
        task.plan = true;
        task.status = Status::Open;
        task.closed_at = None;
        task.ephemeral = false;
        self.update(task)
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Add an edge, rejecting blocking edges that would close a cycle.
    /// Re-adding an identical edge returns the stored one unchanged.
    pub fn add_dependency(&mut self, dep: Dependency) -> Result<Dependency> {
        match self.put_dependency(&dep)? {
            Some(existing) => Ok(existing),
            None => {
                self.storage.rebuild_blocked_cache()?;
                self.dirty = true;
                Ok(dep)
            }
        }
    }

    /// Validate and insert without touching the blocked-cache.
    /// Returns the already-stored edge when one matches.
    pub(crate) fn put_dependency(&mut self, dep: &Dependency) -> Result<Option<Dependency>> {
        dep.validate().map_err(invalid)?;

        for id in [&dep.source_id, &dep.target_id] {
            if !self.storage.task_exists(id)? {
                return Err(not_found(id));
            }
        }

        if dep.is_blocking() && self.would_create_cycle(&dep.source_id, &dep.target_id)? {
            return Err(eyre::eyre!(StoreError::DependencyCycle {
                source_id: dep.source_id.clone(),
                target_id: dep.target_id.clone(),
            }));
        }

        if let Some(existing) = self
            .storage
            .find_dependency(&dep.source_id, &dep.target_id, dep.dep_type)?
        {
            return Ok(Some(existing));
        }

        self.storage.insert_dependency(dep).context("Failed to persist dependency")?;
        Ok(None)
    }

    /// Remove matching edges (any type when `dep_type` is `None`).
    pub fn remove_dependency(
        &mut self,
        source_id: &str,
        target_id: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<usize> {
        let removed = self.storage.delete_dependencies(source_id, target_id, dep_type)?;
        if removed > 0 {
            self.storage.rebuild_blocked_cache()?;
            self.dirty = true;
        }
        Ok(removed)
    }

    pub fn dependencies(&self, task_id: &str, direction: Direction) -> Result<Vec<Dependency>> {
        self.storage.dependencies(task_id, direction)
    }

    pub fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        self.storage.all_dependencies()
    }

    /// Whether a blocking `source -> target` edge would close a cycle.
    pub fn would_create_cycle(&self, source_id: &str, target_id: &str) -> Result<bool> {
        Ok(self.storage.graph_index()?.would_create_cycle(source_id, target_id))
    }

    /// Recompute the blocked-cache from scratch.
    pub fn rebuild_blocked_cache(&mut self) -> Result<usize> {
        self.storage.rebuild_blocked_cache()
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Attach a label; idempotent on `(task_id, name)`.
    pub fn add_label(&mut self, task_id: &str, name: &str) -> Result<Label> {
        let label = Label::new(task_id, name);
        self.put_label(&label)?;
        Ok(self
            .storage
            .labels(task_id)?
            .into_iter()
            .find(|l| l.name == name)
            .unwrap_or(label))
    }

    /// Validate and insert a label record. Returns false if it already existed.
    pub(crate) fn put_label(&mut self, label: &Label) -> Result<bool> {
        label.validate().map_err(invalid)?;
        if !self.storage.task_exists(&label.task_id)? {
            return Err(not_found(&label.task_id));
        }
        let inserted = self.storage.insert_label(label)?;
        if inserted {
            self.dirty = true;
        }
        Ok(inserted)
    }

    pub fn remove_label(&mut self, task_id: &str, name: &str) -> Result<bool> {
        let removed = self.storage.delete_label(task_id, name)?;
        if removed {
            self.dirty = true;
        }
        Ok(removed)
    }

    pub fn labels(&self, task_id: &str) -> Result<Vec<Label>> {
        self.storage.labels(task_id)
    }

    /// Distinct label names across all tasks, sorted.
    pub fn all_labels(&self) -> Result<Vec<String>> {
        self.storage.label_names()
    }

    /// Replace the task's `dimension:*` label with `dimension:value`.
    pub fn set_state(&mut self, task_id: &str, dimension: &str, value: &str, reason: Option<&str>) -> Result<Label> {
        let mut task = self.get_required(task_id)?;
        let label = Label::new(task_id, format!("{}:{}", dimension, value));
        label.validate().map_err(invalid)?;

        self.storage.delete_state_labels(task_id, dimension)?;
        self.put_label(&label)?;
        self.dirty = true;

        if let Some(reason) = reason {
            task.push_note(&format!("[State] {}={}: {}", dimension, value, reason));
            self.update(task)?;
        }
        Ok(label)
    }

    /// Current value of a state dimension, if set.
    pub fn get_state(&self, task_id: &str, dimension: &str) -> Result<Option<String>> {
        Ok(self
            .storage
            .labels(task_id)?
            .into_iter()
            .find(|l| l.dimension() == Some(dimension))
            .map(|l| l.value().to_string()))
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    pub fn add_comment(&mut self, comment: Comment) -> Result<Comment> {
        self.put_comment(&comment)?;
        Ok(comment)
    }

    /// Validate and insert a comment record. Returns false if its ID already existed.
    pub(crate) fn put_comment(&mut self, comment: &Comment) -> Result<bool> {
        comment.validate().map_err(invalid)?;
        if !self.storage.task_exists(&comment.task_id)? {
            return Err(not_found(&comment.task_id));
        }
        let inserted = self.storage.insert_comment(comment)?;
        if inserted {
            self.dirty = true;
        }
        Ok(inserted)
    }

    /// Comments on a task, oldest first.
    pub fn comments(&self, task_id: &str) -> Result<Vec<Comment>> {
        self.storage.comments(task_id)
    }

    // ------------------------------------------------------------------
    // Bulk, dirty flag, meta
    // ------------------------------------------------------------------

    /// Upsert tasks read from the durable log. Rows whose content hash is
    /// unchanged are left alone. Does not mark the store dirty.
    pub fn import_tasks(&mut self, tasks: &[Task]) -> Result<usize> {
        let written = self.storage.import_tasks(tasks)?;
        if written > 0 {
            self.storage.rebuild_blocked_cache()?;
        }
        Ok(written)
    }

    /// Whether the cache has changes not yet exported to the durable log.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        self.storage.get_meta(key)
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.storage.set_meta(key, value)
    }

    /// Wipe the cache. The next import starts from nothing.
    pub fn clear(&mut self) -> Result<()> {
        self.storage.clear()?;
        self.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_store() -> (TempDir, Store) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path()).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_open_requires_init() {
        let temp_dir = TempDir::new().unwrap();
        let err = Store::open(temp_dir.path()).err().unwrap();
        assert!(err.to_string().contains("tf init"));

        Store::init(temp_dir.path()).unwrap();
        assert!(Store::open(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_create_and_get() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store
            .create(Task::new("Test task").with_description("A description").with_priority(1))
            .unwrap();

        assert!(task.id.starts_with("tf-"));
        assert_eq!(task.title, "Test task");
        assert_eq!(task.priority, 1);
        assert_eq!(task.status, Status::Open);
        assert!(task.content_hash.is_some());
        assert!(store.is_dirty());

        let retrieved = store.get(&task.id).unwrap().unwrap();
        assert_eq!(retrieved, task);
    }

    #[test]
    fn test_create_rejects_invalid() {
        let (_temp_dir, mut store) = setup_test_store();
        let err = store.create(Task::new("")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(ValidationError::EmptyTitle))
        ));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_update_touches() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store.create(Task::new("Original")).unwrap();
        let hash = task.content_hash.clone();

        let mut edited = task.clone();
        edited.title = "Updated title".to_string();
        let updated = store.update(edited).unwrap();

        assert_eq!(updated.id, task.id);
        assert!(updated.updated_at >= task.updated_at);
        assert_ne!(updated.content_hash, hash);
        assert_eq!(store.get_required(&task.id).unwrap().title, "Updated title");
    }

    #[test]
    fn test_update_missing_task() {
        let (_temp_dir, mut store) = setup_test_store();
        let mut ghost = Task::new("Ghost");
        ghost.id = "tf-dead".to_string();
        let err = store.update(ghost).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::TaskNotFound(_))));
    }

    #[test]
    fn test_close_and_reopen() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store.create(Task::new("Task to close")).unwrap();

        let closed = store.close(&task.id, Some("Completed")).unwrap();
        assert_eq!(closed.status, Status::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.notes, "[Closed] Completed");

        let reopened = store.reopen(&task.id, None).unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert!(reopened.closed_at.is_none());
    }

    #[test]
    fn test_ready_with_blocking() {
        let (_temp_dir, mut store) = setup_test_store();
        let blocker = store.create(Task::new("Blocker task").with_priority(0)).unwrap();
        let blocked = store.create(Task::new("Blocked task").with_priority(1)).unwrap();

        store.add_dependency(Dependency::blocks(&blocker.id, &blocked.id)).unwrap();

        let ready = store.ready().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, blocker.id);

        store.close(&blocker.id, None).unwrap();

        let ready = store.ready().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, blocked.id);
        assert!(store.blocked().unwrap().is_empty());
    }

    #[test]
    fn test_self_referential_dependency_rejected() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store.create(Task::new("Task")).unwrap();
        let err = store.add_dependency(Dependency::blocks(&task.id, &task.id)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(ValidationError::SelfReferentialDependency(_)))
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let (_temp_dir, mut store) = setup_test_store();
        let a = store.create(Task::new("Task A")).unwrap();
        let b = store.create(Task::new("Task B")).unwrap();
        let c = store.create(Task::new("Task C")).unwrap();

        store.add_dependency(Dependency::blocks(&a.id, &b.id)).unwrap();
        store.add_dependency(Dependency::blocks(&b.id, &c.id)).unwrap();

        let err = store.add_dependency(Dependency::blocks(&c.id, &a.id)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DependencyCycle { .. })
        ));
        assert_eq!(store.all_dependencies().unwrap().len(), 2);
    }

    #[test]
    fn test_dependency_idempotent() {
        let (_temp_dir, mut store) = setup_test_store();
        let a = store.create(Task::new("Task A")).unwrap();
        let b = store.create(Task::new("Task B")).unwrap();

        let first = store.add_dependency(Dependency::blocks(&a.id, &b.id)).unwrap();
        let second = store.add_dependency(Dependency::blocks(&a.id, &b.id)).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.all_dependencies().unwrap().len(), 1);
    }

    #[test]
    fn test_create_child_ids() {
        let (_temp_dir, mut store) = setup_test_store();
        let parent = store.create(Task::new("Epic")).unwrap();

        let c1 = store.create_child(&parent.id, Task::new("Child 1")).unwrap();
        let c2 = store.create_child(&parent.id, Task::new("Child 2")).unwrap();

        assert_eq!(c1.id, format!("{}.1", parent.id));
        assert_eq!(c2.id, format!("{}.2", parent.id));
        assert_eq!(c1.parent_id.as_deref(), Some(parent.id.as_str()));

        let deps = store.dependencies(&parent.id, Direction::Outgoing).unwrap();
        assert_eq!(deps.len(), 2);
        assert!(deps.iter().all(|d| d.dep_type == DependencyType::ParentChild));

        // Open parent blocks its children
        let blocked: Vec<String> = store.blocked().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(blocked.len(), 2);
    }

    #[test]
    fn test_create_child_does_not_reuse_deleted_index() {
        let (_temp_dir, mut store) = setup_test_store();
        let parent = store.create(Task::new("Epic")).unwrap();

        let c1 = store.create_child(&parent.id, Task::new("Child 1")).unwrap();
        store.delete(&c1.id).unwrap();
        let c2 = store.create_child(&parent.id, Task::new("Child 2")).unwrap();

        assert_eq!(c2.id, format!("{}.2", parent.id));
    }

    #[test]
    fn test_rejected_child_leaves_no_trace() {
        let (_temp_dir, mut store) = setup_test_store();
        let parent = store.create(Task::new("Epic")).unwrap();

        assert!(store.create_child(&parent.id, Task::new("")).is_err());
        assert!(store.children(&parent.id).unwrap().is_empty());
        assert!(store.all_dependencies().unwrap().is_empty());

        let child = store.create_child(&parent.id, Task::new("Real child")).unwrap();
        assert_eq!(child.id, format!("{}.1", parent.id));
        assert_eq!(store.get_required(&child.id).unwrap(), child);
        assert_eq!(store.dependencies(&child.id, Direction::Incoming).unwrap().len(), 1);
        assert_eq!(store.blocked().unwrap()[0].id, child.id);
    }

    #[test]
    fn test_create_rejects_malformed_id() {
        let (_temp_dir, mut store) = setup_test_store();
        let mut task = Task::new("Hand-picked ID");
        task.id = "not an id".to_string();

        let err = store.create(task).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(ValidationError::InvalidId(_)))
        ));

        let mut task = Task::new("Well-formed ID");
        task.id = "tf-beef".to_string();
        assert_eq!(store.create(task).unwrap().id, "tf-beef");
    }

    #[test]
    fn test_create_child_missing_parent() {
        let (_temp_dir, mut store) = setup_test_store();
        let err = store.create_child("tf-dead", Task::new("Orphan")).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::TaskNotFound(_))));
    }

    #[test]
    fn test_labels_and_state() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store.create(Task::new("Task")).unwrap();

        store.add_label(&task.id, "backend").unwrap();
        store.add_label(&task.id, "backend").unwrap();
        assert_eq!(store.labels(&task.id).unwrap().len(), 1);

        store.set_state(&task.id, "phase", "draft", None).unwrap();
        store.set_state(&task.id, "phase", "review", Some("ready for eyes")).unwrap();
        assert_eq!(store.get_state(&task.id, "phase").unwrap().as_deref(), Some("review"));
        assert_eq!(store.all_labels().unwrap(), vec!["backend", "phase:review"]);
        assert!(store.get_required(&task.id).unwrap().notes.contains("[State] phase=review: ready for eyes"));

        assert!(store.remove_label(&task.id, "backend").unwrap());
        assert!(!store.remove_label(&task.id, "backend").unwrap());
    }

    #[test]
    fn test_label_requires_task() {
        let (_temp_dir, mut store) = setup_test_store();
        let err = store.add_label("tf-dead", "backend").unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::TaskNotFound(_))));
    }

    #[test]
    fn test_comments_ordered() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store.create(Task::new("Task")).unwrap();

        store.add_comment(Comment::new(&task.id, "first").with_author("alice")).unwrap();
        store.add_comment(Comment::new(&task.id, "second")).unwrap();

        let bodies: Vec<String> = store.comments(&task.id).unwrap().into_iter().map(|c| c.body).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[test]
    fn test_mark_as_plan() {
        let (_temp_dir, mut store) = setup_test_store();
        let task = store.create(Task::new("Blueprint").with_status(Status::InProgress)).unwrap();

        let plan = store.mark_as_plan(&task.id).unwrap();
        assert!(plan.plan);
        assert_eq!(plan.status, Status::Open);

        // Plans are hidden from the default listing
        assert!(store.list(&Filter::new()).unwrap().is_empty());
        assert_eq!(store.list(&Filter::new().include_plans()).unwrap().len(), 1);
    }

    #[test]
    fn test_dirty_flag() {
        let (_temp_dir, mut store) = setup_test_store();
        assert!(!store.is_dirty());
        store.create(Task::new("Task")).unwrap();
        assert!(store.is_dirty());
        store.mark_clean();
        assert!(!store.is_dirty());
    }
}
