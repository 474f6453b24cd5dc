//! Shared test infrastructure for TrakFlow integration tests.
//!
//! Provides TestEnv helper for consistent test setup/teardown.

#![allow(dead_code)]

use std::path::PathBuf;
use tempfile::TempDir;
use trakflow::{Dependency, DependencyType, Filter, Status, Store, Task, TRAK_FLOW_DIR};

/// Test environment with automatic cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub store: Store,
}

impl TestEnv {
    /// Create a new test environment with an initialized store.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::init(temp_dir.path()).expect("Failed to init store");
        Self { temp_dir, store }
    }

    /// The `.trak_flow` directory of this environment.
    pub fn dir(&self) -> PathBuf {
        self.temp_dir.path().join(TRAK_FLOW_DIR)
    }

    /// Create a task with default priority.
    pub fn create_task(&mut self, title: &str) -> Task {
        self.store.create(Task::new(title)).expect("Failed to create task")
    }

    /// Create a task with specified priority.
    pub fn create_task_with_priority(&mut self, title: &str, priority: u8) -> Task {
        self.store
            .create(Task::new(title).with_priority(priority))
            .expect("Failed to create task")
    }

    /// `blocker` must finish before `blocked`.
    pub fn add_blocking_dep(&mut self, blocker: &Task, blocked: &Task) -> Dependency {
        self.store
            .add_dependency(Dependency::blocks(&blocker.id, &blocked.id))
            .expect("Failed to add dependency")
    }

    pub fn add_dep(&mut self, source: &Task, target: &Task, dep_type: DependencyType) -> Dependency {
        self.store
            .add_dependency(Dependency::new(&source.id, &target.id, dep_type))
            .expect("Failed to add dependency")
    }

    /// Close a task.
    pub fn close_task(&mut self, task: &Task) -> Task {
        self.store.close(&task.id, None).expect("Failed to close task")
    }

    /// Assert that a task is in the ready list.
    pub fn assert_ready(&self, task: &Task) {
        let ready = self.store.ready().expect("Failed to get ready tasks");
        assert!(
            ready.iter().any(|t| t.id == task.id),
            "Expected task {} to be ready, but it wasn't. Ready tasks: {:?}",
            task.id,
            ready.iter().map(|t| &t.id).collect::<Vec<_>>()
        );
    }

    /// Assert that a task is NOT in the ready list.
    pub fn assert_not_ready(&self, task: &Task) {
        let ready = self.store.ready().expect("Failed to get ready tasks");
        assert!(
            !ready.iter().any(|t| t.id == task.id),
            "Expected task {} to NOT be ready, but it was",
            task.id
        );
    }

    /// Assert that a task is in the blocked list.
    pub fn assert_blocked(&self, task: &Task) {
        let blocked = self.store.blocked().expect("Failed to get blocked tasks");
        assert!(
            blocked.iter().any(|t| t.id == task.id),
            "Expected task {} to be blocked, but it wasn't",
            task.id
        );
    }

    pub fn ready_ids(&self) -> Vec<String> {
        self.store
            .ready()
            .expect("Failed to get ready tasks")
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    pub fn blocked_ids(&self) -> Vec<String> {
        self.store
            .blocked()
            .expect("Failed to get blocked tasks")
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    /// Get ready tasks count.
    pub fn ready_count(&self) -> usize {
        self.store.ready().expect("Failed to get ready tasks").len()
    }

    /// Count of tasks the default list shows.
    pub fn total_count(&self) -> usize {
        self.store.count(&Filter::new()).expect("Failed to count tasks")
    }

    /// Get tasks by status.
    pub fn count_by_status(&self, status: Status) -> usize {
        self.store
            .count(&Filter::new().status(status))
            .expect("Failed to count tasks")
    }

    pub fn edge_count(&self) -> usize {
        self.store.all_dependencies().expect("Failed to list dependencies").len()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
