//! Core data types for the TrakFlow task graph.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

use crate::id::{content_hash, new_record_id};

/// Current time truncated to the precision stored in the cache.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The core unit of work.
///
/// A task plays one of several roles depending on its flags:
/// a Plan (`plan == true`), a Workflow (`source_plan_id` set, not a plan),
/// or an ordinary work item. Steps are children of a Plan or Workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier, e.g. "tf-a1b2" or "tf-a1b2.3" for children.
    /// Empty until the store allocates one.
    #[serde(default)]
    pub id: String,

    /// Short description of the work
    pub title: String,

    /// Longer description (markdown)
    #[serde(default)]
    pub description: String,

    /// Current state
    #[serde(default)]
    pub status: Status,

    /// Priority 0-4 (0 = critical, 4 = backlog)
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Kind of work
    #[serde(rename = "type", default)]
    pub task_type: TaskType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Weak reference to the owning task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Digest of the semantic fields, used for idempotent merges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// Immutable blueprint flag
    #[serde(default)]
    pub plan: bool,

    /// Plan this workflow was instantiated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_plan_id: Option<String>,

    /// Garbage-collectible, never exported
    #[serde(default)]
    pub ephemeral: bool,

    /// Append-only trace log
    #[serde(default)]
    pub notes: String,
}

fn default_priority() -> u8 {
    2
}

/// Task status states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
    Tombstone,
    Pinned,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Open,
        Status::InProgress,
        Status::Blocked,
        Status::Deferred,
        Status::Closed,
        Status::Tombstone,
        Status::Pinned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::Deferred => "deferred",
            Status::Closed => "closed",
            Status::Tombstone => "tombstone",
            Status::Pinned => "pinned",
        }
    }

    /// Closed and tombstoned tasks no longer block anything.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Closed | Status::Tombstone)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidStatus(s.to_string()))
    }
}

/// Kinds of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Bug => "bug",
            TaskType::Feature => "feature",
            TaskType::Task => "task",
            TaskType::Epic => "epic",
            TaskType::Chore => "chore",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug" => Ok(TaskType::Bug),
            "feature" => Ok(TaskType::Feature),
            "task" => Ok(TaskType::Task),
            "epic" => Ok(TaskType::Epic),
            "chore" => Ok(TaskType::Chore),
            other => Err(ValidationError::InvalidType(other.to_string())),
        }
    }
}

impl Task {
    /// A new open task with default priority and type. The ID is allocated on create.
    pub fn new(title: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: String::new(),
            title: title.into(),
            description: String::new(),
            status: Status::Open,
            priority: default_priority(),
            task_type: TaskType::Task,
            assignee: None,
            parent_id: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            content_hash: None,
            plan: false,
            source_plan_id: None,
            ephemeral: false,
            notes: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Mark as a Plan (blueprint).
    pub fn as_plan(mut self) -> Self {
        self.plan = true;
        self
    }

    /// Mark as ephemeral (garbage-collectible, not exported).
    pub fn as_ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Validate the task's fields and role flags.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.title.chars().count() > 500 {
            return Err(ValidationError::TitleTooLong);
        }
        if self.title.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidCharacters);
        }

        if self.priority > 4 {
            return Err(ValidationError::InvalidPriority(self.priority));
        }

        if self.updated_at < self.created_at {
            return Err(ValidationError::InvalidTimestamp);
        }

        // Plans are immutable blueprints
        if self.plan {
            if self.ephemeral {
                return Err(ValidationError::PlanEphemeral);
            }
            if self.status != Status::Open {
                return Err(ValidationError::PlanStatus(self.status));
            }
            if self.source_plan_id.is_some() {
                return Err(ValidationError::PlanDerived);
            }
        }

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.status == Status::Open
    }

    /// Closed or tombstoned.
    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_workflow(&self) -> bool {
        !self.plan && self.source_plan_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn is_discardable(&self) -> bool {
        self.ephemeral
    }

    /// Close the task, recording the reason in the notes.
    pub fn close(&mut self, reason: Option<&str>) {
        self.status = Status::Closed;
        self.closed_at = Some(now());
        if let Some(reason) = reason {
            self.push_note(&format!("[Closed] {}", reason));
        }
        self.touch();
    }

    /// Reopen the task, recording the reason in the notes.
    pub fn reopen(&mut self, reason: Option<&str>) {
        self.status = Status::Open;
        self.closed_at = None;
        if let Some(reason) = reason {
            self.push_note(&format!("[Reopened] {}", reason));
        }
        self.touch();
    }

    /// Append a timestamped `[ACTION] message` entry to the notes.
    pub fn append_trace(&mut self, action: &str, message: &str) {
        let entry = format!("[{}] [{}] {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), action, message);
        self.push_note(&entry);
        self.touch();
    }

    /// Bump `updated_at` and recompute the content hash.
    pub fn touch(&mut self) {
        self.updated_at = now();
        self.update_content_hash();
    }

    pub fn update_content_hash(&mut self) {
        self.content_hash = Some(self.compute_content_hash());
    }

    /// Digest of every field except `content_hash` and `updated_at`.
    pub fn compute_content_hash(&self) -> String {
        content_hash(&json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "status": self.status,
            "priority": self.priority,
            "type": self.task_type,
            "assignee": self.assignee,
            "parent_id": self.parent_id,
            "created_at": self.created_at,
            "closed_at": self.closed_at,
            "plan": self.plan,
            "source_plan_id": self.source_plan_id,
            "ephemeral": self.ephemeral,
            "notes": self.notes,
        }))
    }

    pub(crate) fn push_note(&mut self, entry: &str) {
        if self.notes.is_empty() {
            self.notes = entry.trim().to_string();
        } else {
            self.notes = format!("{}\n{}", self.notes, entry).trim().to_string();
        }
    }
}

/// A directed, typed edge: `source_id` -> `target_id`.
///
/// For blocking types the source must finish before the target can start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    #[serde(default = "new_record_id")]
    pub id: String,

    pub source_id: String,

    pub target_id: String,

    #[serde(rename = "type", default)]
    pub dep_type: DependencyType,

    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
}

/// Types of relationships between tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    /// Hard dependency: the target waits for the source to close
    #[default]
    Blocks,

    /// Informational link, no blocking semantics
    Related,

    /// Hierarchical: the source is the parent of the target
    ParentChild,

    /// Traceability link to where the work was found
    DiscoveredFrom,
}

impl DependencyType {
    /// Returns true if this edge type participates in cycle checks and the blocked-cache.
    pub fn is_blocking(&self) -> bool {
        matches!(self, DependencyType::Blocks | DependencyType::ParentChild)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::Related => "related",
            DependencyType::ParentChild => "parent-child",
            DependencyType::DiscoveredFrom => "discovered-from",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(DependencyType::Blocks),
            "related" => Ok(DependencyType::Related),
            "parent-child" => Ok(DependencyType::ParentChild),
            "discovered-from" => Ok(DependencyType::DiscoveredFrom),
            other => Err(ValidationError::InvalidDependencyType(other.to_string())),
        }
    }
}

impl Dependency {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>, dep_type: DependencyType) -> Self {
        Self {
            id: new_record_id(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            dep_type,
            created_at: now(),
        }
    }

    pub fn blocks(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self::new(source_id, target_id, DependencyType::Blocks)
    }

    pub fn is_blocking(&self) -> bool {
        self.dep_type.is_blocking()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id.trim().is_empty() || self.target_id.trim().is_empty() {
            return Err(ValidationError::MissingEndpoint);
        }
        if self.source_id == self.target_id {
            return Err(ValidationError::SelfReferentialDependency(self.source_id.clone()));
        }
        Ok(())
    }
}

/// A `(task_id, name)` tag. Names of the form `dimension:value` act as state slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    #[serde(default = "new_record_id")]
    pub id: String,

    pub task_id: String,

    pub name: String,

    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
}

impl Label {
    pub fn new(task_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            task_id: task_id.into(),
            name: name.into(),
            created_at: now(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task_id.trim().is_empty() {
            return Err(ValidationError::MissingTaskId);
        }
        // Alphanumeric, hyphens, underscores, and colons for state labels
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
        {
            return Err(ValidationError::InvalidLabel(self.name.clone()));
        }
        Ok(())
    }

    pub fn is_state_label(&self) -> bool {
        self.name.contains(':')
    }

    /// The `dimension` part of `dimension:value`, if any.
    pub fn dimension(&self) -> Option<&str> {
        self.name.split_once(':').map(|(dimension, _)| dimension)
    }

    /// The `value` part of `dimension:value`, or the whole name.
    pub fn value(&self) -> &str {
        self.name.split_once(':').map(|(_, value)| value).unwrap_or(&self.name)
    }
}

/// Append-only note attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    #[serde(default = "new_record_id")]
    pub id: String,

    pub task_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    pub body: String,

    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(task_id: impl Into<String>, body: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: new_record_id(),
            task_id: task_id.into(),
            author: None,
            body: body.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task_id.trim().is_empty() {
            return Err(ValidationError::MissingTaskId);
        }
        if self.body.trim().is_empty() {
            return Err(ValidationError::EmptyCommentBody);
        }
        Ok(())
    }
}

/// Validation errors for entities and bulk imports.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyTitle,
    TitleTooLong,
    InvalidCharacters,
    InvalidPriority(u8),
    InvalidStatus(String),
    InvalidType(String),
    InvalidDependencyType(String),
    InvalidTimestamp,
    PlanEphemeral,
    PlanStatus(Status),
    PlanDerived,
    MissingEndpoint,
    SelfReferentialDependency(String),
    InvalidLabel(String),
    MissingTaskId,
    EmptyCommentBody,
    InvalidId(String),
    OrphanedTasks(usize),
    ImportFailed(Vec<String>),
    ExportFailed(Vec<String>),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyTitle => write!(f, "title is required"),
            ValidationError::TitleTooLong => write!(f, "title exceeds 500 characters"),
            ValidationError::InvalidCharacters => write!(f, "title contains control characters"),
            ValidationError::InvalidPriority(p) => write!(f, "invalid priority {}: must be 0-4", p),
            ValidationError::InvalidStatus(s) => write!(f, "invalid status: {}", s),
            ValidationError::InvalidType(t) => write!(f, "invalid type: {}", t),
            ValidationError::InvalidDependencyType(t) => write!(f, "invalid dependency type: {}", t),
            ValidationError::InvalidTimestamp => write!(f, "updated_at cannot be before created_at"),
            ValidationError::PlanEphemeral => write!(f, "plans cannot be ephemeral"),
            ValidationError::PlanStatus(s) => write!(f, "plans cannot change status (got {})", s),
            ValidationError::PlanDerived => write!(f, "plans cannot be derived from other plans"),
            ValidationError::MissingEndpoint => write!(f, "source and target IDs are required"),
            ValidationError::SelfReferentialDependency(id) => {
                write!(f, "self-referential dependency not allowed: {}", id)
            }
            ValidationError::InvalidLabel(label) => {
                write!(
                    f,
                    "invalid label '{}': must be alphanumeric with hyphens, underscores or colons",
                    label
                )
            }
            ValidationError::MissingTaskId => write!(f, "task ID is required"),
            ValidationError::EmptyCommentBody => write!(f, "comment body is required"),
            ValidationError::InvalidId(id) => write!(f, "invalid ID format: {}", id),
            ValidationError::OrphanedTasks(count) => {
                write!(f, "found {} orphaned tasks with missing parents", count)
            }
            ValidationError::ImportFailed(errors) => {
                write!(f, "import failed with {} error(s):\n  {}", errors.len(), errors.join("\n  "))
            }
            ValidationError::ExportFailed(errors) => {
                write!(f, "export failed with {} error(s):\n  {}", errors.len(), errors.join("\n  "))
            }
        }
    }
}

impl std::error::Error for ValidationError {}
