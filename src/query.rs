//! Task filters for `Store::list`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use crate::storage::format_timestamp;
use crate::types::{Status, TaskType};

/// Conjunctive task filter.
///
/// Ephemeral tasks, plans and tombstones are excluded unless explicitly included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub statuses: Vec<Status>,
    pub priority: Option<u8>,
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    pub task_type: Option<TaskType>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    pub parent_id: Option<String>,
    pub title_contains: Option<String>,
    pub description_contains: Option<String>,
    pub notes_contains: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub closed_after: Option<DateTime<Utc>>,
    pub closed_before: Option<DateTime<Utc>>,
    pub empty_description: bool,
    pub no_assignee: bool,
    pub include_ephemeral: bool,
    pub include_plans: bool,
    pub include_tombstones: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a status; repeated calls match any of them.
    pub fn status(mut self, status: Status) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn min_priority(mut self, priority: u8) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn max_priority(mut self, priority: u8) -> Self {
        self.max_priority = Some(priority);
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Case-insensitive substring match on the title.
    pub fn title_contains(mut self, substring: impl Into<String>) -> Self {
        self.title_contains = Some(substring.into());
        self
    }

    pub fn description_contains(mut self, substring: impl Into<String>) -> Self {
        self.description_contains = Some(substring.into());
        self
    }

    pub fn notes_contains(mut self, substring: impl Into<String>) -> Self {
        self.notes_contains = Some(substring.into());
        self
    }

    pub fn created_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn updated_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.updated_after = after;
        self.updated_before = before;
        self
    }

    pub fn closed_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.closed_after = after;
        self.closed_before = before;
        self
    }

    pub fn empty_description(mut self) -> Self {
        self.empty_description = true;
        self
    }

    pub fn no_assignee(mut self) -> Self {
        self.no_assignee = true;
        self
    }

    pub fn include_ephemeral(mut self) -> Self {
        self.include_ephemeral = true;
        self
    }

    pub fn include_plans(mut self) -> Self {
        self.include_plans = true;
        self
    }

    pub fn include_tombstones(mut self) -> Self {
        self.include_tombstones = true;
        self
    }

    /// Ephemeral, plans and tombstones all included.
    pub fn everything(self) -> Self {
        self.include_ephemeral().include_plans().include_tombstones()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// SQL `WHERE` body and its positional parameters.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if !self.statuses.is_empty() {
            let placeholders = vec!["?"; self.statuses.len()].join(", ");
            clauses.push(format!("status IN ({})", placeholders));
            params.extend(self.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }

        for (column, op, value) in [
            ("priority", "=", self.priority),
            ("priority", ">=", self.min_priority),
            ("priority", "<=", self.max_priority),
        ] {
            if let Some(value) = value {
                clauses.push(format!("{} {} ?", column, op));
                params.push(Value::Integer(value as i64));
            }
        }

        if let Some(task_type) = self.task_type {
            clauses.push("type = ?".to_string());
            params.push(Value::Text(task_type.as_str().to_string()));
        }
        if let Some(assignee) = &self.assignee {
            clauses.push("assignee = ?".to_string());
            params.push(Value::Text(assignee.clone()));
        }
        if let Some(parent_id) = &self.parent_id {
            clauses.push("parent_id = ?".to_string());
            params.push(Value::Text(parent_id.clone()));
        }
        if let Some(label) = &self.label {
            clauses.push("EXISTS (SELECT 1 FROM labels l WHERE l.task_id = tasks.id AND l.name = ?)".to_string());
            params.push(Value::Text(label.clone()));
        }

        for (column, needle) in [
            ("title", &self.title_contains),
            ("description", &self.description_contains),
            ("notes", &self.notes_contains),
        ] {
            if let Some(needle) = needle {
                clauses.push(format!("lower({}) LIKE ? ESCAPE '\\'", column));
                params.push(Value::Text(format!("%{}%", escape_like(&needle.to_lowercase()))));
            }
        }

        for (column, op, bound) in [
            ("created_at", ">=", self.created_after),
            ("created_at", "<=", self.created_before),
            ("updated_at", ">=", self.updated_after),
            ("updated_at", "<=", self.updated_before),
            ("closed_at", ">=", self.closed_after),
            ("closed_at", "<=", self.closed_before),
        ] {
            if let Some(bound) = bound {
                clauses.push(format!("{} {} ?", column, op));
                params.push(Value::Text(format_timestamp(&bound)));
            }
        }

        if self.empty_description {
            clauses.push("(description IS NULL OR description = '')".to_string());
        }
        if self.no_assignee {
            clauses.push("assignee IS NULL".to_string());
        }
        if !self.include_ephemeral {
            clauses.push("ephemeral = 0".to_string());
        }
        if !self.include_plans {
            clauses.push("plan = 0".to_string());
        }
        if !self.include_tombstones {
            clauses.push("status != 'tombstone'".to_string());
        }

        let sql = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (sql, params)
    }
}

/// Escape LIKE wildcards so user text matches literally.
fn escape_like(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
