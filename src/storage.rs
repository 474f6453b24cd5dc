//! SQLite cache for TrakFlow.
//!
//! The cache is disposable: everything in it can be regenerated from the
//! durable log except the `meta` bookkeeping and the per-parent child counters.

use chrono::{DateTime, SecondsFormat, Utc};
use eyre::{Context, Result};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use crate::graph::GraphIndex;
use crate::query::Filter;
use crate::types::{Comment, Dependency, DependencyType, Label, Status, Task};

/// SQLite database file within the `.trak_flow` directory.
pub const DB_FILE: &str = "trak_flow.db";

const TASK_COLUMNS: &str = "id, title, description, status, priority, type, assignee, parent_id, \
                            created_at, updated_at, closed_at, content_hash, plan, source_plan_id, \
                            ephemeral, notes";

const TASK_ORDER: &str = "ORDER BY priority ASC, updated_at DESC, rowid ASC";

/// Columns added after the first schema version, with their definitions.
const ADDITIVE_COLUMNS: [(&str, &str); 4] = [
    ("plan", "INTEGER NOT NULL DEFAULT 0"),
    ("source_plan_id", "TEXT"),
    ("ephemeral", "INTEGER NOT NULL DEFAULT 0"),
    ("notes", "TEXT NOT NULL DEFAULT ''"),
];

/// Which edges of a task to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges where the task is the source
    Outgoing,
    /// Edges where the task is the target
    Incoming,
    Both,
}

/// Fixed-width RFC 3339 timestamp, so text comparison matches time order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Storage handle for the SQLite cache.
pub struct Storage {
    db: Connection,
}

impl Storage {
    /// Open (creating if needed) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path).context("Failed to open SQLite database")?;
        Self::with_connection(db)
    }

    /// In-memory cache, for tests and throwaway stores.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(db)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        let storage = Self { db };
        storage.init_schema()?;
        storage.migrate_schema()?;
        storage.create_indexes()?;
        Ok(storage)
    }

    /// Initialize SQLite schema.
    fn init_schema(&self) -> Result<()> {
        self.db
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'open',
                    priority INTEGER NOT NULL DEFAULT 2,
                    type TEXT NOT NULL DEFAULT 'task',
                    assignee TEXT,
                    parent_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    closed_at TEXT,
                    content_hash TEXT
                );

                CREATE TABLE IF NOT EXISTS dependencies (
                    id TEXT PRIMARY KEY,
                    source_id TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    type TEXT NOT NULL DEFAULT 'blocks',
                    created_at TEXT NOT NULL,
                    UNIQUE (source_id, target_id, type)
                );
                CREATE INDEX IF NOT EXISTS idx_dependencies_source ON dependencies(source_id);
                CREATE INDEX IF NOT EXISTS idx_dependencies_target ON dependencies(target_id);

                CREATE TABLE IF NOT EXISTS labels (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (task_id, name)
                );
                CREATE INDEX IF NOT EXISTS idx_labels_name ON labels(name);

                CREATE TABLE IF NOT EXISTS comments (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    author TEXT,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_comments_task ON comments(task_id);

                CREATE TABLE IF NOT EXISTS blocked_tasks (
                    task_id TEXT PRIMARY KEY
                );

                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS child_counters (
                    parent_id TEXT PRIMARY KEY,
                    last_index INTEGER NOT NULL
                );
            "#,
            )
            .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Add role-flag columns missing from an older `tasks` table.
    fn migrate_schema(&self) -> Result<()> {
        let mut stmt = self.db.prepare("PRAGMA table_info(tasks)")?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<_>>()?;

        for (column, definition) in ADDITIVE_COLUMNS {
            if !existing.contains(column) {
                log::info!("Migrating tasks table: adding column {}", column);
                self.db
                    .execute(&format!("ALTER TABLE tasks ADD COLUMN {} {}", column, definition), [])
                    .with_context(|| format!("Failed to add column {}", column))?;
            }
        }

        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        self.db
            .execute_batch(
                r#"
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
                CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(type);
                CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee);
                CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_plan ON tasks(plan);
                CREATE INDEX IF NOT EXISTS idx_tasks_source_plan ON tasks(source_plan_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_ephemeral ON tasks(ephemeral);
            "#,
            )
            .context("Failed to create indexes")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        insert_task_row(&self.db, task).with_context(|| format!("Failed to insert task {}", task.id))?;
        Ok(())
    }

    /// Overwrite an existing row in place. Returns false if no row matched.
    pub fn update_task(&self, task: &Task) -> Result<bool> {
        let changed =
            update_task_row(&self.db, task).with_context(|| format!("Failed to update task {}", task.id))?;
        Ok(changed > 0)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let task = self.db.query_row(&sql, params![id], row_to_task).optional()?;
        Ok(task)
    }

    pub fn task_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .query_row("SELECT 1 FROM tasks WHERE id = ?", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete a task with its edges, labels and comments.
    pub fn delete_task(&mut self, id: &str) -> Result<bool> {
        let tx = self.db.transaction()?;
        tx.execute(
            "DELETE FROM dependencies WHERE source_id = ?1 OR target_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM labels WHERE task_id = ?", params![id])?;
        tx.execute("DELETE FROM comments WHERE task_id = ?", params![id])?;
        tx.execute("DELETE FROM blocked_tasks WHERE task_id = ?", params![id])?;
        let removed = tx.execute("DELETE FROM tasks WHERE id = ?", params![id])?;
        tx.commit().context("Failed to commit task deletion")?;
        Ok(removed > 0)
    }

    pub fn all_task_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare("SELECT id FROM tasks ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn query_tasks(&self, filter: &Filter) -> Result<Vec<Task>> {
        let (where_clause, mut values) = filter.to_sql();
        let mut sql = format!("SELECT {} FROM tasks WHERE {} {}", TASK_COLUMNS, where_clause, TASK_ORDER);
        if filter.limit.is_some() || filter.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(filter.limit.map_or(-1, |n| n as i64)));
            values.push(Value::Integer(filter.offset.unwrap_or(0) as i64));
        }
        self.select_tasks(&sql, &values)
    }

    pub fn count_tasks(&self, filter: &Filter) -> Result<usize> {
        let (where_clause, values) = filter.to_sql();
        let sql = format!("SELECT COUNT(*) FROM tasks WHERE {}", where_clause);
        let count: i64 = self.db.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Open, non-ephemeral, non-plan tasks absent from the blocked-cache.
    pub fn ready_tasks(&self) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'open' AND ephemeral = 0 AND plan = 0 \
             AND id NOT IN (SELECT task_id FROM blocked_tasks) {}",
            TASK_COLUMNS, TASK_ORDER
        );
        self.select_tasks(&sql, &[])
    }

    /// Open, non-ephemeral, non-plan tasks present in the blocked-cache.
    pub fn blocked_tasks(&self) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'open' AND ephemeral = 0 AND plan = 0 \
             AND id IN (SELECT task_id FROM blocked_tasks) {}",
            TASK_COLUMNS, TASK_ORDER
        );
        self.select_tasks(&sql, &[])
    }

    /// Non-plan, non-ephemeral tasks last updated before `cutoff`, oldest first.
    pub fn stale_tasks(&self, cutoff: DateTime<Utc>, status: Option<Status>) -> Result<Vec<Task>> {
        let mut sql = format!(
            "SELECT {} FROM tasks WHERE ephemeral = 0 AND plan = 0 AND updated_at < ?",
            TASK_COLUMNS
        );
        let mut values = vec![Value::Text(format_timestamp(&cutoff))];
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY updated_at ASC, rowid ASC");
        self.select_tasks(&sql, &values)
    }

    /// Direct children of `parent_id`, in creation order.
    pub fn child_tasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE parent_id = ? ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        );
        self.select_tasks(&sql, &[Value::Text(parent_id.to_string())])
    }

    /// Direct children of `parent_id` ordered as steps: priority, then title.
    pub fn step_tasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE parent_id = ? ORDER BY priority ASC, title ASC, rowid ASC",
            TASK_COLUMNS
        );
        self.select_tasks(&sql, &[Value::Text(parent_id.to_string())])
    }

    /// Tasks with `plan = 1`, ordered by title.
    pub fn plan_tasks(&self) -> Result<Vec<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE plan = 1 ORDER BY title ASC, rowid ASC", TASK_COLUMNS);
        self.select_tasks(&sql, &[])
    }

    /// Workflows, optionally restricted to one source plan, newest first.
    pub fn workflow_tasks(&self, plan_id: Option<&str>) -> Result<Vec<Task>> {
        let mut sql = format!(
            "SELECT {} FROM tasks WHERE plan = 0 AND source_plan_id IS NOT NULL AND source_plan_id != ''",
            TASK_COLUMNS
        );
        let mut values = Vec::new();
        if let Some(plan_id) = plan_id {
            sql.push_str(" AND source_plan_id = ?");
            values.push(Value::Text(plan_id.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        self.select_tasks(&sql, &values)
    }

    /// IDs of ephemeral tasks created before `cutoff`.
    pub fn ephemeral_ids_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT id FROM tasks WHERE ephemeral = 1 AND created_at < ? ORDER BY id")?;
        let ids = stmt
            .query_map(params![format_timestamp(&cutoff)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Every task that should appear in the durable log, ordered by ID.
    pub fn exportable_tasks(&self) -> Result<Vec<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE ephemeral = 0 ORDER BY id", TASK_COLUMNS);
        self.select_tasks(&sql, &[])
    }

    fn select_tasks(&self, sql: &str, values: &[Value]) -> Result<Vec<Task>> {
        let mut stmt = self.db.prepare(sql)?;
        let tasks = stmt
            .query_map(params_from_iter(values.iter()), row_to_task)?
            .collect::<rusqlite::Result<Vec<Task>>>()
            .context("Failed to read tasks")?;
        Ok(tasks)
    }

    /// Upsert imported tasks in one transaction.
    ///
    /// New IDs are inserted; existing rows are overwritten verbatim only when
    /// the content hash differs. Returns the number of rows written.
    pub fn import_tasks(&mut self, tasks: &[Task]) -> Result<usize> {
        let tx = self.db.transaction()?;
        let mut written = 0;

        for task in tasks {
            let stored: Option<Option<String>> = tx
                .query_row("SELECT content_hash FROM tasks WHERE id = ?", params![task.id], |row| {
                    row.get(0)
                })
                .optional()?;

            match stored {
                None => {
                    insert_task_row(&tx, task).with_context(|| format!("Failed to import task {}", task.id))?;
                    written += 1;
                }
                Some(hash) if hash != task.content_hash => {
                    update_task_row(&tx, task).with_context(|| format!("Failed to import task {}", task.id))?;
                    written += 1;
                }
                Some(_) => {}
            }
        }

        tx.commit().context("Failed to commit task import")?;
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Child counters
    // ------------------------------------------------------------------

    /// Next free child index for `parent_id`. Nothing is reserved until
    /// `insert_child` records it.
    ///
    /// Never below the recorded counter, and past any existing child suffix
    /// so the resulting ID is always unused.
    pub fn next_child_index(&self, parent_id: &str) -> Result<u32> {
        let stored: u32 = self
            .db
            .query_row(
                "SELECT last_index FROM child_counters WHERE parent_id = ?",
                params![parent_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let prefix = format!("{}.", parent_id);
        let mut stmt = self.db.prepare("SELECT id FROM tasks WHERE parent_id = ?1 OR substr(id, 1, ?2) = ?3")?;
        let child_ids = stmt
            .query_map(params![parent_id, prefix.len() as i64, prefix], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let highest_suffix = child_ids
            .iter()
            .filter_map(|id| id.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .max()
            .unwrap_or(0);

        Ok(stored.max(highest_suffix).max(child_ids.len() as u32) + 1)
    }

    /// Insert a child task, its `parent-child` edge and the counter bump in
    /// one transaction.
    pub fn insert_child(&mut self, child: &Task, index: u32, edge: &Dependency) -> Result<()> {
        let tx = self.db.transaction()?;
        insert_task_row(&tx, child).with_context(|| format!("Failed to insert task {}", child.id))?;
        tx.execute(
            "INSERT INTO dependencies (id, source_id, target_id, type, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                edge.id,
                edge.source_id,
                edge.target_id,
                edge.dep_type.as_str(),
                format_timestamp(&edge.created_at),
            ],
        )
        .with_context(|| format!("Failed to link {} to its parent", child.id))?;
        tx.execute(
            "INSERT INTO child_counters (parent_id, last_index) VALUES (?1, ?2)
             ON CONFLICT(parent_id) DO UPDATE SET last_index = excluded.last_index",
            params![edge.source_id, index],
        )?;
        tx.commit().context("Failed to commit child task")?;
        Ok(())
    }


    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Insert an edge. Returns false if an identical `(source, target, type)` edge exists.
    pub fn insert_dependency(&self, dep: &Dependency) -> Result<bool> {
        let inserted = self
            .db
            .execute(
                "INSERT OR IGNORE INTO dependencies (id, source_id, target_id, type, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    dep.id,
                    dep.source_id,
                    dep.target_id,
                    dep.dep_type.as_str(),
                    format_timestamp(&dep.created_at),
                ],
            )
            .context("Failed to insert dependency")?;
        Ok(inserted > 0)
    }

    pub fn find_dependency(
        &self,
        source_id: &str,
        target_id: &str,
        dep_type: DependencyType,
    ) -> Result<Option<Dependency>> {
        let dep = self
            .db
            .query_row(
                "SELECT id, source_id, target_id, type, created_at FROM dependencies
                 WHERE source_id = ? AND target_id = ? AND type = ?",
                params![source_id, target_id, dep_type.as_str()],
                row_to_dependency,
            )
            .optional()?;
        Ok(dep)
    }

    /// Delete matching edges; any type when `dep_type` is `None`.
    pub fn delete_dependencies(
        &self,
        source_id: &str,
        target_id: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<usize> {
        let removed = match dep_type {
            Some(dep_type) => self.db.execute(
                "DELETE FROM dependencies WHERE source_id = ? AND target_id = ? AND type = ?",
                params![source_id, target_id, dep_type.as_str()],
            )?,
            None => self.db.execute(
                "DELETE FROM dependencies WHERE source_id = ? AND target_id = ?",
                params![source_id, target_id],
            )?,
        };
        Ok(removed)
    }

    pub fn dependencies(&self, task_id: &str, direction: Direction) -> Result<Vec<Dependency>> {
        let condition = match direction {
            Direction::Outgoing => "source_id = ?1",
            Direction::Incoming => "target_id = ?1",
            Direction::Both => "source_id = ?1 OR target_id = ?1",
        };
        let sql = format!(
            "SELECT id, source_id, target_id, type, created_at FROM dependencies WHERE {}
             ORDER BY created_at ASC, rowid ASC",
            condition
        );
        let mut stmt = self.db.prepare(&sql)?;
        let deps = stmt
            .query_map(params![task_id], row_to_dependency)?
            .collect::<rusqlite::Result<Vec<Dependency>>>()?;
        Ok(deps)
    }

    pub fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        let mut stmt = self.db.prepare(
            "SELECT id, source_id, target_id, type, created_at FROM dependencies
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let deps = stmt
            .query_map([], row_to_dependency)?
            .collect::<rusqlite::Result<Vec<Dependency>>>()?;
        Ok(deps)
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Insert a label. Returns false if the task already carries that name.
    pub fn insert_label(&self, label: &Label) -> Result<bool> {
        let inserted = self.db.execute(
            "INSERT OR IGNORE INTO labels (id, task_id, name, created_at) VALUES (?, ?, ?, ?)",
            params![label.id, label.task_id, label.name, format_timestamp(&label.created_at)],
        )?;
        Ok(inserted > 0)
    }

    pub fn delete_label(&self, task_id: &str, name: &str) -> Result<bool> {
        let removed = self
            .db
            .execute("DELETE FROM labels WHERE task_id = ? AND name = ?", params![task_id, name])?;
        Ok(removed > 0)
    }

    /// Delete every `<dimension>:*` label of a task.
    pub fn delete_state_labels(&self, task_id: &str, dimension: &str) -> Result<usize> {
        let prefix = format!("{}:", dimension);
        let removed = self.db.execute(
            "DELETE FROM labels WHERE task_id = ?1 AND substr(name, 1, ?2) = ?3",
            params![task_id, prefix.len() as i64, prefix],
        )?;
        Ok(removed)
    }

    pub fn labels(&self, task_id: &str) -> Result<Vec<Label>> {
        let mut stmt = self
            .db
            .prepare("SELECT id, task_id, name, created_at FROM labels WHERE task_id = ? ORDER BY name")?;
        let labels = stmt
            .query_map(params![task_id], row_to_label)?
            .collect::<rusqlite::Result<Vec<Label>>>()?;
        Ok(labels)
    }

    pub fn all_labels(&self) -> Result<Vec<Label>> {
        let mut stmt = self
            .db
            .prepare("SELECT id, task_id, name, created_at FROM labels ORDER BY task_id, name")?;
        let labels = stmt
            .query_map([], row_to_label)?
            .collect::<rusqlite::Result<Vec<Label>>>()?;
        Ok(labels)
    }

    /// Distinct label names across all tasks.
    pub fn label_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.prepare("SELECT DISTINCT name FROM labels ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    /// Insert a comment. Returns false if a comment with the same ID exists.
    pub fn insert_comment(&self, comment: &Comment) -> Result<bool> {
        let inserted = self.db.execute(
            "INSERT OR IGNORE INTO comments (id, task_id, author, body, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                comment.id,
                comment.task_id,
                comment.author,
                comment.body,
                format_timestamp(&comment.created_at),
                format_timestamp(&comment.updated_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn comments(&self, task_id: &str) -> Result<Vec<Comment>> {
        let mut stmt = self.db.prepare(
            "SELECT id, task_id, author, body, created_at, updated_at FROM comments
             WHERE task_id = ? ORDER BY created_at ASC, rowid ASC",
        )?;
        let comments = stmt
            .query_map(params![task_id], row_to_comment)?
            .collect::<rusqlite::Result<Vec<Comment>>>()?;
        Ok(comments)
    }

    pub fn all_comments(&self) -> Result<Vec<Comment>> {
        let mut stmt = self.db.prepare(
            "SELECT id, task_id, author, body, created_at, updated_at FROM comments
             ORDER BY task_id, created_at ASC, rowid ASC",
        )?;
        let comments = stmt
            .query_map([], row_to_comment)?
            .collect::<rusqlite::Result<Vec<Comment>>>()?;
        Ok(comments)
    }

    // ------------------------------------------------------------------
    // Blocked-cache
    // ------------------------------------------------------------------

    /// Adjacency index over every task and edge in the cache.
    pub fn graph_index(&self) -> Result<GraphIndex> {
        let mut stmt = self.db.prepare("SELECT id, status FROM tasks ORDER BY rowid")?;
        let tasks = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, parse_column::<Status>(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<(String, Status)>>>()?;

        let mut stmt = self
            .db
            .prepare("SELECT source_id, target_id, type FROM dependencies ORDER BY rowid")?;
        let edges = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    parse_column::<DependencyType>(row, 2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<(String, String, DependencyType)>>>()?;

        Ok(GraphIndex::build(
            tasks.iter().map(|(id, status)| (id.as_str(), *status)),
            edges
                .iter()
                .map(|(source, target, dep_type)| (source.as_str(), target.as_str(), *dep_type)),
        ))
    }

    /// Recompute the blocked-cache from current edges and statuses.
    pub fn rebuild_blocked_cache(&mut self) -> Result<usize> {
        let blocked = self.graph_index()?.blocked_set();

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM blocked_tasks", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO blocked_tasks (task_id) VALUES (?)")?;
            for id in &blocked {
                stmt.execute(params![id])?;
            }
        }
        tx.commit().context("Failed to rebuild blocked-cache")?;

        log::debug!("Rebuilt blocked-cache: {} blocked task(s)", blocked.len());
        Ok(blocked.len())
    }

    /// IDs currently in the blocked-cache.
    pub fn blocked_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self.db.prepare("SELECT task_id FROM blocked_tasks")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Meta
    // ------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db
            .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .execute("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)", params![key, value])?;
        Ok(())
    }

    /// Remove every row from every table.
    pub fn clear(&mut self) -> Result<()> {
        self.db
            .execute_batch(
                r#"
                DELETE FROM comments;
                DELETE FROM labels;
                DELETE FROM dependencies;
                DELETE FROM blocked_tasks;
                DELETE FROM child_counters;
                DELETE FROM meta;
                DELETE FROM tasks;
            "#,
            )
            .context("Failed to clear tables")?;
        Ok(())
    }
}

fn insert_task_row(conn: &Connection, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            TASK_COLUMNS
        ),
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.priority,
            task.task_type.as_str(),
            task.assignee,
            task.parent_id,
            format_timestamp(&task.created_at),
            format_timestamp(&task.updated_at),
            task.closed_at.as_ref().map(format_timestamp),
            task.content_hash,
            task.plan,
            task.source_plan_id,
            task.ephemeral,
            task.notes,
        ],
    )
}

fn update_task_row(conn: &Connection, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        UPDATE tasks SET
            title = ?2, description = ?3, status = ?4, priority = ?5, type = ?6,
            assignee = ?7, parent_id = ?8, created_at = ?9, updated_at = ?10,
            closed_at = ?11, content_hash = ?12, plan = ?13, source_plan_id = ?14,
            ephemeral = ?15, notes = ?16
        WHERE id = ?1
        "#,
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.priority,
            task.task_type.as_str(),
            task.assignee,
            task.parent_id,
            format_timestamp(&task.created_at),
            format_timestamp(&task.updated_at),
            task.closed_at.as_ref().map(format_timestamp),
            task.content_hash,
            task.plan,
            task.source_plan_id,
            task.ephemeral,
            task.notes,
        ],
    )
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_timestamp(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        status: parse_column(row, 3)?,
        priority: row.get(4)?,
        task_type: parse_column(row, 5)?,
        assignee: row.get(6)?,
        parent_id: row.get(7)?,
        created_at: parse_timestamp(row, 8)?,
        updated_at: parse_timestamp(row, 9)?,
        closed_at: parse_optional_timestamp(row, 10)?,
        content_hash: row.get(11)?,
        plan: row.get(12)?,
        source_plan_id: row.get(13)?,
        ephemeral: row.get(14)?,
        notes: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
    })
}

fn row_to_dependency(row: &Row) -> rusqlite::Result<Dependency> {
    Ok(Dependency {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        dep_type: parse_column(row, 3)?,
        created_at: parse_timestamp(row, 4)?,
    })
}

fn row_to_label(row: &Row) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_timestamp(row, 3)?,
    })
}

fn row_to_comment(row: &Row) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        task_id: row.get(1)?,
        author: row.get(2)?,
        body: row.get(3)?,
        created_at: parse_timestamp(row, 4)?,
        updated_at: parse_timestamp(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_task(id: &str, title: &str) -> Task {
        let mut task = Task::new(title);
        task.id = id.to_string();
        task.update_content_hash();
        task
    }

    #[test]
    fn test_open_creates_database_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(DB_FILE);
        let _storage = Storage::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_insert_and_get_task() {
        let storage = Storage::open_in_memory().unwrap();
        let mut task = make_task("tf-aaaa", "Test task").with_assignee("alice");
        task.closed_at = Some(crate::types::now());
        storage.insert_task(&task).unwrap();

        let retrieved = storage.get_task("tf-aaaa").unwrap().unwrap();
        assert_eq!(retrieved, task);
        assert!(storage.get_task("tf-zzzz").unwrap().is_none());
    }

    #[test]
    fn test_migration_adds_role_columns() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(DB_FILE);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    id TEXT PRIMARY KEY, title TEXT NOT NULL, description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'open', priority INTEGER NOT NULL DEFAULT 2,
                    type TEXT NOT NULL DEFAULT 'task', assignee TEXT, parent_id TEXT,
                    created_at TEXT NOT NULL, updated_at TEXT NOT NULL, closed_at TEXT, content_hash TEXT
                );
                INSERT INTO tasks (id, title, created_at, updated_at)
                VALUES ('tf-old1', 'Legacy', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z');",
            )
            .unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        let task = storage.get_task("tf-old1").unwrap().unwrap();
        assert!(!task.plan);
        assert!(!task.ephemeral);
        assert!(task.source_plan_id.is_none());
        assert_eq!(task.notes, "");
    }

    #[test]
    fn test_import_tasks_only_overwrites_changed_hashes() {
        let mut storage = Storage::open_in_memory().unwrap();
        let a = make_task("tf-aaaa", "A");
        let b = make_task("tf-bbbb", "B");
        assert_eq!(storage.import_tasks(&[a.clone(), b.clone()]).unwrap(), 2);
        assert_eq!(storage.import_tasks(&[a.clone(), b.clone()]).unwrap(), 0);

        let mut changed = b.clone();
        changed.title = "B prime".to_string();
        changed.update_content_hash();
        assert_eq!(storage.import_tasks(&[a, changed]).unwrap(), 1);
        assert_eq!(storage.get_task("tf-bbbb").unwrap().unwrap().title, "B prime");
    }

    fn make_child(id: &str, parent: &str) -> (Task, Dependency) {
        let mut child = make_task(id, "Child");
        child.parent_id = Some(parent.to_string());
        let edge = Dependency::new(parent, id, DependencyType::ParentChild);
        (child, edge)
    }

    #[test]
    fn test_child_counter_is_monotonic() {
        let mut storage = Storage::open_in_memory().unwrap();
        storage.insert_task(&make_task("tf-aaaa", "Parent")).unwrap();

        assert_eq!(storage.next_child_index("tf-aaaa").unwrap(), 1);
        let (child, edge) = make_child("tf-aaaa.1", "tf-aaaa");
        storage.insert_child(&child, 1, &edge).unwrap();

        storage.delete_task("tf-aaaa.1").unwrap();
        assert_eq!(storage.next_child_index("tf-aaaa").unwrap(), 2);
    }

    #[test]
    fn test_insert_child_rolls_back_on_edge_failure() {
        let mut storage = Storage::open_in_memory().unwrap();
        storage.insert_task(&make_task("tf-aaaa", "Parent")).unwrap();
        storage.insert_task(&make_task("tf-bbbb", "Other")).unwrap();
        let existing = Dependency::blocks("tf-bbbb", "tf-aaaa");
        storage.insert_dependency(&existing).unwrap();

        // Edge ID collides with a stored dependency
        let (child, mut edge) = make_child("tf-aaaa.1", "tf-aaaa");
        edge.id = existing.id.clone();
        assert!(storage.insert_child(&child, 1, &edge).is_err());

        assert!(!storage.task_exists("tf-aaaa.1").unwrap());
        assert_eq!(storage.all_dependencies().unwrap().len(), 1);
        assert_eq!(storage.next_child_index("tf-aaaa").unwrap(), 1);

        let (child, edge) = make_child("tf-aaaa.1", "tf-aaaa");
        storage.insert_child(&child, 1, &edge).unwrap();
        assert!(storage.task_exists("tf-aaaa.1").unwrap());
        assert_eq!(storage.all_dependencies().unwrap().len(), 2);
    }

    #[test]
    fn test_child_counter_skips_existing_suffixes() {
        let storage = Storage::open_in_memory().unwrap();
        let mut child = make_task("tf-aaaa.7", "Imported child");
        child.parent_id = Some("tf-aaaa".to_string());
        storage.insert_task(&child).unwrap();

        assert_eq!(storage.next_child_index("tf-aaaa").unwrap(), 8);
    }

    #[test]
    fn test_duplicate_dependency_ignored() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.insert_dependency(&Dependency::blocks("tf-aaaa", "tf-bbbb")).unwrap());
        assert!(!storage.insert_dependency(&Dependency::blocks("tf-aaaa", "tf-bbbb")).unwrap());
        assert_eq!(storage.all_dependencies().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_task_cascades() {
        let mut storage = Storage::open_in_memory().unwrap();
        storage.insert_task(&make_task("tf-aaaa", "A")).unwrap();
        storage.insert_task(&make_task("tf-bbbb", "B")).unwrap();
        storage.insert_dependency(&Dependency::blocks("tf-aaaa", "tf-bbbb")).unwrap();
        storage.insert_label(&Label::new("tf-aaaa", "backend")).unwrap();
        storage.insert_comment(&Comment::new("tf-aaaa", "note")).unwrap();

        assert!(storage.delete_task("tf-aaaa").unwrap());
        assert!(storage.all_dependencies().unwrap().is_empty());
        assert!(storage.labels("tf-aaaa").unwrap().is_empty());
        assert!(storage.comments("tf-aaaa").unwrap().is_empty());
        assert!(storage.task_exists("tf-bbbb").unwrap());
    }

    #[test]
    fn test_rebuild_blocked_cache() {
        let mut storage = Storage::open_in_memory().unwrap();
        storage.insert_task(&make_task("tf-aaaa", "A")).unwrap();
        storage.insert_task(&make_task("tf-bbbb", "B")).unwrap();
        storage.insert_dependency(&Dependency::blocks("tf-aaaa", "tf-bbbb")).unwrap();

        assert_eq!(storage.rebuild_blocked_cache().unwrap(), 1);
        assert_eq!(storage.blocked_ids().unwrap(), HashSet::from(["tf-bbbb".to_string()]));
        assert_eq!(storage.ready_tasks().unwrap()[0].id, "tf-aaaa");
        assert_eq!(storage.blocked_tasks().unwrap()[0].id, "tf-bbbb");
    }

    #[test]
    fn test_state_labels_removed_by_dimension() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_label(&Label::new("tf-aaaa", "phase:draft")).unwrap();
        storage.insert_label(&Label::new("tf-aaaa", "phasex")).unwrap();
        assert_eq!(storage.delete_state_labels("tf-aaaa", "phase").unwrap(), 1);
        assert_eq!(storage.label_names().unwrap(), vec!["phasex".to_string()]);
    }

    #[test]
    fn test_meta_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.get_meta("log_hash").unwrap().is_none());
        storage.set_meta("log_hash", "abc").unwrap();
        storage.set_meta("log_hash", "def").unwrap();
        assert_eq!(storage.get_meta("log_hash").unwrap().as_deref(), Some("def"));
    }
}
