//! Reconciliation between the SQLite cache and the durable JSONL log.
//!
//! The log is the mergeable source of truth: one `{"type": ..., "data": ...}`
//! record per line, `#` header lines and blank lines ignored. Export rewrites
//! the whole file atomically; import upserts by content hash and applies the
//! configured orphan and error policies.

use chrono::{DateTime, SecondsFormat, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{ErrorPolicy, ImportConfig, OrphanHandling};
use crate::id::bytes_hash;
use crate::storage::Direction;
use crate::store::Store;
use crate::types::{Comment, Dependency, Label, Task, ValidationError};

/// Durable log file name within the `.trak_flow` directory.
pub const LOG_FILE: &str = "issues.jsonl";

/// Meta key holding the log content hash as of the last import or export.
pub const LOG_HASH_KEY: &str = "log_hash";

const HEADER: &str = "# TrakFlow task tracker data";

/// One line of the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LogRecord {
    Task(Task),
    Dependency(Dependency),
    Label(Label),
    Comment(Comment),
}

impl LogRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Task(_) => "task",
            LogRecord::Dependency(_) => "dependency",
            LogRecord::Label(_) => "label",
            LogRecord::Comment(_) => "comment",
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            LogRecord::Task(task) => &task.id,
            LogRecord::Dependency(dep) => &dep.id,
            LogRecord::Label(label) => &label.id,
            LogRecord::Comment(comment) => &comment.id,
        }
    }

    /// `"<type>-<id>"`, unique within a log.
    pub fn key(&self) -> String {
        format!("{}-{}", self.kind(), self.record_id())
    }

    /// Whether this record is the task `task_id` or hangs off it.
    pub fn references(&self, task_id: &str) -> bool {
        match self {
            LogRecord::Task(task) => task.id == task_id,
            LogRecord::Dependency(dep) => dep.source_id == task_id || dep.target_id == task_id,
            LogRecord::Label(label) => label.task_id == task_id,
            LogRecord::Comment(comment) => comment.task_id == task_id,
        }
    }
}

/// Parse log content, skipping headers, blank lines and malformed records.
/// Returns the records and the number of lines skipped as malformed.
pub fn parse_records(content: &str) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut skipped = 0;

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!("Skipping malformed log line {}: {}", index + 1, e);
                skipped += 1;
            }
        }
    }

    (records, skipped)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    /// Task records read from the log
    pub tasks_read: usize,
    /// Task rows inserted or overwritten
    pub tasks_written: usize,
    /// Tasks whose parent was absent from the batch
    pub orphans: usize,
    pub dependencies_added: usize,
    pub labels_added: usize,
    pub comments_added: usize,
    pub malformed_lines: usize,
    /// Per-entity failures, regardless of policy
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub tasks: usize,
    pub dependencies: usize,
    pub labels: usize,
    pub comments: usize,
    /// Tasks left out because they failed validation
    pub skipped: Vec<String>,
}

impl ExportReport {
    fn tally(records: &[LogRecord], skipped: Vec<String>) -> Self {
        let mut report = Self {
            skipped,
            ..Self::default()
        };
        for record in records {
            match record {
                LogRecord::Task(_) => report.tasks += 1,
                LogRecord::Dependency(_) => report.dependencies += 1,
                LogRecord::Label(_) => report.labels += 1,
                LogRecord::Comment(_) => report.comments += 1,
            }
        }
        report
    }
}

/// Record a per-entity failure according to `policy`.
fn record_failure(policy: ErrorPolicy, errors: &mut Vec<String>, operation: &str, message: String) {
    if policy == ErrorPolicy::Warn {
        log::warn!("{} failed for {}", operation, message);
    }
    errors.push(message);
}

/// Handle to the durable log file.
#[derive(Debug, Clone)]
pub struct SyncLog {
    path: PathBuf,
}

impl SyncLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log inside a `.trak_flow` directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Whether the file was modified after `timestamp`. A missing file counts as changed.
    pub fn changed_since(&self, timestamp: DateTime<Utc>) -> Result<bool> {
        if !self.exists() {
            return Ok(true);
        }
        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .context("Failed to read log modification time")?;
        Ok(DateTime::<Utc>::from(modified) > timestamp)
    }

    /// Digest of the whole file, `None` when it does not exist.
    pub fn content_hash(&self) -> Result<Option<String>> {
        if !self.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).context("Failed to read log")?;
        Ok(Some(bytes_hash(&bytes)))
    }

    /// All well-formed records; empty when the file does not exist.
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        Ok(self.read_records_counted()?.0)
    }

    fn read_records_counted(&self) -> Result<(Vec<LogRecord>, usize)> {
        if !self.exists() {
            return Ok((Vec::new(), 0));
        }
        let content = fs::read_to_string(&self.path).context("Failed to read log")?;
        Ok(parse_records(&content))
    }

    /// Atomically replace the file with a header and `records`.
    /// Returns the content hash of what was written.
    pub fn write_records(&self, records: &[LogRecord]) -> Result<String> {
        let mut content = format!(
            "{}\n# Generated at {}\n\n",
            HEADER,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        for record in records {
            let line = serde_json::to_string(record).context("Failed to serialize log record")?;
            content.push_str(&line);
            content.push('\n');
        }

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).context("Failed to create log directory")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).context("Failed to create temporary log")?;
        tmp.write_all(content.as_bytes()).context("Failed to write log")?;
        tmp.as_file().sync_all().context("Failed to sync log")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(bytes_hash(content.as_bytes()))
    }

    /// Write every non-ephemeral task (plans and tombstones included) with
    /// the dependencies, labels and comments between exported tasks.
    pub fn export(&self, store: &mut Store, policy: ErrorPolicy) -> Result<ExportReport> {
        let mut skipped = Vec::new();
        let mut records = Vec::new();
        let mut exported: HashSet<String> = HashSet::new();

        for task in store.storage().exportable_tasks()? {
            if let Err(e) = task.validate() {
                record_failure(policy, &mut skipped, "Export", format!("task {}: {}", task.id, e));
                continue;
            }
            exported.insert(task.id.clone());
            records.push(LogRecord::Task(task));
        }

        if policy == ErrorPolicy::Strict && !skipped.is_empty() {
            return Err(eyre::eyre!(ValidationError::ExportFailed(skipped)));
        }

        for dep in store.all_dependencies()? {
            if exported.contains(&dep.source_id) && exported.contains(&dep.target_id) {
                records.push(LogRecord::Dependency(dep));
            }
        }
        for label in store.storage().all_labels()? {
            if exported.contains(&label.task_id) {
                records.push(LogRecord::Label(label));
            }
        }
        for comment in store.storage().all_comments()? {
            if exported.contains(&comment.task_id) {
                records.push(LogRecord::Comment(comment));
            }
        }

        self.finish_export(store, records, skipped)
    }

    /// Re-export only the records touching `changed_ids`, keeping the rest of
    /// the existing file. Falls back to a full export when there is no file yet.
    pub fn incremental_export(&self, store: &mut Store, changed_ids: &[String], policy: ErrorPolicy) -> Result<ExportReport> {
        if !self.exists() {
            return self.export(store, policy);
        }

        let mut records = self.read_records()?;
        let mut skipped = Vec::new();

        for id in changed_ids {
            records.retain(|record| !record.references(id));

            let Some(task) = store.get(id)? else {
                continue;
            };
            if task.ephemeral {
                continue;
            }
            if let Err(e) = task.validate() {
                record_failure(policy, &mut skipped, "Export", format!("task {}: {}", task.id, e));
                continue;
            }
            records.push(LogRecord::Task(task));

            for dep in store.dependencies(id, Direction::Both)? {
                let other = if dep.source_id == *id { &dep.target_id } else { &dep.source_id };
                if store.get(other)?.is_some_and(|t| !t.ephemeral) {
                    records.push(LogRecord::Dependency(dep));
                }
            }
            records.extend(store.labels(id)?.into_iter().map(LogRecord::Label));
            records.extend(store.comments(id)?.into_iter().map(LogRecord::Comment));
        }

        if policy == ErrorPolicy::Strict && !skipped.is_empty() {
            return Err(eyre::eyre!(ValidationError::ExportFailed(skipped)));
        }

        self.finish_export(store, records, skipped)
    }

    fn finish_export(&self, store: &mut Store, records: Vec<LogRecord>, skipped: Vec<String>) -> Result<ExportReport> {
        let hash = self.write_records(&records)?;
        store.set_meta(LOG_HASH_KEY, &hash)?;
        store.mark_clean();

        let report = ExportReport::tally(&records, skipped);
        log::info!(
            "Exported {} task(s), {} dependency(ies), {} label(s), {} comment(s) to {}",
            report.tasks,
            report.dependencies,
            report.labels,
            report.comments,
            self.path.display()
        );
        Ok(report)
    }

    /// Merge the log into the store.
    ///
    /// Tasks go in first, in one transaction, overwriting stored rows only
    /// when the content hash differs. Dependencies, labels and comments follow
    /// one at a time under `config.error_policy`. The store's dirty flag is
    /// left as it was.
    pub fn import(&self, store: &mut Store, config: &ImportConfig) -> Result<ImportReport> {
        let policy = config.error_policy;
        let (records, malformed_lines) = self.read_records_counted()?;
        let mut report = ImportReport {
            malformed_lines,
            ..ImportReport::default()
        };

        let mut tasks = Vec::new();
        let mut dependencies = Vec::new();
        let mut labels = Vec::new();
        let mut comments = Vec::new();
        for record in records {
            match record {
                LogRecord::Task(task) => tasks.push(task),
                LogRecord::Dependency(dep) => dependencies.push(dep),
                LogRecord::Label(label) => labels.push(label),
                LogRecord::Comment(comment) => comments.push(comment),
            }
        }
        report.tasks_read = tasks.len();

        let mut valid_tasks = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if let Err(e) = task.validate() {
                record_failure(policy, &mut report.errors, "Import", format!("task {}: {}", task.id, e));
                continue;
            }
            if task.content_hash.is_none() {
                task.update_content_hash();
            }
            valid_tasks.push(task);
        }

        let (tasks, orphans) = resolve_orphans(valid_tasks, config.orphan_handling)?;
        report.orphans = orphans;

        let was_dirty = store.is_dirty();
        report.tasks_written = store.import_tasks(&tasks)?;

        for dep in &dependencies {
            match store.put_dependency(dep) {
                Ok(None) => report.dependencies_added += 1,
                Ok(Some(_)) => {}
                Err(e) => record_failure(
                    policy,
                    &mut report.errors,
                    "Import",
                    format!("dependency {} -> {}: {}", dep.source_id, dep.target_id, e),
                ),
            }
        }
        if report.dependencies_added > 0 {
            store.rebuild_blocked_cache()?;
        }

        for label in &labels {
            match store.put_label(label) {
                Ok(true) => report.labels_added += 1,
                Ok(false) => {}
                Err(e) => record_failure(
                    policy,
                    &mut report.errors,
                    "Import",
                    format!("label {} on {}: {}", label.name, label.task_id, e),
                ),
            }
        }

        for comment in &comments {
            match store.put_comment(comment) {
                Ok(true) => report.comments_added += 1,
                Ok(false) => {}
                Err(e) => record_failure(
                    policy,
                    &mut report.errors,
                    "Import",
                    format!("comment {} on {}: {}", comment.id, comment.task_id, e),
                ),
            }
        }

        if !was_dirty {
            store.mark_clean();
        }

        if policy == ErrorPolicy::Strict && !report.errors.is_empty() {
            return Err(eyre::eyre!(ValidationError::ImportFailed(report.errors)));
        }

        if let Some(hash) = self.content_hash()? {
            store.set_meta(LOG_HASH_KEY, &hash)?;
        }

        log::info!(
            "Imported {} task record(s) ({} written), {} dependency(ies), {} label(s), {} comment(s) from {}",
            report.tasks_read,
            report.tasks_written,
            report.dependencies_added,
            report.labels_added,
            report.comments_added,
            self.path.display()
        );
        Ok(report)
    }
}

/// Apply the orphan policy to tasks whose parent is absent from the batch.
/// Returns the surviving tasks and the number of orphans found.
fn resolve_orphans(tasks: Vec<Task>, handling: OrphanHandling) -> Result<(Vec<Task>, usize)> {
    let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let is_orphan = |task: &Task| task.parent_id.as_ref().is_some_and(|parent| !ids.contains(parent));

    let orphans = tasks.iter().filter(|t| is_orphan(t)).count();
    if orphans == 0 {
        return Ok((tasks, 0));
    }

    let tasks = match handling {
        OrphanHandling::Allow => tasks,
        OrphanHandling::Skip => {
            log::warn!("Skipping {} orphaned task(s)", orphans);
            tasks.into_iter().filter(|t| !is_orphan(t)).collect()
        }
        OrphanHandling::Resurrect => tasks
            .into_iter()
            .map(|mut task| {
                if is_orphan(&task) {
                    log::warn!(
                        "Resurrecting orphan {} (missing parent {})",
                        task.id,
                        task.parent_id.as_deref().unwrap_or_default()
                    );
                    task.parent_id = None;
                    task.update_content_hash();
                }
                task
            })
            .collect(),
        OrphanHandling::Strict => {
            return Err(eyre::eyre!(ValidationError::OrphanedTasks(orphans)));
        }
    };

    Ok((tasks, orphans))
}
