//! Integration tests for reconciliation between the cache and the durable log.

mod common;

use common::TestEnv;
use std::collections::BTreeSet;
use std::fs;
use tempfile::TempDir;
use trakflow::{
    Comment, Dependency, DependencyType, ErrorPolicy, ImportConfig, LogRecord, OrphanHandling, Session, Status, Store,
    SyncLog, Task, ValidationError,
};

type Snapshot = (
    BTreeSet<(String, Option<String>)>,
    BTreeSet<(String, String, String)>,
    BTreeSet<(String, String)>,
    BTreeSet<(String, String)>,
);

/// Everything the log is expected to carry, in comparable form.
fn snapshot(store: &Store) -> Snapshot {
    let mut tasks = BTreeSet::new();
    let mut labels = BTreeSet::new();
    let mut comments = BTreeSet::new();
    for id in store.all_task_ids().unwrap() {
        let task = store.get_required(&id).unwrap();
        if task.ephemeral {
            continue;
        }
        tasks.insert((task.id.clone(), task.content_hash.clone()));
        for label in store.labels(&id).unwrap() {
            labels.insert((label.task_id, label.name));
        }
        for comment in store.comments(&id).unwrap() {
            comments.insert((comment.id, comment.body));
        }
    }
    let deps = store
        .all_dependencies()
        .unwrap()
        .into_iter()
        .map(|d| (d.source_id, d.target_id, d.dep_type.to_string()))
        .collect();
    (tasks, deps, labels, comments)
}

fn task_record(id: &str, parent: Option<&str>) -> LogRecord {
    let mut task = Task::new(format!("Task {}", id));
    task.id = id.to_string();
    task.parent_id = parent.map(String::from);
    task.update_content_hash();
    LogRecord::Task(task)
}

fn import_config(orphan_handling: OrphanHandling, error_policy: ErrorPolicy) -> ImportConfig {
    ImportConfig {
        orphan_handling,
        error_policy,
    }
}

// =============================================================================
// Round Trip
// =============================================================================

#[test]
fn test_export_import_round_trip() {
    let mut env = TestEnv::new();
    let a = env.create_task_with_priority("Design", 1);
    let b = env.create_task("Build");
    let child = env.store.create_child(&b.id, Task::new("Build part")).unwrap();
    env.add_blocking_dep(&a, &b);
    env.add_dep(&a, &child, DependencyType::Related);
    env.store.add_label(&a.id, "backend").unwrap();
    env.store.set_state(&b.id, "phase", "review", None).unwrap();
    env.store.add_comment(Comment::new(&a.id, "Looks good").with_author("ana")).unwrap();
    let plan = env.store.create(Task::new("Release plan").as_plan()).unwrap();
    let gone = env.create_task("Gone");
    env.store.set_status(&gone.id, Status::Tombstone).unwrap();
    let scratch = env.store.create(Task::new("Scratch").as_ephemeral()).unwrap();
    env.store.add_label(&scratch.id, "tmp").unwrap();

    let log = SyncLog::in_dir(&env.dir());
    let report = log.export(&mut env.store, ErrorPolicy::Strict).unwrap();
    assert_eq!(report.tasks, 5);
    assert!(!env.store.is_dirty());

    let mut fresh = Store::open_in_memory().unwrap();
    let imported = log.import(&mut fresh, &ImportConfig::default()).unwrap();
    assert!(imported.errors.is_empty());
    assert_eq!(imported.tasks_written, 5);

    assert_eq!(snapshot(&fresh), snapshot(&env.store));
    assert!(fresh.get(&scratch.id).unwrap().is_none());
    assert!(fresh.get_required(&plan.id).unwrap().plan);
    assert_eq!(fresh.get_required(&gone.id).unwrap().status, Status::Tombstone);
    assert_eq!(fresh.blocked().unwrap().len(), env.store.blocked().unwrap().len());
}

#[test]
fn test_reimport_is_idempotent() {
    let mut env = TestEnv::new();
    let a = env.create_task("A");
    let b = env.create_task("B");
    env.add_blocking_dep(&a, &b);
    env.store.add_label(&a.id, "x").unwrap();

    let log = SyncLog::in_dir(&env.dir());
    log.export(&mut env.store, ErrorPolicy::Warn).unwrap();

    let report = log.import(&mut env.store, &ImportConfig::default()).unwrap();
    assert_eq!(report.tasks_read, 2);
    assert_eq!(report.tasks_written, 0);
    assert_eq!(report.dependencies_added, 0);
    assert_eq!(report.labels_added, 0);
    assert_eq!(env.edge_count(), 1);
    assert!(!env.store.is_dirty());
}

#[test]
fn test_import_overwrites_changed_task() {
    let mut env = TestEnv::new();
    let task = env.create_task("Original");
    let log = SyncLog::in_dir(&env.dir());
    log.export(&mut env.store, ErrorPolicy::Warn).unwrap();

    // Another branch edits the title
    let mut records = log.read_records().unwrap();
    if let LogRecord::Task(t) = &mut records[0] {
        t.title = "Edited elsewhere".to_string();
        t.touch();
        t.update_content_hash();
    }
    log.write_records(&records).unwrap();

    let report = log.import(&mut env.store, &ImportConfig::default()).unwrap();
    assert_eq!(report.tasks_written, 1);
    assert_eq!(env.store.get_required(&task.id).unwrap().title, "Edited elsewhere");
}

// =============================================================================
// Malformed Input and Policies
// =============================================================================

#[test]
fn test_malformed_lines_are_skipped() {
    let env = TestEnv::new();
    let log = SyncLog::in_dir(&env.dir());
    let good = serde_json::to_string(&task_record("tf-aaaa", None)).unwrap();
    fs::write(
        log.path(),
        format!("# header\n{{broken\n\n{}\n{{\"type\":\"gizmo\",\"data\":{{}}}}\n", good),
    )
    .unwrap();

    let mut store = Store::open_in_memory().unwrap();
    let report = log.import(&mut store, &ImportConfig::default()).unwrap();
    assert_eq!(report.malformed_lines, 2);
    assert_eq!(report.tasks_written, 1);
    assert!(store.get("tf-aaaa").unwrap().is_some());
}

#[test]
fn test_orphan_policies() {
    let env = TestEnv::new();
    let log = SyncLog::in_dir(&env.dir());
    log.write_records(&[
        task_record("tf-aaaa", None),
        task_record("tf-aaaa.1", Some("tf-aaaa")),
        task_record("tf-bbbb.1", Some("tf-bbbb")),
    ])
    .unwrap();

    let mut store = Store::open_in_memory().unwrap();
    let report = log
        .import(&mut store, &import_config(OrphanHandling::Allow, ErrorPolicy::Warn))
        .unwrap();
    assert_eq!(report.orphans, 1);
    assert_eq!(store.all_task_ids().unwrap().len(), 3);
    assert_eq!(store.get_required("tf-bbbb.1").unwrap().parent_id.as_deref(), Some("tf-bbbb"));

    let mut store = Store::open_in_memory().unwrap();
    log.import(&mut store, &import_config(OrphanHandling::Skip, ErrorPolicy::Warn))
        .unwrap();
    assert_eq!(store.all_task_ids().unwrap().len(), 2);
    assert!(store.get("tf-bbbb.1").unwrap().is_none());

    let mut store = Store::open_in_memory().unwrap();
    log.import(&mut store, &import_config(OrphanHandling::Resurrect, ErrorPolicy::Warn))
        .unwrap();
    assert!(store.get_required("tf-bbbb.1").unwrap().parent_id.is_none());
    assert_eq!(store.get_required("tf-aaaa.1").unwrap().parent_id.as_deref(), Some("tf-aaaa"));

    let mut store = Store::open_in_memory().unwrap();
    let err = log
        .import(&mut store, &import_config(OrphanHandling::Strict, ErrorPolicy::Warn))
        .unwrap_err();
    assert_eq!(err.downcast_ref::<ValidationError>(), Some(&ValidationError::OrphanedTasks(1)));
    assert!(store.all_task_ids().unwrap().is_empty());
}

fn log_with_bad_entities(env: &TestEnv) -> SyncLog {
    let log = SyncLog::in_dir(&env.dir());
    log.write_records(&[
        task_record("tf-aaaa", None),
        task_record("tf-bbbb", None),
        LogRecord::Dependency(Dependency::blocks("tf-aaaa", "tf-bbbb")),
        LogRecord::Dependency(Dependency::blocks("tf-bbbb", "tf-aaaa")),
        LogRecord::Dependency(Dependency::blocks("tf-aaaa", "tf-ffff")),
        LogRecord::Comment(Comment::new("tf-aaaa", "kept")),
    ])
    .unwrap();
    log
}

#[test]
fn test_strict_error_policy_completes_pass_then_fails() {
    let env = TestEnv::new();
    let log = log_with_bad_entities(&env);

    let mut store = Store::open_in_memory().unwrap();
    let err = log
        .import(&mut store, &import_config(OrphanHandling::Allow, ErrorPolicy::Strict))
        .unwrap_err();
    match err.downcast_ref::<ValidationError>() {
        Some(ValidationError::ImportFailed(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected ImportFailed, got {:?}", other),
    }

    // Everything valid still went in
    assert_eq!(store.all_task_ids().unwrap().len(), 2);
    assert_eq!(store.all_dependencies().unwrap().len(), 1);
    assert_eq!(store.comments("tf-aaaa").unwrap().len(), 1);
}

#[test]
fn test_warn_and_ignore_policies_continue() {
    let env = TestEnv::new();
    let log = log_with_bad_entities(&env);

    for policy in [ErrorPolicy::Warn, ErrorPolicy::Ignore] {
        let mut store = Store::open_in_memory().unwrap();
        let report = log
            .import(&mut store, &import_config(OrphanHandling::Allow, policy))
            .unwrap();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.dependencies_added, 1);
        assert_eq!(report.comments_added, 1);
        assert_eq!(store.blocked().unwrap()[0].id, "tf-bbbb");
    }
}

// =============================================================================
// Incremental Export and Change Detection
// =============================================================================

#[test]
fn test_incremental_export_merges_changes() {
    let mut env = TestEnv::new();
    let keep = env.create_task("Keep");
    let edit = env.create_task("Edit");
    let remove = env.create_task("Remove");
    env.add_blocking_dep(&keep, &remove);
    let log = SyncLog::in_dir(&env.dir());
    log.export(&mut env.store, ErrorPolicy::Warn).unwrap();

    let mut edited = env.store.get_required(&edit.id).unwrap();
    edited.title = "Edited".to_string();
    env.store.update(edited).unwrap();
    env.store.add_label(&edit.id, "fresh").unwrap();
    env.store.delete(&remove.id).unwrap();
    let added = env.create_task("Added");

    let changed = vec![edit.id.clone(), remove.id.clone(), added.id.clone()];
    log.incremental_export(&mut env.store, &changed, ErrorPolicy::Warn)
        .unwrap();
    assert!(!env.store.is_dirty());

    let records = log.read_records().unwrap();
    let keys: BTreeSet<String> = records.iter().map(|r| r.key()).collect();
    assert_eq!(keys.len(), records.len());
    assert!(!records.iter().any(|r| r.references(&remove.id)));
    assert!(keys.contains(&format!("task-{}", keep.id)));
    assert!(keys.contains(&format!("task-{}", added.id)));
    assert!(records.iter().any(|r| matches!(r, LogRecord::Label(l) if l.name == "fresh")));

    let mut fresh = Store::open_in_memory().unwrap();
    log.import(&mut fresh, &ImportConfig::default()).unwrap();
    assert_eq!(snapshot(&fresh), snapshot(&env.store));
}

#[test]
fn test_incremental_export_without_file_writes_everything() {
    let mut env = TestEnv::new();
    env.create_task("A");
    env.create_task("B");
    let log = SyncLog::in_dir(&env.dir());
    assert!(!log.exists());

    let report = log.incremental_export(&mut env.store, &[], ErrorPolicy::Warn).unwrap();
    assert_eq!(report.tasks, 2);
    assert_eq!(log.read_records().unwrap().len(), 2);
}

#[test]
fn test_session_reimports_out_of_band_edits() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().to_path_buf();

    let mut session = Session::init(&root).unwrap();
    let task = session.store_mut().create(Task::new("Shared")).unwrap();
    session.flush().unwrap();
    drop(session);

    // Nothing changed: no import happens
    let session = Session::open(&root).unwrap();
    assert!(!session.log_changed().unwrap());
    drop(session);

    // A merge rewrites the log behind our back
    let log = SyncLog::in_dir(&root.join(".trak_flow"));
    let mut records = log.read_records().unwrap();
    records.push(task_record("tf-cafe", None));
    log.write_records(&records).unwrap();

    let session = Session::open(&root).unwrap();
    assert!(session.store().get("tf-cafe").unwrap().is_some());
    assert!(session.store().get(&task.id).unwrap().is_some());
    assert!(!session.log_changed().unwrap());
}
