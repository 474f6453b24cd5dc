//! TrakFlow: a dual-store task tracker for autonomous agents.
//!
//! Tasks live in a fast local SQLite cache and in a durable, mergeable JSONL
//! log. Blocking dependencies are kept acyclic and a materialized
//! blocked-cache answers "what can I work on" without graph traversal.
//!
//! # Example
//!
//! ```no_run
//! use trakflow::{Dependency, Session, Task};
//! use std::path::Path;
//!
//! // Initialize a new project
//! let mut session = Session::init(Path::new(".")).unwrap();
//! let store = session.store_mut();
//!
//! // Create tasks
//! let login = store.create(Task::new("Implement login").with_priority(1)).unwrap();
//! let tests = store.create(Task::new("Write tests")).unwrap();
//!
//! // Login must land before the tests
//! store.add_dependency(Dependency::blocks(&login.id, &tests.id)).unwrap();
//!
//! // Query ready work
//! let ready = store.ready().unwrap();
//! assert_eq!(ready.len(), 1);
//! assert_eq!(ready[0].id, login.id);
//!
//! // Close a task and write the log
//! store.close(&login.id, Some("Implemented OAuth")).unwrap();
//! session.flush().unwrap();
//! ```

mod graph;
mod storage;

pub mod analysis;
pub mod builder;
pub mod config;
pub mod dot;
pub mod id;
pub mod query;
pub mod session;
pub mod store;
pub mod sync;
pub mod types;
pub mod workflow;

// Re-export public API
pub use analysis::{DependencyGraph, GraphAnalysis, TreeDirection, TreeNode};
pub use builder::{StoreBuilderExt, TaskBuilder};
pub use config::{Config, ConfigError, ErrorPolicy, ExportConfig, IdConfig, ImportConfig, OrphanHandling};
pub use query::Filter;
pub use session::Session;
pub use storage::{DB_FILE, Direction};
pub use store::{Store, StoreError, TRAK_FLOW_DIR};
pub use sync::{ExportReport, ImportReport, LOG_FILE, LogRecord, SyncLog};
pub use types::{Comment, Dependency, DependencyType, Label, Status, Task, TaskType, ValidationError};
pub use workflow::StoreWorkflowExt;
