//! CLI argument parsing for TrakFlow.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tf",
    about = "A dual-store task tracker for autonomous agents",
    version,
    after_help = "Logs are written to: ~/.local/share/trak_flow/logs/trak_flow.log"
)]
pub struct Cli {
    /// Project root containing .trak_flow (default: nearest ancestor of the current directory)
    #[arg(short = 'C', long, global = true)]
    pub dir: Option<PathBuf>,

    /// Output JSON instead of text
    #[arg(short, long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a new .trak_flow directory
    Init,

    /// Create a new task
    Create {
        /// Task title
        title: String,

        /// Priority (0=critical, 4=backlog)
        #[arg(short, long, default_value = "2")]
        priority: u8,

        /// Type (bug, feature, task, epic, chore)
        #[arg(short = 't', long = "type", default_value = "task")]
        task_type: String,

        /// Description
        #[arg(short = 'D', long)]
        description: Option<String>,

        #[arg(short, long)]
        assignee: Option<String>,

        /// Labels (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        labels: Vec<String>,

        /// Create as a child of this task
        #[arg(long)]
        parent: Option<String>,

        /// Tasks that must finish first (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        blocked_by: Vec<String>,
    },

    /// Show a task with its labels, edges and comments
    Show {
        /// Task ID
        id: String,
    },

    /// List tasks
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by exact priority
        #[arg(short, long)]
        priority: Option<u8>,

        #[arg(short = 't', long = "type")]
        task_type: Option<String>,

        #[arg(short, long)]
        assignee: Option<String>,

        #[arg(short, long)]
        label: Option<String>,

        /// Case-insensitive title substring
        #[arg(long)]
        search: Option<String>,

        /// Include plans, ephemeral and tombstoned tasks
        #[arg(long)]
        all: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show tasks that are ready to work on
    Ready,

    /// Show tasks waiting on other work
    Blocked,

    /// Start working on a task (set status to in_progress)
    Start {
        /// Task ID
        id: String,
    },

    /// Close a task
    Close {
        /// Task ID
        id: String,

        /// Reason for closing
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Reopen a closed task
    Reopen {
        /// Task ID
        id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Delete a task and everything attached to it
    Delete {
        /// Task ID
        id: String,
    },

    /// Manage dependencies
    #[command(subcommand)]
    Dep(DepCommand),

    /// Manage labels
    #[command(subcommand)]
    Label(LabelCommand),

    /// Comment on a task
    Comment {
        /// Task ID
        id: String,

        /// Comment text
        body: String,
    },

    /// Manage Plans (workflow blueprints)
    #[command(subcommand)]
    Plan(PlanCommand),

    /// Manage Workflows (Plan instances)
    #[command(subcommand)]
    Workflow(WorkflowCommand),

    /// Dependency graph views
    #[command(subcommand)]
    Graph(GraphCommand),

    /// Tasks not updated recently
    Stale {
        /// Age threshold in days
        #[arg(short, long, default_value = "30")]
        days: i64,

        #[arg(short, long)]
        status: Option<String>,
    },

    /// Reconcile the cache with the durable log
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Subcommand)]
pub enum DepCommand {
    /// Add an edge: SOURCE must happen before TARGET for blocking types
    Add {
        source: String,
        target: String,

        /// blocks, related, parent-child, discovered-from
        #[arg(short = 't', long = "type", default_value = "blocks")]
        dep_type: String,
    },

    /// Remove edges between two tasks
    Remove {
        source: String,
        target: String,

        /// Only this type (default: every type)
        #[arg(short = 't', long = "type")]
        dep_type: Option<String>,
    },

    /// Print the dependency tree of a task
    Tree {
        id: String,

        /// Walk towards dependents instead of blockers
        #[arg(short, long)]
        reverse: bool,

        #[arg(long, default_value = "10")]
        depth: usize,
    },
}

#[derive(Subcommand)]
pub enum LabelCommand {
    Add { id: String, name: String },

    Remove { id: String, name: String },

    /// List labels of a task, or every label in use
    List { id: Option<String> },

    /// Set a `dimension:value` state label, replacing the previous value
    State {
        id: String,
        dimension: String,
        value: String,

        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommand {
    /// Create a new Plan
    Create {
        title: String,

        #[arg(short = 'D', long)]
        description: Option<String>,

        #[arg(short = 't', long = "type", default_value = "task")]
        task_type: String,

        #[arg(short, long, default_value = "2")]
        priority: u8,
    },

    /// Add a step to a Plan
    Add {
        plan_id: String,
        title: String,

        #[arg(short = 'D', long)]
        description: Option<String>,

        #[arg(short = 't', long = "type", default_value = "task")]
        task_type: String,

        #[arg(short, long, default_value = "2")]
        priority: u8,
    },

    /// List Plans
    List,

    /// Show a Plan with its steps
    Show { id: String },

    /// Create a persistent Workflow from a Plan
    Start {
        plan_id: String,

        /// Template variable (key=value), repeatable
        #[arg(long = "var")]
        vars: Vec<String>,
    },

    /// Create an ephemeral Workflow from a Plan
    Execute {
        plan_id: String,

        #[arg(long = "var")]
        vars: Vec<String>,
    },

    /// Convert an existing task into a Plan
    Convert { id: String },
}

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List Workflows
    List {
        /// Only Workflows from this Plan
        #[arg(long)]
        plan: Option<String>,
    },

    /// Discard an ephemeral Workflow
    Discard { id: String },

    /// Summarize and close a Workflow
    Summarize {
        id: String,

        #[arg(short, long)]
        summary: String,
    },

    /// Garbage collect old ephemeral tasks
    Gc {
        /// Maximum age (e.g. 24h, 7d, 2w)
        #[arg(long, default_value = "24h")]
        age: String,
    },
}

#[derive(Subcommand)]
pub enum GraphCommand {
    /// Graphviz output
    Dot {
        /// Include closed tasks
        #[arg(long)]
        closed: bool,

        /// Render SVG through the `dot` command
        #[arg(long)]
        svg: bool,
    },

    /// Graph health summary
    Analyze,

    /// Longest blocking chain from a task
    CriticalPath { id: String },
}

#[derive(Subcommand)]
pub enum SyncCommand {
    /// Import the log into the cache
    Import {
        /// Clear the cache first
        #[arg(short, long)]
        force: bool,
    },

    /// Write the cache to the log
    Export,
}
