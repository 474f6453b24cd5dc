//! TrakFlow CLI - task tracking for autonomous agents.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use trakflow::session::find_root;
use trakflow::{
    Comment, Dependency, DependencyGraph, Direction, Filter, Session, Status, StoreBuilderExt, StoreWorkflowExt, Task,
    TaskType, TreeDirection, TreeNode, dot,
};

mod cli;

use cli::{Cli, Command, DepCommand, GraphCommand, LabelCommand, PlanCommand, SyncCommand, WorkflowCommand};

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trak_flow")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("trak_flow.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn get_root(cli: &Cli) -> PathBuf {
    if let Some(dir) = &cli.dir {
        return dir.clone();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_root(&cwd).unwrap_or(cwd)
}

fn format_status(status: Status) -> ColoredString {
    match status {
        Status::Open => "open".green(),
        Status::InProgress => "in_progress".blue(),
        Status::Blocked => "blocked".red(),
        Status::Deferred => "deferred".yellow(),
        Status::Closed => "closed".dimmed(),
        Status::Tombstone => "tombstone".dimmed().strikethrough(),
        Status::Pinned => "pinned".magenta(),
    }
}

fn format_priority(priority: u8) -> ColoredString {
    let text = format!("P{}", priority);
    match priority {
        0 => text.red().bold(),
        1 => text.red(),
        2 => text.yellow(),
        _ => text.normal(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn print_tasks(tasks: &[Task], json: bool, empty: &str) -> Result<()> {
    if json {
        return print_json(tasks);
    }
    if tasks.is_empty() {
        println!("{}", empty.dimmed());
    }
    for task in tasks {
        let mut tags = String::new();
        if task.plan {
            tags.push_str(" [plan]");
        }
        if task.ephemeral {
            tags.push_str(" [ephemeral]");
        }
        println!(
            "{} {} {} {}{}",
            format_status(task.status),
            task.id.cyan(),
            format_priority(task.priority),
            task.title,
            tags.dimmed()
        );
    }
    Ok(())
}

fn print_tree(node: &TreeNode, depth: usize) {
    println!(
        "{}{} {} {}",
        "  ".repeat(depth),
        node.id.cyan(),
        format_status(node.status),
        node.title
    );
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

/// `key=value` pairs into a variable map.
fn parse_vars(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| eyre::eyre!("Invalid variable '{}': expected key=value", pair))
        })
        .collect()
}

/// `24h`, `7d`, `2w` into hours.
fn parse_age_hours(age: &str) -> Result<i64> {
    let invalid = || eyre::eyre!("Invalid age '{}': expected e.g. 24h, 7d, 2w", age);
    let unit = age.chars().last().ok_or_else(invalid)?;
    let number: i64 = age[..age.len() - unit.len_utf8()].parse().map_err(|_| invalid())?;
    let hours_per_unit = match unit {
        'h' => 1,
        'd' => 24,
        'w' => 24 * 7,
        _ => return Err(invalid()),
    };
    number.checked_mul(hours_per_unit).ok_or_else(invalid)
}

fn parse<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse::<T>().map_err(|e| eyre::eyre!(e))
}

fn run(cli: Cli) -> Result<()> {
    let root = get_root(&cli);
    let json = cli.json;

    if let Command::Init = cli.command {
        Session::init(&root).context("Failed to initialize TrakFlow")?;
        println!("{} Initialized TrakFlow in {}", "✓".green(), root.display());
        return Ok(());
    }

    Session::run(&root, |session| execute(session, cli.command, json))
}

fn execute(session: &mut Session, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Init => {
            println!("{} TrakFlow already initialized in {}", "✓".green(), session.dir().display());
        }

        Command::Create {
            title,
            priority,
            task_type,
            description,
            assignee,
            labels,
            parent,
            blocked_by,
        } => {
            let mut builder = session
                .store_mut()
                .build(title)
                .priority(priority)
                .task_type(parse::<TaskType>(&task_type)?)
                .labels(labels);
            if let Some(description) = description {
                builder = builder.description(description);
            }
            if let Some(assignee) = assignee {
                builder = builder.assignee(assignee);
            }
            if let Some(parent) = parent {
                builder = builder.parent(parent);
            }
            for blocker in blocked_by {
                builder = builder.blocked_by(blocker);
            }
            let task = builder.create()?;

            if json {
                return print_json(&task);
            }
            println!("{} Created: {} {}", "✓".green(), task.id.cyan(), task.title);
        }

        Command::Show { id } => {
            let store = session.store();
            let task = store.get_required(&id)?;
            let labels = store.labels(&id)?;
            let deps = store.dependencies(&id, Direction::Both)?;
            let comments = store.comments(&id)?;

            if json {
                return print_json(&serde_json::json!({
                    "task": task,
                    "labels": labels,
                    "dependencies": deps,
                    "comments": comments,
                }));
            }

            println!("{}: {}", "ID".bold(), task.id.cyan());
            println!("{}: {}", "Title".bold(), task.title);
            println!("{}: {}", "Status".bold(), format_status(task.status));
            println!("{}: {}", "Priority".bold(), format_priority(task.priority));
            println!("{}: {}", "Type".bold(), task.task_type);
            if let Some(assignee) = &task.assignee {
                println!("{}: {}", "Assignee".bold(), assignee);
            }
            if let Some(parent) = &task.parent_id {
                println!("{}: {}", "Parent".bold(), parent.cyan());
            }
            if !task.description.is_empty() {
                println!("{}: {}", "Description".bold(), task.description);
            }
            if !labels.is_empty() {
                let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
                println!("{}: {}", "Labels".bold(), names.join(", "));
            }
            for dep in &deps {
                println!("{}: {} -[{}]-> {}", "Edge".bold(), dep.source_id.cyan(), dep.dep_type, dep.target_id.cyan());
            }
            println!("{}: {}", "Created".bold(), task.created_at);
            println!("{}: {}", "Updated".bold(), task.updated_at);
            if let Some(closed_at) = &task.closed_at {
                println!("{}: {}", "Closed".bold(), closed_at);
            }
            if !task.notes.is_empty() {
                println!("{}:\n{}", "Notes".bold(), task.notes.dimmed());
            }
            for comment in &comments {
                let author = comment.author.as_deref().unwrap_or("anonymous");
                println!("{} {}: {}", comment.created_at.to_string().dimmed(), author.bold(), comment.body);
            }
        }

        Command::List {
            status,
            priority,
            task_type,
            assignee,
            label,
            search,
            all,
            limit,
        } => {
            let mut filter = Filter::new();
            if let Some(status) = status {
                filter = filter.status(parse::<Status>(&status)?);
            }
            if let Some(priority) = priority {
                filter = filter.priority(priority);
            }
            if let Some(task_type) = task_type {
                filter = filter.task_type(parse::<TaskType>(&task_type)?);
            }
            if let Some(assignee) = assignee {
                filter = filter.assignee(assignee);
            }
            if let Some(label) = label {
                filter = filter.label(label);
            }
            if let Some(search) = search {
                filter = filter.title_contains(search);
            }
            if all {
                filter = filter.everything();
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }

            let tasks = session.store().list(&filter)?;
            print_tasks(&tasks, json, "No tasks found")?;
        }

        Command::Ready => {
            let tasks = session.store().ready()?;
            if !json && !tasks.is_empty() {
                println!("{} {} task(s) ready to work on:", "→".blue(), tasks.len());
            }
            print_tasks(&tasks, json, "No ready tasks")?;
        }

        Command::Blocked => {
            let tasks = session.store().blocked()?;
            if !json && !tasks.is_empty() {
                println!("{} {} task(s) blocked:", "⊘".red(), tasks.len());
            }
            print_tasks(&tasks, json, "No blocked tasks")?;
        }

        Command::Start { id } => {
            let task = session.store_mut().set_status(&id, Status::InProgress)?;
            println!("{} Started: {} {}", "→".blue(), task.id.cyan(), task.title);
        }

        Command::Close { id, reason } => {
            let task = session.store_mut().close(&id, reason.as_deref())?;
            println!("{} Closed: {} {}", "✓".green(), task.id.cyan(), task.title);
        }

        Command::Reopen { id, reason } => {
            let task = session.store_mut().reopen(&id, reason.as_deref())?;
            println!("{} Reopened: {} {}", "✓".green(), task.id.cyan(), task.title);
        }

        Command::Delete { id } => {
            if !session.store_mut().delete(&id)? {
                eyre::bail!("Task not found: {}", id);
            }
            println!("{} Deleted: {}", "✓".green(), id.cyan());
        }

        Command::Dep(DepCommand::Add { source, target, dep_type }) => {
            let dep = Dependency::new(&source, &target, parse(&dep_type)?);
            session.store_mut().add_dependency(dep)?;
            println!("{} {} -[{}]-> {}", "✓".green(), source.cyan(), dep_type, target.cyan());
        }

        Command::Dep(DepCommand::Remove { source, target, dep_type }) => {
            let dep_type = dep_type.as_deref().map(parse).transpose()?;
            let removed = session.store_mut().remove_dependency(&source, &target, dep_type)?;
            println!("{} Removed {} edge(s)", "✓".green(), removed);
        }

        Command::Dep(DepCommand::Tree { id, reverse, depth }) => {
            let direction = if reverse {
                TreeDirection::Dependents
            } else {
                TreeDirection::Blocking
            };
            let graph = DependencyGraph::new(session.store())?;
            let tree = graph
                .dependency_tree(&id, direction, depth)?
                .ok_or_else(|| eyre::eyre!("Depth must be at least 1"))?;
            if json {
                return print_json(&tree);
            }
            print_tree(&tree, 0);
        }

        Command::Label(LabelCommand::Add { id, name }) => {
            session.store_mut().add_label(&id, &name)?;
            println!("{} Labeled {} with {}", "✓".green(), id.cyan(), name);
        }

        Command::Label(LabelCommand::Remove { id, name }) => {
            if session.store_mut().remove_label(&id, &name)? {
                println!("{} Removed {} from {}", "✓".green(), name, id.cyan());
            } else {
                println!("{}", "Label not present".dimmed());
            }
        }

        Command::Label(LabelCommand::List { id }) => {
            let names: Vec<String> = match id {
                Some(id) => session.store().labels(&id)?.into_iter().map(|l| l.name).collect(),
                None => session.store().all_labels()?,
            };
            if json {
                return print_json(&names);
            }
            for name in names {
                println!("{}", name);
            }
        }

        Command::Label(LabelCommand::State {
            id,
            dimension,
            value,
            reason,
        }) => {
            let label = session
                .store_mut()
                .set_state(&id, &dimension, &value, reason.as_deref())?;
            println!("{} {} is now {}", "✓".green(), id.cyan(), label.name);
        }

        Command::Comment { id, body } => {
            let mut comment = Comment::new(&id, body);
            if let Some(actor) = session.config().actor.clone() {
                comment = comment.with_author(actor);
            }
            let comment = session.store_mut().add_comment(comment)?;
            println!("{} Commented on {} ({})", "✓".green(), id.cyan(), comment.id.dimmed());
        }

        Command::Plan(PlanCommand::Create {
            title,
            description,
            task_type,
            priority,
        }) => {
            let plan = Task::new(title)
                .with_description(description.unwrap_or_default())
                .with_type(parse(&task_type)?)
                .with_priority(priority);
            let plan = session.store_mut().create_plan(plan)?;
            println!("{} Created Plan: {} {}", "✓".green(), plan.id.cyan(), plan.title);
        }

        Command::Plan(PlanCommand::Add {
            plan_id,
            title,
            description,
            task_type,
            priority,
        }) => {
            let step = Task::new(title)
                .with_description(description.unwrap_or_default())
                .with_type(parse(&task_type)?)
                .with_priority(priority);
            let step = session.store_mut().add_plan_step(&plan_id, step)?;
            println!("{} Added step: {} {}", "✓".green(), step.id.cyan(), step.title);
        }

        Command::Plan(PlanCommand::List) => {
            let plans = session.store().plans()?;
            print_tasks(&plans, json, "No plans found")?;
        }

        Command::Plan(PlanCommand::Show { id }) => {
            let plan = session.store().get_required(&id)?;
            let steps = session.store().plan_steps(&id)?;
            if json {
                return print_json(&serde_json::json!({ "plan": plan, "steps": steps }));
            }
            println!("Plan: {} - {}", plan.id.cyan(), plan.title);
            print_tasks(&steps, false, "(no steps defined)")?;
        }

        Command::Plan(PlanCommand::Start { plan_id, vars }) => {
            let workflow = session.store_mut().plan_start(&plan_id, &parse_vars(&vars)?)?;
            println!("{} Created persistent Workflow: {}", "✓".green(), workflow.id.cyan());
        }

        Command::Plan(PlanCommand::Execute { plan_id, vars }) => {
            let workflow = session.store_mut().plan_execute(&plan_id, &parse_vars(&vars)?)?;
            println!("{} Created ephemeral Workflow: {}", "✓".green(), workflow.id.cyan());
        }

        Command::Plan(PlanCommand::Convert { id }) => {
            let plan = session.store_mut().convert_to_plan(&id)?;
            println!("{} Converted to Plan: {}", "✓".green(), plan.id.cyan());
        }

        Command::Workflow(WorkflowCommand::List { plan }) => {
            let workflows = session.store().workflows(plan.as_deref())?;
            print_tasks(&workflows, json, "No workflows found")?;
        }

        Command::Workflow(WorkflowCommand::Discard { id }) => {
            session.store_mut().discard_workflow(&id)?;
            println!("{} Discarded Workflow: {}", "✓".green(), id.cyan());
        }

        Command::Workflow(WorkflowCommand::Summarize { id, summary }) => {
            session.store_mut().summarize_workflow(&id, &summary)?;
            println!("{} Summarized Workflow: {}", "✓".green(), id.cyan());
        }

        Command::Workflow(WorkflowCommand::Gc { age }) => {
            let count = session.store_mut().garbage_collect_ephemeral(parse_age_hours(&age)?)?;
            println!("{} Collected {} ephemeral task(s)", "✓".green(), count);
        }

        Command::Graph(GraphCommand::Dot { closed, svg }) => {
            let output = if svg {
                dot::to_svg(session.store(), None, closed)?
            } else {
                dot::to_dot(session.store(), None, closed)?
            };
            println!("{}", output);
        }

        Command::Graph(GraphCommand::Analyze) => {
            let analysis = DependencyGraph::new(session.store())?.analyze()?;
            if json {
                return print_json(&analysis);
            }
            println!("{}: {}", "Total".bold(), analysis.total_tasks);
            println!("{}: {}", "Open".bold(), analysis.open_tasks);
            println!("{}: {}", "Ready".bold(), analysis.ready_tasks);
            println!("{}: {}", "Blocked".bold(), analysis.blocked_tasks);
            println!("{}: {}", "Orphans".bold(), analysis.orphan_tasks);
            for b in &analysis.bottlenecks {
                println!(
                    "  {} {} {} {}",
                    "⚠".yellow(),
                    b.id.cyan(),
                    b.title,
                    format!("(in {}, out {})", b.incoming, b.outgoing).dimmed()
                );
            }
        }

        Command::Graph(GraphCommand::CriticalPath { id }) => {
            let graph = DependencyGraph::new(session.store())?;
            let path: Vec<Task> = graph.critical_path(&id).into_iter().cloned().collect();
            print_tasks(&path, json, "No path")?;
        }

        Command::Stale { days, status } => {
            let status = status.as_deref().map(parse::<Status>).transpose()?;
            let tasks = session.store().stale(days, status)?;
            print_tasks(&tasks, json, "No stale tasks")?;
        }

        Command::Sync(SyncCommand::Import { force }) => {
            let report = if force {
                session.reimport()?
            } else {
                session.import()?
            };
            println!(
                "{} Imported {} task(s) ({} written), {} edge(s), {} label(s), {} comment(s)",
                "✓".green(),
                report.tasks_read,
                report.tasks_written,
                report.dependencies_added,
                report.labels_added,
                report.comments_added
            );
            for error in &report.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        Command::Sync(SyncCommand::Export) => {
            let report = session.export()?;
            println!(
                "{} Exported {} task(s), {} edge(s), {} label(s), {} comment(s)",
                "✓".green(),
                report.tasks,
                report.dependencies,
                report.labels,
                report.comments
            );
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    info!("Command: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_age_hours_units() {
        assert_eq!(parse_age_hours("36h").unwrap(), 36);
        assert_eq!(parse_age_hours("2d").unwrap(), 48);
        assert_eq!(parse_age_hours("1w").unwrap(), 168);
        assert!(parse_age_hours("3m").is_err());
        assert!(parse_age_hours("").is_err());
    }

    #[test]
    fn test_parse_age_hours_overflow_is_an_error() {
        let days = format!("{}d", i64::MAX / 2);
        assert!(parse_age_hours(&days).is_err());
        let weeks = format!("{}w", i64::MAX / 100);
        assert!(parse_age_hours(&weeks).is_err());
    }
}
