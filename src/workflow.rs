//! Plans and Workflows.
//!
//! A Plan is a reusable blueprint whose children are its steps. Instantiating
//! a Plan creates a Workflow (persistent or ephemeral) with one child per
//! step, `{{key}}` placeholders filled from the supplied variables.

use eyre::Result;
use std::collections::HashMap;

use crate::store::{Store, StoreError};
use crate::types::Task;

/// Replace every `{{key}}` in `text` with its value.
pub fn interpolate(text: &str, vars: &HashMap<String, String>) -> String {
    vars.iter()
        .fold(text.to_string(), |acc, (key, value)| acc.replace(&format!("{{{{{}}}}}", key), value))
}

/// Extension trait for Plan and Workflow operations on Store.
pub trait StoreWorkflowExt {
    /// Create a new Plan.
    fn create_plan(&mut self, task: Task) -> Result<Task>;

    /// Add a step to a Plan.
    fn add_plan_step(&mut self, plan_id: &str, step: Task) -> Result<Task>;

    /// All Plans, ordered by title.
    fn plans(&self) -> Result<Vec<Task>>;

    /// Steps of a Plan, ordered by priority then title.
    fn plan_steps(&self, plan_id: &str) -> Result<Vec<Task>>;

    /// Turn an existing ordinary task into a Plan.
    fn convert_to_plan(&mut self, id: &str) -> Result<Task>;

    /// Instantiate a persistent Workflow.
    fn plan_start(&mut self, plan_id: &str, vars: &HashMap<String, String>) -> Result<Task>;

    /// Instantiate an ephemeral Workflow.
    fn plan_execute(&mut self, plan_id: &str, vars: &HashMap<String, String>) -> Result<Task>;

    /// Workflows, optionally from a single Plan, newest first.
    fn workflows(&self, plan_id: Option<&str>) -> Result<Vec<Task>>;

    fn workflow_steps(&self, workflow_id: &str) -> Result<Vec<Task>>;

    /// Delete an ephemeral Workflow and its children.
    fn discard_workflow(&mut self, workflow_id: &str) -> Result<()>;

    /// Record a summary and close the Workflow and all of its children.
    fn summarize_workflow(&mut self, workflow_id: &str, summary: &str) -> Result<Task>;
}

fn required_plan(store: &Store, plan_id: &str) -> Result<Task> {
    let plan = store.get_required(plan_id)?;
    if !plan.plan {
        return Err(eyre::eyre!(StoreError::NotAPlan(plan_id.to_string())));
    }
    Ok(plan)
}

fn instantiate(store: &mut Store, plan_id: &str, vars: &HashMap<String, String>, ephemeral: bool) -> Result<Task> {
    let plan = required_plan(store, plan_id)?;

    let mut workflow = Task::new(interpolate(&plan.title, vars))
        .with_description(interpolate(&plan.description, vars))
        .with_type(plan.task_type)
        .with_priority(plan.priority);
    workflow.source_plan_id = Some(plan.id.clone());
    workflow.ephemeral = ephemeral;

    let workflow = store.create(workflow)?;
    let workflow = store.append_trace(&workflow.id, "INSTANTIATED", &format!("from Plan {}", plan.id))?;

    for step in store.storage().step_tasks(plan_id)? {
        let mut child = Task::new(interpolate(&step.title, vars))
            .with_description(interpolate(&step.description, vars))
            .with_type(step.task_type)
            .with_priority(step.priority);
        child.ephemeral = ephemeral;
        store.create_child(&workflow.id, child)?;
    }

    log::info!(
        "Instantiated {} workflow {} from plan {}",
        if ephemeral { "ephemeral" } else { "persistent" },
        workflow.id,
        plan.id
    );
    Ok(workflow)
}

impl StoreWorkflowExt for Store {
    fn create_plan(&mut self, task: Task) -> Result<Task> {
        self.create(task.as_plan())
    }

    fn add_plan_step(&mut self, plan_id: &str, step: Task) -> Result<Task> {
        required_plan(self, plan_id)?;
        self.create_child(plan_id, step)
    }

    fn plans(&self) -> Result<Vec<Task>> {
        self.storage().plan_tasks()
    }

    fn plan_steps(&self, plan_id: &str) -> Result<Vec<Task>> {
        self.storage().step_tasks(plan_id)
    }

    fn convert_to_plan(&mut self, id: &str) -> Result<Task> {
        let task = self.get_required(id)?;
        if task.plan {
            return Err(eyre::eyre!(StoreError::AlreadyAPlan(id.to_string())));
        }
        if task.ephemeral {
            return Err(eyre::eyre!(StoreError::EphemeralPlan(id.to_string())));
        }
        self.mark_as_plan(id)
    }

    fn plan_start(&mut self, plan_id: &str, vars: &HashMap<String, String>) -> Result<Task> {
        instantiate(self, plan_id, vars, false)
    }

    fn plan_execute(&mut self, plan_id: &str, vars: &HashMap<String, String>) -> Result<Task> {
        instantiate(self, plan_id, vars, true)
    }

    fn workflows(&self, plan_id: Option<&str>) -> Result<Vec<Task>> {
        self.storage().workflow_tasks(plan_id)
    }

    fn workflow_steps(&self, workflow_id: &str) -> Result<Vec<Task>> {
        self.children(workflow_id)
    }

    fn discard_workflow(&mut self, workflow_id: &str) -> Result<()> {
        let workflow = self.get_required(workflow_id)?;
        if !workflow.is_discardable() {
            return Err(eyre::eyre!(StoreError::NotEphemeral(workflow_id.to_string())));
        }

        for child in self.children(workflow_id)? {
            self.delete(&child.id)?;
        }
        self.delete(workflow_id)?;
        Ok(())
    }

    fn summarize_workflow(&mut self, workflow_id: &str, summary: &str) -> Result<Task> {
        let mut workflow = self.get_required(workflow_id)?;
        workflow.push_note(&format!("\n[Summary]\n{}", summary));
        workflow.close(Some("summarized"));
        let workflow = self.update(workflow)?;

        for mut child in self.children(workflow_id)? {
            child.close(Some("workflow summarized"));
            self.update(child)?;
        }
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_interpolate() {
        let v = vars(&[("name", "auth"), ("env", "prod")]);
        assert_eq!(interpolate("Deploy {{name}} to {{env}}", &v), "Deploy auth to prod");
        assert_eq!(interpolate("Untouched {{other}}", &v), "Untouched {{other}}");
        assert_eq!(interpolate("plain", &HashMap::new()), "plain");
    }

    #[test]
    fn test_add_step_requires_plan() {
        let mut store = Store::open_in_memory().unwrap();
        let task = store.create(Task::new("Ordinary")).unwrap();

        let err = store.add_plan_step(&task.id, Task::new("Step")).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotAPlan(_))));
    }

    #[test]
    fn test_plan_execute_is_ephemeral() {
        let mut store = Store::open_in_memory().unwrap();
        let plan = store.create_plan(Task::new("Release {{version}}")).unwrap();
        store.add_plan_step(&plan.id, Task::new("Tag {{version}}")).unwrap();

        let workflow = store.plan_execute(&plan.id, &vars(&[("version", "1.2")])).unwrap();
        assert!(workflow.ephemeral);
        assert!(workflow.is_workflow());
        assert_eq!(workflow.title, "Release 1.2");
        assert!(workflow.notes.contains("[INSTANTIATED] from Plan"));

        let steps = store.workflow_steps(&workflow.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].ephemeral);
        assert_eq!(steps[0].title, "Tag 1.2");

        // Plan itself untouched
        let plan = store.get_required(&plan.id).unwrap();
        assert!(plan.plan);
        assert_eq!(plan.status, Status::Open);
    }

    #[test]
    fn test_convert_to_plan_rejections() {
        let mut store = Store::open_in_memory().unwrap();
        let plan = store.create_plan(Task::new("Plan")).unwrap();
        let err = store.convert_to_plan(&plan.id).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::AlreadyAPlan(_))));

        let temp = store.create(Task::new("Scratch").as_ephemeral()).unwrap();
        let err = store.convert_to_plan(&temp.id).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::EphemeralPlan(_))));

        let task = store.create(Task::new("Closed one")).unwrap();
        store.close(&task.id, None).unwrap();
        let converted = store.convert_to_plan(&task.id).unwrap();
        assert!(converted.plan);
        assert_eq!(converted.status, Status::Open);
        assert!(converted.closed_at.is_none());
    }
}
