use tracing::debug;

use super::{Task, TaskDefinition, TaskStatus};
use crate::device::ConfigSnapshot;
use crate::error::{CompileError, SchedulerResult};
use crate::scheduler::Scheduler;
use crate::sweep::Feedback;

/// Everything a compile routine may look at while compiling one step.
pub struct CompileContext {
    task: Task,
    scheduler: Scheduler,
    config: ConfigSnapshot,
    feedback: Feedback,
}

impl CompileContext {
    pub(crate) fn new(task: Task, scheduler: Scheduler, config: ConfigSnapshot) -> Self {
        Self {
            task,
            scheduler,
            config,
            feedback: Feedback::default(),
        }
    }

    pub(crate) fn set_feedback(&mut self, feedback: Feedback) {
        self.feedback = feedback;
    }

    /// Configuration snapshot taken when the task was submitted.
    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn feedback(&self) -> &Feedback {
        &self.feedback
    }

    /// Submit a task contained by the one being compiled.
    pub async fn submit_child(&self, definition: TaskDefinition) -> SchedulerResult<Task> {
        let child = Task::new(definition.contained_by(&self.task));
        if let Some(user) = self.task.runtime().user() {
            child.runtime().set_user(user);
        }
        self.scheduler.submit(&child).await?;
        debug!(
            "Task {} submitted child {} ({:?})",
            self.task.name(),
            child.name(),
            child.id()
        );
        Ok(child)
    }

    /// Submit a child task and wait for it to reach a terminal state.
    pub async fn run_child(&self, definition: TaskDefinition) -> Result<Task, CompileError> {
        let child = self
            .submit_child(definition)
            .await
            .map_err(|e| CompileError::Child(e.to_string()))?;
        match child.join().await {
            TaskStatus::Finished => Ok(child),
            status => Err(CompileError::Child(match child.execution_error() {
                Some(e) => e.to_string(),
                None => format!("{} ended {}", child.name(), status),
            })),
        }
    }
}
