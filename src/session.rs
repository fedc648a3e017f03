//! Per-user sessions.

use tracing::info;

use crate::db::{TaskRecord, UserRecord};
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{Scheduler, SubmitOptions};
use crate::task::{Task, TaskDefinition};
use crate::types::TaskId;

/// A logged-in user's handle on the scheduler.
///
/// Tasks created or submitted through a terminal belong to its user, which
/// gives them a persisted record.
pub struct Terminal {
    scheduler: Scheduler,
    user: UserRecord,
}

impl Terminal {
    pub(crate) fn new(scheduler: Scheduler, user: UserRecord) -> Self {
        Self { scheduler, user }
    }

    pub fn user(&self) -> &UserRecord {
        &self.user
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn create_task(&self, definition: TaskDefinition) -> Task {
        let task = Task::new(definition);
        task.runtime().set_user(self.user.clone());
        task
    }

    /// Submit a task, claiming it for this user if it has no owner yet.
    pub async fn submit(&self, task: &Task) -> SchedulerResult<TaskId> {
        self.submit_with(task, SubmitOptions::default()).await
    }

    pub async fn submit_with(&self, task: &Task, options: SubmitOptions) -> SchedulerResult<TaskId> {
        if task.runtime().user().is_none() {
            task.runtime().set_user(self.user.clone());
        }
        self.scheduler.submit_with(task, options).await
    }

    pub async fn cancel(&self, task: &Task) {
        self.scheduler.cancel_task(task).await;
    }

    /// Persisted runs of this user, newest first.
    pub async fn records(&self) -> SchedulerResult<Vec<TaskRecord>> {
        self.scheduler
            .records()
            .list_for_user(&self.user.id)
            .await
            .map_err(SchedulerError::from)
    }

    pub fn logout(self) {
        info!("User {} logged out", self.user.name);
    }
}
