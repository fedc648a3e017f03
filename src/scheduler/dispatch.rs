use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::queue::settle_stack;
use super::{Scheduler, lock};
use crate::task::{Task, TaskStatus};

/// Move ready tasks onto the hardware until shutdown.
pub(super) async fn dispatch_loop(scheduler: Scheduler) {
    let inner = &scheduler.inner;
    debug!("Dispatch loop started");
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        while let Some(task) = scheduler.next_dispatchable() {
            scheduler.submit_task(task).await;
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.dispatch_tick) => {}
        }
    }
    debug!("Dispatch loop stopped");
}

/// Retire terminal tasks and resubmit periodic ones.
pub(super) async fn reaper_loop(scheduler: Scheduler, mut rx: mpsc::UnboundedReceiver<Task>) {
    loop {
        let task = tokio::select! {
            _ = scheduler.inner.shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        scheduler.reap(task).await;
    }
    debug!("Reaper loop stopped");
}

impl Scheduler {
    /// Next queued task allowed onto the hardware, with its resources
    /// already acquired.
    ///
    /// A task is eligible once its scheduled time has passed and either
    /// nothing is submitting or it is nested in the task on top of the stack
    /// and that task has streamed every step compiled so far.
    fn next_dispatchable(&self) -> Option<Task> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;

        settle_stack(&mut state.stack);
        state.queue.prune_terminal();

        let now = Utc::now();
        let top = state.stack.last().cloned();
        let resources = &mut state.resources;
        state.queue.pick(|task| {
            if !task.definition().at.is_ready(now) {
                return false;
            }
            if let Some(top) = &top {
                let caught_up = top.runtime().cursor() >= top.runtime().compiled_steps();
                if !task.is_nested_in(top) || !caught_up {
                    return false;
                }
            }
            resources.try_acquire(task)
        })
    }

    /// Put one task on the hardware: start its submit and fetch activities.
    async fn submit_task(&self, task: Task) {
        let Some(id) = task.id() else {
            return;
        };
        let runtime = task.runtime();

        if let Err(e) = self.inner.executor.free(id).await {
            warn!("Failed to free stale reservation of task {} ({}): {:#}", task.name(), id, e);
        }
        if !runtime.transition(TaskStatus::Submitting) {
            debug!("Task {} ({}) is {}, not dispatching", task.name(), id, runtime.status());
            lock(&self.inner.state).resources.release(&task);
            return;
        }

        lock(&self.inner.state).stack.push(task.clone());
        runtime.mark_started();
        info!("Dispatching task {} ({})", task.name(), id);

        if task.definition().with_feedback {
            self.start_compile(&task);
        }
        self.start_submit(&task);
        lock(&self.inner.running).insert(id, task.clone());
        self.start_fetch(&task);
    }

    /// Drop a terminal task from the bookkeeping and reschedule it if it is
    /// periodic.
    async fn reap(&self, task: Task) {
        let Some(id) = task.id() else {
            return;
        };
        if !self.inner.config.debug_mode {
            lock(&self.inner.running).remove(&id);
        }
        lock(&self.inner.tasks).remove(&id);
        debug!("Retired task {} ({})", task.name(), id);

        let Some(period) = task.definition().period else {
            return;
        };
        if task.status() != TaskStatus::Finished || self.inner.shutdown.is_cancelled() {
            return;
        }

        let delay = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::zero());
        let next = task.instantiate_at(Utc::now() + delay);
        if let Some(user) = task.runtime().user() {
            next.runtime().set_user(user);
        }
        match self.submit(&next).await {
            Ok(next_id) => info!(
                "Rescheduled periodic task {} as {} in {:?}",
                task.name(),
                next_id,
                period
            ),
            Err(e) => error!("Failed to reschedule periodic task {}: {}", task.name(), e),
        }
    }
}
