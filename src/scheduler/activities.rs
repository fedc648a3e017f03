//! Per-task background activities: compile, submit and fetch.
//!
//! Every activity runs under a child token of its task's cancellation token
//! and checks it at its suspension points. Failures are caught here, logged
//! with the task name and id, and turned into a `failed` status.

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Scheduler, lock};
use crate::error::CompileError;
use crate::executor::{FeedExtra, StepSlot};
use crate::program::StepCompiler;
use crate::task::{ActivityKind, CompileContext, Task, TaskStatus};

impl Scheduler {
    pub(super) fn start_compile(&self, task: &Task) {
        let scheduler = self.clone();
        let owned = task.clone();
        task.runtime()
            .start_activity(ActivityKind::Compile, move |token| {
                compile_activity(scheduler, owned, token)
            });
    }

    pub(super) fn start_submit(&self, task: &Task) {
        let scheduler = self.clone();
        let owned = task.clone();
        task.runtime()
            .start_activity(ActivityKind::Submit, move |token| {
                submit_activity(scheduler, owned, token)
            });
    }

    pub(super) fn start_fetch(&self, task: &Task) {
        let scheduler = self.clone();
        let owned = task.clone();
        task.runtime()
            .start_activity(ActivityKind::Fetch, move |token| {
                fetch_activity(scheduler, owned, token)
            });
    }

    /// Feed the side-effect restore commands, at most once per task.
    async fn clean_side_effects(&self, task: &Task) {
        let runtime = task.runtime();
        let Some(id) = task.id() else {
            return;
        };
        if !runtime.claim_cleanup() {
            return;
        }
        let commands = runtime.program().restore_commands();
        debug!(
            "Restoring {} settings for task {} ({})",
            commands.len(),
            task.name(),
            id
        );
        if let Err(e) = self
            .inner
            .executor
            .feed(id, StepSlot::Cleanup, commands, FeedExtra::default())
            .await
        {
            error!("Cleanup of task {} ({}) failed: {:#}", task.name(), id, e);
        }
    }

    async fn free(&self, task: &Task) {
        let Some(id) = task.id() else {
            return;
        };
        if let Err(e) = self.inner.executor.free(id).await {
            warn!("Failed to free task {} ({}): {:#}", task.name(), id, e);
        }
    }

    /// Fail a task whose compilation broke before it reached the hardware.
    ///
    /// A task that was dispatched meanwhile is left to its fetch activity.
    async fn fail_undispatched(&self, task: &Task) {
        let failed = {
            let mut state = lock(&self.inner.state);
            let runtime = task.runtime();
            let failed = runtime.transition_from(TaskStatus::Compiling, TaskStatus::Failed)
                || runtime.transition_from(TaskStatus::Pending, TaskStatus::Failed);
            if failed {
                state.queue.remove(task);
            }
            failed
        };
        if failed {
            info!("Task {} ({:?}) failed before dispatch", task.name(), task.id());
            self.finalize(task).await;
        }
    }

    /// Move a task to its terminal status and finalize it.
    async fn complete(&self, task: &Task, status: TaskStatus) {
        if task.runtime().transition(status) {
            self.finalize(task).await;
        } else {
            debug!(
                "Task {} ({:?}) already {}, dropping {}",
                task.name(),
                task.id(),
                task.status(),
                status
            );
        }
    }
}

/// Compile sweep points into steps until the sweep is exhausted.
///
/// Feedback tasks wait for the results of every compiled step before asking
/// the sweep for its next point.
async fn compile_activity(scheduler: Scheduler, task: Task, token: CancellationToken) {
    let runtime = task.runtime();
    let definition = task.definition();
    let mut sweep = definition.experiment.sweep();
    let mut compiler = StepCompiler::new(definition.compile_mode);
    let mut ctx = CompileContext::new(task.clone(), scheduler.clone(), runtime.snapshot());
    let mut results = runtime.subscribe_results();

    let outcome: Result<(), CompileError> = async {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            if definition.with_feedback {
                let needed = runtime.compiled_steps();
                let ready = tokio::select! {
                    _ = token.cancelled() => false,
                    ready = async { results.wait_for(|n| *n >= needed).await.is_ok() } => ready,
                };
                if !ready {
                    return Ok(());
                }
                ctx.set_feedback(runtime.feedback());
            }

            let Some(point) = sweep.next_point(ctx.feedback()) else {
                return Ok(());
            };
            let step = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                step = compiler.compile(definition.experiment.as_ref(), point, &ctx) => step?,
            };
            runtime.push_step(step);
        }
    }
    .await;

    let failed = match outcome {
        Ok(()) => {
            debug!(
                "Compiled {} steps of task {} ({:?})",
                runtime.compiled_steps(),
                task.name(),
                task.id()
            );
            false
        }
        Err(e) => {
            error!("Compilation of task {} ({:?}) failed: {}", task.name(), task.id(), e);
            runtime.record_failure(format!("compile: {e}"));
            true
        }
    };
    runtime.finish_compile();
    if failed {
        scheduler.fail_undispatched(&task).await;
    }
}

/// Stream compiled steps into the executor in order, then restore side
/// effects. Streaming stops at the first recorded failure.
async fn submit_activity(scheduler: Scheduler, task: Task, token: CancellationToken) {
    let runtime = task.runtime();
    let Some(id) = task.id() else {
        runtime.mark_submit_done();
        return;
    };
    let executor = scheduler.inner.executor.clone();
    let mut progress = runtime.subscribe_progress();

    let outcome: Result<()> = async {
        loop {
            if token.is_cancelled() || runtime.failure().is_some() {
                return Ok(());
            }

            let cursor = runtime.cursor();
            if let Some(step) = runtime.step_at(cursor) {
                let extra = FeedExtra {
                    data_map: Some(step.data_map.for_executor()),
                };
                debug!("Feeding step {} of task {} ({})", cursor, task.name(), id);
                if !executor
                    .feed(id, StepSlot::Step(cursor), step.commands, extra)
                    .await?
                {
                    bail!("executor rejected step {}", cursor);
                }
                runtime.advance_cursor(cursor + 1);
                continue;
            }

            let done = progress.borrow_and_update().done;
            if runtime.step_at(cursor).is_some() {
                continue;
            }
            if done {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                changed = progress.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    if let Err(e) = outcome {
        error!("Submitting task {} ({}) failed: {:#}", task.name(), id, e);
        runtime.record_failure(format!("submit: {e:#}"));
    }
    scheduler.clean_side_effects(&task).await;
    runtime.mark_submit_done();
    scheduler.inner.wake.notify_one();
}

/// Poll the executor until every fed step has a result, then settle the
/// task's terminal status.
async fn fetch_activity(scheduler: Scheduler, task: Task, token: CancellationToken) {
    let runtime = task.runtime();
    let Some(id) = task.id() else {
        return;
    };
    let inner = &scheduler.inner;

    let outcome: Result<TaskStatus> = async {
        loop {
            if token.is_cancelled() {
                return Ok(TaskStatus::Cancelled);
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(TaskStatus::Cancelled),
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }

            if let Some(failure) = runtime.failure() {
                bail!(failure);
            }

            let results = inner.executor.fetch(id, runtime.fetched()).await?;
            if !results.is_empty() {
                debug!("Fetched {} results of task {} ({})", results.len(), task.name(), id);
                runtime.append_results(results);
            }

            if runtime.status() == TaskStatus::Running && runtime.fetched() >= runtime.cursor() {
                if let Some(failure) = runtime.failure() {
                    bail!(failure);
                }
                return Ok(TaskStatus::Finished);
            }
        }
    }
    .await;

    let status = match outcome {
        Ok(TaskStatus::Finished) => {
            runtime.wait_submit_done().await;
            let path = inner.config.task_data_path(id);
            if let Err(e) = inner.executor.save(id, &path).await {
                error!("Failed to save data of task {} ({}): {:#}", task.name(), id, e);
            }
            TaskStatus::Finished
        }
        Ok(status) => {
            info!("Task {} ({}) received kill signal", task.name(), id);
            runtime.cancel_activity(ActivityKind::Compile);
            runtime.wait_submit_done().await;
            scheduler.free(&task).await;
            status
        }
        Err(e) => {
            error!("Task {} ({}) failed: {:#}", task.name(), id, e);
            runtime.record_failure(e.to_string());
            runtime.cancel_activity(ActivityKind::Compile);
            runtime.cancel_activity(ActivityKind::Submit);
            runtime.wait_submit_done().await;
            scheduler.free(&task).await;
            TaskStatus::Failed
        }
    };

    scheduler.complete(&task, status).await;
}
