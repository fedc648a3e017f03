//! The scheduler: owns the queue, the active-submission stack and the running
//! pool, and mediates every task status transition.
//!
//! One dispatch loop moves ready tasks from the queue onto the hardware; one
//! reaper loop retires tasks that reached a terminal state. Each dispatched
//! task runs its own compile, submit and fetch activities (see
//! `activities.rs`).

mod activities;
mod dispatch;
mod maintain;
mod queue;


pub use maintain::Maintained;

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::UserStore;
use crate::config::SchedulerConfig;
use crate::db::{RecordStore, TaskRecordData, UserRecord, create_connection, ensure_schema};
use crate::device::{ConfigSnapshot, DeviceConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{Executor, FeedExtra, StepResult, StepSlot};
use crate::program::{Command, CommandValue};
use crate::session::Terminal;
use crate::task::{CancelOutcome, Task, TaskDefinition, TaskStatus, WeakTask};
use crate::types::TaskId;
use queue::{PendingQueue, ResourceTable};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Options for [`Scheduler::submit_with`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Assign an id and compile, but never dispatch.
    pub dry_run: bool,
    /// Compile against this configuration instead of a fresh snapshot.
    pub config: Option<ConfigSnapshot>,
}

#[derive(Default)]
struct DispatchState {
    queue: PendingQueue,
    stack: Vec<Task>,
    resources: ResourceTable,
}

struct SchedulerInner {
    config: SchedulerConfig,
    executor: Arc<dyn Executor>,
    device: DeviceConfig,
    users: UserStore,
    records: RecordStore,
    system_user: UserRecord,
    next_id: AtomicU64,
    state: Mutex<DispatchState>,
    running: Mutex<HashMap<TaskId, Task>>,
    tasks: Mutex<HashMap<TaskId, WeakTask>>,
    wake: Notify,
    shutdown: CancellationToken,
    reaper_tx: mpsc::UnboundedSender<Task>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Connect the database, load the system user and start the background
    /// loops.
    pub async fn bootstrap(
        executor: Arc<dyn Executor>,
        device: DeviceConfig,
        config: SchedulerConfig,
    ) -> SchedulerResult<Self> {
        let db = create_connection(config.database.clone()).await?;
        ensure_schema(&db).await?;

        let users = UserStore::new(db.clone());
        let secret = Uuid::new_v4().to_string();
        let system_user = users.get_or_create_system_user(&secret).await?;

        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            inner: Arc::new(SchedulerInner {
                config,
                executor,
                device,
                users,
                records: RecordStore::new(db),
                system_user,
                next_id: AtomicU64::new(TaskId::SYSTEM.get() + 1),
                state: Mutex::new(DispatchState::default()),
                running: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                reaper_tx,
                loops: Mutex::new(Vec::new()),
            }),
        };

        let dispatch = tokio::spawn(dispatch::dispatch_loop(scheduler.clone()));
        let reaper = tokio::spawn(dispatch::reaper_loop(scheduler.clone(), reaper_rx));
        lock(&scheduler.inner.loops).extend([dispatch, reaper]);

        info!(
            "Scheduler started (poll interval {:?}, data path {})",
            scheduler.inner.config.poll_interval,
            scheduler.inner.config.data_path.display()
        );
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.inner.device
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    pub fn system_user(&self) -> &UserRecord {
        &self.inner.system_user
    }

    pub fn records(&self) -> &RecordStore {
        &self.inner.records
    }

    // -- submission --------------------------------------------------------

    pub async fn submit(&self, task: &Task) -> SchedulerResult<TaskId> {
        self.submit_with(task, SubmitOptions::default()).await
    }

    /// Assign an id and configuration snapshot, start compiling and enqueue.
    pub async fn submit_with(&self, task: &Task, options: SubmitOptions) -> SchedulerResult<TaskId> {
        let runtime = task.runtime();
        let definition = task.definition();
        let already_submitted = || SchedulerError::AlreadySubmitted {
            name: task.name().clone(),
            id: task.id().map(|id| id.to_string()).unwrap_or_default(),
            status: task.status(),
        };

        if runtime.status() != TaskStatus::NotSubmitted {
            return Err(already_submitted());
        }

        let id = TaskId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let snapshot = options.config.unwrap_or_else(|| self.inner.device.export());
        if !runtime.assign(id, snapshot, definition.with_feedback, definition.compile_mode) {
            return Err(already_submitted());
        }
        lock(&self.inner.tasks).insert(id, task.downgrade());

        if let Some(user) = runtime.user() {
            let tags = definition.tags.iter().cloned().collect();
            match self
                .inner
                .records
                .create_record(id, task.name(), &user.id, tags)
                .await
            {
                Ok(record) => runtime.set_record(record.id),
                Err(e) => warn!("Failed to create record for task {} ({}): {:#}", task.name(), id, e),
            }
        }

        runtime.transition(if definition.with_feedback {
            TaskStatus::Pending
        } else {
            TaskStatus::Compiling
        });

        // Children submitted from the compile routine must find their parent
        // already queued.
        if options.dry_run {
            info!("Dry run of task {} ({}): compiling only", task.name(), id);
        } else {
            lock(&self.inner.state).queue.push(task.clone());
            self.inner.wake.notify_one();
            info!(
                "Submitted task {} ({}) priority={} at={:?}",
                task.name(),
                id,
                definition.priority,
                definition.at
            );
        }

        if !definition.with_feedback {
            self.start_compile(task);
        }
        Ok(id)
    }

    // -- cancellation ------------------------------------------------------

    /// Cancel one task. Idempotent; a no-op for terminal tasks.
    pub async fn cancel_task(&self, task: &Task) {
        match task.runtime().request_cancel() {
            CancelOutcome::Terminated => {
                info!("Cancelled task {} ({:?}) before dispatch", task.name(), task.id());
                lock(&self.inner.state).queue.remove(task);
                self.finalize(task).await;
            }
            CancelOutcome::Signalled => {
                info!("Cancelling task {} ({:?})", task.name(), task.id());
            }
            CancelOutcome::AlreadyTerminal => {
                debug!("Task {} already terminal, nothing to cancel", task.name());
            }
        }
    }

    /// Cancel everything: queued tasks, active submitters, hardware work and
    /// the running pool, in that order.
    pub async fn cancel_all(&self) {
        let (queued, stacked) = {
            let mut state = lock(&self.inner.state);
            let queued = state.queue.drain();
            let stacked = std::mem::take(&mut state.stack);
            (queued, stacked)
        };
        info!(
            "Cancelling all tasks ({} queued, {} submitting)",
            queued.len(),
            stacked.len()
        );

        for task in &queued {
            self.cancel_task(task).await;
        }
        for task in stacked.iter().rev() {
            self.cancel_task(task).await;
        }
        if let Err(e) = self.inner.executor.cancel().await {
            warn!("Executor cancel failed: {:#}", e);
        }
        let running: Vec<Task> = lock(&self.inner.running).values().cloned().collect();
        for task in &running {
            self.cancel_task(task).await;
        }
    }

    /// Stop the background loops and cancel every task.
    pub async fn shutdown(&self) {
        self.cancel_all().await;
        self.inner.shutdown.cancel();
        let loops: Vec<_> = lock(&self.inner.loops).drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    // -- shared configuration ----------------------------------------------

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.device.query(key)
    }

    /// Update the shared configuration.
    ///
    /// Unless `cache` is set the value is also written to the hardware on
    /// the setup slot of the system task.
    pub async fn set(&self, key: &str, value: Value, cache: bool) -> SchedulerResult<()> {
        self.inner.device.update(key, value.clone(), cache);
        if cache {
            return Ok(());
        }

        let command = Command::write(key, CommandValue::Setting(value));
        let accepted = self
            .inner
            .executor
            .feed(TaskId::SYSTEM, StepSlot::Setup, vec![command], FeedExtra::default())
            .await?;
        if accepted {
            self.inner.executor.free(TaskId::SYSTEM).await?;
        }
        Ok(())
    }

    /// Write every parameter through and drop the configuration buffer.
    pub async fn update_parameters(&self, parameters: BTreeMap<String, Value>) -> SchedulerResult<()> {
        for (key, value) in parameters {
            self.set(&key, value, false).await?;
        }
        self.inner.device.clear_buffer();
        Ok(())
    }

    /// Results of `task` from step `skip` onward, straight from the executor.
    pub async fn fetch(&self, task: &Task, skip: usize) -> SchedulerResult<Vec<StepResult>> {
        let id = task
            .id()
            .ok_or_else(|| SchedulerError::NotSubmitted(task.name().clone()))?;
        Ok(self.inner.executor.fetch(id, skip).await?)
    }

    // -- bookkeeping -------------------------------------------------------

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        lock(&self.inner.tasks).get(&id).and_then(WeakTask::upgrade)
    }

    /// Live tasks known to the scheduler, by id.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|_, weak| weak.upgrade().is_some());
        let mut live: Vec<Task> = tasks.values().filter_map(WeakTask::upgrade).collect();
        live.sort_by_key(|t| t.id());
        live
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        let mut running: Vec<Task> = lock(&self.inner.running).values().cloned().collect();
        running.sort_by_key(|t| t.id());
        running
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Id of the task currently holding hardware resource `name`.
    pub fn resource_holder(&self, name: &str) -> Option<TaskId> {
        lock(&self.inner.state).resources.holder(name)
    }

    // -- users -------------------------------------------------------------

    pub async fn add_user(&self, name: &str, password: &str) -> SchedulerResult<UserRecord> {
        let user = self.inner.users.create_user(name, password).await?;
        info!("Added user {}", name);
        Ok(user)
    }

    pub async fn login(&self, name: &str, password: &str) -> SchedulerResult<Terminal> {
        let user = self.inner.users.verify(name, password).await?;
        info!("User {} logged in", name);
        Ok(Terminal::new(self.clone(), user))
    }

    /// A task owned by the scheduler's system user.
    pub fn create_task(&self, definition: TaskDefinition) -> Task {
        let task = Task::new(definition);
        task.runtime().set_user(self.inner.system_user.clone());
        task
    }

    // -- terminal bookkeeping ----------------------------------------------

    /// Persist the record, release resources and hand the task to the
    /// reaper. Runs once, right after the terminal transition.
    async fn finalize(&self, task: &Task) {
        let runtime = task.runtime();
        runtime.mark_submit_done();
        self.persist(task).await;
        lock(&self.inner.state).resources.release(task);
        if self.inner.reaper_tx.send(task.clone()).is_err() {
            debug!("Reaper gone, task {} not retired", task.name());
        }
        self.inner.wake.notify_one();
        info!(
            "Task {} ({:?}) is {}",
            task.name(),
            task.id(),
            runtime.status()
        );
    }

    async fn persist(&self, task: &Task) {
        let runtime = task.runtime();
        let Some(record) = runtime.record() else {
            warn!("Task {} ({:?}) has no record to commit", task.name(), task.id());
            return;
        };
        let data = TaskRecordData {
            result: runtime.result(),
            program: runtime.program(),
        };
        if let Err(e) = self
            .inner
            .records
            .attach_result(&record, runtime.status(), data)
            .await
        {
            error!(
                "Failed to commit record of task {} ({:?}): {:#}",
                task.name(),
                task.id(),
                e
            );
        }
    }
}
