//! Mutable per-task state owned by the scheduler and the task's activities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use surrealdb::RecordId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::UserRecord;
use crate::device::ConfigSnapshot;
use crate::executor::StepResult;
use crate::program::{CompileMode, Program, Step};
use crate::sweep::Feedback;
use crate::types::TaskId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle state of a task.
///
/// ```text
/// not submitted -> {pending, compiling} -> submitting -> running -> finished
///        any non-terminal state -> {failed, cancelled}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotSubmitted,
    /// Waiting for dispatch; compilation needs live hardware feedback.
    Pending,
    /// Waiting for dispatch while the program compiles ahead.
    Compiling,
    Submitting,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Still streaming or waiting to stream commands.
    pub fn is_submitting(self) -> bool {
        matches!(self, Self::Pending | Self::Compiling | Self::Submitting)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (NotSubmitted, Pending | Compiling) => true,
            (Pending | Compiling, Submitting) => true,
            (Submitting, Running) => true,
            (Running, Finished) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSubmitted => "not submitted",
            Self::Pending => "pending",
            Self::Compiling => "compiling",
            Self::Submitting => "submitting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated results of a task.
///
/// After a failure this holds whatever was captured before the fault.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Axis name -> value of that axis at every compiled step.
    pub index: BTreeMap<String, Vec<Value>>,
    pub data: Vec<StepResult>,
}

impl TaskResult {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn diagnostics(&self) -> Vec<&Value> {
        self.data
            .iter()
            .filter_map(|r| r.diagnostics.as_ref())
            .collect()
    }
}

/// Named background activities of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Compile,
    Submit,
    Fetch,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Submit => "submit",
            Self::Fetch => "fetch",
        }
    }
}

struct Activity {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CompileProgress {
    pub compiled: usize,
    pub done: bool,
}

/// What a cancellation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// The task never reached hardware and is now `cancelled`.
    Terminated,
    /// The task is in flight; its fetch activity completes the cancellation.
    Signalled,
    AlreadyTerminal,
}

struct StatusLog {
    current: TaskStatus,
    history: Vec<(TaskStatus, DateTime<Utc>)>,
}

pub struct TaskRuntime {
    id: OnceLock<TaskId>,
    created_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,

    status: Mutex<StatusLog>,
    status_tx: watch::Sender<TaskStatus>,

    cursor: AtomicUsize,
    program: Mutex<Program>,
    progress_tx: watch::Sender<CompileProgress>,
    result: Mutex<TaskResult>,
    results_tx: watch::Sender<usize>,
    failure: Mutex<Option<String>>,

    record: Mutex<Option<RecordId>>,
    user: Mutex<Option<UserRecord>>,

    token: CancellationToken,
    activities: Mutex<HashMap<ActivityKind, Activity>>,
    submit_done_tx: watch::Sender<bool>,
    cleaned: AtomicBool,
}

impl Default for TaskRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRuntime {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: OnceLock::new(),
            created_at: now,
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            status: Mutex::new(StatusLog {
                current: TaskStatus::NotSubmitted,
                history: vec![(TaskStatus::NotSubmitted, now)],
            }),
            status_tx: watch::Sender::new(TaskStatus::NotSubmitted),
            cursor: AtomicUsize::new(0),
            program: Mutex::new(Program::default()),
            progress_tx: watch::Sender::new(CompileProgress::default()),
            result: Mutex::new(TaskResult::default()),
            results_tx: watch::Sender::new(0),
            failure: Mutex::new(None),
            record: Mutex::new(None),
            user: Mutex::new(None),
            token: CancellationToken::new(),
            activities: Mutex::new(HashMap::new()),
            submit_done_tx: watch::Sender::new(false),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Option<TaskId> {
        self.id.get().copied()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.started_at)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.finished_at)
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.status).current
    }

    /// Every status the task has been in, oldest first.
    pub fn status_history(&self) -> Vec<TaskStatus> {
        lock(&self.status).history.iter().map(|(s, _)| *s).collect()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Steps fed to the executor so far.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn compiled_steps(&self) -> usize {
        self.progress_tx.borrow().compiled
    }

    pub fn program(&self) -> Program {
        lock(&self.program).clone()
    }

    pub fn result(&self) -> TaskResult {
        lock(&self.result).clone()
    }

    pub fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    pub fn record(&self) -> Option<RecordId> {
        lock(&self.record).clone()
    }

    pub fn user(&self) -> Option<UserRecord> {
        lock(&self.user).clone()
    }

    pub(crate) fn set_user(&self, user: UserRecord) {
        *lock(&self.user) = Some(user);
    }

    pub(crate) fn set_record(&self, record: RecordId) {
        *lock(&self.record) = Some(record);
    }

    /// Assign the id and prepare an empty program against `snapshot`.
    /// Returns `false` if an id was assigned before.
    pub(crate) fn assign(
        &self,
        id: TaskId,
        snapshot: ConfigSnapshot,
        with_feedback: bool,
        mode: CompileMode,
    ) -> bool {
        if self.id.set(id).is_err() {
            return false;
        }
        *lock(&self.program) = Program::new(with_feedback, mode, snapshot);
        true
    }

    pub(crate) fn snapshot(&self) -> ConfigSnapshot {
        lock(&self.program).snapshot.clone()
    }

    /// Move to `next` if the state machine allows it.
    pub(crate) fn transition(&self, next: TaskStatus) -> bool {
        let mut log = lock(&self.status);
        self.apply_transition(&mut log, next)
    }

    /// Move to `next` only from `expected`. Check and move happen under one
    /// lock.
    pub(crate) fn transition_from(&self, expected: TaskStatus, next: TaskStatus) -> bool {
        let mut log = lock(&self.status);
        if log.current != expected {
            return false;
        }
        self.apply_transition(&mut log, next)
    }

    fn apply_transition(&self, log: &mut StatusLog, next: TaskStatus) -> bool {
        if !log.current.can_transition_to(next) {
            debug!("Ignoring transition {} -> {}", log.current, next);
            return false;
        }
        log.current = next;
        log.history.push((next, Utc::now()));
        if next.is_terminal() {
            *lock(&self.finished_at) = Some(Utc::now());
        }
        self.status_tx.send_replace(next);
        true
    }

    pub(crate) fn request_cancel(&self) -> CancelOutcome {
        let outcome = {
            let mut log = lock(&self.status);
            match log.current {
                s if s.is_terminal() => CancelOutcome::AlreadyTerminal,
                TaskStatus::Submitting | TaskStatus::Running => CancelOutcome::Signalled,
                _ => {
                    log.current = TaskStatus::Cancelled;
                    log.history.push((TaskStatus::Cancelled, Utc::now()));
                    *lock(&self.finished_at) = Some(Utc::now());
                    self.status_tx.send_replace(TaskStatus::Cancelled);
                    CancelOutcome::Terminated
                }
            }
        };
        if outcome != CancelOutcome::AlreadyTerminal {
            self.token.cancel();
        }
        outcome
    }

    pub(crate) fn mark_started(&self) {
        *lock(&self.started_at) = Some(Utc::now());
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    // -- program -----------------------------------------------------------

    pub(crate) fn push_step(&self, step: Step) {
        let compiled = {
            let mut result = lock(&self.result);
            for (axis, value) in &step.point.values {
                result
                    .index
                    .entry(axis.clone())
                    .or_default()
                    .push(value.clone());
            }
            let mut program = lock(&self.program);
            program.push_step(step);
            program.len()
        };
        self.progress_tx.send_modify(|p| p.compiled = compiled);
    }

    pub(crate) fn finish_compile(&self) {
        self.progress_tx.send_modify(|p| p.done = true);
    }

    pub(crate) fn subscribe_progress(&self) -> watch::Receiver<CompileProgress> {
        self.progress_tx.subscribe()
    }

    pub(crate) fn step_at(&self, index: usize) -> Option<Step> {
        lock(&self.program).steps.get(index).cloned()
    }

    pub(crate) fn advance_cursor(&self, fed: usize) {
        self.cursor.fetch_max(fed, Ordering::SeqCst);
    }

    /// True once for the caller that should replay side-effect restoration.
    pub(crate) fn claim_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::SeqCst)
    }

    // -- results -----------------------------------------------------------

    pub(crate) fn append_results(&self, results: Vec<StepResult>) -> usize {
        let len = {
            let mut buffer = lock(&self.result);
            buffer.data.extend(results);
            buffer.data.len()
        };
        self.results_tx.send_replace(len);
        len
    }

    pub(crate) fn fetched(&self) -> usize {
        lock(&self.result).data.len()
    }

    pub(crate) fn subscribe_results(&self) -> watch::Receiver<usize> {
        self.results_tx.subscribe()
    }

    pub(crate) fn feedback(&self) -> Feedback {
        Feedback {
            results: lock(&self.result).data.clone(),
        }
    }

    /// Keep the first failure reported by any activity.
    pub(crate) fn record_failure(&self, message: impl Into<String>) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(message.into());
        }
    }

    // -- activities --------------------------------------------------------

    /// Spawn a named activity with its own child cancellation token.
    pub(crate) fn start_activity<F, Fut>(&self, kind: ActivityKind, activity: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = tokio::spawn(activity(token.clone()));
        lock(&self.activities).insert(kind, Activity { token, handle });
    }

    pub(crate) fn cancel_activity(&self, kind: ActivityKind) {
        if let Some(activity) = lock(&self.activities).get(&kind) {
            activity.token.cancel();
        }
    }

    pub fn is_activity_running(&self, kind: ActivityKind) -> bool {
        lock(&self.activities)
            .get(&kind)
            .is_some_and(|a| !a.handle.is_finished())
    }

    pub(crate) fn mark_submit_done(&self) {
        self.submit_done_tx.send_replace(true);
    }

    pub(crate) fn submit_done(&self) -> bool {
        *self.submit_done_tx.borrow()
    }

    pub(crate) async fn wait_submit_done(&self) {
        let mut rx = self.submit_done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::sweep::SweepPoint;

    #[test]
    fn test_valid_transitions() {
        use TaskStatus::*;
        assert!(NotSubmitted.can_transition_to(Compiling));
        assert!(NotSubmitted.can_transition_to(Pending));
        assert!(Compiling.can_transition_to(Submitting));
        assert!(Submitting.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        use TaskStatus::*;
        assert!(!Running.can_transition_to(Submitting));
        assert!(!Compiling.can_transition_to(Running));
        assert!(!Submitting.can_transition_to(Finished));
        assert!(!NotSubmitted.can_transition_to(Submitting));
        for terminal in [Finished, Failed, Cancelled] {
            for next in [Pending, Running, Finished, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_records_history() {
        let runtime = TaskRuntime::new();
        assert!(runtime.transition(TaskStatus::Compiling));
        assert!(!runtime.transition(TaskStatus::Finished));
        assert!(runtime.transition(TaskStatus::Submitting));
        assert!(runtime.transition(TaskStatus::Failed));
        assert!(!runtime.transition(TaskStatus::Cancelled));

        assert_eq!(
            runtime.status_history(),
            vec![
                TaskStatus::NotSubmitted,
                TaskStatus::Compiling,
                TaskStatus::Submitting,
                TaskStatus::Failed
            ]
        );
        assert!(runtime.finished_at().is_some());
    }

    #[test]
    fn test_transition_from_requires_expected_status() {
        let runtime = TaskRuntime::new();
        assert!(!runtime.transition_from(TaskStatus::Compiling, TaskStatus::Failed));
        assert_eq!(runtime.status(), TaskStatus::NotSubmitted);

        runtime.transition(TaskStatus::Compiling);
        assert!(runtime.transition_from(TaskStatus::Compiling, TaskStatus::Failed));
        assert!(!runtime.transition_from(TaskStatus::Compiling, TaskStatus::Submitting));
        assert_eq!(runtime.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_transition_from_has_one_winner() {
        for _ in 0..50 {
            let runtime = TaskRuntime::new();
            runtime.transition(TaskStatus::Compiling);
            let winners: usize = std::thread::scope(|s| {
                let handles: Vec<_> = [TaskStatus::Submitting, TaskStatus::Failed]
                    .into_iter()
                    .cycle()
                    .take(8)
                    .map(|next| {
                        let runtime = &runtime;
                        s.spawn(move || runtime.transition_from(TaskStatus::Compiling, next))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| usize::from(h.join().unwrap()))
                    .sum()
            });
            assert_eq!(winners, 1);
            assert_eq!(runtime.status_history().len(), 3);
        }
    }

    #[test]
    fn test_cancel_before_dispatch_terminates() {
        let runtime = TaskRuntime::new();
        runtime.transition(TaskStatus::Compiling);
        assert_eq!(runtime.request_cancel(), CancelOutcome::Terminated);
        assert_eq!(runtime.status(), TaskStatus::Cancelled);
        assert!(runtime.is_cancelled());
        assert_eq!(runtime.request_cancel(), CancelOutcome::AlreadyTerminal);
    }

    #[test]
    fn test_cancel_in_flight_only_signals() {
        let runtime = TaskRuntime::new();
        runtime.transition(TaskStatus::Compiling);
        runtime.transition(TaskStatus::Submitting);
        assert_eq!(runtime.request_cancel(), CancelOutcome::Signalled);
        assert_eq!(runtime.status(), TaskStatus::Submitting);
        assert!(runtime.is_cancelled());
    }

    #[test]
    fn test_id_assigned_once() {
        let runtime = TaskRuntime::new();
        assert!(runtime.assign(TaskId::new(7), ConfigSnapshot::default(), false, CompileMode::Full));
        assert!(!runtime.assign(TaskId::new(8), ConfigSnapshot::default(), false, CompileMode::Full));
        assert_eq!(runtime.id(), Some(TaskId::new(7)));
    }

    #[test]
    fn test_push_step_updates_index_and_progress() {
        let runtime = TaskRuntime::new();
        let rx = runtime.subscribe_progress();
        runtime.push_step(Step {
            point: SweepPoint::new().with("x", 1).with("y", "a"),
            commands: vec![],
            data_map: Default::default(),
            context: Value::Null,
        });
        runtime.finish_compile();

        assert_eq!(*rx.borrow(), CompileProgress { compiled: 1, done: true });
        assert_eq!(runtime.result().index.get("y"), Some(&vec![json!("a")]));
        assert!(runtime.step_at(0).is_some());
        assert!(runtime.step_at(1).is_none());
    }

    #[test]
    fn test_cleanup_claimed_once() {
        let runtime = TaskRuntime::new();
        assert!(runtime.claim_cleanup());
        assert!(!runtime.claim_cleanup());
    }

    #[test]
    fn test_first_failure_wins() {
        let runtime = TaskRuntime::new();
        runtime.record_failure("first");
        runtime.record_failure("second");
        assert_eq!(runtime.failure().as_deref(), Some("first"));
    }
}
