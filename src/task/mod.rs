//! Tasks: user-defined experiments and the handles the scheduler drives.
//!
//! A [`TaskDefinition`] describes what to run and when. Submitting wraps it in
//! a [`Task`], a cheap cloneable handle whose [`TaskRuntime`] carries the
//! live status, compiled program and accumulated results.

mod analysis;
mod context;
mod runtime;

pub use analysis::{ACCEPTED_SCORE, AnalysisOutcome};
pub use context::CompileContext;
pub use runtime::{ActivityKind, TaskResult, TaskRuntime, TaskStatus};
pub(crate) use runtime::CancelOutcome;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{CompileError, SchedulerError};
use crate::program::{CompileMode, CompiledStep, Program};
use crate::sweep::{SweepPoint, SweepSource};
use crate::types::{ResourceName, TaskId, TaskName};

/// User-defined experiment logic.
#[async_trait]
pub trait Experiment: Send + Sync {
    /// Fresh sweep over the experiment's parameter space.
    fn sweep(&self) -> Box<dyn SweepSource>;

    /// Compile one sweep point against the submitted configuration snapshot.
    async fn compile_step(
        &self,
        point: &SweepPoint,
        ctx: &CompileContext,
    ) -> Result<CompiledStep, CompileError>;

    /// Judge the results of a finished run.
    fn analyze(&self, _result: &TaskResult) -> AnalysisOutcome {
        AnalysisOutcome::default()
    }

    /// Tasks to rerun before retrying a rejected maintenance attempt.
    fn calibrations(&self) -> Vec<TaskDefinition> {
        Vec::new()
    }
}

/// When a task becomes eligible for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Schedule {
    Immediate,
    At(DateTime<Utc>),
}

impl Schedule {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Immediate => true,
            Self::At(at) => *at <= now,
        }
    }
}

/// Description of a task, reusable across runs.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: TaskName,
    pub experiment: Arc<dyn Experiment>,
    /// Lower values dispatch first.
    pub priority: i32,
    pub at: Schedule,
    /// Resubmit this long after every successful run.
    pub period: Option<Duration>,
    pub compile_mode: CompileMode,
    /// Compilation depends on results of earlier steps.
    pub with_feedback: bool,
    /// Exclusive hardware resources held while the task runs.
    pub resources: Vec<ResourceName>,
    pub tags: BTreeSet<String>,
    pub(crate) parent: Option<Task>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<TaskName>, experiment: Arc<dyn Experiment>) -> Self {
        Self {
            name: name.into(),
            experiment,
            priority: 0,
            at: Schedule::Immediate,
            period: None,
            compile_mode: CompileMode::Full,
            with_feedback: false,
            resources: Vec::new(),
            tags: BTreeSet::new(),
            parent: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Schedule::At(at);
        self
    }

    pub fn every(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn compile_once(mut self) -> Self {
        self.compile_mode = CompileMode::Once;
        self
    }

    pub fn with_feedback(mut self) -> Self {
        self.with_feedback = true;
        self
    }

    pub fn resource(mut self, resource: impl Into<ResourceName>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Declare this task as running inside `parent`.
    pub fn contained_by(mut self, parent: &Task) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn parent(&self) -> Option<&Task> {
        self.parent.as_ref()
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("at", &self.at)
            .field("period", &self.period)
            .field("compile_mode", &self.compile_mode)
            .field("with_feedback", &self.with_feedback)
            .field("resources", &self.resources)
            .field("parent", &self.parent.as_ref().map(Task::name))
            .finish()
    }
}

/// Key deciding dispatch order among eligible tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DispatchOrder {
    pub at: Schedule,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

pub(crate) struct TaskInner {
    definition: TaskDefinition,
    runtime: TaskRuntime,
}

/// Shared handle to one run of a task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(definition: TaskDefinition) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                definition,
                runtime: TaskRuntime::new(),
            }),
        }
    }

    /// A not-yet-submitted copy of this task: same definition, fresh state.
    pub fn instantiate(&self) -> Task {
        Task::new(self.inner.definition.clone())
    }

    pub(crate) fn instantiate_at(&self, at: DateTime<Utc>) -> Task {
        let mut definition = self.inner.definition.clone();
        definition.at = Schedule::At(at);
        Task::new(definition)
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.inner.definition
    }

    pub fn runtime(&self) -> &TaskRuntime {
        &self.inner.runtime
    }

    pub fn name(&self) -> &TaskName {
        &self.inner.definition.name
    }

    pub fn id(&self) -> Option<TaskId> {
        self.inner.runtime.id()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.runtime.status()
    }

    pub fn status_history(&self) -> Vec<TaskStatus> {
        self.inner.runtime.status_history()
    }

    pub fn result(&self) -> TaskResult {
        self.inner.runtime.result()
    }

    pub fn program(&self) -> Program {
        self.inner.runtime.program()
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.runtime.failure()
    }

    /// The first failure of a background activity, as a typed error.
    pub fn execution_error(&self) -> Option<SchedulerError> {
        let message = self.failure()?;
        Some(SchedulerError::ExecutionFailure {
            task: self.name().clone(),
            id: self.id()?,
            message,
        })
    }

    pub fn dispatch_order(&self) -> DispatchOrder {
        DispatchOrder {
            at: self.inner.definition.at,
            priority: self.inner.definition.priority,
            created_at: self.inner.runtime.created_at(),
        }
    }

    /// Whether `ancestor` appears in this task's containment chain.
    pub fn is_nested_in(&self, ancestor: &Task) -> bool {
        let mut current = self.inner.definition.parent.as_ref();
        while let Some(parent) = current {
            if parent.ptr_eq(ancestor) {
                return true;
            }
            current = parent.inner.definition.parent.as_ref();
        }
        false
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the task reaches a terminal state.
    pub async fn join(&self) -> TaskStatus {
        let mut rx = self.inner.runtime.subscribe_status();
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.status()
    }

    pub(crate) fn downgrade(&self) -> WeakTask {
        WeakTask(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", self.name())
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning reference kept in the scheduler's task table.
#[derive(Clone)]
pub(crate) struct WeakTask(Weak<TaskInner>);

impl WeakTask {
    pub(crate) fn upgrade(&self) -> Option<Task> {
        self.0.upgrade().map(|inner| Task { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::Sweep;
    use chrono::Duration as ChronoDuration;

    struct Noop;

    #[async_trait]
    impl Experiment for Noop {
        fn sweep(&self) -> Box<dyn SweepSource> {
            Box::new(Sweep::new())
        }

        async fn compile_step(
            &self,
            _point: &SweepPoint,
            _ctx: &CompileContext,
        ) -> Result<CompiledStep, CompileError> {
            Ok(CompiledStep::default())
        }
    }

    fn def(name: &str) -> TaskDefinition {
        TaskDefinition::new(name, Arc::new(Noop))
    }

    #[test]
    fn test_schedule_ordering() {
        let now = Utc::now();
        assert!(Schedule::Immediate < Schedule::At(now));
        assert!(Schedule::At(now) < Schedule::At(now + ChronoDuration::seconds(1)));
        assert!(Schedule::At(now).is_ready(now));
        assert!(!Schedule::At(now + ChronoDuration::seconds(5)).is_ready(now));
    }

    #[test]
    fn test_dispatch_order_uses_time_then_priority() {
        let now = Utc::now();
        let late_urgent = Task::new(def("a").at(now + ChronoDuration::seconds(10)).priority(-5));
        let early = Task::new(def("b").priority(3));
        let early_urgent = Task::new(def("c").priority(1));
        assert!(early.dispatch_order() < late_urgent.dispatch_order());
        assert!(early_urgent.dispatch_order() < early.dispatch_order());
    }

    #[test]
    fn test_execution_error_is_typed() {
        let task = Task::new(def("rabi"));
        assert!(task.execution_error().is_none());

        task.runtime().assign(
            TaskId::new(7),
            crate::device::ConfigSnapshot::default(),
            false,
            CompileMode::Full,
        );
        assert!(task.execution_error().is_none());

        task.runtime().record_failure("fetch: link down");
        match task.execution_error() {
            Some(SchedulerError::ExecutionFailure { task: name, id, message }) => {
                assert_eq!(name.as_str(), "rabi");
                assert_eq!(id, TaskId::new(7));
                assert_eq!(message, "fetch: link down");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_instantiate_has_fresh_state() {
        let task = Task::new(def("rabi").priority(2));
        task.runtime().transition(TaskStatus::Compiling);

        let copy = task.instantiate();
        assert!(!copy.ptr_eq(&task));
        assert_eq!(copy.status(), TaskStatus::NotSubmitted);
        assert_eq!(copy.definition().priority, 2);
        assert_eq!(copy.name().as_str(), "rabi");
    }

    #[test]
    fn test_nesting_follows_parent_chain() {
        let root = Task::new(def("root"));
        let child = Task::new(def("child").contained_by(&root));
        let grandchild = Task::new(def("grandchild").contained_by(&child));
        let other = Task::new(def("other"));

        assert!(child.is_nested_in(&root));
        assert!(grandchild.is_nested_in(&root));
        assert!(grandchild.is_nested_in(&child));
        assert!(!root.is_nested_in(&child));
        assert!(!other.is_nested_in(&root));
    }

    #[tokio::test]
    async fn test_join_returns_terminal_status() {
        let task = Task::new(def("t"));
        let handle = {
            let task = task.clone();
            tokio::spawn(async move { task.join().await })
        };
        task.runtime().transition(TaskStatus::Compiling);
        task.runtime().transition(TaskStatus::Cancelled);
        assert_eq!(handle.await.unwrap(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_weak_task_upgrade() {
        let task = Task::new(def("t"));
        let weak = task.downgrade();
        assert!(weak.upgrade().is_some());
        drop(task);
        assert!(weak.upgrade().is_none());
    }
}
