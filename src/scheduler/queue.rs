//! Pending queue, active-submission stack and hardware resource table.
//!
//! All three live behind the scheduler's single dispatch lock.

use std::collections::{BTreeMap, HashMap};

use crate::task::{DispatchOrder, Task, TaskStatus};
use crate::types::{ResourceName, TaskId};

/// Tasks waiting for dispatch, ordered by [`DispatchOrder`] then arrival.
#[derive(Default)]
pub(crate) struct PendingQueue {
    entries: BTreeMap<(DispatchOrder, u64), Task>,
    seq: u64,
}

impl PendingQueue {
    pub fn push(&mut self, task: Task) {
        self.seq += 1;
        self.entries.insert((task.dispatch_order(), self.seq), task);
    }

    /// Remove and return the first task, in dispatch order, accepted by
    /// `eligible`.
    pub fn pick(&mut self, mut eligible: impl FnMut(&Task) -> bool) -> Option<Task> {
        let key = self
            .entries
            .iter()
            .find(|(_, task)| eligible(task))
            .map(|(key, _)| *key)?;
        self.entries.remove(&key)
    }

    /// Drop tasks that reached a terminal state while queued.
    pub fn prune_terminal(&mut self) {
        self.entries.retain(|_, task| !task.status().is_terminal());
    }

    pub fn remove(&mut self, task: &Task) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, queued| !queued.ptr_eq(task));
        self.entries.len() != before
    }

    pub fn drain(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pop every finished submitter off the top of the stack.
///
/// A popped task that is still submitting moves on to `running`.
pub(crate) fn settle_stack(stack: &mut Vec<Task>) {
    while let Some(top) = stack.last() {
        let runtime = top.runtime();
        if !runtime.submit_done() && !runtime.status().is_terminal() {
            break;
        }
        if let Some(top) = stack.pop() {
            top.runtime()
                .transition_from(TaskStatus::Submitting, TaskStatus::Running);
        }
    }
}

/// Exclusive hardware resources and the tasks holding them.
#[derive(Default)]
pub(crate) struct ResourceTable {
    holders: HashMap<ResourceName, Task>,
}

impl ResourceTable {
    /// Acquire every resource of `task`, or none.
    ///
    /// A resource held by an ancestor of `task` counts as available and stays
    /// with the ancestor.
    pub fn try_acquire(&mut self, task: &Task) -> bool {
        let resources = &task.definition().resources;
        let available = resources.iter().all(|name| match self.holders.get(name) {
            None => true,
            Some(holder) => holder.ptr_eq(task) || task.is_nested_in(holder),
        });
        if !available {
            return false;
        }
        for name in resources {
            self.holders
                .entry(name.clone())
                .or_insert_with(|| task.clone());
        }
        true
    }

    pub fn release(&mut self, task: &Task) {
        self.holders.retain(|_, holder| !holder.ptr_eq(task));
    }

    pub fn holder(&self, name: &str) -> Option<TaskId> {
        self.holders.get(name).and_then(Task::id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    use crate::error::CompileError;
    use crate::program::CompiledStep;
    use crate::sweep::{Sweep, SweepPoint, SweepSource};
    use crate::task::{CompileContext, Experiment, TaskDefinition};

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
    fn test_pick_follows_dispatch_order() {
        let mut queue = PendingQueue::default();
        queue.push(Task::new(def("later").at(Utc::now() + Duration::seconds(30))));
        queue.push(Task::new(def("low").priority(5)));
        queue.push(Task::new(def("high").priority(1)));
        queue.push(Task::new(def("high-second").priority(1)));

        let names: Vec<_> = std::iter::from_fn(|| queue.pick(|_| true))
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["high", "high-second", "low", "later"]);
    }

    #[test]
    fn test_pick_skips_ineligible() {
        let mut queue = PendingQueue::default();
        queue.push(Task::new(def("a").priority(1)));
        queue.push(Task::new(def("b").priority(2)));

        let picked = queue.pick(|t| t.name().as_str() == "b").unwrap();
        assert_eq!(picked.name().as_str(), "b");
        assert_eq!(queue.len(), 1);
        assert!(queue.pick(|_| false).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_prune_and_remove() {
        let mut queue = PendingQueue::default();
        let dead = Task::new(def("dead"));
        let alive = Task::new(def("alive"));
        queue.push(dead.clone());
        queue.push(alive.clone());

        dead.runtime().transition(TaskStatus::Cancelled);
        queue.prune_terminal();
        assert_eq!(queue.len(), 1);
        assert!(queue.remove(&alive));
        assert!(!queue.remove(&alive));
    }

    #[test]
    fn test_settle_stack_pops_done_submitters() {
        let parent = Task::new(def("parent"));
        let child = Task::new(def("child").contained_by(&parent));
        for task in [&parent, &child] {
            task.runtime().transition(TaskStatus::Compiling);
            task.runtime().transition(TaskStatus::Submitting);
        }
        let mut stack = vec![parent.clone(), child.clone()];

        parent.runtime().mark_submit_done();
        settle_stack(&mut stack);
        assert_eq!(stack.len(), 2);

        child.runtime().mark_submit_done();
        settle_stack(&mut stack);
        assert!(stack.is_empty());
        assert_eq!(parent.status(), TaskStatus::Running);
        assert_eq!(child.status(), TaskStatus::Running);
    }

    #[test]
    fn test_resources_shared_with_descendants_only() {
        let mut table = ResourceTable::default();
        let parent = Task::new(def("parent").resource("AWG1.CH1"));
        let child = Task::new(def("child").contained_by(&parent).resource("AWG1.CH1"));
        let other = Task::new(def("other").resource("AWG1.CH1"));

        assert!(table.try_acquire(&parent));
        assert!(table.try_acquire(&child));
        assert!(!table.try_acquire(&other));

        table.release(&child);
        assert!(!table.try_acquire(&other));
        table.release(&parent);
        assert!(table.try_acquire(&other));
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let mut table = ResourceTable::default();
        let holder = Task::new(def("holder").resource("B"));
        let both = Task::new(def("both").resource("A").resource("B"));
        assert!(table.try_acquire(&holder));
        assert!(!table.try_acquire(&both));

        let only_a = Task::new(def("only-a").resource("A"));
        assert!(table.try_acquire(&only_a));
    }
}
