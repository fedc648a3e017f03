//! Pure-software executor.
//!
//! Writes are applied to an in-memory settings map and every fed step
//! completes immediately with one [`StepResult`]. Results can be held back to
//! imitate slow hardware, and every call is recorded for inspection.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::{Executor, FeedExtra, StepResult, StepSlot};
use crate::program::{Command, CommandValue};
use crate::types::{Address, TaskId};

/// Computes the data of one step from its commands and the current settings.
pub type Responder =
    dyn Fn(TaskId, usize, &[Command], &BTreeMap<Address, CommandValue>) -> Value + Send + Sync;

/// One recorded `feed` call.
#[derive(Debug, Clone)]
pub struct FeedRecord {
    pub task_id: TaskId,
    pub slot: StepSlot,
    pub commands: Vec<Command>,
    pub extra: FeedExtra,
}

#[derive(Default)]
struct SimState {
    feeds: Vec<FeedRecord>,
    frees: HashMap<TaskId, usize>,
    results: HashMap<TaskId, Vec<StepResult>>,
    held: HashMap<TaskId, Vec<StepResult>>,
    settings: BTreeMap<Address, CommandValue>,
    cancels: usize,
    saved: Vec<(TaskId, PathBuf)>,
}

pub struct SimulatedExecutor {
    state: Mutex<SimState>,
    responder: Option<Box<Responder>>,
    hold_results: AtomicBool,
    fail_fetch: AtomicBool,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            responder: None,
            hold_results: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(TaskId, usize, &[Command], &BTreeMap<Address, CommandValue>) -> Value
            + Send
            + Sync
            + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep completed results invisible to `fetch` until released.
    pub fn hold_results(&self, hold: bool) {
        self.hold_results.store(hold, Ordering::SeqCst);
        if !hold {
            let mut state = self.lock();
            let held: Vec<_> = state.held.drain().collect();
            for (task_id, results) in held {
                state.results.entry(task_id).or_default().extend(results);
            }
        }
    }

    /// Make every subsequent `fetch` fail.
    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn feeds(&self) -> Vec<FeedRecord> {
        self.lock().feeds.clone()
    }

    pub fn feeds_for(&self, task_id: TaskId) -> Vec<FeedRecord> {
        self.lock()
            .feeds
            .iter()
            .filter(|f| f.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn free_count(&self, task_id: TaskId) -> usize {
        self.lock().frees.get(&task_id).copied().unwrap_or(0)
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancels
    }

    pub fn setting(&self, address: &str) -> Option<CommandValue> {
        self.lock().settings.get(address).cloned()
    }

    pub fn saved(&self) -> Vec<(TaskId, PathBuf)> {
        self.lock().saved.clone()
    }

    fn respond(
        &self,
        task_id: TaskId,
        step: usize,
        commands: &[Command],
        settings: &BTreeMap<Address, CommandValue>,
    ) -> Value {
        match &self.responder {
            Some(responder) => responder(task_id, step, commands, settings),
            None => {
                let reads: Vec<&str> = commands
                    .iter()
                    .filter_map(|cmd| match cmd {
                        Command::Read { address } => Some(address.as_str()),
                        _ => None,
                    })
                    .collect();
                json!({ "step": step, "reads": reads })
            }
        }
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn feed(
        &self,
        task_id: TaskId,
        slot: StepSlot,
        commands: Vec<Command>,
        extra: FeedExtra,
    ) -> Result<bool> {
        debug!("Simulator feed task={} slot={} cmds={}", task_id, slot, commands.len());
        let mut state = self.lock();

        for cmd in &commands {
            if let Command::Write { address, value } = cmd {
                state.settings.insert(address.clone(), value.clone());
            }
        }

        if let StepSlot::Step(step) = slot {
            let data = self.respond(task_id, step, &commands, &state.settings);
            let result = StepResult::new(step, data);
            let target = if self.hold_results.load(Ordering::SeqCst) {
                &mut state.held
            } else {
                &mut state.results
            };
            target.entry(task_id).or_default().push(result);
        }

        state.feeds.push(FeedRecord {
            task_id,
            slot,
            commands,
            extra,
        });
        Ok(true)
    }

    async fn free(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.lock();
        *state.frees.entry(task_id).or_default() += 1;
        state.held.remove(&task_id);
        Ok(())
    }

    async fn fetch(&self, task_id: TaskId, skip: usize) -> Result<Vec<StepResult>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated fetch failure for task {}", task_id));
        }
        let state = self.lock();
        Ok(state
            .results
            .get(&task_id)
            .map(|results| results.iter().skip(skip).cloned().collect())
            .unwrap_or_default())
    }

    async fn save(&self, task_id: TaskId, path: &Path) -> Result<()> {
        let payload = {
            let state = self.lock();
            serde_json::to_vec_pretty(&state.results.get(&task_id).cloned().unwrap_or_default())?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, payload).await?;
        self.lock().saved.push((task_id, path.to_path_buf()));
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        let mut state = self.lock();
        state.cancels += 1;
        state.held.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_applies_writes_and_produces_results() {
        let sim = SimulatedExecutor::new();
        let id = TaskId::new(1);
        let cmds = vec![
            Command::write("PSG1.CH1.Output", CommandValue::setting("ON")),
            Command::read("AD1.CH1.IQ"),
        ];
        assert!(sim.feed(id, StepSlot::Step(0), cmds, FeedExtra::default()).await.unwrap());

        assert_eq!(sim.setting("PSG1.CH1.Output"), Some(CommandValue::setting("ON")));
        let results = sim.fetch(id, 0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data["reads"], json!(["AD1.CH1.IQ"]));
    }

    #[tokio::test]
    async fn test_reserved_slots_produce_no_results() {
        let sim = SimulatedExecutor::new();
        let id = TaskId::new(2);
        sim.feed(id, StepSlot::Cleanup, vec![], FeedExtra::default()).await.unwrap();
        sim.feed(id, StepSlot::Setup, vec![], FeedExtra::default()).await.unwrap();
        assert!(sim.fetch(id, 0).await.unwrap().is_empty());
        assert_eq!(sim.feeds_for(id).len(), 2);
    }

    #[tokio::test]
    async fn test_held_results_are_released() {
        let sim = SimulatedExecutor::new();
        let id = TaskId::new(3);
        sim.hold_results(true);
        sim.feed(id, StepSlot::Step(0), vec![], FeedExtra::default()).await.unwrap();
        assert!(sim.fetch(id, 0).await.unwrap().is_empty());

        sim.hold_results(false);
        assert_eq!(sim.fetch(id, 0).await.unwrap().len(), 1);
        assert!(sim.fetch(id, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_responder_and_save() {
        let sim = SimulatedExecutor::new().with_responder(|_, step, _, _| json!(step * 10));
        let id = TaskId::new(4);
        sim.feed(id, StepSlot::Step(0), vec![], FeedExtra::default()).await.unwrap();
        sim.feed(id, StepSlot::Step(1), vec![], FeedExtra::default()).await.unwrap();
        assert_eq!(sim.fetch(id, 1).await.unwrap()[0].data, json!(10));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4").join("raw.json");
        sim.save(id, &path).await.unwrap();
        assert!(path.exists());
        assert_eq!(sim.saved().len(), 1);
    }

    #[tokio::test]
    async fn test_free_is_counted() {
        let sim = SimulatedExecutor::new();
        let id = TaskId::new(5);
        sim.free(id).await.unwrap();
        sim.free(id).await.unwrap();
        assert_eq!(sim.free_count(id), 2);
        assert_eq!(sim.free_count(TaskId::new(6)), 0);
    }
}
