// Executor boundary: the only interface toward real or simulated hardware.

mod simulator;

pub use simulator::{FeedRecord, SimulatedExecutor};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

use crate::program::{Command, DataMap};
use crate::types::TaskId;

/// Where in a task's command stream a batch of commands belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepSlot {
    /// Out-of-band restore commands, executed after the last step.
    Cleanup,
    /// Out-of-band setup commands, executed outside the step sequence.
    Setup,
    Step(usize),
}

impl StepSlot {
    /// Wire index: -2 for cleanup, -1 for setup, the step number otherwise.
    pub fn index(self) -> i64 {
        match self {
            Self::Cleanup => -2,
            Self::Setup => -1,
            Self::Step(i) => i as i64,
        }
    }
}

impl fmt::Display for StepSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Extra information travelling with fed commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedExtra {
    pub data_map: Option<DataMap>,
}

/// Result of one completed step, as reported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub diagnostics: Option<Value>,
}

impl StepResult {
    pub fn new(step: usize, data: Value) -> Self {
        Self {
            step,
            data,
            diagnostics: None,
        }
    }
}

/// Subsystem that drives physical instruments given compiled commands.
///
/// The scheduler never calls `feed` concurrently for the same task id.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Enqueue commands for execution at `slot`. Returns whether the
    /// executor accepted the batch.
    async fn feed(
        &self,
        task_id: TaskId,
        slot: StepSlot,
        commands: Vec<Command>,
        extra: FeedExtra,
    ) -> Result<bool>;

    /// Release hardware resources reserved for a task. Idempotent.
    async fn free(&self, task_id: TaskId) -> Result<()>;

    /// Results of completed steps, starting at step `skip`.
    async fn fetch(&self, task_id: TaskId, skip: usize) -> Result<Vec<StepResult>>;

    /// Persist raw captured data for a task under `path`.
    async fn save(&self, task_id: TaskId, path: &Path) -> Result<()>;

    /// Abort all in-flight hardware work.
    async fn cancel(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_slot_indices() {
        assert_eq!(StepSlot::Cleanup.index(), -2);
        assert_eq!(StepSlot::Setup.index(), -1);
        assert_eq!(StepSlot::Step(7).index(), 7);
        assert_eq!(StepSlot::Step(3).to_string(), "3");
    }
}
