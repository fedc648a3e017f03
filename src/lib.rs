// Core modules
pub mod auth;
mod config;
pub mod db;
pub mod device;
mod error;
pub mod executor;
pub mod program;
pub mod sweep;
pub mod task;
mod types;

// Scheduling
pub mod scheduler;
mod session;

// Re-export key types and functions
pub use config::SchedulerConfig;
pub use db::{DatabaseConfig, TaskRecord, UserRecord, create_connection, ensure_schema};
pub use device::{ConfigSnapshot, DeviceConfig};
pub use error::{CompileError, SchedulerError, SchedulerResult};
pub use executor::{Executor, FeedExtra, SimulatedExecutor, StepResult, StepSlot};
pub use program::{Command, CommandValue, CompileMode, CompiledStep, DataMap, Program, Signal};
pub use scheduler::{Maintained, Scheduler, SubmitOptions};
pub use session::Terminal;
pub use sweep::{Feedback, Sweep, SweepPoint, SweepSource};
pub use task::{
    AnalysisOutcome, CompileContext, Experiment, Schedule, Task, TaskDefinition, TaskResult,
    TaskStatus,
};
pub use types::{Address, ResourceName, TaskId, TaskName};

use anyhow::Result;
use std::sync::Arc;

/// Convenience function to start a scheduler on the pure-software executor.
///
/// Returns the executor handle as well so callers can inspect what was fed.
pub async fn create_simulated_scheduler(
    device: DeviceConfig,
    config: SchedulerConfig,
) -> Result<(Scheduler, Arc<SimulatedExecutor>)> {
    let executor = Arc::new(SimulatedExecutor::new());
    let scheduler = Scheduler::bootstrap(executor.clone(), device, config).await?;
    Ok((scheduler, executor))
}
