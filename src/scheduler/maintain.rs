//! Calibration loop: run, analyze, recalibrate dependencies, retry.

use std::future::Future;
use std::pin::Pin;
use tracing::{info, warn};

use super::Scheduler;
use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{AnalysisOutcome, Task, TaskDefinition, TaskStatus};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An accepted maintenance run.
#[derive(Debug, Clone)]
pub struct Maintained {
    pub task: Task,
    pub outcome: AnalysisOutcome,
    pub attempts: u32,
}

impl Scheduler {
    /// Run `definition` until its analysis accepts the result, at most
    /// `budget` times.
    ///
    /// An accepted run commits its parameters into the shared configuration.
    /// After a judged rejection every calibration the experiment declares is
    /// maintained first, with one attempt less of budget.
    pub fn maintain(
        &self,
        definition: TaskDefinition,
        budget: u32,
    ) -> BoxFuture<'_, SchedulerResult<Maintained>> {
        Box::pin(async move {
            let mut last_score = -1;
            for attempt in 1..=budget {
                let task = self.create_task(definition.clone());
                self.submit(&task).await?;
                let status = task.join().await;

                let outcome = if status == TaskStatus::Finished {
                    definition.experiment.analyze(&task.result())
                } else {
                    let reason = task
                        .execution_error()
                        .map_or_else(|| status.to_string(), |e| e.to_string());
                    AnalysisOutcome::rejected(-1, reason)
                };
                info!(
                    "Maintenance of {} attempt {}/{}: score {} ({})",
                    definition.name, attempt, budget, outcome.score, outcome.message
                );

                if outcome.is_accepted() {
                    self.update_parameters(outcome.parameters.clone()).await?;
                    return Ok(Maintained {
                        task,
                        outcome,
                        attempts: attempt,
                    });
                }
                last_score = outcome.score;

                if outcome.is_judged() && attempt < budget {
                    for calibration in definition.experiment.calibrations() {
                        let name = calibration.name.clone();
                        if let Err(e) = self.maintain(calibration, budget - 1).await {
                            warn!("Calibration {} for {} did not converge: {}", name, definition.name, e);
                        }
                    }
                }
            }

            Err(SchedulerError::CalibrationExhausted {
                task: definition.name,
                attempts: budget,
                last_score,
            })
        })
    }
}
