//! Step compilation strategies and side-effect bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::{Command, CommandValue, Step, Waveform};
use crate::device::ConfigSnapshot;
use crate::error::CompileError;
use crate::sweep::SweepPoint;
use crate::task::{CompileContext, Experiment};
use crate::types::Address;

/// How successive sweep points are turned into steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMode {
    /// Every step is compiled independently.
    #[default]
    Full,
    /// Only the first step is compiled; later steps re-issue its
    /// acquisition commands and share its data map.
    Once,
}

/// Hardware settings to restore once a task reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SideEffects(BTreeMap<Address, CommandValue>);

impl SideEffects {
    /// Record the restore value for every address first written by `commands`.
    ///
    /// Settings restore to their pre-task value from `snapshot` and are
    /// skipped when the snapshot has none. Waveform outputs always restore to
    /// [`Waveform::zero`].
    pub fn fold(&mut self, commands: &[Command], snapshot: &ConfigSnapshot) {
        for cmd in commands {
            let Command::Write { address, value } = cmd else {
                continue;
            };
            if self.0.contains_key(address) {
                continue;
            }
            if value.is_waveform() {
                self.0
                    .insert(address.clone(), CommandValue::Waveform(Waveform::zero()));
            } else if let Some(previous) = snapshot.query(address.as_str()) {
                self.0
                    .insert(address.clone(), CommandValue::Setting(previous.clone()));
            } else {
                debug!("No historical value for {}, not restorable", address);
            }
        }
    }

    pub fn get(&self, address: &str) -> Option<&CommandValue> {
        self.0.get(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn restore_commands(&self) -> Vec<Command> {
        self.0
            .iter()
            .map(|(address, value)| Command::write(address.clone(), value.clone()))
            .collect()
    }
}

/// Turns sweep points into steps according to a [`CompileMode`].
pub struct StepCompiler {
    mode: CompileMode,
    template: Option<Step>,
}

impl StepCompiler {
    pub fn new(mode: CompileMode) -> Self {
        Self {
            mode,
            template: None,
        }
    }

    pub fn mode(&self) -> CompileMode {
        self.mode
    }

    /// Compile one sweep point.
    ///
    /// In [`CompileMode::Once`] the experiment's compile routine only runs
    /// for the first point.
    pub async fn compile(
        &mut self,
        experiment: &dyn Experiment,
        point: SweepPoint,
        ctx: &CompileContext,
    ) -> Result<Step, CompileError> {
        if let (CompileMode::Once, Some(template)) = (self.mode, &self.template) {
            return Ok(Step {
                point,
                commands: template
                    .commands
                    .iter()
                    .filter(|cmd| cmd.is_acquisition())
                    .cloned()
                    .collect(),
                data_map: template.data_map.clone(),
                context: template.context.clone(),
            });
        }

        let compiled = experiment.compile_step(&point, ctx).await?;
        let step = Step {
            point,
            commands: compiled.commands,
            data_map: compiled.data_map,
            context: compiled.context,
        };
        if self.mode == CompileMode::Once {
            self.template = Some(step.clone());
        }
        Ok(step)
    }
}
