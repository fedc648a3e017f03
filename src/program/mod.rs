//! Compiled representation of a task's sweep.
//!
//! A [`Program`] is derived, never authored: the compile activity appends one
//! [`Step`] per sweep point and folds every hardware write into the
//! program-level [`SideEffects`] map so it can be undone after the task ends.

mod compiler;

pub use compiler::{CompileMode, SideEffects, StepCompiler};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::device::ConfigSnapshot;
use crate::sweep::SweepPoint;
use crate::types::Address;

/// Address suffix of the acquisition-mode setting on capture channels.
pub const CAPTURE_MODE_SUFFIX: &str = ".CaptureMode";

/// Waveform description understood by the executor.
///
/// Waveforms are carried as expressions (e.g. `"cos(2e6) * square(1e-6)"`);
/// sample synthesis belongs to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub expr: String,
}

impl Waveform {
    pub fn new(expr: impl Into<String>) -> Self {
        Self { expr: expr.into() }
    }

    /// The neutral output every waveform channel is restored to.
    pub fn zero() -> Self {
        Self::new("zero()")
    }

    pub fn is_zero(&self) -> bool {
        self.expr == "zero()"
    }
}

/// Value written to a hardware address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandValue {
    Setting(Value),
    Waveform(Waveform),
}

impl CommandValue {
    pub fn setting(value: impl Into<Value>) -> Self {
        Self::Setting(value.into())
    }

    pub fn is_waveform(&self) -> bool {
        matches!(self, Self::Waveform(_))
    }
}

/// Primitive instruction for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum Command {
    Read { address: Address },
    Write { address: Address, value: CommandValue },
    Trig { address: Address },
    Sync { delay: f64 },
}

impl Command {
    pub fn read(address: impl Into<Address>) -> Self {
        Self::Read {
            address: address.into(),
        }
    }

    pub fn write(address: impl Into<Address>, value: CommandValue) -> Self {
        Self::Write {
            address: address.into(),
            value,
        }
    }

    pub fn trig(address: impl Into<Address>) -> Self {
        Self::Trig {
            address: address.into(),
        }
    }

    pub fn sync(delay: f64) -> Self {
        Self::Sync { delay }
    }

    pub fn address(&self) -> Option<&Address> {
        match self {
            Self::Read { address } | Self::Write { address, .. } | Self::Trig { address } => {
                Some(address)
            }
            Self::Sync { .. } => None,
        }
    }

    /// Whether the command must be re-issued on every step even when the
    /// rest of the program is reused (reads, triggers, capture-mode writes).
    pub fn is_acquisition(&self) -> bool {
        match self {
            Self::Read { .. } | Self::Trig { .. } => true,
            Self::Write { address, .. } => address.as_str().ends_with(CAPTURE_MODE_SUFFIX),
            Self::Sync { .. } => false,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { address } => write!(f, "READ({})", address),
            Self::Write { address, value } => match value {
                CommandValue::Setting(v) => write!(f, "WRITE({}, {})", address, v),
                CommandValue::Waveform(w) => write!(f, "WRITE({}, {})", address, w.expr),
            },
            Self::Trig { address } => write!(f, "TRIG({})", address),
            Self::Sync { delay } => write!(f, "SYNC({})", delay),
        }
    }
}

/// Kind of data a step produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    #[default]
    State,
    Count,
    Diag,
    Iq,
    Trace,
}

impl Signal {
    /// Signal the executor should capture. Counts and diagnostics are derived
    /// from raw states after fetching, so the hardware only captures states.
    pub fn captured(self) -> Self {
        match self {
            Self::Count | Self::Diag => Self::State,
            other => other,
        }
    }
}

/// Maps logical measurements onto raw-result slots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataMap {
    pub signal: Signal,
    pub shots: u32,
    /// Logical measurement name -> raw result slot (capture address).
    pub slots: BTreeMap<String, Address>,
}

impl DataMap {
    pub fn new(signal: Signal, shots: u32) -> Self {
        Self {
            signal,
            shots,
            slots: BTreeMap::new(),
        }
    }

    pub fn slot(mut self, name: impl Into<String>, address: impl Into<Address>) -> Self {
        self.slots.insert(name.into(), address.into());
        self
    }

    /// Copy handed to the executor along with a step's commands.
    pub fn for_executor(&self) -> Self {
        Self {
            signal: self.signal.captured(),
            ..self.clone()
        }
    }
}

/// What a task's compile routine returns for one sweep point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledStep {
    pub commands: Vec<Command>,
    pub data_map: DataMap,
    /// Free-form compile-time context kept for provenance.
    #[serde(default)]
    pub context: Value,
}

impl CompiledStep {
    pub fn new(commands: Vec<Command>, data_map: DataMap) -> Self {
        Self {
            commands,
            data_map,
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// One compiled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub point: SweepPoint,
    pub commands: Vec<Command>,
    pub data_map: DataMap,
    #[serde(default)]
    pub context: Value,
}

/// The compiled program of one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub with_feedback: bool,
    pub mode: CompileMode,
    pub steps: Vec<Step>,
    pub side_effects: SideEffects,
    #[serde(default)]
    pub snapshot: ConfigSnapshot,
}

impl Program {
    pub fn new(with_feedback: bool, mode: CompileMode, snapshot: ConfigSnapshot) -> Self {
        Self {
            with_feedback,
            mode,
            steps: Vec::new(),
            side_effects: SideEffects::default(),
            snapshot,
        }
    }

    /// Append a compiled step and fold its writes into the side-effect map.
    pub fn push_step(&mut self, step: Step) {
        self.side_effects.fold(&step.commands, &self.snapshot);
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Explicit restore commands for every recorded side effect.
    pub fn restore_commands(&self) -> Vec<Command> {
        self.side_effects.restore_commands()
    }
}
