//! Parameter sweeps over named experiment axes.
//!
//! A [`Sweep`] is a Cartesian product of axis groups; axes inside one group
//! advance together (zip). The last group varies fastest. Feedback-driven
//! experiments implement [`SweepSource`] directly (or use [`from_fn`]) to pick
//! the next point from results measured so far.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::StepResult;

/// One combination of axis values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Position inside each axis group.
    pub index: Vec<usize>,
    /// Axis name and value, in axis declaration order.
    pub values: Vec<(String, Value)>,
}

impl SweepPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, axis: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((axis.into(), value.into()));
        self
    }

    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value)
    }

    pub fn get_f64(&self, axis: &str) -> Option<f64> {
        self.get(axis).and_then(Value::as_f64)
    }
}

/// Hardware results available to a sweep when it picks its next point.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    pub results: Vec<StepResult>,
}

impl Feedback {
    pub fn last(&self) -> Option<&StepResult> {
        self.results.last()
    }
}

/// Lazy, finite producer of sweep points.
pub trait SweepSource: Send {
    fn next_point(&mut self, feedback: &Feedback) -> Option<SweepPoint>;
}

#[derive(Debug, Clone)]
struct Axis {
    name: String,
    values: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
struct AxisGroup {
    axes: Vec<Axis>,
}

impl AxisGroup {
    fn len(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).min().unwrap_or(0)
    }
}

/// Product-of-zips sweep.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    groups: Vec<AxisGroup>,
    cursor: Vec<usize>,
    exhausted: bool,
}

impl Sweep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new product dimension.
    pub fn axis<V: Into<Value>>(mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.groups.push(AxisGroup {
            axes: vec![Axis {
                name: name.into(),
                values: values.into_iter().map(Into::into).collect(),
            }],
        });
        self.cursor.push(0);
        self
    }

    /// Zip an axis with the most recently added dimension. Starts a new
    /// dimension when there is none yet. The group is truncated to its
    /// shortest axis.
    pub fn zip_axis<V: Into<Value>>(mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let axis = Axis {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        };
        match self.groups.last_mut() {
            Some(group) => group.axes.push(axis),
            None => {
                self.groups.push(AxisGroup { axes: vec![axis] });
                self.cursor.push(0);
            }
        }
        self
    }

    /// Total number of points.
    pub fn len(&self) -> usize {
        self.groups.iter().map(AxisGroup::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> SweepPoint {
        let mut point = SweepPoint {
            index: self.cursor.clone(),
            values: Vec::new(),
        };
        for (group, &i) in self.groups.iter().zip(&self.cursor) {
            for axis in &group.axes {
                point.values.push((axis.name.clone(), axis.values[i].clone()));
            }
        }
        point
    }

    fn advance(&mut self) {
        for g in (0..self.groups.len()).rev() {
            self.cursor[g] += 1;
            if self.cursor[g] < self.groups[g].len() {
                return;
            }
            self.cursor[g] = 0;
        }
        self.exhausted = true;
    }
}

impl Iterator for Sweep {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<SweepPoint> {
        if self.exhausted || self.is_empty() {
            return None;
        }
        let point = self.current();
        self.advance();
        Some(point)
    }
}

impl SweepSource for Sweep {
    fn next_point(&mut self, _feedback: &Feedback) -> Option<SweepPoint> {
        self.next()
    }
}

/// Sweep driven by a closure over the feedback seen so far.
pub struct FnSweep<F>(F);

impl<F> SweepSource for FnSweep<F>
where
    F: FnMut(&Feedback) -> Option<SweepPoint> + Send,
{
    fn next_point(&mut self, feedback: &Feedback) -> Option<SweepPoint> {
        (self.0)(feedback)
    }
}

pub fn from_fn<F>(f: F) -> FnSweep<F>
where
    F: FnMut(&Feedback) -> Option<SweepPoint> + Send,
{
    FnSweep(f)
}
