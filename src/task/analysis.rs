use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Score of an analysis that accepts the measured result.
pub const ACCEPTED_SCORE: i32 = 100;

/// Verdict of a task's analysis over its results.
///
/// A negative score means the result could not be judged at all; maintenance
/// then retries without running dependency calibrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub score: i32,
    /// Dotted configuration keys and their new values.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl AnalysisOutcome {
    pub fn accepted() -> Self {
        Self {
            score: ACCEPTED_SCORE,
            status: "ok".to_string(),
            ..Self::default()
        }
    }

    pub fn rejected(score: i32, message: impl Into<String>) -> Self {
        Self {
            score,
            status: "rejected".to_string(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn is_accepted(&self) -> bool {
        self.score == ACCEPTED_SCORE
    }

    /// Whether a failed attempt is worth recalibrating dependencies for.
    pub fn is_judged(&self) -> bool {
        self.score >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_acceptance() {
        let ok = AnalysisOutcome::accepted().with_parameter("Q1.setting.LO", 4.4e9);
        assert!(ok.is_accepted());
        assert_eq!(ok.parameters.get("Q1.setting.LO"), Some(&json!(4.4e9)));

        let bad = AnalysisOutcome::rejected(40, "fit diverged");
        assert!(!bad.is_accepted());
        assert!(bad.is_judged());
        assert!(!AnalysisOutcome::rejected(-1, "no data").is_judged());
    }
}
