// src/queue/actions.rs

//! Queue actions: small rules evaluated after every run.
//!
//! A rule pairs a condition such as `Ar40 > 10` with an action. `repeat`
//! re-inserts the finished run at the head of the queue until it has been
//! repeated `nrepeat` times, then cancels the queue; `cancel` aborts at once.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::Deserialize;

use crate::errors::{ExprunError, Result};
use crate::run::RunState;
use crate::types::AnalysisType;

const CONDITION_PATTERN: &str =
    r"^\s*([A-Za-z][A-Za-z0-9_]*)\s*(<=|>=|==|!=|<|>)\s*(-?[0-9]+(?:\.[0-9]*)?(?:[eE][-+]?[0-9]+)?)\s*$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Repeat,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Comparator::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

/// `<attribute> <comparator> <value>`, where the attribute names an isotope
/// of the run's baseline-corrected signals.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attr: String,
    pub comparator: Comparator,
    pub value: f64,
}

impl FromStr for Condition {
    type Err = ExprunError;

    fn from_str(s: &str) -> Result<Self> {
        let re = Regex::new(CONDITION_PATTERN)
            .map_err(|e| ExprunError::QueueError(format!("condition pattern: {e}")))?;
        let caps = re.captures(s).ok_or_else(|| {
            ExprunError::QueueError(format!("invalid action condition: {s:?}"))
        })?;
        let comparator = match &caps[2] {
            "<" => Comparator::Lt,
            "<=" => Comparator::Le,
            ">" => Comparator::Gt,
            ">=" => Comparator::Ge,
            "==" => Comparator::Eq,
            _ => Comparator::Ne,
        };
        let value = caps[3]
            .parse()
            .map_err(|e| ExprunError::QueueError(format!("invalid value in {s:?}: {e}")))?;
        Ok(Self {
            attr: caps[1].to_string(),
            comparator,
            value,
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.attr, self.comparator.as_str(), self.value)
    }
}

impl Condition {
    pub fn matches(&self, signals: &BTreeMap<String, f64>) -> bool {
        signals
            .get(&self.attr)
            .is_some_and(|v| self.comparator.apply(*v, self.value))
    }
}

/// `[[action]]` table of a queue file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueActionConfig {
    pub action: ActionKind,
    pub condition: String,
    #[serde(default)]
    pub analysis_type: Option<AnalysisType>,
    #[serde(default = "default_nrepeat")]
    pub nrepeat: u32,
}

fn default_nrepeat() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct QueueAction {
    pub action: ActionKind,
    pub condition: Condition,
    /// Only runs of this type trigger the action.
    pub analysis_type: Option<AnalysisType>,
    pub nrepeat: u32,
    /// Repeats performed so far.
    pub count: u32,
}

impl TryFrom<QueueActionConfig> for QueueAction {
    type Error = ExprunError;

    fn try_from(cfg: QueueActionConfig) -> Result<Self> {
        if cfg.action == ActionKind::Repeat && cfg.nrepeat == 0 {
            return Err(ExprunError::QueueError(
                "repeat action needs nrepeat >= 1".into(),
            ));
        }
        Ok(Self {
            action: cfg.action,
            condition: cfg.condition.parse()?,
            analysis_type: cfg.analysis_type,
            nrepeat: cfg.nrepeat,
            count: 0,
        })
    }
}

impl QueueAction {
    /// Whether a finished run triggers this action.
    ///
    /// Only runs that produced data (`success` or `truncated`) are checked.
    pub fn check_run(
        &self,
        analysis_type: AnalysisType,
        state: RunState,
        signals: &BTreeMap<String, f64>,
    ) -> bool {
        if !matches!(state, RunState::Success | RunState::Truncated) {
            return false;
        }
        if self.analysis_type.is_some_and(|t| t != analysis_type) {
            return false;
        }
        self.condition.matches(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(ar40: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("Ar40".to_string(), ar40)])
    }

    #[test]
    fn parses_conditions() {
        let c: Condition = "Ar40 >= 10.5".parse().unwrap();
        assert_eq!(c.attr, "Ar40");
        assert_eq!(c.comparator, Comparator::Ge);
        assert_eq!(c.value, 10.5);
        assert_eq!(c.to_string(), "Ar40 >= 10.5");

        assert!("Ar40 >> 3".parse::<Condition>().is_err());
        assert!("> 3".parse::<Condition>().is_err());
    }

    #[test]
    fn missing_attribute_never_matches() {
        let c: Condition = "Ar36 < 100".parse().unwrap();
        assert!(!c.matches(&signals(1.0)));
    }

    #[test]
    fn check_run_filters_state_and_type() {
        let action = QueueAction::try_from(QueueActionConfig {
            action: ActionKind::Repeat,
            condition: "Ar40 > 10".into(),
            analysis_type: Some(AnalysisType::Unknown),
            nrepeat: 2,
        })
        .unwrap();

        assert!(action.check_run(AnalysisType::Unknown, RunState::Success, &signals(20.0)));
        assert!(!action.check_run(AnalysisType::Unknown, RunState::Success, &signals(5.0)));
        assert!(!action.check_run(AnalysisType::Unknown, RunState::Failed, &signals(20.0)));
        assert!(!action.check_run(AnalysisType::Air, RunState::Success, &signals(20.0)));
    }

    #[test]
    fn repeat_needs_at_least_one_repetition() {
        let cfg = QueueActionConfig {
            action: ActionKind::Repeat,
            condition: "Ar40 > 10".into(),
            analysis_type: None,
            nrepeat: 0,
        };
        assert!(QueueAction::try_from(cfg).is_err());
    }
}
