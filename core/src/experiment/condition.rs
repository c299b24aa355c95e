//! Metric-threshold conditions attached to an experiment.
//!
//! A condition watches one variable in the experiment's log output. Log
//! lines of the form `<variable> <value>` are compared against the
//! threshold; a match selects the condition's action. Conditions with a
//! `time N` gate stay silent until N minutes after the experiment started
//! running.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ExperimentError;

/// Comparison between the logged value and the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Comparator {
    Gt,
    Lt,
    Eq,
    Geq,
    Leq,
}

impl Comparator {
    /// Whether `value <op> threshold` holds.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Eq => value == threshold,
            Comparator::Geq => value >= threshold,
            Comparator::Leq => value <= threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Gt => "gt",
            Comparator::Lt => "lt",
            Comparator::Eq => "eq",
            Comparator::Geq => "geq",
            Comparator::Leq => "leq",
        }
    }
}

impl FromStr for Comparator {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "gt" => Ok(Comparator::Gt),
            "lt" => Ok(Comparator::Lt),
            "eq" => Ok(Comparator::Eq),
            "geq" => Ok(Comparator::Geq),
            "leq" => Ok(Comparator::Leq),
            other => Err(ExperimentError::UnknownComparator(other.to_string())),
        }
    }
}

impl TryFrom<String> for Comparator {
    type Error = ExperimentError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Comparator> for String {
    fn from(c: Comparator) -> String {
        c.as_str().to_string()
    }
}

/// When a condition starts being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeGate {
    Immediately,
    /// Inactive until this many minutes after entering `running`.
    After { minutes: f64 },
}

impl FromStr for TimeGate {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "immediately" {
            return Ok(TimeGate::Immediately);
        }
        let mut parts = trimmed.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("time"), Some(n), None) => match n.parse::<f64>() {
                Ok(minutes) if minutes.is_finite() && minutes >= 0.0 => Ok(TimeGate::After { minutes }),
                _ => Err(ExperimentError::BadTimeGate(s.to_string())),
            },
            _ => Err(ExperimentError::BadTimeGate(s.to_string())),
        }
    }
}

impl TryFrom<String> for TimeGate {
    type Error = ExperimentError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeGate> for String {
    fn from(g: TimeGate) -> String {
        g.to_string()
    }
}

impl fmt::Display for TimeGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeGate::Immediately => write!(f, "immediately"),
            TimeGate::After { minutes } => write!(f, "time {}", minutes),
        }
    }
}

/// What a matching condition asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConditionAction {
    NoAction,
    Warn,
    Kill,
    Email,
}

impl ConditionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionAction::NoAction => "no action",
            ConditionAction::Warn => "warn",
            ConditionAction::Kill => "kill",
            ConditionAction::Email => "email",
        }
    }
}

impl FromStr for ConditionAction {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no action" => Ok(ConditionAction::NoAction),
            "warn" => Ok(ConditionAction::Warn),
            "kill" => Ok(ConditionAction::Kill),
            "email" => Ok(ConditionAction::Email),
            other => Err(ExperimentError::UnknownAction(other.to_string())),
        }
    }
}

impl TryFrom<String> for ConditionAction {
    type Error = ExperimentError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConditionAction> for String {
    fn from(a: ConditionAction) -> String {
        a.as_str().to_string()
    }
}

impl fmt::Display for ConditionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub name: String,
    pub variable: String,
    pub threshold: f64,
    pub comparator: Comparator,
    #[serde(default = "immediately")]
    pub when: TimeGate,
    pub action: ConditionAction,
    /// Set each time the owning experiment enters `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
}

fn immediately() -> TimeGate {
    TimeGate::Immediately
}

impl Condition {
    /// Reset the time gate's reference point.
    pub fn arm(&mut self, now_ms: u64) {
        self.start_time_ms = Some(now_ms);
    }

    /// Whether the time gate has opened. A gated condition that was never
    /// armed is closed.
    pub fn is_active(&self, now_ms: u64) -> bool {
        match self.when {
            TimeGate::Immediately => true,
            TimeGate::After { minutes } => match self.start_time_ms {
                Some(start) => {
                    let elapsed_min = now_ms.saturating_sub(start) as f64 / 60_000.0;
                    elapsed_min >= minutes
                }
                None => false,
            },
        }
    }

    /// Evaluate one log line. Anything that does not parse, names another
    /// variable, or falls before the time gate is `NoAction`.
    pub fn get_action(&self, line: &str, now_ms: u64) -> ConditionAction {
        let (variable, value) = match parse_metric(line) {
            Some(metric) => metric,
            None => return ConditionAction::NoAction,
        };
        if variable != self.variable || !self.is_active(now_ms) {
            return ConditionAction::NoAction;
        }
        if self.comparator.holds(value, self.threshold) {
            self.action
        } else {
            ConditionAction::NoAction
        }
    }
}

/// Split `<variable><whitespace><value>` into its parts. Lines with any
/// other shape, or a value that is not a number, yield `None`.
pub fn parse_metric(line: &str) -> Option<(&str, f64)> {
    let mut parts = line.split_whitespace();
    let variable = parts.next()?;
    let raw = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let value = raw.parse::<f64>().ok()?;
    if value.is_nan() {
        return None;
    }
    Some((variable, value))
}

/// Aggregate result of all conditions on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: ConditionAction,
    /// Name of the condition that produced `action`.
    pub condition: Option<String>,
}

impl Verdict {
    pub fn none() -> Verdict {
        Verdict {
            action: ConditionAction::NoAction,
            condition: None,
        }
    }
}

/// Evaluate every condition against `line`. The first non-`NoAction`
/// result is kept, but a `Kill` from any condition wins immediately.
pub fn evaluate(conditions: &[Condition], line: &str, now_ms: u64) -> Verdict {
    let mut verdict = Verdict::none();
    for condition in conditions {
        match condition.get_action(line, now_ms) {
            ConditionAction::NoAction => {}
            ConditionAction::Kill => {
                return Verdict {
                    action: ConditionAction::Kill,
                    condition: Some(condition.name.clone()),
                };
            }
            action if verdict.action == ConditionAction::NoAction => {
                verdict = Verdict {
                    action,
                    condition: Some(condition.name.clone()),
                };
            }
            _ => {}
        }
    }
    verdict
}
