//! Experiment entity: definition, lifecycle history, warnings.
//!
//! ```text
//! defined -> submitted -> submitted_to_kid -> running -> finished
//!                                                     -> terminated
//!                                                     -> lost
//! ```
//!
//! History is append-only. Re-entering the current state is a no-op, and
//! the first terminal state wins: nothing is appended after it.

pub mod condition;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ExperimentError;
use crate::rpc::query::now_ms;

pub use condition::{Condition, ConditionAction, Comparator, TimeGate, Verdict};


// ---------------------------------------------------------------------------
// ExperimentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Defined,
    Submitted,
    SubmittedToKid,
    Running,
    Finished,
    Terminated,
    Lost,
}


impl ExperimentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentState::Finished | ExperimentState::Terminated | ExperimentState::Lost
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentState::Defined => "defined",
            ExperimentState::Submitted => "submitted",
            ExperimentState::SubmittedToKid => "submitted_to_kid",
            ExperimentState::Running => "running",
            ExperimentState::Finished => "finished",
            ExperimentState::Terminated => "terminated",
            ExperimentState::Lost => "lost",
        }
    }
}


impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateEntry {
    pub state: ExperimentState,
    pub at_ms: u64,
}


/// A warn/email verdict, or an error the worker agent reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarningRecord {
    pub at_ms: u64,
    pub condition: String,
    pub action: ConditionAction,
    pub line: String,
}


// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

fn default_parameter_format() -> String {
    "--{name} {value}".to_string()
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    pub id: String,
    /// Template with `{code}` and `{params}` placeholders.
    pub run_command: String,
    #[serde(default)]
    pub code_file: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// How one parameter renders into `{params}`; `{name}` and `{value}`.
    #[serde(default = "default_parameter_format")]
    pub parameter_format: String,
    #[serde(default)]
    pub required_files: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub collection: Option<String>,
    /// Node the experiment is assigned to.
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub created_ms: u64,
    #[serde(default)]
    pub modified_ms: u64,
    #[serde(default)]
    pub states: Vec<StateEntry>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub warnings: Vec<WarningRecord>,
}


impl Experiment {
    pub fn new(id: &str, run_command: &str) -> Experiment {
        let now = now_ms();
        Experiment {
            id: id.to_string(),
            run_command: run_command.to_string(),
            code_file: None,
            parameters: BTreeMap::new(),
            parameter_format: default_parameter_format(),
            required_files: Vec::new(),
            outputs: Vec::new(),
            collection: None,
            cluster: None,
            created_ms: now,
            modified_ms: now,
            states: vec![StateEntry {
                state: ExperimentState::Defined,
                at_ms: now,
            }],
            conditions: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Parse a YAML definition. Unknown fields are rejected; a definition
    /// without history starts out `defined`.
    pub fn from_yaml(content: &str, path: &Path) -> Result<Experiment, ExperimentError> {
        let mut exp: Experiment = serde_yaml::from_str(content).map_err(|e| ExperimentError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        exp.normalize();
        exp.validate().map_err(|message| ExperimentError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(exp)
    }

    /// Load every `*.yaml` / `*.yml` definition in `folder`, sorted by path.
    pub fn load_folder(folder: &Path) -> Result<Vec<Experiment>, ExperimentError> {
        let io_err = |source| ExperimentError::Io {
            path: folder.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(folder)
            .map_err(io_err)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
            })
            .collect();
        paths.sort();

        let mut experiments = Vec::with_capacity(paths.len());
        let mut seen = BTreeSet::new();
        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|source| ExperimentError::Io {
                path: path.clone(),
                source,
            })?;
            let exp = Experiment::from_yaml(&content, &path)?;
            if !seen.insert(exp.id.clone()) {
                return Err(ExperimentError::Parse {
                    path,
                    message: format!("duplicate experiment id '{}'", exp.id),
                });
            }
            experiments.push(exp);
        }
        Ok(experiments)
    }

    /// Fill in timestamps and the initial state for definitions that
    /// carry none.
    pub fn normalize(&mut self) {
        let now = now_ms();
        if self.created_ms == 0 {
            self.created_ms = now;
        }
        if self.modified_ms == 0 {
            self.modified_ms = self.created_ms;
        }
        if self.states.is_empty() {
            self.states.push(StateEntry {
                state: ExperimentState::Defined,
                at_ms: self.created_ms,
            });
        }
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("experiment id is empty".into());
        }
        if self.id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(format!("experiment id '{}' contains whitespace or '/'", self.id));
        }
        if self.run_command.trim().is_empty() {
            return Err(format!("experiment '{}' has an empty run_command", self.id));
        }
        let mut names = BTreeSet::new();
        for c in &self.conditions {
            if !names.insert(c.name.as_str()) {
                return Err(format!("duplicate condition name '{}'", c.name));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ExperimentState {
        self.states
            .last()
            .map(|e| e.state)
            .unwrap_or(ExperimentState::Defined)
    }

    /// Append `state` to the history. Returns false (and changes nothing)
    /// when it is already the current state or a terminal state was
    /// reached earlier. Entering `running` arms every condition's time gate.
    pub fn update_state(&mut self, state: ExperimentState, now_ms: u64) -> bool {
        let current = self.state();
        if current == state || current.is_terminal() {
            return false;
        }
        self.states.push(StateEntry { state, at_ms: now_ms });
        self.modified_ms = now_ms;
        if state == ExperimentState::Running {
            for c in &mut self.conditions {
                c.arm(now_ms);
            }
        }
        true
    }

    /// Run the condition engine over one log line. Warn and email verdicts
    /// are recorded here; acting on kill is left to the owner.
    pub fn observe(&mut self, line: &str, now_ms: u64) -> Verdict {
        let verdict = condition::evaluate(&self.conditions, line, now_ms);
        match verdict.action {
            ConditionAction::Warn | ConditionAction::Email => {
                let name = verdict.condition.clone().unwrap_or_default();
                self.add_warning(&name, verdict.action, line, now_ms);
            }
            ConditionAction::Kill | ConditionAction::NoAction => {}
        }
        verdict
    }

    pub fn add_warning(&mut self, condition: &str, action: ConditionAction, line: &str, now_ms: u64) {
        self.warnings.push(WarningRecord {
            at_ms: now_ms,
            condition: condition.to_string(),
            action,
            line: line.trim_end().to_string(),
        });
        self.modified_ms = now_ms;
    }

    /// The shell command to run: `run_command` with `{code}` and `{params}`
    /// expanded. Parameters render in key order, space-joined.
    pub fn command(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, value)| {
                self.parameter_format
                    .replace("{name}", name)
                    .replace("{value}", &render_value(value))
            })
            .collect();
        self.run_command
            .replace("{code}", self.code_file.as_deref().unwrap_or(""))
            .replace("{params}", &params.join(" "))
            .trim()
            .to_string()
    }
}


fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
