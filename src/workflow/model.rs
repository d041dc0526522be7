//! Workflow Data Model
//!
//! Core data structures representing a CI workflow definition: its
//! triggers, jobs, matrix strategy, and ordered steps.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: Python package
//! on: [push]
//! jobs:
//!   build:
//!     runs-on: ubuntu-latest
//!     strategy:
//!       matrix:
//!         python-version: ["3.10"]
//!     steps:
//!       - uses: actions/checkout@v4
//!       - name: Set up Python ${{ matrix.python-version }}
//!         uses: actions/setup-python@v5
//!         with:
//!           python-version: ${{ matrix.python-version }}
//!       - name: Install dependencies
//!         run: |
//!           python -m pip install --upgrade pip
//!           if [ -f requirements.txt ]; then pip install -r requirements.txt; fi
//!       - name: Test
//!         run: pytest
//! ```

use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use super::matrix::Matrix;
use super::triggers::Triggers;

/// Ordered string map used for `env` and `with` blocks.
pub type EnvMap = IndexMap<String, String>;

/// One concrete matrix combination (axis name -> value).
pub type MatrixValues = IndexMap<String, Value>;

/// A complete workflow definition.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Workflow {
    /// Display name of the workflow
    #[serde(default)]
    pub name: Option<String>,

    /// Events that start a run
    #[serde(rename = "on", default)]
    pub triggers: Triggers,

    /// Environment shared by every job
    #[serde(default, deserialize_with = "scalar_map")]
    pub env: EnvMap,

    /// Jobs in declaration order
    #[serde(default)]
    pub jobs: IndexMap<String, Job>,
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the workflow name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an event (without filters) to the trigger set.
    pub fn on(mut self, event: impl Into<String>) -> Self {
        self.triggers.add_event(event);
        self
    }

    /// Adds a job under the given id.
    pub fn with_job(mut self, id: impl Into<String>, job: Job) -> Self {
        self.jobs.insert(id.into(), job);
        self
    }

    /// Gets a job by id.
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Returns the workflow name, or `fallback` when it has none.
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(fallback)
    }

    /// Total number of steps across all jobs.
    pub fn step_count(&self) -> usize {
        self.jobs.values().map(|job| job.steps.len()).sum()
    }
}

/// A job: an ordered list of steps run on one platform label.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    #[serde(default)]
    pub name: Option<String>,

    /// Target platform label(s), e.g. `ubuntu-latest`
    #[serde(default, deserialize_with = "single_or_vec")]
    pub runs_on: Vec<String>,

    /// Jobs that must succeed before this one starts
    #[serde(default, deserialize_with = "single_or_vec")]
    pub needs: Vec<String>,

    /// Job-level condition
    #[serde(rename = "if", default, deserialize_with = "optional_scalar")]
    pub condition: Option<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub env: EnvMap,

    #[serde(default)]
    pub defaults: Defaults,

    /// Deadline for the whole job; caps every step's own timeout
    #[serde(default)]
    pub timeout_minutes: Option<f64>,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Job {
    /// Creates a job targeting the given platform label.
    pub fn new(runs_on: impl Into<String>) -> Self {
        Self {
            runs_on: vec![runs_on.into()],
            ..Self::default()
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a dependency on another job.
    pub fn needs(mut self, job_id: impl Into<String>) -> Self {
        self.needs.push(job_id.into());
        self
    }

    /// Sets the job condition.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Adds a matrix axis.
    pub fn with_matrix_axis(mut self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.strategy.matrix.axes.insert(key.into(), Value::Array(values));
        self
    }

    /// Adds a job-level environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// `defaults:` block of a job.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Defaults {
    #[serde(default)]
    pub run: RunDefaults,
}

/// `defaults.run:` settings applied to every `run` step.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct RunDefaults {
    pub shell: Option<String>,
    pub working_directory: Option<String>,
}

/// Matrix strategy of a job.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Matrix,

    /// Skip the remaining combinations once one fails
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Accepted for compatibility; combinations always run one at a time
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            matrix: Matrix::default(),
            fail_fast: default_fail_fast(),
            max_parallel: None,
        }
    }
}

fn default_fail_fast() -> bool {
    true
}

/// A single step of a job.
///
/// Exactly one of `uses` or `run` is set on a valid step.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    /// Identifier used by `steps.<id>` expressions
    pub id: Option<String>,

    pub name: Option<String>,

    #[serde(rename = "if", default, deserialize_with = "optional_scalar")]
    pub condition: Option<String>,

    /// Action reference, e.g. `actions/setup-python@v5`
    pub uses: Option<String>,

    /// Action parameters
    #[serde(default, deserialize_with = "scalar_map")]
    pub with: EnvMap,

    /// Inline command block
    pub run: Option<String>,

    pub shell: Option<String>,

    pub working_directory: Option<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub env: EnvMap,

    pub timeout_minutes: Option<f64>,
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepKind<'a> {
    /// Invoke an action
    Action(&'a str),
    /// Run a command block
    Script(&'a str),
}

impl Step {
    /// Creates a step running an inline command block.
    ///
    /// # Example
    ///
    /// ```
    /// use cirunner::workflow::Step;
    ///
    /// let step = Step::script("pytest")
    ///     .with_name("Test with pytest")
    ///     .with_env("PYTHONHASHSEED", "0");
    /// assert_eq!(step.display_name(), "Test with pytest");
    /// ```
    pub fn script(command: impl Into<String>) -> Self {
        Self {
            run: Some(command.into()),
            ..Self::default()
        }
    }

    /// Creates a step invoking an action.
    pub fn action(reference: impl Into<String>) -> Self {
        Self {
            uses: Some(reference.into().trim().to_string()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds an action parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the step condition.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Returns what this step does, or `None` when it sets neither or
    /// both of `uses` and `run`.
    pub fn kind(&self) -> Option<StepKind<'_>> {
        match (&self.uses, &self.run) {
            (Some(uses), None) => Some(StepKind::Action(uses)),
            (None, Some(run)) => Some(StepKind::Script(run)),
            _ => None,
        }
    }

    /// Name shown in logs: the explicit name, else derived from the step body.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.kind() {
            Some(StepKind::Action(uses)) => format!("Run {}", uses),
            Some(StepKind::Script(run)) => {
                let first_line = run.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                format!("Run {}", first_line.trim())
            }
            None => "Invalid step".to_string(),
        }
    }
}

/// Converts a YAML scalar into its string form.
pub(crate) fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Deserializes either a single string or array of strings into Vec<String>
pub(crate) fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Number(n) => Ok(vec![n.to_string()]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Deserializes a mapping of scalars, stringifying numbers and booleans.
fn scalar_map<'de, D>(deserializer: D) -> Result<EnvMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<IndexMap<String, Value>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| match scalar_to_string(value) {
            Some(s) => Ok((key, s)),
            None => Err(de::Error::custom(format!(
                "Value of '{}' must be a string, number or boolean",
                key
            ))),
        })
        .collect()
}

/// Deserializes an optional scalar (e.g. `if: false`) as a string.
fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        other => scalar_to_string(other)
            .map(Some)
            .ok_or_else(|| de::Error::custom("Expected a string, number or boolean")),
    }
}
