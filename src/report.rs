//! Run Report
//!
//! Results of a workflow run: one [`JobReport`] per job instance and one
//! [`StepReport`] per step, with the captured console output.
//!
//! A report can be written to JSON with [`RunReport::save`] and read back
//! with [`RunReport::load`].

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::MatrixValues;

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Value exposed as `steps.<id>.outcome`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failure",
            Self::Skipped => "skipped",
        }
    }
}

/// Outcome of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    /// Value exposed as `job.status` and `needs.<id>.result`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failure",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Why the step was skipped or failed without an exit code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub duration_ms: u64,
}

impl StepReport {
    pub fn skipped(name: impl Into<String>, id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            status: StepStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            reason: Some(reason.into()),
            duration_ms: 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// Job id from the workflow
    pub job_id: String,
    /// Display name, including matrix values
    pub name: String,
    #[serde(default)]
    pub matrix: MatrixValues,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
}

impl JobReport {
    /// A job instance that never started.
    pub fn skipped(job_id: &str, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: name.into(),
            matrix: MatrixValues::new(),
            status: JobStatus::Skipped,
            reason: Some(reason.into()),
            steps: Vec::new(),
            duration_ms: 0,
        }
    }

    /// First failed step, if any.
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.is_failure())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow: String,
    pub event: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// `false` when the event does not trigger the workflow
    pub triggered: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn new(workflow: impl Into<String>, event: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow: workflow.into(),
            event: event.into(),
            git_ref: None,
            triggered: true,
            dry_run: false,
            started_at: now,
            finished_at: now,
            jobs: Vec::new(),
        }
    }

    /// A run passes when no job instance failed.
    pub fn succeeded(&self) -> bool {
        self.jobs.iter().all(|j| j.status != JobStatus::Failed)
    }

    /// Combined result of a job id across its matrix instances.
    ///
    /// Failure wins over success; a job with only skipped instances is
    /// skipped.
    pub fn job_result(&self, job_id: &str) -> Option<JobStatus> {
        let mut result = None;
        for job in self.jobs.iter().filter(|j| j.job_id == job_id) {
            result = match (result, job.status) {
                (Some(JobStatus::Failed), _) | (_, JobStatus::Failed) => Some(JobStatus::Failed),
                (Some(JobStatus::Success), _) | (_, JobStatus::Success) => Some(JobStatus::Success),
                _ => Some(JobStatus::Skipped),
            };
        }
        result
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Counts of (passed, failed, skipped) job instances.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.jobs.iter().fold((0, 0, 0), |(p, f, s), job| match job.status {
            JobStatus::Success => (p + 1, f, s),
            JobStatus::Failed => (p, f + 1, s),
            JobStatus::Skipped => (p, f, s + 1),
        })
    }

    /// One-line summary such as `2 passed, 1 failed, 0 skipped in 3.2s`.
    pub fn summary(&self) -> String {
        let (passed, failed, skipped) = self.counts();
        let seconds = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        format!(
            "{} passed, {} failed, {} skipped in {:.1}s",
            passed, failed, skipped, seconds
        )
    }

    /// Writes the report as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        info!("Saved run report to {}", path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
