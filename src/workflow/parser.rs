//! Workflow Parser
//!
//! Handles loading and parsing workflow definitions from YAML files,
//! and locating the default workflow file of a repository.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::model::Workflow;
use super::validator::validate_workflow;
use crate::error::{Result, RunnerError};

/// Workflow files tried, in order, when none is given on the command line.
pub const DEFAULT_WORKFLOW_CANDIDATES: &[&str] = &[
    ".github/workflows/ci.yml",
    ".github/workflows/ci.yaml",
    "workflow.yml",
    "workflow.yaml",
];

/// Loads a workflow from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the workflow structure
///
/// # Example
///
/// ```rust,no_run
/// use cirunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow(".github/workflows/ci.yml")?;
///     println!("Loaded {} jobs", workflow.jobs.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|source| RunnerError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_workflow(&yaml_content)
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml_content: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_yaml::from_str(yaml_content)?;

    info!(
        "Parsed {} jobs, {} steps",
        workflow.jobs.len(),
        workflow.step_count()
    );

    validate_workflow(&workflow)?;

    Ok(workflow)
}

/// Finds the workflow to run inside `dir`.
///
/// Tries [`DEFAULT_WORKFLOW_CANDIDATES`], then the first `.yml`/`.yaml`
/// file (by name) in `.github/workflows`.
pub fn discover_workflow(dir: &Path) -> Option<PathBuf> {
    for candidate in DEFAULT_WORKFLOW_CANDIDATES {
        let path = dir.join(candidate);
        if path.is_file() {
            return Some(path);
        }
    }

    let workflows_dir = dir.join(".github").join("workflows");
    let mut files: Vec<PathBuf> = fs::read_dir(&workflows_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect();

    files.sort();
    files.into_iter().next()
}
