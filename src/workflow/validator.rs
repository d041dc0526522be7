//! Workflow Validation
//!
//! Provides structural validation for workflow definitions including:
//! - Job and step field validation
//! - Action reference syntax
//! - `needs` reference integrity
//! - Job ordering (Kahn's algorithm, cycles rejected)

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use thiserror::Error;

use super::matrix::expand_matrix;
use super::model::{Job, StepKind, Workflow};
use crate::actions::ActionRef;
use crate::error::{Result, RunnerError};

/// Upper bound for `timeout-minutes` (seven days).
pub const MAX_TIMEOUT_MINUTES: f64 = 10_080.0;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workflow has no jobs")]
    NoJobs,

    #[error("Workflow has no 'on' triggers")]
    NoTriggers,

    #[error("Job '{0}' has no steps")]
    NoSteps(String),

    #[error("Step {index} of job '{job}' has neither 'uses' nor 'run'")]
    EmptyStep { job: String, index: usize },

    #[error("Step {index} of job '{job}' sets both 'uses' and 'run'")]
    AmbiguousStep { job: String, index: usize },

    #[error("Step '{step}' of job '{job}' has an empty 'run' block")]
    EmptyCommand { job: String, step: String },

    #[error("Duplicate step id '{id}' in job '{job}'")]
    DuplicateStepId { job: String, id: String },

    #[error("Step '{step}' of job '{job}': {message}")]
    InvalidAction {
        job: String,
        step: String,
        message: String,
    },

    #[error("Job '{job}' needs unknown job '{need}'")]
    UnknownNeed { job: String, need: String },

    #[error("Job '{0}' needs itself")]
    SelfNeed(String),

    #[error("Job '{job}' has an invalid matrix: {message}")]
    InvalidMatrix { job: String, message: String },

    #[error("{location} has an invalid timeout-minutes value {value} (expected more than 0 and at most {})", MAX_TIMEOUT_MINUTES)]
    InvalidTimeout { location: String, value: f64 },

    #[error("Jobs have cyclic 'needs' dependencies: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

fn check_timeout(value: Option<f64>, location: impl FnOnce() -> String) -> Option<ValidationError> {
    let value = value?;
    if value.is_finite() && value > 0.0 && value <= MAX_TIMEOUT_MINUTES {
        return None;
    }
    Some(ValidationError::InvalidTimeout {
        location: location(),
        value,
    })
}

/// Validates a single job's steps, timeouts and strategy.
fn validate_job(job_id: &str, job: &Job) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    errors.extend(check_timeout(job.timeout_minutes, || format!("Job '{}'", job_id)));

    if job.steps.is_empty() {
        errors.push(ValidationError::NoSteps(job_id.to_string()));
        return errors;
    }

    let mut seen_ids = HashSet::new();

    for (index, step) in job.steps.iter().enumerate() {
        let position = index + 1;

        if let Some(id) = &step.id {
            if !seen_ids.insert(id.clone()) {
                errors.push(ValidationError::DuplicateStepId {
                    job: job_id.to_string(),
                    id: id.clone(),
                });
            }
        }

        errors.extend(check_timeout(step.timeout_minutes, || {
            format!("Step '{}' of job '{}'", step.display_name(), job_id)
        }));

        match step.kind() {
            Some(StepKind::Script(run)) => {
                if run.trim().is_empty() {
                    errors.push(ValidationError::EmptyCommand {
                        job: job_id.to_string(),
                        step: step.display_name(),
                    });
                }
            }
            Some(StepKind::Action(uses)) => {
                if let Err(e) = ActionRef::parse(uses) {
                    errors.push(ValidationError::InvalidAction {
                        job: job_id.to_string(),
                        step: step.display_name(),
                        message: e.to_string(),
                    });
                }
            }
            None if step.uses.is_some() => {
                errors.push(ValidationError::AmbiguousStep {
                    job: job_id.to_string(),
                    index: position,
                });
            }
            None => {
                errors.push(ValidationError::EmptyStep {
                    job: job_id.to_string(),
                    index: position,
                });
            }
        }
    }

    if let Err(e) = expand_matrix(job_id, &job.strategy.matrix) {
        let message = match e {
            RunnerError::Matrix { message, .. } => message,
            other => other.to_string(),
        };
        errors.push(ValidationError::InvalidMatrix {
            job: job_id.to_string(),
            message,
        });
    }

    errors
}

/// Collects every structural problem in the workflow.
pub fn collect_errors(workflow: &Workflow) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.triggers.is_empty() {
        errors.push(ValidationError::NoTriggers);
    }

    if workflow.jobs.is_empty() {
        errors.push(ValidationError::NoJobs);
        return errors;
    }

    for (job_id, job) in &workflow.jobs {
        errors.extend(validate_job(job_id, job));

        for need in &job.needs {
            if need == job_id {
                errors.push(ValidationError::SelfNeed(job_id.clone()));
            } else if !workflow.jobs.contains_key(need) {
                errors.push(ValidationError::UnknownNeed {
                    job: job_id.clone(),
                    need: need.clone(),
                });
            }
        }
    }

    errors
}

/// Validates the entire workflow and returns the job execution order.
///
/// Performs the following checks:
/// 1. Workflow has triggers and jobs
/// 2. Every job has valid steps and matrix
/// 3. All `needs` point to existing jobs
/// 4. No cyclic `needs`
pub fn validate_workflow(workflow: &Workflow) -> Result<Vec<String>> {
    info!("Validating workflow with {} jobs", workflow.jobs.len());

    let errors = collect_errors(workflow);
    if !errors.is_empty() {
        return Err(RunnerError::Validation(errors));
    }

    let order = job_order(workflow)?;

    info!(
        "Workflow validated: {} jobs, {} steps",
        workflow.jobs.len(),
        workflow.step_count()
    );
    Ok(order)
}

/// Orders jobs so that every job follows the jobs it needs.
///
/// Kahn's algorithm; among ready jobs, declaration order wins.
pub fn job_order(workflow: &Workflow) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for (job_id, job) in &workflow.jobs {
        let unique: HashSet<&str> = job.needs.iter().map(String::as_str).collect();
        in_degree.insert(job_id.as_str(), unique.len());
    }

    let mut sorted_order: Vec<String> = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();

    loop {
        let next = workflow
            .jobs
            .keys()
            .map(String::as_str)
            .find(|id| !done.contains(id) && in_degree.get(id) == Some(&0));

        let Some(current) = next else {
            break;
        };

        done.insert(current);
        sorted_order.push(current.to_string());

        for (job_id, job) in &workflow.jobs {
            if !done.contains(job_id.as_str()) && job.needs.iter().any(|n| n == current) {
                if let Some(degree) = in_degree.get_mut(job_id.as_str()) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
    }

    if sorted_order.len() != workflow.jobs.len() {
        let remaining: Vec<String> = workflow
            .jobs
            .keys()
            .filter(|id| !done.contains(id.as_str()))
            .cloned()
            .collect();
        return Err(RunnerError::Validation(vec![
            ValidationError::CyclicDependency(remaining),
        ]));
    }

    debug!("Job order: {:?}", sorted_order);
    Ok(sorted_order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;
    use serde_json::json;

    fn job() -> Job {
        Job::new("ubuntu-latest").with_step(Step::script("echo hi"))
    }

    fn errors_of(workflow: &Workflow) -> Vec<ValidationError> {
        match validate_workflow(workflow) {
            Err(RunnerError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_workflow() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("lint", job())
            .with_job("test", job().needs("lint"));

        let order = validate_workflow(&workflow).unwrap();
        assert_eq!(order, vec!["lint", "test"]);
    }

    #[test]
    fn test_empty_workflow() {
        let errors = errors_of(&Workflow::new());
        assert!(errors.contains(&ValidationError::NoJobs));
        assert!(errors.contains(&ValidationError::NoTriggers));
    }

    #[test]
    fn test_job_without_steps() {
        let workflow = Workflow::new().on("push").with_job("build", Job::new("ubuntu-latest"));
        assert_eq!(
            errors_of(&workflow),
            vec![ValidationError::NoSteps("build".to_string())]
        );
    }

    #[test]
    fn test_step_needs_exactly_one_body() {
        let mut both = Step::script("make");
        both.uses = Some("actions/checkout@v4".to_string());

        let workflow = Workflow::new().on("push").with_job(
            "build",
            Job::new("ubuntu-latest")
                .with_step(Step::default())
                .with_step(both),
        );

        let errors = errors_of(&workflow);
        assert!(errors.contains(&ValidationError::EmptyStep {
            job: "build".to_string(),
            index: 1
        }));
        assert!(errors.contains(&ValidationError::AmbiguousStep {
            job: "build".to_string(),
            index: 2
        }));
    }

    #[test]
    fn test_blank_run_block() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("build", Job::new("ubuntu-latest").with_step(Step::script("   \n")));
        assert!(matches!(
            errors_of(&workflow)[0],
            ValidationError::EmptyCommand { .. }
        ));
    }

    #[test]
    fn test_duplicate_step_ids() {
        let workflow = Workflow::new().on("push").with_job(
            "build",
            Job::new("ubuntu-latest")
                .with_step(Step::script("echo 1").with_id("same"))
                .with_step(Step::script("echo 2").with_id("same")),
        );
        assert!(errors_of(&workflow).contains(&ValidationError::DuplicateStepId {
            job: "build".to_string(),
            id: "same".to_string()
        }));
    }

    #[test]
    fn test_action_without_version() {
        let workflow = Workflow::new().on("push").with_job(
            "build",
            Job::new("ubuntu-latest").with_step(Step::action("actions/checkout")),
        );
        assert!(matches!(
            errors_of(&workflow)[0],
            ValidationError::InvalidAction { .. }
        ));
    }

    #[test]
    fn test_unknown_and_self_needs() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("a", job().needs("ghost"))
            .with_job("b", job().needs("b"));

        let errors = errors_of(&workflow);
        assert!(errors.contains(&ValidationError::UnknownNeed {
            job: "a".to_string(),
            need: "ghost".to_string()
        }));
        assert!(errors.contains(&ValidationError::SelfNeed("b".to_string())));
    }

    #[test]
    fn test_cyclic_needs() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("a", job().needs("b"))
            .with_job("b", job().needs("a"))
            .with_job("c", job());

        let errors = errors_of(&workflow);
        assert_eq!(
            errors,
            vec![ValidationError::CyclicDependency(vec![
                "a".to_string(),
                "b".to_string()
            ])]
        );
    }

    #[test]
    fn test_timeout_out_of_range() {
        let mut huge = job();
        huge.timeout_minutes = Some(1e300);
        let mut negative_step = Step::script("echo hi");
        negative_step.timeout_minutes = Some(-1.0);
        let mut nan = Job::new("ubuntu-latest").with_step(negative_step);
        nan.timeout_minutes = Some(f64::NAN);

        let workflow = Workflow::new()
            .on("push")
            .with_job("huge", huge)
            .with_job("nan", nan);

        let errors = errors_of(&workflow);
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::InvalidTimeout { .. })));
        assert!(errors[0].to_string().starts_with("Job 'huge'"));
        assert!(errors[2].to_string().starts_with("Step 'Run echo hi' of job 'nan'"));
    }

    #[test]
    fn test_timeout_within_range() {
        let mut quick = job();
        quick.timeout_minutes = Some(0.5);
        quick.steps[0].timeout_minutes = Some(MAX_TIMEOUT_MINUTES);

        let workflow = Workflow::new().on("push").with_job("quick", quick);
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn test_invalid_matrix() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("test", job().with_matrix_axis("python", vec![]));
        assert!(matches!(
            errors_of(&workflow)[0],
            ValidationError::InvalidMatrix { .. }
        ));
    }

    #[test]
    fn test_job_order_respects_needs_and_declaration() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("deploy", job().needs("test").needs("lint"))
            .with_job("test", job().needs("build"))
            .with_job("build", job())
            .with_job("lint", job());

        let order = job_order(&workflow).unwrap();
        assert_eq!(order, vec!["build", "test", "lint", "deploy"]);
    }

    #[test]
    fn test_job_order_duplicate_needs() {
        let workflow = Workflow::new()
            .on("push")
            .with_job("a", job())
            .with_job("b", job().needs("a").needs("a"));

        assert_eq!(job_order(&workflow).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_matrix_job_passes() {
        let workflow = Workflow::new().on("push").with_job(
            "test",
            job().with_matrix_axis("python", vec![json!("3.11"), json!("3.12")]),
        );
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::NoJobs;
        assert_eq!(err.to_string(), "Workflow has no jobs");

        let err = ValidationError::NoSteps("build".to_string());
        assert!(err.to_string().contains("build"));

        let err = ValidationError::CyclicDependency(vec!["a".to_string(), "b".to_string()]);
        assert!(err.to_string().contains("cyclic"));
        assert!(err.to_string().contains("a, b"));
    }
}
