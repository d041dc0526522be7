//! Workflow Execution Engine
//!
//! Orchestrates a whole run:
//! - Trigger matching against the simulated event
//! - Job ordering by `needs`, with optional selection of one job
//! - Job-level conditions and dependency skipping
//! - Sequential matrix instances with fail-fast
//! - Timing of every step

use std::collections::HashSet;
use std::path::PathBuf;

use colored::Colorize;
use log::{info, warn};
use serde_json::{json, Map};

use crate::actions::BUILTIN_ACTIONS;
use crate::error::{Result, RunnerError};
use crate::monitoring::ExecutionTimeline;
use crate::report::{JobReport, JobStatus, RunReport};
use crate::workflow::{expand_matrix, job_order, EnvMap, GitRef, Workflow};

use super::job::{JobRunner, RunContext};

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use cirunner::execution::Engine;
/// use cirunner::load_workflow;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow(".github/workflows/ci.yml")?;
///     let mut engine = Engine::new(workflow);
///     engine.set_ref("refs/heads/main");
///     engine.set_working_dir("/src/project");
///
///     let report = engine.run().await?;
///     println!("{}", report.summary());
///     Ok(())
/// }
/// ```
pub struct Engine {
    workflow: Workflow,
    workflow_path: Option<PathBuf>,
    event: String,
    git_ref: Option<GitRef>,
    job_filter: Option<String>,
    working_dir: Option<PathBuf>,
    extra_env: EnvMap,
    dry_run: bool,
    strict_actions: bool,
    timeline: ExecutionTimeline,
}

impl Engine {
    /// Creates an engine simulating a `push` in the current directory.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            workflow_path: None,
            event: "push".to_string(),
            git_ref: None,
            job_filter: None,
            working_dir: None,
            extra_env: EnvMap::new(),
            dry_run: false,
            strict_actions: false,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Sets the workflow file path (its stem names unnamed workflows).
    pub fn set_workflow_path(&mut self, path: impl Into<PathBuf>) {
        self.workflow_path = Some(path.into());
    }

    /// Sets the simulated event name.
    pub fn set_event(&mut self, event: impl Into<String>) {
        self.event = event.into();
    }

    /// Sets the simulated ref: a branch name, `refs/heads/x` or `refs/tags/x`.
    pub fn set_ref(&mut self, git_ref: &str) {
        self.git_ref = Some(GitRef::parse(git_ref));
    }

    /// Runs only this job and the jobs it transitively needs.
    pub fn set_job_filter(&mut self, job_id: impl Into<String>) {
        self.job_filter = Some(job_id.into());
    }

    /// Sets the workspace the steps run in.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    /// Adds a variable to the environment every step inherits.
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra_env.insert(key.into(), value.into());
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Fails steps that use actions without a built-in handler.
    pub fn set_strict_actions(&mut self, strict: bool) {
        self.strict_actions = strict;
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Timing of the last run.
    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Name used for `github.workflow` and the report.
    pub fn workflow_name(&self) -> String {
        let stem = self
            .workflow_path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        self.workflow.display_name(&stem).to_string()
    }

    /// Executes the workflow.
    ///
    /// 1. Checks that the event (and ref) trigger the workflow
    /// 2. Orders the jobs by `needs`
    /// 3. Skips jobs whose needs did not succeed or whose `if` is false
    /// 4. Runs every matrix instance of the remaining jobs in turn
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - The run finished; check [`RunReport::succeeded`]
    /// * `Err` - The run could not start (unknown job, bad matrix, I/O)
    pub async fn run(&mut self) -> Result<RunReport> {
        let name = self.workflow_name();
        let mut report = RunReport::new(&name, &self.event);
        report.git_ref = self.git_ref.as_ref().map(GitRef::full);
        report.dry_run = self.dry_run;

        if !self
            .workflow
            .triggers
            .matches(&self.event, self.git_ref.as_ref())
        {
            warn!(
                "Workflow '{}' is not triggered by '{}'{}",
                name,
                self.event,
                report
                    .git_ref
                    .as_ref()
                    .map(|r| format!(" on {}", r))
                    .unwrap_or_default()
            );
            report.triggered = false;
            report.finish();
            return Ok(report);
        }

        let order = job_order(&self.workflow)?;
        let selected = self.select_jobs(&order)?;

        let workspace = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let mut run = RunContext::new(&name, workspace);
        run.event = self.event.clone();
        run.git_ref = self.git_ref.clone();
        run.strict_actions = self.strict_actions;
        run.dry_run = self.dry_run;
        run.base_env
            .extend(self.extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        info!(
            "Starting '{}' ({} jobs, event: {}, dry run: {})",
            name,
            selected.len(),
            self.event,
            self.dry_run
        );

        let mut timeline = ExecutionTimeline::new();

        for job_id in &selected {
            let Some(job) = self.workflow.job(job_id) else {
                return Err(RunnerError::UnknownJob(job_id.clone()));
            };

            let mut needs = Map::new();
            for need in &job.needs {
                let result = report.job_result(need).unwrap_or(JobStatus::Skipped);
                needs.insert(need.clone(), json!({ "result": result.as_str() }));
            }

            let runner = JobRunner::new(&run, &self.workflow, job_id, job, &BUILTIN_ACTIONS)
                .with_needs(json!(needs));

            if let Some(blocker) = job
                .needs
                .iter()
                .find(|n| report.job_result(n) != Some(JobStatus::Success))
            {
                info!("Skipping job '{}': needs '{}' did not succeed", job_id, blocker);
                report.jobs.push(JobReport::skipped(
                    job_id,
                    runner.display_name(),
                    format!("needs '{}' did not succeed", blocker),
                ));
                continue;
            }

            match runner.should_run() {
                Ok(true) => {}
                Ok(false) => {
                    info!("Skipping job '{}': condition was false", job_id);
                    report.jobs.push(JobReport::skipped(
                        job_id,
                        runner.display_name(),
                        "condition was false",
                    ));
                    continue;
                }
                Err(e) => {
                    let mut skipped = JobReport::skipped(job_id, runner.display_name(), e.to_string());
                    skipped.status = JobStatus::Failed;
                    report.jobs.push(skipped);
                    continue;
                }
            }

            let combinations = expand_matrix(job_id, &job.strategy.matrix)?;
            let mut instance_failed = false;

            for combination in combinations {
                let runner = JobRunner::new(&run, &self.workflow, job_id, job, &BUILTIN_ACTIONS)
                    .with_needs(json!(needs))
                    .with_matrix(combination.clone());

                if instance_failed && job.strategy.fail_fast {
                    let mut skipped = JobReport::skipped(
                        job_id,
                        runner.display_name(),
                        "fail-fast: an earlier instance failed",
                    );
                    skipped.matrix = combination;
                    report.jobs.push(skipped);
                    continue;
                }

                let job_report = runner.run(&mut timeline).await?;
                match job_report.status {
                    JobStatus::Failed => {
                        instance_failed = true;
                        info!("{} {}", "Job failed:".red(), job_report.name);
                    }
                    _ => info!("{} {}", "Job passed:".green(), job_report.name),
                }
                report.jobs.push(job_report);
            }
        }

        report.finish();
        self.timeline = timeline;

        info!("{}", report.summary());
        Ok(report)
    }

    /// Jobs to run, in execution order.
    fn select_jobs(&self, order: &[String]) -> Result<Vec<String>> {
        let Some(target) = &self.job_filter else {
            return Ok(order.to_vec());
        };

        if self.workflow.job(target).is_none() {
            return Err(RunnerError::UnknownJob(target.clone()));
        }

        let mut wanted: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = vec![target.as_str()];
        while let Some(current) = pending.pop() {
            if !wanted.insert(current) {
                continue;
            }
            if let Some(job) = self.workflow.job(current) {
                pending.extend(job.needs.iter().map(String::as_str));
            }
        }

        Ok(order
            .iter()
            .filter(|id| wanted.contains(id.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::StepStatus;
    use crate::workflow::{parse_workflow, Job, Step};
    use std::fs;
    use tempfile::tempdir;

    fn engine(yaml: &str, workspace: &std::path::Path) -> Engine {
        let mut engine = Engine::new(parse_workflow(yaml).unwrap());
        engine.set_working_dir(workspace);
        engine
    }

    fn statuses(report: &RunReport) -> Vec<(String, JobStatus)> {
        report
            .jobs
            .iter()
            .map(|j| (j.name.clone(), j.status))
            .collect()
    }

    #[tokio::test]
    async fn test_workflow_built_in_code() {
        let dir = tempdir().unwrap();
        let workflow = Workflow::new()
            .on("push")
            .with_job(
                "test",
                Job::new("ubuntu-latest")
                    .with_env("STAGE", "ci")
                    .with_step(Step::action("actions/checkout@v4").with_param("fetch-depth", "0"))
                    .with_step(
                        Step::script("touch installed.txt")
                            .with_name("Install dependencies")
                            .when("hashFiles('requirements.txt') != ''"),
                    )
                    .with_step(Step::script("echo \"$STAGE\" > stage.txt").with_shell("sh")),
            )
            .with_job(
                "deploy",
                Job::new("ubuntu-latest")
                    .needs("test")
                    .when("github.event_name == 'release'")
                    .with_step(Step::script("touch deployed.txt")),
            );

        let mut engine = Engine::new(workflow);
        engine.set_working_dir(dir.path());
        let report = engine.run().await.unwrap();

        assert_eq!(
            statuses(&report),
            vec![
                ("test".to_string(), JobStatus::Success),
                ("deploy".to_string(), JobStatus::Skipped)
            ]
        );
        let steps: Vec<StepStatus> = report.jobs[0].steps.iter().map(|s| s.status).collect();
        assert_eq!(
            steps,
            vec![StepStatus::Success, StepStatus::Skipped, StepStatus::Success]
        );
        assert_eq!(fs::read_to_string(dir.path().join("stage.txt")).unwrap(), "ci\n");
        assert!(!dir.path().join("installed.txt").exists());
        assert!(!dir.path().join("deployed.txt").exists());
    }

    const PIPELINE: &str = r#"
name: CI
on:
  push:
    branches: [main]
jobs:
  test:
    runs-on: ubuntu-latest
    needs: build
    steps:
      - run: echo test >> order.txt
  lint:
    runs-on: ubuntu-latest
    steps:
      - run: echo lint >> order.txt
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo build >> order.txt
"#;

    #[tokio::test]
    async fn test_jobs_follow_needs() {
        let dir = tempdir().unwrap();
        let mut engine = engine(PIPELINE, dir.path());

        let report = engine.run().await.unwrap();

        assert!(report.succeeded());
        let order = fs::read_to_string(dir.path().join("order.txt")).unwrap();
        assert_eq!(order, "lint\nbuild\ntest\n");
        assert_eq!(engine.timeline().spans().len(), 3);
    }

    #[tokio::test]
    async fn test_job_filter_includes_needs() {
        let dir = tempdir().unwrap();
        let mut engine = engine(PIPELINE, dir.path());
        engine.set_job_filter("test");

        let report = engine.run().await.unwrap();

        let ids: Vec<&str> = report.jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["build", "test"]);
    }

    #[tokio::test]
    async fn test_unknown_job_filter() {
        let dir = tempdir().unwrap();
        let mut engine = engine(PIPELINE, dir.path());
        engine.set_job_filter("deploy");

        assert!(matches!(
            engine.run().await,
            Err(RunnerError::UnknownJob(id)) if id == "deploy"
        ));
    }

    #[tokio::test]
    async fn test_not_triggered() {
        let dir = tempdir().unwrap();
        let mut engine = engine(PIPELINE, dir.path());
        engine.set_ref("refs/heads/feature");

        let report = engine.run().await.unwrap();
        assert!(!report.triggered);
        assert!(report.jobs.is_empty());
        assert!(report.succeeded());
        assert!(!dir.path().join("order.txt").exists());

        engine.set_event("pull_request");
        engine.set_ref("main");
        assert!(!engine.run().await.unwrap().triggered);

        engine.set_event("push");
        assert!(engine.run().await.unwrap().triggered);
    }

    #[tokio::test]
    async fn test_failed_need_skips_dependent() {
        let dir = tempdir().unwrap();
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: exit 1
  test:
    runs-on: ubuntu-latest
    needs: [build]
    steps:
      - run: touch tested.txt
"#;
        let mut engine = engine(yaml, dir.path());
        let report = engine.run().await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(
            statuses(&report),
            vec![
                ("build".to_string(), JobStatus::Failed),
                ("test".to_string(), JobStatus::Skipped)
            ]
        );
        assert_eq!(
            report.jobs[1].reason.as_deref(),
            Some("needs 'build' did not succeed")
        );
        assert!(!dir.path().join("tested.txt").exists());
    }

    const MATRIX: &str = r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    strategy:
      fail-fast: FAIL_FAST
      matrix:
        n: [1, 2, 3]
    steps:
      - run: |
          echo ${{ matrix.n }} >> ran.txt
          test ${{ matrix.n }} -ne 2
"#;

    #[tokio::test]
    async fn test_matrix_fail_fast() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&MATRIX.replace("FAIL_FAST", "true"), dir.path());
        let report = engine.run().await.unwrap();

        assert_eq!(
            statuses(&report),
            vec![
                ("test (1)".to_string(), JobStatus::Success),
                ("test (2)".to_string(), JobStatus::Failed),
                ("test (3)".to_string(), JobStatus::Skipped)
            ]
        );
        assert_eq!(report.jobs[2].matrix["n"], json!(3));
        assert_eq!(fs::read_to_string(dir.path().join("ran.txt")).unwrap(), "1\n2\n");
    }

    #[tokio::test]
    async fn test_matrix_without_fail_fast() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&MATRIX.replace("FAIL_FAST", "false"), dir.path());
        let report = engine.run().await.unwrap();

        assert_eq!(report.counts(), (2, 1, 0));
        assert_eq!(
            fs::read_to_string(dir.path().join("ran.txt")).unwrap(),
            "1\n2\n3\n"
        );
    }

    #[tokio::test]
    async fn test_job_condition() {
        let dir = tempdir().unwrap();
        let yaml = r#"
on: [push, pull_request]
jobs:
  docs:
    if: github.event_name == 'pull_request'
    runs-on: ubuntu-latest
    steps:
      - run: touch docs.txt
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "$EXTRA"
"#;
        let mut engine = engine(yaml, dir.path());
        engine.add_env("EXTRA", "from-cli");
        let report = engine.run().await.unwrap();

        assert_eq!(report.jobs[0].status, JobStatus::Skipped);
        assert_eq!(report.jobs[1].steps[0].stdout, "from-cli\n");
        assert!(!dir.path().join("docs.txt").exists());
    }

    #[tokio::test]
    async fn test_dry_run() {
        let dir = tempdir().unwrap();
        let mut engine = engine(PIPELINE, dir.path());
        engine.set_dry_run(true);

        let report = engine.run().await.unwrap();

        assert!(report.dry_run);
        assert!(report.succeeded());
        assert!(report
            .jobs
            .iter()
            .flat_map(|j| &j.steps)
            .all(|s| s.status == StepStatus::Skipped));
        assert!(!dir.path().join("order.txt").exists());
    }

    #[test]
    fn test_workflow_name_fallback() {
        let yaml = "on: push\njobs:\n  a:\n    runs-on: x\n    steps:\n      - run: echo\n";
        let mut engine = Engine::new(parse_workflow(yaml).unwrap());
        assert_eq!(engine.workflow_name(), "workflow");

        engine.set_workflow_path(".github/workflows/ci.yml");
        assert_eq!(engine.workflow_name(), "ci");
    }
}
