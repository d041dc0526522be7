//! Job Step Sequencer
//!
//! Runs the steps of one job instance (a job paired with one matrix
//! combination) in declared order. Steps share the workspace, the
//! variables exported through `GITHUB_ENV` and the directories added
//! through `GITHUB_PATH`. The first failing step halts the job: every
//! later step is recorded as skipped.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};

use crate::actions::{ActionContext, ActionRef, ActionRegistry};
use crate::error::{Result, RunnerError};
use crate::expression::{evaluate_condition, interpolate, ExpressionContext};
use crate::monitoring::ExecutionTimeline;
use crate::report::{JobReport, JobStatus, StepReport, StepStatus};
use crate::workflow::{instance_name, EnvMap, GitRef, Job, MatrixValues, Step, StepKind, Workflow};

use super::command_files::{CommandEffects, CommandFiles};
use super::step::{create_execution_script, execute_script, ScriptRequest, Shell};

/// Settings shared by every job of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub workflow_name: String,
    pub event: String,
    pub git_ref: Option<GitRef>,
    /// Checked-out tree the steps run in
    pub workspace: PathBuf,
    /// Environment inherited by every step before workflow variables apply
    pub base_env: EnvMap,
    /// Fail steps using actions without a built-in handler
    pub strict_actions: bool,
    pub dry_run: bool,
}

impl RunContext {
    /// Creates a context inheriting the current process environment.
    pub fn new(workflow_name: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        let base_env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();

        Self {
            workflow_name: workflow_name.into(),
            event: "push".to_string(),
            git_ref: None,
            workspace: workspace.into(),
            base_env,
            strict_actions: false,
            dry_run: false,
        }
    }
}

/// What earlier steps left behind for later ones.
#[derive(Debug, Default)]
struct JobState {
    /// Variables exported through `GITHUB_ENV`
    exported: EnvMap,
    /// `PATH` additions, highest priority first
    path: Vec<PathBuf>,
    /// `steps` context
    steps: Map<String, Value>,
    failed: bool,
}

impl JobState {
    fn apply(&mut self, effects: CommandEffects) {
        for (key, value) in effects.env {
            self.exported.shift_remove(&key);
            self.exported.insert(key, value);
        }
        for dir in effects.path {
            self.path.retain(|p| p != &dir);
            self.path.insert(0, dir);
        }
    }

    fn record(&mut self, step: &Step, status: StepStatus, outputs: EnvMap) {
        let Some(id) = &step.id else {
            return;
        };
        self.steps.insert(
            id.clone(),
            json!({
                "outputs": outputs,
                "outcome": status.as_str(),
                "conclusion": status.as_str(),
            }),
        );
    }
}

/// Everything resolved about a step before it runs.
#[derive(Clone, Copy)]
struct PreparedStep<'p> {
    index: usize,
    label: &'p str,
    temp: &'p Path,
    ctx: &'p ExpressionContext,
    /// Variables visible as the `env` context
    context_env: &'p EnvMap,
    deadline: Option<Instant>,
}

/// Result of executing one step's body.
struct StepRun {
    status: StepStatus,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    reason: Option<String>,
    effects: CommandEffects,
}

impl StepRun {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            reason: Some(reason.into()),
            effects: CommandEffects::default(),
        }
    }
}

/// Executes one job instance.
pub struct JobRunner<'a> {
    run: &'a RunContext,
    workflow: &'a Workflow,
    job_id: &'a str,
    job: &'a Job,
    matrix: MatrixValues,
    needs: Value,
    registry: &'a ActionRegistry,
}

impl<'a> JobRunner<'a> {
    pub fn new(
        run: &'a RunContext,
        workflow: &'a Workflow,
        job_id: &'a str,
        job: &'a Job,
        registry: &'a ActionRegistry,
    ) -> Self {
        Self {
            run,
            workflow,
            job_id,
            job,
            matrix: MatrixValues::new(),
            needs: Value::Object(Map::new()),
            registry,
        }
    }

    pub fn with_matrix(mut self, matrix: MatrixValues) -> Self {
        self.matrix = matrix;
        self
    }

    /// Sets the `needs` context (`needs.<job>.result`).
    pub fn with_needs(mut self, needs: Value) -> Self {
        self.needs = needs;
        self
    }

    /// Display name of the instance. A job `name` containing expressions
    /// is interpolated instead of getting the matrix suffix.
    pub fn display_name(&self) -> String {
        match &self.job.name {
            Some(name) if name.contains("${{") => {
                let ctx = self.base_context(None, &JobState::default());
                interpolate(name, &ctx).unwrap_or_else(|_| name.clone())
            }
            Some(name) => instance_name(name, &self.matrix),
            None => instance_name(self.job_id, &self.matrix),
        }
    }

    /// Evaluates the job-level `if`. The matrix context is empty here.
    pub fn should_run(&self) -> Result<bool> {
        let ctx = self.base_context(None, &JobState::default());
        evaluate_condition(self.job.condition.as_deref(), &ctx)
    }

    /// Runs every step and returns the job's report.
    ///
    /// Step failures are recorded in the report. Errors are returned only
    /// when the job cannot be set up at all.
    pub async fn run(&self, timeline: &mut ExecutionTimeline) -> Result<JobReport> {
        let started = Instant::now();
        let name = self.display_name();
        let temp = tempfile::Builder::new().prefix("cirunner-").tempdir()?;
        let deadline = self
            .job
            .timeout_minutes
            .and_then(minutes)
            .and_then(|limit| started.checked_add(limit));

        info!("Job: {}", name);

        let mut state = JobState::default();
        let mut steps = Vec::with_capacity(self.job.steps.len());

        for (index, step) in self.job.steps.iter().enumerate() {
            let base = self.base_context(Some(temp.path()), &state);
            let label = step_label(step, &base);
            let timeline_label = format!("{} / {}. {}", name, index + 1, label);

            if state.failed {
                debug!("Skipping '{}': previous step failed", label);
                state.record(step, StepStatus::Skipped, EnvMap::new());
                steps.push(StepReport::skipped(label, step.id.clone(), "previous step failed"));
                continue;
            }

            let prepared = self.step_context(step, &state, base).and_then(|(ctx, env)| {
                let should_run = evaluate_condition(step.condition.as_deref(), &ctx)?;
                Ok((ctx, env, should_run))
            });

            let (ctx, context_env) = match prepared {
                Ok((ctx, env, true)) => (ctx, env),
                Ok(_) => {
                    info!("  - {} (skipped: condition was false)", label);
                    state.record(step, StepStatus::Skipped, EnvMap::new());
                    steps.push(StepReport::skipped(label, step.id.clone(), "condition was false"));
                    continue;
                }
                Err(e) => {
                    error!("Step '{}': {}", label, e);
                    state.failed = true;
                    state.record(step, StepStatus::Failed, EnvMap::new());
                    let mut report = StepReport::skipped(label, step.id.clone(), e.to_string());
                    report.status = StepStatus::Failed;
                    steps.push(report);
                    continue;
                }
            };

            if self.run.dry_run {
                self.print_dry_run(step, &label, &ctx);
                state.record(step, StepStatus::Skipped, EnvMap::new());
                steps.push(StepReport::skipped(label, step.id.clone(), "dry run"));
                continue;
            }

            info!("  - {}", label);
            timeline.start(timeline_label.clone());
            let step_started = Instant::now();

            let prepared = PreparedStep {
                index,
                label: &label,
                temp: temp.path(),
                ctx: &ctx,
                context_env: &context_env,
                deadline,
            };
            let outcome = match self.execute(step, &prepared, &state).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Step '{}' failed: {}", label, e);
                    StepRun::failed(e.to_string())
                }
            };

            let elapsed = step_started.elapsed();
            timeline.finish(timeline_label, outcome.status);

            if outcome.status == StepStatus::Failed {
                state.failed = true;
            }
            let outputs = outcome.effects.outputs.clone();
            state.apply(outcome.effects);
            state.record(step, outcome.status, outputs);

            steps.push(StepReport {
                name: label,
                id: step.id.clone(),
                status: outcome.status,
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                reason: outcome.reason,
                duration_ms: elapsed.as_millis() as u64,
            });
        }

        let status = if state.failed {
            JobStatus::Failed
        } else {
            JobStatus::Success
        };

        Ok(JobReport {
            job_id: self.job_id.to_string(),
            name,
            matrix: self.matrix.clone(),
            status,
            reason: None,
            steps,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn execute(&self, step: &Step, prepared: &PreparedStep<'_>, state: &JobState) -> Result<StepRun> {
        let PreparedStep {
            index,
            label,
            temp,
            ctx,
            context_env,
            deadline,
        } = *prepared;

        let files = CommandFiles::create(temp, index)?;
        let mut process_env = self.process_env(temp, context_env, state);
        for (key, value) in files.env_vars() {
            process_env.insert(key.to_string(), value);
        }

        match step.kind() {
            Some(StepKind::Script(command)) => {
                let shell = Shell::parse(
                    step.shell
                        .as_deref()
                        .or(self.job.defaults.run.shell.as_deref())
                        .unwrap_or("bash"),
                )?;
                let command = interpolate(command, ctx)?;
                let script = create_execution_script(temp, index, &shell, &command)?;
                let working_dir = self.working_dir(step, ctx)?;
                let timeout = step_timeout(step, deadline);

                let output = execute_script(&ScriptRequest {
                    step_label: label,
                    script: &script,
                    shell: &shell,
                    working_dir: &working_dir,
                    env: &process_env,
                    timeout,
                })
                .await?;

                let (mut status, mut reason) = if output.timed_out {
                    (StepStatus::Failed, Some("timed out".to_string()))
                } else if output.success() {
                    (StepStatus::Success, None)
                } else {
                    (
                        StepStatus::Failed,
                        Some(format!("exit code {}", output.exit_code)),
                    )
                };

                // a bad command file fails the step but keeps its output
                let effects = match files.collect() {
                    Ok(effects) => effects,
                    Err(e) => {
                        error!("Step '{}': {}", label, e);
                        status = StepStatus::Failed;
                        reason = Some(e.to_string());
                        CommandEffects::default()
                    }
                };

                Ok(StepRun {
                    status,
                    exit_code: Some(output.exit_code),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    reason,
                    effects,
                })
            }
            Some(StepKind::Action(uses)) => {
                self.run_action(uses, step, ctx, temp, &process_env, state)
            }
            None => Err(RunnerError::action(
                label,
                "step must set exactly one of 'uses' or 'run'",
            )),
        }
    }

    fn run_action(
        &self,
        uses: &str,
        step: &Step,
        ctx: &ExpressionContext,
        temp: &Path,
        process_env: &EnvMap,
        state: &JobState,
    ) -> Result<StepRun> {
        let action = ActionRef::parse(uses)?;

        let Some(handler) = self.registry.get(&action) else {
            let message = match &action {
                ActionRef::Repository { .. } => format!("no built-in handler for {}", action),
                ActionRef::Local(_) => format!("local action {} is not supported", action),
                ActionRef::Docker(_) => format!("container action {} is not supported", action),
            };
            if self.run.strict_actions {
                return Err(RunnerError::action(action.to_string(), message));
            }
            warn!("Skipping step: {}", message);
            return Ok(StepRun {
                status: StepStatus::Skipped,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                reason: Some(message),
                effects: CommandEffects::default(),
            });
        };

        let mut inputs = EnvMap::new();
        for (key, value) in &step.with {
            inputs.insert(key.clone(), interpolate(value, ctx)?);
        }

        let action_ctx = ActionContext {
            workspace: &self.run.workspace,
            temp,
            env: process_env,
            path_additions: &state.path,
        };
        let outcome = handler.run(&inputs, &action_ctx)?;

        Ok(StepRun {
            status: StepStatus::Success,
            exit_code: Some(0),
            stdout: outcome.messages.join("\n"),
            stderr: String::new(),
            reason: None,
            effects: CommandEffects {
                env: outcome.env,
                path: outcome.path,
                outputs: outcome.outputs,
            },
        })
    }

    /// Contexts visible to expressions before the step's own `env` applies.
    fn base_context(&self, temp: Option<&Path>, state: &JobState) -> ExpressionContext {
        let mut ctx = ExpressionContext::new(&self.run.workspace);
        ctx.set_failed(state.failed);

        let (git_ref, ref_name, ref_type) = match &self.run.git_ref {
            Some(r @ GitRef::Branch(_)) => (r.full(), r.name().to_string(), "branch"),
            Some(r @ GitRef::Tag(_)) => (r.full(), r.name().to_string(), "tag"),
            None => (String::new(), String::new(), ""),
        };

        ctx.set(
            "github",
            json!({
                "event_name": self.run.event,
                "ref": git_ref,
                "ref_name": ref_name,
                "ref_type": ref_type,
                "workspace": self.run.workspace.to_string_lossy(),
                "job": self.job_id,
                "workflow": self.run.workflow_name,
            }),
        );

        let mut env = self.workflow.env.clone();
        env.extend(self.job.env.clone());
        env.extend(state.exported.clone());
        ctx.set("env", json!(env));

        ctx.set("matrix", json!(self.matrix));
        ctx.set("steps", Value::Object(state.steps.clone()));
        ctx.set("needs", self.needs.clone());
        ctx.set(
            "job",
            json!({ "status": if state.failed { "failure" } else { "success" } }),
        );
        ctx.set(
            "runner",
            json!({
                "os": runner_os(),
                "arch": runner_arch(),
                "temp": temp.map(|t| t.to_string_lossy().into_owned()).unwrap_or_default(),
            }),
        );
        ctx
    }

    /// Adds the step's `env` context: workflow, job, exported and step
    /// variables, later layers winning. Declared values are interpolated;
    /// exported values are taken as-is.
    fn step_context(
        &self,
        step: &Step,
        state: &JobState,
        mut ctx: ExpressionContext,
    ) -> Result<(ExpressionContext, EnvMap)> {
        let mut env = EnvMap::new();

        for layer in [&self.workflow.env, &self.job.env] {
            ctx.set("env", json!(env));
            for (key, value) in layer {
                let value = interpolate(value, &ctx)?;
                env.insert(key.clone(), value);
            }
        }

        env.extend(state.exported.clone());

        ctx.set("env", json!(env));
        for (key, value) in &step.env {
            let value = interpolate(value, &ctx)?;
            env.insert(key.clone(), value);
        }

        ctx.set("env", json!(env));
        Ok((ctx, env))
    }

    /// Full child environment: inherited variables, runner defaults, then
    /// the workflow variables and the `PATH` additions.
    fn process_env(&self, temp: &Path, context_env: &EnvMap, state: &JobState) -> EnvMap {
        let mut env = self.run.base_env.clone();

        let workspace = self.run.workspace.to_string_lossy().into_owned();
        let defaults = [
            ("CI", "true".to_string()),
            ("GITHUB_ACTIONS", "true".to_string()),
            ("GITHUB_WORKSPACE", workspace),
            ("GITHUB_EVENT_NAME", self.run.event.clone()),
            ("GITHUB_WORKFLOW", self.run.workflow_name.clone()),
            ("GITHUB_JOB", self.job_id.to_string()),
            ("RUNNER_OS", runner_os().to_string()),
            ("RUNNER_ARCH", runner_arch().to_string()),
            ("RUNNER_TEMP", temp.to_string_lossy().into_owned()),
        ];
        for (key, value) in defaults {
            env.insert(key.to_string(), value);
        }
        if let Some(git_ref) = &self.run.git_ref {
            env.insert("GITHUB_REF".to_string(), git_ref.full());
            env.insert("GITHUB_REF_NAME".to_string(), git_ref.name().to_string());
        }

        for (key, value) in context_env {
            env.insert(key.clone(), value.clone());
        }

        if !state.path.is_empty() {
            let base = env.get("PATH").cloned().unwrap_or_default();
            let mut entries = state.path.clone();
            entries.extend(std::env::split_paths(&base));
            match std::env::join_paths(entries) {
                Ok(joined) => {
                    env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
                }
                Err(e) => warn!("Ignoring PATH additions: {}", e),
            }
        }

        env
    }

    /// Step `working-directory`, else the job default, relative to the workspace.
    fn working_dir(&self, step: &Step, ctx: &ExpressionContext) -> Result<PathBuf> {
        let configured = step
            .working_directory
            .as_deref()
            .or(self.job.defaults.run.working_directory.as_deref());

        match configured {
            Some(dir) => Ok(self.run.workspace.join(interpolate(dir, ctx)?)),
            None => Ok(self.run.workspace.clone()),
        }
    }

    fn print_dry_run(&self, step: &Step, label: &str, ctx: &ExpressionContext) {
        println!();
        println!("[DRY RUN] Step: {}", label);
        match step.kind() {
            Some(StepKind::Script(command)) => {
                let command = interpolate(command, ctx).unwrap_or_else(|_| command.to_string());
                let shell = step
                    .shell
                    .as_deref()
                    .or(self.job.defaults.run.shell.as_deref())
                    .unwrap_or("bash");
                println!("  Shell: {}", shell);
                for line in command.lines() {
                    println!("  | {}", line);
                }
            }
            Some(StepKind::Action(uses)) => {
                println!("  Uses: {}", uses);
                for (key, value) in &step.with {
                    let value = interpolate(value, ctx).unwrap_or_else(|_| value.clone());
                    println!("  With: {} = {}", key, value);
                }
            }
            None => {}
        }
    }
}

/// Step name with expressions resolved where possible.
fn step_label(step: &Step, ctx: &ExpressionContext) -> String {
    let name = step.display_name();
    if name.contains("${{") {
        interpolate(&name, ctx).unwrap_or(name)
    } else {
        name
    }
}

/// `None` for values no `Duration` can hold (negative, NaN, too large).
fn minutes(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value * 60.0).ok()
}

/// Step timeout capped by what is left of the job timeout.
fn step_timeout(step: &Step, deadline: Option<Instant>) -> Option<Duration> {
    let own = step.timeout_minutes.and_then(minutes);
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));

    match (own, remaining) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn runner_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

fn runner_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "X64",
        "x86" => "X86",
        "aarch64" => "ARM64",
        "arm" => "ARM",
        other => other,
    }
}
