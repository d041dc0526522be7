//! cirunner CLI Entry Point
//!
//! Runs a CI workflow definition on the local machine.
//!
//! # Usage
//!
//! ```bash
//! # Run .github/workflows/ci.yml as a push
//! cirunner
//!
//! # Simulate a push to a branch
//! cirunner .github/workflows/ci.yml --ref main
//!
//! # Preview the steps without executing them
//! cirunner --dry-run
//!
//! # Run one job and write a JSON report
//! cirunner --job test --report target/ci-report.json
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use cirunner::execution::{Engine, JobRunner, RunContext};
use cirunner::report::{JobStatus, RunReport, StepStatus};
use cirunner::workflow::{discover_workflow, expand_matrix, load_workflow, validate_workflow, Workflow};
use cirunner::{APP_NAME, VERSION};

/// Lines of output shown for a failed step.
const FAILURE_TAIL_LINES: usize = 20;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: Option<PathBuf>,
    event: String,
    git_ref: Option<String>,
    job: Option<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    dry_run: bool,
    validate_only: bool,
    list: bool,
    strict_actions: bool,
    report_path: Option<PathBuf>,
    timeline: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: None,
            event: "push".to_string(),
            git_ref: None,
            job: None,
            working_dir: None,
            env: Vec::new(),
            dry_run: false,
            validate_only: false,
            list: false,
            strict_actions: false,
            report_path: None,
            timeline: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Local CI Workflow Runner");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: cirunner [OPTIONS] [WORKFLOW_FILE]");
    println!();
    println!("Arguments:");
    println!("  [WORKFLOW_FILE]     Workflow YAML (default: .github/workflows/ci.yml)");
    println!();
    println!("Options:");
    println!("  --event NAME        Event to simulate (default: push)");
    println!("  --ref REF           Branch or tag (main, refs/heads/x, refs/tags/v1)");
    println!("  --job ID            Run one job and the jobs it needs");
    println!("  --working-dir PATH  Workspace the steps run in");
    println!("  --env KEY=VALUE     Extra environment variable (repeatable)");
    println!("  --dry-run           Print the steps without executing them");
    println!("  --validate          Validate the workflow and exit");
    println!("  --list              List jobs and steps and exit");
    println!("  --strict-actions    Fail steps using actions without a built-in handler");
    println!("  --report PATH       Write a JSON run report");
    println!("  --timeline          Print a step timing chart");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  cirunner");
    println!("  cirunner .github/workflows/ci.yml --ref main");
    println!("  cirunner --job test --report target/ci-report.json");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--validate" => config.validate_only = true,
            "--list" => config.list = true,
            "--strict-actions" => config.strict_actions = true,
            "--timeline" => config.timeline = true,
            "--verbose" | "-v" => config.verbose = true,
            "--event" => config.event = option_value(args, &mut i, "--event")?.to_string(),
            "--ref" => config.git_ref = Some(option_value(args, &mut i, "--ref")?.to_string()),
            "--job" => config.job = Some(option_value(args, &mut i, "--job")?.to_string()),
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(option_value(args, &mut i, "--working-dir")?));
            }
            "--report" => {
                config.report_path = Some(PathBuf::from(option_value(args, &mut i, "--report")?));
            }
            "--env" => {
                let pair = option_value(args, &mut i, "--env")?;
                let (key, value) = pair
                    .split_once('=')
                    .filter(|(k, _)| !k.is_empty())
                    .ok_or_else(|| format!("Invalid --env value '{}', expected KEY=VALUE", pair))?;
                config.env.push((key.to_string(), value.to_string()));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Validates the working directory, defaulting to the current one.
fn setup_working_directory(working_dir: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        let current = env::current_dir()?;
        info!("Working directory: {}", current.display());
        return Ok(current);
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    let dir = dir.canonicalize()?;
    info!("Working directory: {}", dir.display());
    Ok(dir)
}

/// Prints jobs, their matrix instances and steps.
fn print_jobs(workflow: &Workflow, workflow_name: &str, workspace: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let order = validate_workflow(workflow)?;
    let run = RunContext::new(workflow_name, workspace);

    for job_id in &order {
        let Some(job) = workflow.job(job_id) else {
            continue;
        };
        let needs = if job.needs.is_empty() {
            String::new()
        } else {
            format!(" (needs: {})", job.needs.join(", "))
        };
        println!("{}{}", job_id.bold(), needs);

        for combination in expand_matrix(job_id, &job.strategy.matrix)? {
            if !combination.is_empty() {
                let runner = JobRunner::new(&run, workflow, job_id, job, &cirunner::actions::BUILTIN_ACTIONS)
                    .with_matrix(combination);
                println!("  instance: {}", runner.display_name());
            }
        }

        for (index, step) in job.steps.iter().enumerate() {
            println!("  {}. {}", index + 1, step.display_name());
        }
    }
    Ok(())
}

/// Prints per-job and per-step results.
fn print_summary(report: &RunReport) {
    println!();
    if !report.triggered {
        println!(
            "{} Workflow '{}' is not triggered by '{}'",
            "-".yellow(),
            report.workflow,
            report.event
        );
        return;
    }

    for job in &report.jobs {
        let mark = match job.status {
            JobStatus::Success => "✓".green(),
            JobStatus::Failed => "✗".red(),
            JobStatus::Skipped => "-".yellow(),
        };
        let reason = job
            .reason
            .as_ref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!("{} {}{} [{} ms]", mark, job.name.bold(), reason, job.duration_ms);

        for step in &job.steps {
            let mark = match step.status {
                StepStatus::Success => "✓".green(),
                StepStatus::Failed => "✗".red(),
                StepStatus::Skipped => "-".dimmed(),
            };
            let reason = step
                .reason
                .as_ref()
                .filter(|_| step.status != StepStatus::Success)
                .map(|r| format!(" ({})", r))
                .unwrap_or_default();
            println!("    {} {}{}", mark, step.name, reason);
        }

        if let Some(failed) = job.failed_step() {
            for (stream, text) in [("stdout", &failed.stdout), ("stderr", &failed.stderr)] {
                if text.trim().is_empty() {
                    continue;
                }
                let lines: Vec<&str> = text.lines().collect();
                let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
                println!("      {}:", stream.dimmed());
                for line in &lines[start..] {
                    println!("      | {}", line);
                }
            }
        }
    }

    println!();
    let summary = report.summary();
    if report.succeeded() {
        println!("{} {}", "Workflow passed:".green().bold(), summary);
    } else {
        println!("{} {}", "Workflow failed:".red().bold(), summary);
    }
}

/// Main application flow. Returns whether the run passed.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    let workspace = setup_working_directory(config.working_dir)?;

    // Locate and load workflow
    let workflow_path = match config.workflow_path {
        Some(path) => path,
        None => discover_workflow(&workspace).ok_or_else(|| {
            format!(
                "No workflow file found in {} (looked for .github/workflows/ci.yml and workflow.yml)",
                workspace.display()
            )
        })?,
    };

    let workflow = load_workflow(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;

    let mut engine = Engine::new(workflow);
    engine.set_workflow_path(&workflow_path);

    if config.validate_only {
        let order = validate_workflow(engine.workflow())?;
        println!(
            "{} {} ({} jobs, {} steps; order: {})",
            "Workflow is valid:".green(),
            workflow_path.display(),
            engine.workflow().jobs.len(),
            engine.workflow().step_count(),
            order.join(" -> ")
        );
        return Ok(true);
    }

    if config.list {
        print_jobs(engine.workflow(), &engine.workflow_name(), &workspace)?;
        return Ok(true);
    }

    // Configure engine
    engine.set_event(&config.event);
    if let Some(git_ref) = &config.git_ref {
        engine.set_ref(git_ref);
    }
    if let Some(job) = config.job {
        engine.set_job_filter(job);
    }
    for (key, value) in config.env {
        engine.add_env(key, value);
    }
    engine.set_working_dir(workspace);
    engine.set_dry_run(config.dry_run);
    engine.set_strict_actions(config.strict_actions);

    // Execute workflow
    let report = engine.run().await?;

    print_summary(&report);

    if config.timeline {
        println!("{}", engine.timeline().gantt_chart());
    }

    if let Some(path) = config.report_path {
        report.save(&path)?;
    }

    Ok(report.succeeded())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cirunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert_eq!(config.event, "push");
        assert!(config.workflow_path.is_none());
        assert!(!config.dry_run);
    }

    #[test]
    fn test_parse_options() {
        let config = parse_arguments(&args(&[
            "ci.yml",
            "--event",
            "pull_request",
            "--ref",
            "refs/heads/main",
            "--job",
            "test",
            "--env",
            "A=1=2",
            "--dry-run",
            "--report",
            "out.json",
        ]))
        .unwrap();

        assert_eq!(config.workflow_path, Some(PathBuf::from("ci.yml")));
        assert_eq!(config.event, "pull_request");
        assert_eq!(config.git_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(config.job.as_deref(), Some("test"));
        assert_eq!(config.env, vec![("A".to_string(), "1=2".to_string())]);
        assert!(config.dry_run);
        assert_eq!(config.report_path, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--ref"])).is_err());
        assert!(parse_arguments(&args(&["--env", "NOVALUE"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yml", "b.yml"])).is_err());
    }
}
