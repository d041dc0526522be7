//! `actions/setup-python`
//!
//! Resolves an installed interpreter matching `python-version` instead of
//! downloading one. Lookup order for a requested `3.11`:
//!
//! 1. `python3.11`
//! 2. `python3`
//! 3. `python`
//!
//! The first candidate whose reported version matches wins. Its directory
//! is prepended to `PATH` for the steps that follow, and a shim directory
//! under the job's temp dir maps `python`, `python3`, `pip` and `pip3` to
//! that interpreter so later steps never pick up a different one.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};

use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::error::{Result, RunnerError};
use crate::workflow::EnvMap;

const DEFAULT_VERSION: &str = "3";

pub struct SetupPython;

impl ActionHandler for SetupPython {
    fn name(&self) -> &'static str {
        "actions/setup-python"
    }

    fn run(&self, inputs: &EnvMap, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        let requested = requested_version(inputs, ctx.workspace)?;

        if requested.to_lowercase().starts_with("pypy") {
            return Err(RunnerError::action(
                self.name(),
                format!("'{}' is not supported, only CPython", requested),
            ));
        }

        if inputs.get("cache").is_some_and(|v| !v.is_empty()) {
            warn!("actions/setup-python: 'cache' input ignored for local runs");
        }

        let search_path = ctx.search_path();
        for candidate in candidates(&requested) {
            let Ok(path) = which::which_in(&candidate, Some(&search_path), ctx.workspace) else {
                debug!("setup-python: {} not found", candidate);
                continue;
            };

            let Some(version) = interpreter_version(&path) else {
                debug!("setup-python: could not query {}", path.display());
                continue;
            };

            if !version_matches(&requested, &version) {
                debug!(
                    "setup-python: {} is {}, wanted {}",
                    path.display(),
                    version,
                    requested
                );
                continue;
            }

            info!("Using Python {} at {}", version, path.display());
            let shims = write_shims(ctx.temp, &path, &version)?;
            let mut result = outcome(&path, &version);
            result.path.push(shims);
            return Ok(result);
        }

        Err(RunnerError::action(
            self.name(),
            format!("no Python interpreter matching '{}' found on PATH", requested),
        ))
    }
}

/// Reads `python-version`, falling back to `python-version-file`.
fn requested_version(inputs: &EnvMap, workspace: &Path) -> Result<String> {
    if let Some(version) = inputs.get("python-version").map(|v| v.trim()) {
        if !version.is_empty() {
            return Ok(version.to_string());
        }
    }

    if let Some(file) = inputs.get("python-version-file").filter(|f| !f.is_empty()) {
        let content = std::fs::read_to_string(workspace.join(file)).map_err(|e| {
            RunnerError::action("actions/setup-python", format!("{}: {}", file, e))
        })?;
        if let Some(line) = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
        {
            return Ok(line.to_string());
        }
    }

    Ok(DEFAULT_VERSION.to_string())
}

/// Executable names to try, most specific first.
fn candidates(requested: &str) -> Vec<String> {
    let parts: Vec<&str> = requested
        .split('.')
        .take_while(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .collect();

    let mut names = Vec::new();
    if parts.len() >= 2 {
        names.push(format!("python{}.{}", parts[0], parts[1]));
    }
    names.push("python3".to_string());
    names.push("python".to_string());
    names
}

/// Runs `<python> --version` and returns e.g. `3.11.4`.
fn interpreter_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }

    // Python 2 printed the version on stderr
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };

    text.trim()
        .strip_prefix("Python ")
        .map(|v| v.trim().to_string())
}

/// Component-wise prefix match; `x` matches any component.
///
/// `3` matches `3.12.1`, `3.11` matches `3.11.4` but not `3.1.2`.
pub fn version_matches(requested: &str, actual: &str) -> bool {
    let actual: Vec<&str> = actual.split('.').collect();

    requested
        .trim()
        .split('.')
        .enumerate()
        .all(|(i, want)| match actual.get(i) {
            _ if want.eq_ignore_ascii_case("x") || want == "*" => true,
            Some(have) => {
                // release suffixes such as 12rc1
                let digits: String = have.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits == want
            }
            None => false,
        })
}

/// Writes wrapper scripts that forward to `interpreter`.
///
/// Returns the shim directory. It goes last in `ActionOutcome::path`,
/// which gives it the highest priority.
fn write_shims(temp: &Path, interpreter: &Path, version: &str) -> Result<PathBuf> {
    let dir = temp.join("setup-python").join("bin");
    fs::create_dir_all(&dir)?;

    let target = shell_quote(&interpreter.to_string_lossy());
    let mut shims = vec![
        ("python".to_string(), format!("exec {} \"$@\"", target)),
        ("python3".to_string(), format!("exec {} \"$@\"", target)),
        ("pip".to_string(), format!("exec {} -m pip \"$@\"", target)),
        ("pip3".to_string(), format!("exec {} -m pip \"$@\"", target)),
    ];
    let mut parts = version.split('.');
    if let (Some(major), Some(minor)) = (parts.next(), parts.next()) {
        shims.push((
            format!("python{}.{}", major, minor),
            format!("exec {} \"$@\"", target),
        ));
    }

    for (name, body) in shims {
        let path = dir.join(&name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
    }

    debug!("setup-python: shims in {}", dir.display());
    Ok(dir)
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

fn outcome(interpreter: &Path, version: &str) -> ActionOutcome {
    let bin_dir = interpreter
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    // installation prefix: <prefix>/bin/python3
    let location = if bin_dir.file_name().is_some_and(|n| n == "bin") {
        bin_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| bin_dir.clone())
    } else {
        bin_dir.clone()
    };

    let mut outcome = ActionOutcome::default();
    outcome.env.insert(
        "pythonLocation".to_string(),
        location.to_string_lossy().into_owned(),
    );
    outcome
        .outputs
        .insert("python-version".to_string(), version.to_string());
    outcome.outputs.insert(
        "python-path".to_string(),
        interpreter.to_string_lossy().into_owned(),
    );
    outcome.path.push(bin_dir);
    outcome.messages.push(format!(
        "Successfully set up CPython ({}) at {}",
        version,
        interpreter.display()
    ));
    outcome
}
