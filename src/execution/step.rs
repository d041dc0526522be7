//! Script Step Execution
//!
//! Handles the execution of a single `run:` step:
//! - Shell selection
//! - Script generation
//! - Process spawning with a timeout
//! - Output capture

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::process::Command;

use crate::error::{Result, RunnerError};
use crate::workflow::EnvMap;

/// Exit code recorded when a step is killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Interpreter used for a `run:` block.
#[derive(Debug, Clone, PartialEq)]
pub enum Shell {
    Bash,
    Sh,
    Python,
    /// Command template where `{0}` is replaced by the script path
    Custom(String),
}

impl Shell {
    /// Resolves a `shell:` value. Unknown names without `{0}` are rejected.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "" | "bash" => Ok(Self::Bash),
            "sh" => Ok(Self::Sh),
            "python" => Ok(Self::Python),
            custom if custom.contains("{0}") => Ok(Self::Custom(custom.to_string())),
            other => Err(RunnerError::action(
                "shell",
                format!("unsupported shell '{}', use bash, sh, python or a template with {{0}}", other),
            )),
        }
    }

    /// Script file extension.
    fn extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            _ => "sh",
        }
    }

    /// Program and arguments that run `script`.
    pub fn command_line(&self, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy().into_owned();
        match self {
            Self::Bash => vec![
                "bash".to_string(),
                "--noprofile".to_string(),
                "--norc".to_string(),
                "-eo".to_string(),
                "pipefail".to_string(),
                script,
            ],
            Self::Sh => vec!["sh".to_string(), "-e".to_string(), script],
            Self::Python => vec!["python".to_string(), script],
            Self::Custom(template) => template
                .split_whitespace()
                .map(|part| part.replace("{0}", &script))
                .collect(),
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::Sh => write!(f, "sh"),
            Self::Python => write!(f, "python"),
            Self::Custom(template) => write!(f, "{}", template),
        }
    }
}

/// A script ready to execute.
#[derive(Debug, Clone)]
pub struct ScriptRequest<'a> {
    pub step_label: &'a str,
    pub script: &'a Path,
    pub shell: &'a Shell,
    pub working_dir: &'a Path,
    /// Complete environment; the child does not inherit the runner's
    pub env: &'a EnvMap,
    pub timeout: Option<Duration>,
}

/// Captured result of a script process.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Writes the body of a `run:` block into `dir`.
pub fn create_execution_script(
    dir: &Path,
    index: usize,
    shell: &Shell,
    command_text: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let script_path = dir.join(format!("step_{}.{}", index, shell.extension()));
    let mut file = File::create(&script_path)?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Runs a generated script and captures its output.
///
/// Failing to spawn the interpreter is an error. A non-zero exit or a
/// timeout is reported through [`ScriptOutput`].
pub async fn execute_script(request: &ScriptRequest<'_>) -> Result<ScriptOutput> {
    let argv = request.shell.command_line(request.script);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RunnerError::action("shell", "empty shell command"))?;

    if !request.working_dir.is_dir() {
        return Err(RunnerError::action(
            "shell",
            format!(
                "working directory does not exist: {}",
                request.working_dir.display()
            ),
        ));
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(request.working_dir)
        .env_clear()
        .envs(request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(
        "Executing '{}' with {} in {}",
        request.step_label,
        request.shell,
        request.working_dir.display()
    );

    let child = cmd.spawn().map_err(|e| {
        RunnerError::action("shell", format!("failed to start '{}': {}", program, e))
    })?;

    let waited = match request.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => Some(result?),
            // dropping the future kills the child
            Err(_) => None,
        },
        None => Some(child.wait_with_output().await?),
    };

    let Some(output) = waited else {
        error!(
            "Step '{}' timed out after {:?}",
            request.step_label,
            request.timeout.unwrap_or_default()
        );
        return Ok(ScriptOutput {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            ..ScriptOutput::default()
        });
    };

    let result = ScriptOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        timed_out: false,
    };

    if result.success() {
        debug!("Step '{}' completed successfully", request.step_label);
        if !result.stdout.trim().is_empty() {
            debug!("Step '{}' output:\n{}", request.step_label, result.stdout);
        }
    } else {
        error!(
            "Step '{}' failed with exit code: {}",
            request.step_label, result.exit_code
        );
        if !result.stderr.trim().is_empty() {
            error!("stderr:\n{}", result.stderr);
        }
        if !result.stdout.trim().is_empty() {
            debug!("stdout:\n{}", result.stdout);
        }
    }

    if output.status.code().is_none() {
        warn!("Step '{}' was terminated by a signal", request.step_label);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_env() -> EnvMap {
        let mut env = EnvMap::new();
        env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        );
        env
    }

    #[test]
    fn test_shell_parse() {
        assert_eq!(Shell::parse("bash").unwrap(), Shell::Bash);
        assert_eq!(Shell::parse("").unwrap(), Shell::Bash);
        assert_eq!(Shell::parse("sh").unwrap(), Shell::Sh);
        assert_eq!(Shell::parse("python").unwrap(), Shell::Python);
        assert_eq!(
            Shell::parse("perl {0}").unwrap(),
            Shell::Custom("perl {0}".to_string())
        );
        assert!(Shell::parse("pwsh").is_err());
    }

    #[test]
    fn test_command_line() {
        let script = Path::new("/tmp/job/step_0.sh");
        assert_eq!(
            Shell::Bash.command_line(script),
            vec!["bash", "--noprofile", "--norc", "-eo", "pipefail", "/tmp/job/step_0.sh"]
        );
        assert_eq!(
            Shell::Custom("bash -x {0}".to_string()).command_line(script),
            vec!["bash", "-x", "/tmp/job/step_0.sh"]
        );
    }

    #[test]
    fn test_create_execution_script() {
        let dir = tempdir().unwrap();
        let path = create_execution_script(dir.path(), 2, &Shell::Python, "print('hi')").unwrap();

        assert!(path.ends_with("step_2.py"));
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "print('hi')\n");
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let dir = tempdir().unwrap();
        let script =
            create_execution_script(dir.path(), 0, &Shell::Bash, "echo out\necho err >&2").unwrap();
        let env = base_env();

        let output = execute_script(&ScriptRequest {
            step_label: "echo",
            script: &script,
            shell: &Shell::Bash,
            working_dir: dir.path(),
            env: &env,
            timeout: None,
        })
        .await
        .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_execute_stops_on_first_error() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("reached");
        let body = format!("false\ntouch {}", marker.display());
        let script = create_execution_script(dir.path(), 0, &Shell::Bash, &body).unwrap();
        let env = base_env();

        let output = execute_script(&ScriptRequest {
            step_label: "fail",
            script: &script,
            shell: &Shell::Bash,
            working_dir: dir.path(),
            env: &env,
            timeout: None,
        })
        .await
        .unwrap();

        assert_eq!(output.exit_code, 1);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let dir = tempdir().unwrap();
        let script = create_execution_script(dir.path(), 0, &Shell::Sh, "sleep 5").unwrap();
        let env = base_env();

        let output = execute_script(&ScriptRequest {
            step_label: "slow",
            script: &script,
            shell: &Shell::Sh,
            working_dir: dir.path(),
            env: &env,
            timeout: Some(Duration::from_millis(200)),
        })
        .await
        .unwrap();

        assert!(output.timed_out);
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_execute_missing_working_dir() {
        let dir = tempdir().unwrap();
        let script = create_execution_script(dir.path(), 0, &Shell::Bash, "true").unwrap();
        let missing = dir.path().join("missing");
        let env = base_env();

        let result = execute_script(&ScriptRequest {
            step_label: "cd",
            script: &script,
            shell: &Shell::Bash,
            working_dir: &missing,
            env: &env,
            timeout: None,
        })
        .await;

        assert!(result.is_err());
    }
}
