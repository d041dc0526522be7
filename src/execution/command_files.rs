//! Step Command Files
//!
//! Each step receives the paths of three files through `GITHUB_ENV`,
//! `GITHUB_PATH` and `GITHUB_OUTPUT`. Whatever the step appends there is
//! read back after it exits and applied to the steps that follow.
//!
//! `GITHUB_ENV` and `GITHUB_OUTPUT` accept `NAME=value` lines and the
//! multi-line form:
//!
//! ```text
//! NAME<<EOF
//! line one
//! line two
//! EOF
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, RunnerError};
use crate::workflow::EnvMap;

/// The files handed to one step.
#[derive(Debug, Clone)]
pub struct CommandFiles {
    pub env: PathBuf,
    pub path: PathBuf,
    pub output: PathBuf,
}

/// What a step wrote into its command files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandEffects {
    pub env: EnvMap,
    pub path: Vec<PathBuf>,
    pub outputs: EnvMap,
}

impl CommandFiles {
    /// Creates empty command files for step `index` inside `dir`.
    pub fn create(dir: &Path, index: usize) -> Result<Self> {
        let files = Self {
            env: dir.join(format!("env_{}", index)),
            path: dir.join(format!("path_{}", index)),
            output: dir.join(format!("output_{}", index)),
        };

        for file in [&files.env, &files.path, &files.output] {
            fs::write(file, "")?;
        }

        Ok(files)
    }

    /// Variables that point the step at these files.
    pub fn env_vars(&self) -> [(&'static str, String); 3] {
        [
            ("GITHUB_ENV", self.env.to_string_lossy().into_owned()),
            ("GITHUB_PATH", self.path.to_string_lossy().into_owned()),
            ("GITHUB_OUTPUT", self.output.to_string_lossy().into_owned()),
        ]
    }

    /// Reads back everything the step wrote.
    pub fn collect(&self) -> Result<CommandEffects> {
        Ok(CommandEffects {
            env: parse_key_values(&read_optional(&self.env)?)?,
            path: parse_paths(&read_optional(&self.path)?),
            outputs: parse_key_values(&read_optional(&self.output)?)?,
        })
    }
}

/// A step may delete its own command file.
fn read_optional(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Parses `NAME=value` and `NAME<<DELIM` blocks. Later entries win.
pub fn parse_key_values(content: &str) -> Result<EnvMap> {
    let mut values = EnvMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        let heredoc = line.split_once("<<");
        let assign = line.split_once('=');

        // whichever separator comes first decides the form
        let use_heredoc = match (heredoc, assign) {
            (Some((h, _)), Some((a, _))) => h.len() < a.len(),
            (Some(_), None) => true,
            _ => false,
        };

        if use_heredoc {
            let (name, delimiter) = heredoc.unwrap_or_default();
            let name = valid_name(name, line)?;
            let delimiter = delimiter.trim();
            if delimiter.is_empty() {
                return Err(invalid(line, "empty heredoc delimiter"));
            }

            let mut body: Vec<&str> = Vec::new();
            let mut closed = false;
            for next in lines.by_ref() {
                if next == delimiter {
                    closed = true;
                    break;
                }
                body.push(next);
            }
            if !closed {
                return Err(invalid(
                    line,
                    &format!("missing closing delimiter '{}'", delimiter),
                ));
            }

            values.shift_remove(&name);
            values.insert(name, body.join("\n"));
        } else if let Some((name, value)) = assign {
            let name = valid_name(name, line)?;
            values.shift_remove(&name);
            values.insert(name, value.to_string());
        } else {
            return Err(invalid(line, "expected NAME=value or NAME<<DELIMITER"));
        }
    }

    Ok(values)
}

/// One directory per non-blank line, in the order written.
pub fn parse_paths(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn valid_name(name: &str, line: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(invalid(line, "invalid variable name"));
    }
    Ok(name.to_string())
}

fn invalid(line: &str, message: &str) -> RunnerError {
    RunnerError::CommandFile {
        line: line.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_simple_assignments() {
        let values = parse_key_values("A=1\n\nB=x=y\nA=2\n").unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["A"], "2");
        assert_eq!(values["B"], "x=y");
    }

    #[test]
    fn test_parse_heredoc() {
        let content = "NOTES<<EOF\nfirst\nsecond=line\nEOF\nAFTER=yes\n";
        let values = parse_key_values(content).unwrap();
        assert_eq!(values["NOTES"], "first\nsecond=line");
        assert_eq!(values["AFTER"], "yes");
    }

    #[test]
    fn test_value_containing_heredoc_marker() {
        let values = parse_key_values("SHIFT=a<<b\n").unwrap();
        assert_eq!(values["SHIFT"], "a<<b");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_key_values("NOTES<<EOF\nunterminated\n").is_err());
        assert!(parse_key_values("no separator\n").is_err());
        assert!(parse_key_values("=value\n").is_err());
    }

    #[test]
    fn test_parse_paths() {
        let paths = parse_paths("/opt/tool/bin\n\n  /usr/local/go/bin  \n");
        assert_eq!(
            paths,
            vec![PathBuf::from("/opt/tool/bin"), PathBuf::from("/usr/local/go/bin")]
        );
    }

    #[test]
    fn test_create_and_collect() {
        let dir = tempdir().unwrap();
        let files = CommandFiles::create(dir.path(), 3).unwrap();
        assert!(files.env.ends_with("env_3"));

        fs::write(&files.env, "MODE=ci\n").unwrap();
        fs::write(&files.path, "/opt/bin\n").unwrap();
        fs::remove_file(&files.output).unwrap();

        let effects = files.collect().unwrap();
        assert_eq!(effects.env["MODE"], "ci");
        assert_eq!(effects.path, vec![PathBuf::from("/opt/bin")]);
        assert!(effects.outputs.is_empty());
    }
}
