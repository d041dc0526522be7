//! Action Handling
//!
//! Parses `uses:` references and dispatches them to built-in handlers.
//! Actions are not downloaded: only the handlers registered here can run.
//!
//! # Reference Forms
//!
//! - `owner/repo@ref` and `owner/repo/path@ref`: repository actions
//! - `./path/to/action`: local actions
//! - `docker://image:tag`: container actions
//!
//! # Built-in Handlers
//!
//! - [`checkout::Checkout`]: `actions/checkout`
//! - [`setup_python::SetupPython`]: `actions/setup-python`

pub mod checkout;
pub mod setup_python;

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use once_cell::sync::Lazy;

use crate::error::{Result, RunnerError};
use crate::workflow::EnvMap;

/// Registry holding the handlers shipped with the runner.
pub static BUILTIN_ACTIONS: Lazy<ActionRegistry> = Lazy::new(ActionRegistry::with_builtins);

/// A parsed `uses:` reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRef {
    Repository {
        owner: String,
        repo: String,
        path: Option<String>,
        version: String,
    },
    Local(String),
    Docker(String),
}

impl ActionRef {
    /// Parses a `uses:` value.
    ///
    /// # Example
    /// ```
    /// use cirunner::actions::ActionRef;
    ///
    /// let action = ActionRef::parse("actions/setup-python@v5").unwrap();
    /// assert_eq!(action.name(), "actions/setup-python");
    /// assert!(ActionRef::parse("actions/setup-python").is_err());
    /// ```
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let err = |message: &str| RunnerError::ActionReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        if let Some(image) = reference.strip_prefix("docker://") {
            if image.is_empty() {
                return Err(err("missing image name"));
            }
            return Ok(Self::Docker(image.to_string()));
        }

        if reference.starts_with("./") || reference.starts_with("../") {
            return Ok(Self::Local(reference.to_string()));
        }

        let (name, version) = reference
            .split_once('@')
            .ok_or_else(|| err("missing '@<ref>' version"))?;

        if version.trim().is_empty() {
            return Err(err("empty version after '@'"));
        }

        let mut parts = name.splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        let path = parts.next().filter(|p| !p.is_empty()).map(str::to_string);

        if owner.is_empty() || repo.is_empty() {
            return Err(err("expected 'owner/repo@ref'"));
        }

        Ok(Self::Repository {
            owner: owner.to_string(),
            repo: repo.to_string(),
            path,
            version: version.to_string(),
        })
    }

    /// Lookup key: `owner/repo[/path]` in lower case, without the version.
    pub fn name(&self) -> String {
        match self {
            Self::Repository {
                owner, repo, path, ..
            } => {
                let base = format!("{}/{}", owner, repo);
                match path {
                    Some(p) => format!("{}/{}", base, p).to_lowercase(),
                    None => base.to_lowercase(),
                }
            }
            Self::Local(path) => path.clone(),
            Self::Docker(image) => format!("docker://{}", image),
        }
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repository { version, .. } => write!(f, "{}@{}", self.name(), version),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// What a handler sees of the running job.
pub struct ActionContext<'a> {
    pub workspace: &'a Path,
    /// Per-job scratch directory (`RUNNER_TEMP`)
    pub temp: &'a Path,
    /// Environment the step would run with
    pub env: &'a EnvMap,
    /// Directories added to `PATH` by earlier steps, highest priority first
    pub path_additions: &'a [PathBuf],
}

impl<'a> ActionContext<'a> {
    /// Effective search path: earlier additions first, then the step's `PATH`.
    pub fn search_path(&self) -> OsString {
        let base = self
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();

        let mut entries: Vec<PathBuf> = self.path_additions.to_vec();
        entries.extend(std::env::split_paths(&base));
        std::env::join_paths(entries).unwrap_or(base)
    }
}

/// Effects of a handler on the steps that follow.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Variables exported to later steps
    pub env: EnvMap,
    /// Directories prepended to `PATH` for later steps
    pub path: Vec<PathBuf>,
    /// Values readable as `steps.<id>.outputs.<name>`
    pub outputs: EnvMap,
    /// Lines reported as the step's console output
    pub messages: Vec<String>,
}

/// A built-in implementation of a repository action.
pub trait ActionHandler: Send + Sync {
    /// `owner/repo` this handler implements, in lower case.
    fn name(&self) -> &'static str;

    /// Runs the action with its (already interpolated) `with:` inputs.
    fn run(&self, inputs: &EnvMap, ctx: &ActionContext<'_>) -> Result<ActionOutcome>;
}

/// Lookup table from action name to handler.
pub struct ActionRegistry {
    handlers: HashMap<String, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry with every built-in handler.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(checkout::Checkout));
        registry.register(Box::new(setup_python::SetupPython));
        registry
    }

    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        debug!("Registered action handler: {}", handler.name());
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Finds the handler for a reference; versions are not distinguished.
    pub fn get(&self, action: &ActionRef) -> Option<&dyn ActionHandler> {
        self.handlers.get(&action.name()).map(|h| h.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repository() {
        let action = ActionRef::parse("actions/checkout@v4").unwrap();
        assert_eq!(
            action,
            ActionRef::Repository {
                owner: "actions".to_string(),
                repo: "checkout".to_string(),
                path: None,
                version: "v4".to_string(),
            }
        );
        assert_eq!(action.to_string(), "actions/checkout@v4");
    }

    #[test]
    fn test_parse_repository_with_path() {
        let action = ActionRef::parse("github/codeql-action/init@v3").unwrap();
        assert_eq!(action.name(), "github/codeql-action/init");
    }

    #[test]
    fn test_parse_local_and_docker() {
        assert_eq!(
            ActionRef::parse("./.github/actions/lint").unwrap(),
            ActionRef::Local("./.github/actions/lint".to_string())
        );
        assert_eq!(
            ActionRef::parse("docker://alpine:3.19").unwrap(),
            ActionRef::Docker("alpine:3.19".to_string())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(ActionRef::parse("actions/checkout").is_err());
        assert!(ActionRef::parse("actions/checkout@").is_err());
        assert!(ActionRef::parse("checkout@v4").is_err());
        assert!(ActionRef::parse("docker://").is_err());
    }

    #[test]
    fn test_name_is_case_insensitive() {
        let action = ActionRef::parse("Actions/Setup-Python@v5").unwrap();
        assert_eq!(action.name(), "actions/setup-python");
        assert!(BUILTIN_ACTIONS.get(&action).is_some());
    }

    #[test]
    fn test_builtin_registry() {
        assert_eq!(
            BUILTIN_ACTIONS.names(),
            vec!["actions/checkout", "actions/setup-python"]
        );

        let unknown = ActionRef::parse("actions/cache@v4").unwrap();
        assert!(BUILTIN_ACTIONS.get(&unknown).is_none());
    }

    #[test]
    fn test_search_path_prefers_additions() {
        let mut env = EnvMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        let additions = vec![PathBuf::from("/opt/python/bin")];
        let ctx = ActionContext {
            workspace: Path::new("."),
            temp: Path::new("."),
            env: &env,
            path_additions: &additions,
        };

        let joined = ctx.search_path();
        let entries: Vec<PathBuf> = std::env::split_paths(&joined).collect();
        assert_eq!(
            entries,
            vec![PathBuf::from("/opt/python/bin"), PathBuf::from("/usr/bin")]
        );
    }
}
