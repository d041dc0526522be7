//! Trigger Matching
//!
//! Decides whether an event (and the ref it happened on) starts a
//! workflow run. The `on:` key accepts three shapes:
//!
//! ```yaml
//! on: push
//! on: [push, pull_request]
//! on:
//!   push:
//!     branches: [main, "releases/*"]
//!     tags-ignore: ["v*-rc"]
//!   workflow_dispatch:
//! ```

use glob::{MatchOptions, Pattern};
use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use super::model::single_or_vec;

/// Branch and tag filters attached to one event.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerFilter {
    #[serde(default, deserialize_with = "single_or_vec")]
    pub branches: Vec<String>,
    #[serde(default, deserialize_with = "single_or_vec")]
    pub branches_ignore: Vec<String>,
    #[serde(default, deserialize_with = "single_or_vec")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "single_or_vec")]
    pub tags_ignore: Vec<String>,
    /// Not evaluated locally: no change set is known
    #[serde(default, deserialize_with = "single_or_vec")]
    pub paths: Vec<String>,
    #[serde(default, deserialize_with = "single_or_vec")]
    pub paths_ignore: Vec<String>,
}

/// A git ref the run is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// Parses `refs/heads/x`, `refs/tags/x`, or a bare branch name.
    pub fn parse(reference: &str) -> Self {
        if let Some(tag) = reference.strip_prefix("refs/tags/") {
            Self::Tag(tag.to_string())
        } else if let Some(branch) = reference.strip_prefix("refs/heads/") {
            Self::Branch(branch.to_string())
        } else {
            Self::Branch(reference.to_string())
        }
    }

    /// Short name (`main`, `v1.0`).
    pub fn name(&self) -> &str {
        match self {
            Self::Branch(name) | Self::Tag(name) => name,
        }
    }

    /// Fully-qualified ref (`refs/heads/main`).
    pub fn full(&self) -> String {
        match self {
            Self::Branch(name) => format!("refs/heads/{}", name),
            Self::Tag(name) => format!("refs/tags/{}", name),
        }
    }
}

impl TriggerFilter {
    /// Returns true when the ref passes the branch/tag filters.
    pub fn matches_ref(&self, git_ref: &GitRef) -> bool {
        if !self.paths.is_empty() || !self.paths_ignore.is_empty() {
            debug!("Path filters are not evaluated for local runs");
        }

        match git_ref {
            GitRef::Branch(name) => {
                if !self.branches.is_empty() {
                    return matches_patterns(&self.branches, name);
                }
                if !self.branches_ignore.is_empty() {
                    return !self.branches_ignore.iter().any(|p| glob_match(p, name));
                }
                // A tag-only filter never fires for branches
                self.tags.is_empty() && self.tags_ignore.is_empty()
            }
            GitRef::Tag(name) => {
                if !self.tags.is_empty() {
                    return matches_patterns(&self.tags, name);
                }
                if !self.tags_ignore.is_empty() {
                    return !self.tags_ignore.iter().any(|p| glob_match(p, name));
                }
                self.branches.is_empty() && self.branches_ignore.is_empty()
            }
        }
    }
}

/// The set of events that start a workflow.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(try_from = "RawTriggers")]
pub struct Triggers {
    events: IndexMap<String, TriggerFilter>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTriggers {
    Single(String),
    List(Vec<String>),
    Map(IndexMap<String, Value>),
}

impl TryFrom<RawTriggers> for Triggers {
    type Error = String;

    fn try_from(raw: RawTriggers) -> Result<Self, Self::Error> {
        let mut triggers = Triggers::default();
        match raw {
            RawTriggers::Single(event) => triggers.add_event(event),
            RawTriggers::List(events) => events.into_iter().for_each(|e| triggers.add_event(e)),
            RawTriggers::Map(map) => {
                for (event, value) in map {
                    // Non-mapping bodies (`schedule:` lists, null) carry no ref filters
                    let filter = match value {
                        Value::Object(_) => serde_json::from_value(value)
                            .map_err(|e| format!("Invalid filter for event '{}': {}", event, e))?,
                        _ => TriggerFilter::default(),
                    };
                    triggers.events.insert(event, filter);
                }
            }
        }
        Ok(triggers)
    }
}

impl Triggers {
    /// Adds an event without filters.
    pub fn add_event(&mut self, event: impl Into<String>) {
        self.events.insert(event.into(), TriggerFilter::default());
    }

    /// Adds an event with filters.
    pub fn add_filtered(&mut self, event: impl Into<String>, filter: TriggerFilter) {
        self.events.insert(event.into(), filter);
    }

    /// Returns true if the event is listed at all.
    pub fn contains(&self, event: &str) -> bool {
        self.events.contains_key(event)
    }

    /// Event names in declaration order.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn filter(&self, event: &str) -> Option<&TriggerFilter> {
        self.events.get(event)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Decides whether `event` on `git_ref` starts a run.
    ///
    /// With no ref, only the event name is checked.
    pub fn matches(&self, event: &str, git_ref: Option<&GitRef>) -> bool {
        let Some(filter) = self.events.get(event) else {
            debug!("Event '{}' is not a trigger", event);
            return false;
        };

        match git_ref {
            Some(r) => filter.matches_ref(r),
            None => true,
        }
    }
}

/// Ordered include/exclude matching: `!pattern` negates, last match wins.
fn matches_patterns(patterns: &[String], name: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_match(negated, name) {
                matched = false;
            }
        } else if glob_match(pattern, name) {
            matched = true;
        }
    }
    matched
}

/// Glob match where `*` stops at `/`.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(name, options),
        Err(_) => pattern == name,
    }
}
