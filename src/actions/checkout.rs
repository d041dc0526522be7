//! `actions/checkout`
//!
//! The runner executes against a local working tree, so checkout only
//! confirms the workspace exists. Inputs that would fetch another
//! repository are reported and ignored.

use log::{info, warn};

use super::{ActionContext, ActionHandler, ActionOutcome};
use crate::error::{Result, RunnerError};
use crate::workflow::EnvMap;

/// Inputs that only make sense for a remote clone.
const IGNORED_INPUTS: &[&str] = &["repository", "path", "ref", "token", "fetch-depth"];

pub struct Checkout;

impl ActionHandler for Checkout {
    fn name(&self) -> &'static str {
        "actions/checkout"
    }

    fn run(&self, inputs: &EnvMap, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
        if !ctx.workspace.is_dir() {
            return Err(RunnerError::action(
                self.name(),
                format!("workspace not found: {}", ctx.workspace.display()),
            ));
        }

        for key in inputs.keys() {
            if IGNORED_INPUTS.contains(&key.as_str()) {
                warn!("actions/checkout: input '{}' ignored for local runs", key);
            }
        }

        info!("Using workspace {}", ctx.workspace.display());

        let mut outcome = ActionOutcome::default();
        outcome
            .messages
            .push(format!("Using local workspace {}", ctx.workspace.display()));
        Ok(outcome)
    }
}
