//! Workflow Execution Module
//!
//! Runs the jobs of a workflow on the local machine, one step at a time.
//!
//! # Architecture
//!
//! - [`engine`]: Whole-run orchestration (triggers, job order, matrix)
//! - [`job`]: Step sequencer for one job instance
//! - [`step`]: Script generation and shell execution
//! - [`command_files`]: `GITHUB_ENV` / `GITHUB_PATH` / `GITHUB_OUTPUT` parsing

pub mod command_files;
pub mod engine;
pub mod job;
pub mod step;

pub use engine::Engine;
pub use job::{JobRunner, RunContext};
pub use step::Shell;
