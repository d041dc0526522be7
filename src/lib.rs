//! cirunner - Local CI Workflow Runner
//!
//! Reads a GitHub-Actions-style workflow definition and runs its jobs on
//! the local machine. Steps run strictly in order; the first failing step
//! stops its job and the run is reported as failed.
//!
//! # Architecture
//!
//! - [`workflow`]: Data model, parsing, validation, matrix and triggers
//! - [`expression`]: `${{ }}` expressions and `if:` conditions
//! - [`actions`]: Action references and built-in action handlers
//! - [`execution`]: Engine, job sequencer and shell execution
//! - [`report`]: Run results and JSON reports
//! - [`monitoring`]: Step timing
//!
//! # Example
//!
//! ```rust,no_run
//! use cirunner::execution::Engine;
//! use cirunner::load_workflow;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow(".github/workflows/ci.yml")?;
//!
//!     // Simulate a push to main
//!     let mut engine = Engine::new(workflow);
//!     engine.set_event("push");
//!     engine.set_ref("main");
//!
//!     let report = engine.run().await?;
//!     assert!(report.succeeded());
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod error;
pub mod execution;
pub mod expression;
pub mod monitoring;
pub mod report;
pub mod workflow;

// Re-export commonly used types
pub use error::{Result, RunnerError};
pub use execution::engine::Engine;
pub use report::{JobReport, JobStatus, RunReport, StepReport, StepStatus};
pub use workflow::model::{Job, Step, Workflow};
pub use workflow::parser::{load_workflow, parse_workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "cirunner";
