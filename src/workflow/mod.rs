//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating CI workflow definitions.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, Job, Step)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and job ordering
//! - [`matrix`]: Matrix expansion
//! - [`triggers`]: Event and branch matching

pub mod matrix;
pub mod model;
pub mod parser;
pub mod triggers;
pub mod validator;

pub use matrix::{expand_matrix, instance_name, Matrix};
pub use model::{EnvMap, Job, MatrixValues, Step, StepKind, Strategy, Workflow};
pub use parser::{discover_workflow, load_workflow, parse_workflow};
pub use triggers::{GitRef, TriggerFilter, Triggers};
pub use validator::{job_order, validate_workflow, ValidationError, MAX_TIMEOUT_MINUTES};
