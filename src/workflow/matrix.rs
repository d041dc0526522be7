//! Matrix Expansion
//!
//! Turns a job's `strategy.matrix` into the list of concrete parameter
//! combinations the job is repeated over.
//!
//! ```yaml
//! matrix:
//!   os: [ubuntu-latest, macos-latest]
//!   python-version: ["3.11", "3.12"]
//!   exclude:
//!     - os: macos-latest
//!       python-version: "3.11"
//!   include:
//!     - python-version: "3.12"
//!       experimental: true
//! ```

use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use super::model::MatrixValues;
use crate::error::{Result, RunnerError};

/// Matrix definition: axes plus include/exclude adjustments.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Matrix {
    #[serde(default)]
    pub include: Vec<MatrixValues>,

    #[serde(default)]
    pub exclude: Vec<MatrixValues>,

    /// Axis name -> list of values, in declaration order
    #[serde(flatten)]
    pub axes: IndexMap<String, Value>,
}

impl Matrix {
    /// True when the matrix declares nothing.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty() && self.include.is_empty()
    }
}

/// Expands a matrix into its combinations.
///
/// 1. Cartesian product of the axes (no axes: a single empty combination)
/// 2. Combinations matching an `exclude` entry are dropped
/// 3. Each `include` entry is merged into every combination whose axis
///    values it agrees with, or appended when it agrees with none
///
/// # Example
/// ```
/// use cirunner::workflow::matrix::{expand_matrix, Matrix};
/// use serde_json::json;
///
/// let mut matrix = Matrix::default();
/// matrix.axes.insert("python".to_string(), json!(["3.11", "3.12"]));
/// matrix.axes.insert("os".to_string(), json!(["linux"]));
///
/// let combos = expand_matrix("test", &matrix).unwrap();
/// assert_eq!(combos.len(), 2);
/// assert_eq!(combos[1]["python"], json!("3.12"));
/// ```
pub fn expand_matrix(job_id: &str, matrix: &Matrix) -> Result<Vec<MatrixValues>> {
    let matrix_error = |message: String| RunnerError::Matrix {
        job: job_id.to_string(),
        message,
    };

    let mut combinations: Vec<MatrixValues> = vec![IndexMap::new()];

    for (key, value) in &matrix.axes {
        let values = value
            .as_array()
            .ok_or_else(|| matrix_error(format!("axis '{}' must be a list of values", key)))?;

        if values.is_empty() {
            return Err(matrix_error(format!("axis '{}' does not contain any values", key)));
        }

        combinations = combinations
            .into_iter()
            .flat_map(|combo| {
                values.iter().map(move |v| {
                    let mut next = combo.clone();
                    next.insert(key.clone(), v.clone());
                    next
                })
            })
            .collect();
    }

    let before = combinations.len();
    combinations.retain(|combo| !matrix.exclude.iter().any(|entry| entry_matches(entry, combo)));
    if combinations.len() != before {
        debug!(
            "Matrix for '{}': excluded {} combination(s)",
            job_id,
            before - combinations.len()
        );
    }

    // An include-only matrix yields exactly its include entries
    if matrix.axes.is_empty() && !matrix.include.is_empty() {
        combinations.clear();
    }

    for entry in &matrix.include {
        let mut merged = false;

        for combo in combinations.iter_mut() {
            let compatible = entry
                .iter()
                .filter(|(key, _)| matrix.axes.contains_key(*key))
                .all(|(key, value)| combo.get(key) == Some(value));

            if compatible && !matrix.axes.is_empty() {
                for (key, value) in entry {
                    combo.insert(key.clone(), value.clone());
                }
                merged = true;
            }
        }

        if !merged {
            combinations.push(entry.clone());
        }
    }

    debug!(
        "Matrix for '{}' expanded to {} combination(s)",
        job_id,
        combinations.len()
    );

    Ok(combinations)
}

/// True if every key of `entry` has the same value in `combo`.
fn entry_matches(entry: &MatrixValues, combo: &MatrixValues) -> bool {
    entry.iter().all(|(key, value)| combo.get(key) == Some(value))
}

/// Display name of a job instance, e.g. `test (ubuntu-latest, 3.12)`.
pub fn instance_name(job_name: &str, combo: &MatrixValues) -> String {
    if combo.is_empty() {
        return job_name.to_string();
    }

    let values: Vec<String> = combo.values().map(display_value).collect();
    format!("{} ({})", job_name, values.join(", "))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(yaml: &str) -> Matrix {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_no_matrix_single_combination() {
        let combos = expand_matrix("build", &Matrix::default()).unwrap();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn test_cartesian_product_in_declared_order() {
        let matrix = parse(
            r#"
os: [linux, macos]
python: ["3.11", "3.12"]
"#,
        );
        let combos = expand_matrix("test", &matrix).unwrap();

        assert_eq!(combos.len(), 4);
        assert_eq!(combos[0]["os"], json!("linux"));
        assert_eq!(combos[0]["python"], json!("3.11"));
        assert_eq!(combos[1]["python"], json!("3.12"));
        assert_eq!(combos[3]["os"], json!("macos"));
        let keys: Vec<&String> = combos[0].keys().collect();
        assert_eq!(keys, vec!["os", "python"]);
    }

    #[test]
    fn test_exclude() {
        let matrix = parse(
            r#"
os: [linux, macos]
python: ["3.11", "3.12"]
exclude:
  - os: macos
    python: "3.11"
"#,
        );
        let combos = expand_matrix("test", &matrix).unwrap();
        assert_eq!(combos.len(), 3);
        assert!(!combos
            .iter()
            .any(|c| c["os"] == json!("macos") && c["python"] == json!("3.11")));
    }

    #[test]
    fn test_include_merges_and_appends() {
        let matrix = parse(
            r#"
python: ["3.11", "3.12"]
include:
  - python: "3.12"
    experimental: true
  - python: "3.13"
    experimental: true
"#,
        );
        let combos = expand_matrix("test", &matrix).unwrap();

        assert_eq!(combos.len(), 3);
        assert!(combos[0].get("experimental").is_none());
        assert_eq!(combos[1]["experimental"], json!(true));
        assert_eq!(combos[2]["python"], json!("3.13"));
    }

    #[test]
    fn test_include_extra_key_added_to_all() {
        let matrix = parse(
            r#"
python: ["3.11", "3.12"]
include:
  - coverage: true
"#,
        );
        let combos = expand_matrix("test", &matrix).unwrap();
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c["coverage"] == json!(true)));
    }

    #[test]
    fn test_include_only_matrix() {
        let matrix = parse(
            r#"
include:
  - target: x86_64
  - target: aarch64
"#,
        );
        let combos = expand_matrix("build", &matrix).unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[0]["target"], json!("x86_64"));
        assert_eq!(combos[1]["target"], json!("aarch64"));
    }

    #[test]
    fn test_empty_axis_is_error() {
        let matrix = parse("python: []\n");
        let err = expand_matrix("test", &matrix).unwrap_err();
        assert!(err.to_string().contains("'python'"));
    }

    #[test]
    fn test_scalar_axis_is_error() {
        let matrix = parse("python: \"3.12\"\n");
        assert!(expand_matrix("test", &matrix).is_err());
    }

    #[test]
    fn test_unquoted_version_keeps_yaml_number() {
        // 3.10 is a YAML float, so it reads back as 3.1
        let matrix = parse("python: [3.10]\n");
        let combos = expand_matrix("test", &matrix).unwrap();
        assert_eq!(instance_name("test", &combos[0]), "test (3.1)");
    }

    #[test]
    fn test_instance_name() {
        let mut combo = IndexMap::new();
        assert_eq!(instance_name("build", &combo), "build");

        combo.insert("os".to_string(), json!("ubuntu-latest"));
        combo.insert("python".to_string(), json!("3.12"));
        assert_eq!(instance_name("build", &combo), "build (ubuntu-latest, 3.12)");
    }
}
