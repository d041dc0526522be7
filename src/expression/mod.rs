//! Expression Evaluation
//!
//! Evaluates the `${{ ... }}` expressions embedded in workflow text and
//! the `if:` conditions of jobs and steps.
//!
//! # Structure
//!
//! - [`parser`]: Tokenizer and expression tree
//! - [`functions`]: Coercion rules and built-in functions
//!
//! # Example
//!
//! ```
//! use cirunner::expression::{interpolate, ExpressionContext};
//! use serde_json::json;
//!
//! let mut ctx = ExpressionContext::new(".");
//! ctx.set("matrix", json!({ "python-version": "3.12" }));
//!
//! let text = interpolate("Set up Python ${{ matrix.python-version }}", &ctx).unwrap();
//! assert_eq!(text, "Set up Python 3.12");
//! ```

pub mod functions;
pub mod parser;

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Result, RunnerError};
use functions::{compare, loose_eq, to_text, truthy};
use parser::{parse, CompareOp, Expr};

/// Named contexts (`github`, `env`, `matrix`, ...) visible to expressions.
#[derive(Debug, Clone)]
pub struct ExpressionContext {
    contexts: Map<String, Value>,
    workspace: PathBuf,
    failed: bool,
}

impl ExpressionContext {
    /// Creates an empty context rooted at `workspace` (used by `hashFiles`).
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            contexts: Map::new(),
            workspace: workspace.into(),
            failed: false,
        }
    }

    /// Sets a named context, replacing any previous value.
    pub fn set(&mut self, name: &str, value: Value) {
        self.contexts.insert(name.to_ascii_lowercase(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.contexts.get(&name.to_ascii_lowercase())
    }

    /// Marks whether an earlier step of the job has failed.
    pub fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Evaluates a bare expression (no `${{ }}` wrapper).
    pub fn evaluate(&self, source: &str) -> Result<Value> {
        let expr = parse(source)?;
        self.eval(&expr, source)
    }

    fn eval(&self, expr: &Expr, source: &str) -> Result<Value> {
        Ok(match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Context(name) => self.get(name).cloned().unwrap_or(Value::Null),
            Expr::Property(target, name) => property(&self.eval(target, source)?, name),
            Expr::Index(target, index) => {
                let target = self.eval(target, source)?;
                let index = self.eval(index, source)?;
                match (&target, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .filter(|f| *f >= 0.0)
                        .and_then(|f| items.get(f as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    (Value::Object(_), _) => property(&target, &to_text(&index)),
                    _ => Value::Null,
                }
            }
            Expr::Not(inner) => Value::Bool(!truthy(&self.eval(inner, source)?)),
            Expr::And(left, right) => {
                let left = self.eval(left, source)?;
                if !truthy(&left) {
                    left
                } else {
                    self.eval(right, source)?
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left, source)?;
                if truthy(&left) {
                    left
                } else {
                    self.eval(right, source)?
                }
            }
            Expr::Compare(left, op, right) => {
                let left = self.eval(left, source)?;
                let right = self.eval(right, source)?;
                let result = match op {
                    CompareOp::Eq => loose_eq(&left, &right),
                    CompareOp::Ne => !loose_eq(&left, &right),
                    CompareOp::Lt => compare(&left, &right).is_some_and(|o| o.is_lt()),
                    CompareOp::Le => compare(&left, &right).is_some_and(|o| o.is_le()),
                    CompareOp::Gt => compare(&left, &right).is_some_and(|o| o.is_gt()),
                    CompareOp::Ge => compare(&left, &right).is_some_and(|o| o.is_ge()),
                };
                Value::Bool(result)
            }
            Expr::Call(name, args) => self.call(name, args, source)?,
        })
    }

    fn call(&self, name: &str, args: &[Expr], source: &str) -> Result<Value> {
        let values = args
            .iter()
            .map(|a| self.eval(a, source))
            .collect::<Result<Vec<Value>>>()?;

        let arity = |min: usize, max: usize| -> Result<()> {
            if values.len() < min || values.len() > max {
                return Err(RunnerError::expression(
                    source,
                    format!("{}() takes {}..={} arguments, got {}", name, min, max, values.len()),
                ));
            }
            Ok(())
        };

        match name.to_ascii_lowercase().as_str() {
            "success" => {
                arity(0, 0)?;
                Ok(Value::Bool(!self.failed))
            }
            "failure" => {
                arity(0, 0)?;
                Ok(Value::Bool(self.failed))
            }
            "always" => {
                arity(0, 0)?;
                Ok(Value::Bool(true))
            }
            "cancelled" => {
                arity(0, 0)?;
                Ok(Value::Bool(false))
            }
            "contains" => {
                arity(2, 2)?;
                Ok(Value::Bool(functions::contains(&values[0], &values[1])))
            }
            "startswith" => {
                arity(2, 2)?;
                Ok(Value::Bool(functions::starts_with(&values[0], &values[1])))
            }
            "endswith" => {
                arity(2, 2)?;
                Ok(Value::Bool(functions::ends_with(&values[0], &values[1])))
            }
            "format" => {
                arity(1, usize::MAX)?;
                functions::format(&to_text(&values[0]), &values[1..]).map(Value::String)
            }
            "join" => {
                arity(1, 2)?;
                let separator = values.get(1).map(to_text).unwrap_or_else(|| ",".to_string());
                Ok(Value::String(functions::join(&values[0], &separator)))
            }
            "tojson" => {
                arity(1, 1)?;
                Ok(Value::String(serde_json::to_string_pretty(&values[0])?))
            }
            "fromjson" => {
                arity(1, 1)?;
                serde_json::from_str(&to_text(&values[0]))
                    .map_err(|e| RunnerError::expression(source, format!("fromJSON: {}", e)))
            }
            "hashfiles" => {
                arity(1, usize::MAX)?;
                let patterns: Vec<String> = values.iter().map(to_text).collect();
                functions::hash_files(&self.workspace, &patterns).map(Value::String)
            }
            _ => Err(RunnerError::expression(
                source,
                format!("unknown function '{}'", name),
            )),
        }
    }
}

/// Object member lookup: exact key first, then case-insensitive.
fn property(target: &Value, name: &str) -> Value {
    let Value::Object(map) = target else {
        return Value::Null;
    };
    map.get(name)
        .or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .cloned()
        .unwrap_or(Value::Null)
}

/// Replaces every `${{ expr }}` in `text` with the expression's value.
pub fn interpolate(text: &str, ctx: &ExpressionContext) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let body_start = start + 3;
        let end = find_closing(&rest[body_start..])
            .ok_or_else(|| RunnerError::expression(text, "missing closing '}}'"))?;

        let source = rest[body_start..body_start + end].trim();
        let value = ctx.evaluate(source)?;
        out.push_str(&to_text(&value));

        rest = &rest[body_start + end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Offset of the `}}` closing an expression, skipping string literals.
fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Evaluates an `if:` condition.
///
/// A missing condition means `success()`. A condition without a status
/// function is implicitly `success() && (condition)`.
pub fn evaluate_condition(condition: Option<&str>, ctx: &ExpressionContext) -> Result<bool> {
    let Some(raw) = condition.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(!ctx.failed);
    };

    let source = match strip_wrapper(raw) {
        Some(inner) => inner,
        None if raw.contains("${{") => {
            // Text with embedded expressions is truthy when non-empty
            let text = interpolate(raw, ctx)?;
            return Ok(!ctx.failed && !text.is_empty());
        }
        None => raw,
    };

    let expr = parse(source)?;
    let value = ctx.eval(&expr, source)?;

    if expr.uses_status_function() {
        Ok(truthy(&value))
    } else {
        Ok(!ctx.failed && truthy(&value))
    }
}

/// Returns the inner expression of a condition written as `${{ expr }}`.
fn strip_wrapper(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix("${{")?;
    let end = find_closing(inner)?;
    if inner[end + 2..].trim().is_empty() {
        Some(inner[..end].trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn context() -> ExpressionContext {
        let mut ctx = ExpressionContext::new(".");
        ctx.set(
            "github",
            json!({ "event_name": "push", "ref": "refs/heads/main", "ref_name": "main" }),
        );
        ctx.set("matrix", json!({ "python-version": "3.12", "os": "ubuntu-latest" }));
        ctx.set("env", json!({ "MODE": "strict" }));
        ctx.set(
            "steps",
            json!({ "version": { "outputs": { "tag": "v1.2" }, "outcome": "success" } }),
        );
        ctx
    }

    #[test]
    fn test_interpolate() {
        let ctx = context();
        assert_eq!(
            interpolate("python ${{ matrix.python-version }} on ${{matrix.os}}", &ctx).unwrap(),
            "python 3.12 on ubuntu-latest"
        );
        assert_eq!(interpolate("no expressions", &ctx).unwrap(), "no expressions");
        assert_eq!(
            interpolate("${{ steps.version.outputs.tag }}", &ctx).unwrap(),
            "v1.2"
        );
        assert_eq!(interpolate("[${{ matrix.missing }}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_interpolate_braces_inside_string() {
        let ctx = context();
        assert_eq!(
            interpolate("${{ format('{{x}}-{0}', 'y') }}", &ctx).unwrap(),
            "{x}-y"
        );
    }

    #[test]
    fn test_interpolate_unterminated() {
        assert!(interpolate("${{ matrix.os", &context()).is_err());
    }

    #[test]
    fn test_context_names_are_case_insensitive() {
        let ctx = context();
        assert_eq!(ctx.evaluate("GitHub.Event_Name").unwrap(), json!("push"));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        let ctx = context();
        assert_eq!(ctx.evaluate("env.MISSING || 'default'").unwrap(), json!("default"));
        assert_eq!(ctx.evaluate("env.MODE && 'on'").unwrap(), json!("on"));
        assert_eq!(ctx.evaluate("!env.MODE").unwrap(), json!(false));
    }

    #[test]
    fn test_index_access() {
        let mut ctx = context();
        ctx.set("list", json!(["a", "b"]));
        assert_eq!(ctx.evaluate("list[1]").unwrap(), json!("b"));
        assert_eq!(ctx.evaluate("list[5]").unwrap(), Value::Null);
        assert_eq!(ctx.evaluate("matrix['os']").unwrap(), json!("ubuntu-latest"));
    }

    #[test]
    fn test_functions() {
        let ctx = context();
        assert_eq!(ctx.evaluate("startsWith(github.ref, 'refs/heads/')").unwrap(), json!(true));
        assert_eq!(ctx.evaluate("contains(fromJSON('[\"push\"]'), github.event_name)").unwrap(), json!(true));
        assert_eq!(ctx.evaluate("format('{0}-{1}', 'py', matrix.python-version)").unwrap(), json!("py-3.12"));
        assert_eq!(ctx.evaluate("join(fromJSON('[1,2]'), '+')").unwrap(), json!("1+2"));
        assert!(ctx.evaluate("nope()").is_err());
        assert!(ctx.evaluate("contains('a')").is_err());
    }

    #[test]
    fn test_condition_defaults_to_success() {
        let mut ctx = context();
        assert!(evaluate_condition(None, &ctx).unwrap());
        assert!(evaluate_condition(Some("  "), &ctx).unwrap());

        ctx.set_failed(true);
        assert!(!evaluate_condition(None, &ctx).unwrap());
    }

    #[test]
    fn test_condition_forms() {
        let ctx = context();
        assert!(evaluate_condition(Some("github.ref_name == 'main'"), &ctx).unwrap());
        assert!(evaluate_condition(Some("${{ github.ref_name == 'MAIN' }}"), &ctx).unwrap());
        assert!(!evaluate_condition(Some("${{ github.event_name == 'pull_request' }}"), &ctx).unwrap());
        assert!(!evaluate_condition(Some("false"), &ctx).unwrap());
        assert!(evaluate_condition(Some("true"), &ctx).unwrap());
    }

    #[test]
    fn test_condition_status_functions() {
        let mut ctx = context();
        ctx.set_failed(true);

        assert!(!evaluate_condition(Some("github.ref_name == 'main'"), &ctx).unwrap());
        assert!(evaluate_condition(Some("always()"), &ctx).unwrap());
        assert!(evaluate_condition(Some("failure()"), &ctx).unwrap());
        assert!(!evaluate_condition(Some("success()"), &ctx).unwrap());
    }

    #[test]
    fn test_condition_hash_files() {
        let dir = tempdir().unwrap();
        let ctx = ExpressionContext::new(dir.path());
        let condition = Some("hashFiles('requirements.txt') != ''");

        assert!(!evaluate_condition(condition, &ctx).unwrap());

        fs::write(dir.path().join("requirements.txt"), "pytest\n").unwrap();
        assert!(evaluate_condition(condition, &ctx).unwrap());
    }

    #[test]
    fn test_condition_invalid_expression() {
        assert!(evaluate_condition(Some("github.ref =="), &context()).is_err());
    }
}
