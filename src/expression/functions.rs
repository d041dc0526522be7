//! Built-in Expression Functions
//!
//! Value coercion rules and the function library available inside
//! expressions (`contains`, `format`, `hashFiles`, ...).

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use glob::{glob_with, MatchOptions, Pattern};
use log::debug;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, RunnerError};

/// Truthiness: `false`, `0`, `''` and `null` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Converts a value to the text substituted into a template.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

/// Numeric coercion used when comparing values of different types.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else if let Some(hex) = trimmed.strip_prefix("0x") {
                i64::from_str_radix(hex, 16).map(|n| n as f64).unwrap_or(f64::NAN)
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Loose equality: strings ignore case, other mixed types compare as numbers.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            left == right
        }
        _ => to_number(left) == to_number(right),
    }
}

/// Ordering comparison; `None` when the operands are not comparable.
pub fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => to_number(left).partial_cmp(&to_number(right)),
    }
}

/// `contains(search, item)`: array membership or case-insensitive substring.
pub fn contains(search: &Value, item: &Value) -> bool {
    match search {
        Value::Array(items) => items.iter().any(|v| loose_eq(v, item)),
        other => to_text(other)
            .to_lowercase()
            .contains(&to_text(item).to_lowercase()),
    }
}

pub fn starts_with(text: &Value, prefix: &Value) -> bool {
    to_text(text)
        .to_lowercase()
        .starts_with(&to_text(prefix).to_lowercase())
}

pub fn ends_with(text: &Value, suffix: &Value) -> bool {
    to_text(text)
        .to_lowercase()
        .ends_with(&to_text(suffix).to_lowercase())
}

/// `format('{0} {1}', a, b)` with `{{` / `}}` escapes.
pub fn format(template: &str, args: &[Value]) -> Result<String> {
    let err = |message: String| RunnerError::expression(format!("format('{}')", template), message);
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '{' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .ok_or_else(|| err("unclosed '{'".to_string()))?;
                let index_text: String = chars[i + 1..i + close].iter().collect();
                let index: usize = index_text
                    .trim()
                    .parse()
                    .map_err(|_| err(format!("invalid placeholder '{{{}}}'", index_text)))?;
                let arg = args
                    .get(index)
                    .ok_or_else(|| err(format!("no argument for placeholder {{{}}}", index)))?;
                out.push_str(&to_text(arg));
                i += close + 1;
            }
            '}' => return Err(err("unmatched '}'".to_string())),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

/// `join(array, separator)`; non-arrays are returned as text.
pub fn join(value: &Value, separator: &str) -> String {
    match value {
        Value::Array(items) => items.iter().map(to_text).collect::<Vec<_>>().join(separator),
        other => to_text(other),
    }
}

/// SHA-256 over the files matching `patterns` under `workspace`.
///
/// Each matched file is hashed, then the digests are hashed together in
/// path order. Patterns starting with `!` exclude files. Returns an empty
/// string when nothing matches.
pub fn hash_files(workspace: &Path, patterns: &[String]) -> Result<String> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let root = Pattern::escape(&workspace.to_string_lossy());
    let mut files: BTreeSet<PathBuf> = BTreeSet::new();
    let mut exclusions: Vec<Pattern> = Vec::new();

    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            let compiled = Pattern::new(negated)
                .map_err(|e| RunnerError::expression(format!("hashFiles('{}')", pattern), e.to_string()))?;
            exclusions.push(compiled);
            continue;
        }

        let full = format!("{}/{}", root.trim_end_matches('/'), pattern);
        let entries = glob_with(&full, options)
            .map_err(|e| RunnerError::expression(format!("hashFiles('{}')", pattern), e.to_string()))?;

        for entry in entries.flatten() {
            if entry.is_file() {
                files.insert(entry);
            }
        }
    }

    files.retain(|path| {
        let relative = path.strip_prefix(workspace).unwrap_or(path);
        !exclusions
            .iter()
            .any(|p| p.matches_path_with(relative, options))
    });

    if files.is_empty() {
        debug!("hashFiles({:?}) matched no files", patterns);
        return Ok(String::new());
    }

    let mut combined = Sha256::new();
    for file in &files {
        let content = fs::read(file)?;
        combined.update(Sha256::digest(&content));
    }

    debug!("hashFiles({:?}) hashed {} file(s)", patterns, files.len());
    Ok(hex::encode(combined.finalize()))
}
