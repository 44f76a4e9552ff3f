//! Parameter coercion and validation.
//!
//! Validation never stops at the first problem: every declared parameter is
//! checked and every failure is collected, so a caller can fix a command in
//! one round trip.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::capability::{ParamType, ParameterSpec, ToolParams};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamErrorKind {
    #[error("required parameter is missing")]
    Missing,

    #[error("expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("`{value}` is not one of: {}", .choices.join(", "))]
    NotAChoice { value: String, choices: Vec<String> },

    #[error("file does not exist: {path}")]
    FileNotFound { path: String },

    #[error("unexpected parameter")]
    Unexpected,
}

/// A validation failure for one named parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{param}: {kind}")]
pub struct ParamError {
    pub param: String,
    pub kind: ParamErrorKind,
}

impl ParamError {
    pub fn new(param: impl Into<String>, kind: ParamErrorKind) -> Self {
        Self {
            param: param.into(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check `raw` against `specs`, returning normalized parameters.
///
/// - unknown keys are rejected,
/// - `null` counts as absent,
/// - absent parameters take their default when one is declared, and the
///   default goes through the same coercion as a supplied value,
/// - strings are coerced to numbers and booleans where the spec asks for it,
/// - `FILE` values have `~` expanded and must exist.
pub fn validate(
    specs: &[ParameterSpec],
    raw: &ToolParams,
) -> std::result::Result<ToolParams, Vec<ParamError>> {
    let mut errors = Vec::new();
    let mut normalized = ToolParams::new();

    for key in raw.keys() {
        if !specs.iter().any(|s| &s.name == key) {
            errors.push(ParamError::new(key.clone(), ParamErrorKind::Unexpected));
        }
    }

    for spec in specs {
        let supplied = raw.get(&spec.name).filter(|v| !v.is_null());
        match supplied.or(spec.default.as_ref()) {
            Some(value) => match coerce(spec, value, true) {
                Ok(v) => {
                    normalized.insert(spec.name.clone(), v);
                }
                Err(kind) => errors.push(ParamError::new(spec.name.clone(), kind)),
            },
            None if spec.required => {
                errors.push(ParamError::new(spec.name.clone(), ParamErrorKind::Missing));
            }
            None => {}
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(errors)
    }
}

/// Coerce a single value without touching the filesystem.
///
/// Used to check declared defaults at registration time.
pub fn check_shape(spec: &ParameterSpec, value: &Value) -> std::result::Result<Value, ParamErrorKind> {
    coerce(spec, value, false)
}

/// Whether `value` could fill a parameter of this spec.
pub fn accepts(spec: &ParameterSpec, value: &Value) -> bool {
    coerce(spec, value, false).is_ok()
}

fn coerce(
    spec: &ParameterSpec,
    value: &Value,
    check_files: bool,
) -> std::result::Result<Value, ParamErrorKind> {
    let mismatch = |expected: &str| ParamErrorKind::TypeMismatch {
        expected: expected.to_string(),
        found: type_name(value).to_string(),
    };

    match spec.kind {
        ParamType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch("string")),
        },
        ParamType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => parse_number(s.trim()).ok_or_else(|| mismatch("number")),
            _ => Err(mismatch("number")),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => parse_bool(s.trim())
                .map(Value::Bool)
                .ok_or_else(|| mismatch("boolean")),
            _ => Err(mismatch("boolean")),
        },
        ParamType::File => {
            let Value::String(s) = value else {
                return Err(mismatch("file path"));
            };
            let path = expand_home(s.trim());
            if check_files && !path.exists() {
                return Err(ParamErrorKind::FileNotFound {
                    path: path.display().to_string(),
                });
            }
            Ok(Value::String(path.display().to_string()))
        }
        ParamType::Enum => {
            let candidate = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(mismatch("string")),
            };
            spec.choices
                .iter()
                .find(|c| c.eq_ignore_ascii_case(&candidate))
                .map(|c| Value::String(c.clone()))
                .ok_or_else(|| ParamErrorKind::NotAChoice {
                    value: candidate,
                    choices: spec.choices.clone(),
                })
        }
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => Path::new(p).to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
