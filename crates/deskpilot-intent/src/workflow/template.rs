//! Parameter templates.
//!
//! Step parameters may contain `{{input.<path>}}` and `{{steps.<id>[.<path>]}}`
//! references.  A string that is exactly one reference takes the referenced
//! JSON value (type preserved); anywhere else references are interpolated as
//! text.
//!
//! A step reference resolves against that step's result.  `success`,
//! `message`, `error`, `data` and `output` (an alias for `data`) name result
//! fields; any other first segment, or no path at all, reads from `data`.  A
//! step that never ran resolves to `null`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use deskpilot_kernel::{ToolParams, ToolResult};
use regex::{Captures, Regex};
use serde_json::{Map, Value};

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("template regex is valid")
});

const RESULT_FIELDS: &[&str] = &["success", "message", "error", "data", "output"];

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A parsed `input.*` or `steps.*` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Input { path: Vec<String> },
    Step { step: String, path: Vec<String> },
}

impl Reference {
    /// Parse a dotted path such as `steps.fetch.data.url`.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let mut segments = expr.split('.').map(str::to_string);
        let root = segments.next().unwrap_or_default();
        let rest: Vec<String> = segments.collect();
        if rest.iter().any(String::is_empty) {
            return Err(format!("empty segment in `{expr}`"));
        }
        match root.as_str() {
            "input" => Ok(Self::Input { path: rest }),
            "steps" => {
                let mut rest = rest.into_iter();
                let step = rest
                    .next()
                    .ok_or_else(|| format!("`{expr}` does not name a step"))?;
                Ok(Self::Step {
                    step,
                    path: rest.collect(),
                })
            }
            other => Err(format!("unknown reference root `{other}` in `{expr}`")),
        }
    }

    /// The step this reference reads from, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            Self::Input { .. } => None,
        }
    }
}

/// Every reference inside `value`, in document order.
pub fn scan(value: &Value) -> Result<Vec<Reference>, String> {
    let mut found = Vec::new();
    scan_into(value, &mut found)?;
    Ok(found)
}

fn scan_into(value: &Value, found: &mut Vec<Reference>) -> Result<(), String> {
    match value {
        Value::String(s) => {
            for caps in REFERENCE.captures_iter(s) {
                found.push(Reference::parse(&caps[1])?);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_into(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                scan_into(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// The steps referenced anywhere in a parameter template.
pub fn step_references(params: &ToolParams) -> Result<BTreeSet<String>, String> {
    let mut steps = BTreeSet::new();
    for value in params.values() {
        for reference in scan(value)? {
            if let Some(step) = reference.step() {
                steps.insert(step.to_string());
            }
        }
    }
    Ok(steps)
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The values references resolve against during one run.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    input: Value,
    steps: Map<String, Value>,
}

impl Scope {
    pub fn new(input: &ToolParams) -> Self {
        Self {
            input: Value::Object(input.clone()),
            steps: Map::new(),
        }
    }

    /// Expose a finished step's result.
    pub fn record(&mut self, step: &str, result: &ToolResult) {
        let error = result
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok())
            .unwrap_or(Value::Null);
        let entry = serde_json::json!({
            "success": result.success,
            "message": result.message,
            "error": error,
            "data": result.data,
            "output": result.data,
        });
        self.steps.insert(step.to_string(), entry);
    }

    /// Mark a step that never ran; references to it resolve to `null`.
    pub fn record_absent(&mut self, step: &str) {
        self.steps.insert(step.to_string(), Value::Null);
    }

    pub fn resolve(&self, reference: &Reference) -> Value {
        match reference {
            Reference::Input { path } => walk(&self.input, path),
            Reference::Step { step, path } => {
                let Some(entry) = self.steps.get(step).filter(|e| !e.is_null()) else {
                    return Value::Null;
                };
                match path.first() {
                    Some(first) if RESULT_FIELDS.contains(&first.as_str()) => walk(entry, path),
                    _ => walk(&entry["data"], path),
                }
            }
        }
    }

    /// Substitute every reference in `value`.
    pub fn render(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.render_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn render_params(&self, params: &ToolParams) -> ToolParams {
        params
            .iter()
            .map(|(k, v)| (k.clone(), self.render(v)))
            .collect()
    }

    fn render_str(&self, s: &str) -> Value {
        if let Some(caps) = REFERENCE.captures(s)
            && caps.get(0).is_some_and(|m| m.range() == (0..s.len()))
        {
            return Reference::parse(&caps[1])
                .map(|r| self.resolve(&r))
                .unwrap_or(Value::Null);
        }

        let rendered = REFERENCE.replace_all(s, |caps: &Captures<'_>| {
            match Reference::parse(&caps[1]).map(|r| self.resolve(&r)) {
                Ok(Value::String(text)) => text,
                Ok(Value::Null) | Err(_) => String::new(),
                Ok(other) => other.to_string(),
            }
        });
        Value::String(rendered.into_owned())
    }
}

fn walk(root: &Value, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
