//! Entity extraction.
//!
//! Pulls URLs, filesystem paths, quoted strings, and numbers out of command
//! text, independently of which tool the text resolves to.  Extractors run
//! in a fixed order and later ones never claim text an earlier one already
//! took: quoted strings first, then URLs, then paths, then numbers.

use std::ops::Range;
use std::sync::LazyLock;

use deskpilot_kernel::{ParamType, ParameterSpec};
use regex::Regex;
use serde::{Deserialize, Serialize};

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)(?P<q>"[^"]*"|'[^']*')"#).expect("entity regex is valid")
});

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("entity regex is valid"));

static PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(?P<p>[A-Za-z]:[\\/]\S*|~/\S*|~$|\.\.?/\S*|/\S+)")
        .expect("entity regex is valid")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\b\d+(?:\.\d+)?\b").expect("entity regex is valid"));

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']'];

/// What kind of value an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Url,
    Path,
    Quoted,
    Number,
}

/// A value found in command text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    /// The value, with surrounding quotes or trailing punctuation removed.
    pub value: String,
    /// Byte range of the entity in the source text.
    pub span: Range<usize>,
}

impl Entity {
    /// Whether this entity can fill a parameter of `spec`.
    pub fn fits(&self, spec: &ParameterSpec) -> bool {
        match (self.kind, spec.kind) {
            (EntityKind::Path, ParamType::File | ParamType::String) => true,
            (EntityKind::Url, ParamType::String) => true,
            (EntityKind::Quoted, ParamType::String | ParamType::File) => true,
            (EntityKind::Quoted, ParamType::Enum) => spec
                .choices
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&self.value)),
            (EntityKind::Number, ParamType::Number) => true,
            _ => false,
        }
    }

    /// The value as JSON, typed for numbers.
    pub fn json_value(&self) -> serde_json::Value {
        if self.kind == EntityKind::Number
            && let Ok(n) = self.value.parse::<i64>()
        {
            return n.into();
        }
        if self.kind == EntityKind::Number
            && let Some(n) = self.value.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
        {
            return serde_json::Value::Number(n);
        }
        serde_json::Value::String(self.value.clone())
    }

    fn overlaps(&self, span: &Range<usize>) -> bool {
        self.span.start < span.end && span.start < self.span.end
    }
}

/// Guess the kind of a bare value (used for values carried over from
/// earlier commands' parameters).
pub fn classify(value: &str) -> EntityKind {
    if URL.is_match(value) && value.starts_with("http") {
        EntityKind::Url
    } else if PATH.is_match(value) || value.contains(['/', '\\']) {
        EntityKind::Path
    } else if value.parse::<f64>().is_ok() {
        EntityKind::Number
    } else {
        EntityKind::Quoted
    }
}

/// Extract all entities, ordered by position.
pub fn extract(text: &str) -> Vec<Entity> {
    let mut found: Vec<Entity> = Vec::new();

    for caps in QUOTED.captures_iter(text) {
        if let Some(m) = caps.name("q") {
            let raw = m.as_str();
            found.push(Entity {
                kind: EntityKind::Quoted,
                value: raw[1..raw.len() - 1].to_string(),
                span: m.range(),
            });
        }
    }

    for m in URL.find_iter(text) {
        push_trimmed(&mut found, EntityKind::Url, text, m.range());
    }

    for caps in PATH.captures_iter(text) {
        if let Some(m) = caps.name("p") {
            push_trimmed(&mut found, EntityKind::Path, text, m.range());
        }
    }

    for m in NUMBER.find_iter(text) {
        push_trimmed(&mut found, EntityKind::Number, text, m.range());
    }

    found.sort_by_key(|e| e.span.start);
    found
}

fn push_trimmed(found: &mut Vec<Entity>, kind: EntityKind, text: &str, span: Range<usize>) {
    let raw = &text[span.clone()];
    let trimmed = raw.trim_end_matches(TRAILING_PUNCTUATION);
    if trimmed.is_empty() {
        return;
    }
    let span = span.start..span.start + trimmed.len();
    if found.iter().any(|e| e.overlaps(&span)) {
        return;
    }
    found.push(Entity {
        kind,
        value: trimmed.to_string(),
        span,
    });
}
