//! Context resolution for referring words.
//!
//! Commands like "delete that file" or "open it" refer back to something an
//! earlier command mentioned.  Referring phrases are detected as whole words
//! and resolved against the entities and parameter values of recent parsed
//! commands, most recent first.

use std::ops::Range;
use std::sync::LazyLock;

use deskpilot_kernel::params;
use deskpilot_kernel::ParameterSpec;
use regex::Regex;
use serde_json::Value;

use crate::entities::{self, EntityKind};
use crate::interpreter::ParsedCommand;

/// Referring phrases, longest first, with the entity kinds each may refer to.
const REFERENCES: &[(&str, &[EntityKind])] = &[
    ("that file", &[EntityKind::Path, EntityKind::Quoted]),
    ("this file", &[EntityKind::Path, EntityKind::Quoted]),
    ("the file", &[EntityKind::Path, EntityKind::Quoted]),
    ("that folder", &[EntityKind::Path]),
    ("that url", &[EntityKind::Url]),
    ("that link", &[EntityKind::Url]),
    ("the link", &[EntityKind::Url]),
    ("there", &[EntityKind::Path]),
    ("it", ANY),
    ("that", ANY),
    ("this", ANY),
];

const ANY: &[EntityKind] = &[EntityKind::Path, EntityKind::Url, EntityKind::Quoted];

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = REFERENCES
        .iter()
        .map(|(phrase, _)| phrase.replace(' ', r"\s+"))
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
        .expect("reference regex is valid")
});

/// A referring phrase found in command text.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    /// The phrase as written.
    pub phrase: String,
    pub span: Range<usize>,
    kinds: &'static [EntityKind],
}

/// The kinds of entity a phrase can stand for, if it is a referring phrase.
fn kinds_for(phrase: &str) -> Option<&'static [EntityKind]> {
    let normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    REFERENCES
        .iter()
        .find(|(p, _)| *p == normalized)
        .map(|(_, kinds)| *kinds)
}

/// Whether a slot value is itself just a referring phrase ("it").
pub fn is_reference(value: &str) -> bool {
    kinds_for(value.trim()).is_some()
}

/// Every referring phrase in `text`, in order.
pub fn find_references(text: &str) -> Vec<Reference> {
    REFERENCE_PATTERN
        .find_iter(text)
        .filter_map(|m| {
            kinds_for(m.as_str()).map(|kinds| Reference {
                phrase: m.as_str().to_string(),
                span: m.range(),
                kinds,
            })
        })
        .collect()
}

/// Resolve a referring phrase for a parameter of `spec`, looking back over at
/// most `window` commands of `history` (oldest first).
pub fn resolve(
    phrase: &str,
    spec: &ParameterSpec,
    history: &[ParsedCommand],
    window: usize,
) -> Option<Value> {
    let kinds = kinds_for(phrase)?;
    let skip = history.len().saturating_sub(window);

    for command in history.iter().skip(skip).rev() {
        let from_entities = command
            .entities
            .iter()
            .rev()
            .filter(|e| kinds.contains(&e.kind))
            .map(|e| e.json_value());
        let from_params = command
            .parameters
            .values()
            .rev()
            .filter_map(Value::as_str)
            .filter(|v| !is_reference(v) && kinds.contains(&entities::classify(v)))
            .map(|v| Value::String(v.to_string()));

        if let Some(value) = from_entities
            .chain(from_params)
            .find(|v| params::accepts(spec, v))
        {
            return Some(value);
        }
    }
    None
}

impl Reference {
    /// Whether this phrase may refer to an entity of `kind`.
    pub fn accepts(&self, kind: EntityKind) -> bool {
        self.kinds.contains(&kind)
    }
}
