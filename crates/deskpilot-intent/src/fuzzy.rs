//! Fuzzy tool scoring.
//!
//! Text is reduced to content tokens (lowercase, alphanumeric runs of two or
//! more characters, stopwords and bare numbers removed).  Each tool has a
//! vocabulary built from its name, the parts of its name, and its keywords.
//!
//! For every content token the best similarity against the vocabulary is
//! taken, where similarity is `1 - levenshtein(a, b) / max(len(a), len(b))`.
//! The tool's score blends the single best token with the mean over all
//! tokens:
//!
//! ```text
//! score = 0.5 * max(best_i) + 0.5 * mean(best_i)      clamped to [0, 1]
//! ```
//!
//! A tool is accepted when its score reaches [`ACCEPTANCE_THRESHOLD`].  With
//! this blend one close hit carries a short command ("cpy" scores 0.75
//! against `copy_files`) while unrelated filler words pull a long command
//! down.

use std::cmp::Ordering;

use deskpilot_kernel::ToolMetadata;
use serde::{Deserialize, Serialize};

/// Minimum fuzzy score for a tool to be chosen.
pub const ACCEPTANCE_THRESHOLD: f64 = 0.45;

/// Weight of the best single token in the blended score.
const BEST_WEIGHT: f64 = 0.5;

const MIN_TOKEN_LEN: usize = 2;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "be", "by", "can", "could", "for", "from", "i", "in", "into", "is",
    "it", "me", "my", "of", "on", "or", "please", "that", "the", "then", "this", "to", "up",
    "us", "we", "with", "would", "you", "your",
];

// ---------------------------------------------------------------------------
// Tokens and similarity
// ---------------------------------------------------------------------------

/// Split text into content tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Character-level edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

// ---------------------------------------------------------------------------
// Vocabulary and scoring
// ---------------------------------------------------------------------------

/// The words a tool answers to.
#[derive(Debug, Clone)]
pub struct ToolVocabulary {
    pub tool: String,
    /// Position in registration order.
    pub order: usize,
    words: Vec<String>,
}

impl ToolVocabulary {
    pub fn from_metadata(metadata: &ToolMetadata, order: usize) -> Self {
        let name = metadata.name.to_lowercase();
        let mut words = Vec::new();
        let mut add = |w: &str| {
            let w = w.to_lowercase();
            if w.chars().count() >= MIN_TOKEN_LEN && !words.contains(&w) {
                words.push(w);
            }
        };

        for part in name.split(['_', '-']) {
            add(part);
        }
        add(&name);
        for keyword in &metadata.keywords {
            for part in keyword.split_whitespace() {
                add(part);
            }
        }

        Self {
            tool: metadata.name.clone(),
            order,
            words,
        }
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Best vocabulary word for `token` and its similarity.
    fn best_word(&self, token: &str) -> Option<(&str, f64)> {
        self.words
            .iter()
            .map(|w| (w.as_str(), similarity(token, w)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
    }
}

/// A tool's fuzzy score for one piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyScore {
    pub tool: String,
    pub score: f64,
    /// The content token that matched best and the word it matched.
    pub best_token: Option<(String, String)>,
    #[serde(skip)]
    order: usize,
}

/// Score `tokens` against one vocabulary.
pub fn score(tokens: &[String], vocab: &ToolVocabulary) -> FuzzyScore {
    let mut best: Option<(String, String, f64)> = None;
    let mut total = 0.0;

    for token in tokens {
        let Some((word, sim)) = vocab.best_word(token) else {
            continue;
        };
        total += sim;
        if best.as_ref().is_none_or(|(_, _, s)| sim > *s) {
            best = Some((token.clone(), word.to_string(), sim));
        }
    }

    let score = match &best {
        Some((_, _, best_sim)) if !tokens.is_empty() => {
            let mean = total / tokens.len() as f64;
            (BEST_WEIGHT * best_sim + (1.0 - BEST_WEIGHT) * mean).clamp(0.0, 1.0)
        }
        _ => 0.0,
    };

    FuzzyScore {
        tool: vocab.tool.clone(),
        score,
        best_token: best.map(|(t, w, _)| (t, w)),
        order: vocab.order,
    }
}

/// Score every vocabulary, highest first.
///
/// Ties are broken by registration order, then by tool name.
pub fn rank(text: &str, vocabularies: &[ToolVocabulary]) -> Vec<FuzzyScore> {
    let tokens = tokenize(text);
    let mut scores: Vec<FuzzyScore> = vocabularies.iter().map(|v| score(&tokens, v)).collect();
    scores.sort_by(compare);
    scores
}

fn compare(a: &FuzzyScore, b: &FuzzyScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.order.cmp(&b.order))
        .then_with(|| a.tool.cmp(&b.tool))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
