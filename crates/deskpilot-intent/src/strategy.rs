//! Pluggable match strategies.
//!
//! The interpreter always has a default strategy ([`FuzzyStrategy`]) and may
//! be given an alternate that is consulted first.  A strategy only ranks
//! tools; thresholds, slot filling, and context are handled by the
//! interpreter so every strategy gets them for free.

use std::cmp::Ordering;

use deskpilot_kernel::ToolMetadata;
use serde::{Deserialize, Serialize};

use crate::fuzzy::{self, ToolVocabulary};

/// Registered tools as seen by strategies, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tools: Vec<ToolMetadata>,
    pub vocabularies: Vec<ToolVocabulary>,
}

impl Catalog {
    pub fn new(tools: Vec<ToolMetadata>) -> Self {
        let vocabularies = tools
            .iter()
            .enumerate()
            .map(|(i, m)| ToolVocabulary::from_metadata(m, i))
            .collect();
        Self {
            tools,
            vocabularies,
        }
    }

    pub fn metadata(&self, tool: &str) -> Option<&ToolMetadata> {
        self.tools.iter().find(|m| m.name == tool)
    }

    fn order(&self, tool: &str) -> usize {
        self.tools
            .iter()
            .position(|m| m.name == tool)
            .unwrap_or(usize::MAX)
    }
}

/// One ranked tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub tool: String,
    pub score: f64,
    /// A misspelled token and the vocabulary word it most resembles.
    pub correction: Option<(String, String)>,
}

/// Ranks tools for a piece of text.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Every tool with its score, best first.  Must be deterministic.
    fn rank(&self, text: &str, catalog: &Catalog) -> Vec<Candidate>;
}

// ---------------------------------------------------------------------------
// FuzzyStrategy
// ---------------------------------------------------------------------------

/// Edit-distance scoring over tool names and keywords.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyStrategy;

impl MatchStrategy for FuzzyStrategy {
    fn name(&self) -> &str {
        "fuzzy"
    }

    fn rank(&self, text: &str, catalog: &Catalog) -> Vec<Candidate> {
        fuzzy::rank(text, &catalog.vocabularies)
            .into_iter()
            .map(|s| Candidate {
                tool: s.tool,
                score: s.score,
                correction: s.best_token,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ExampleStrategy
// ---------------------------------------------------------------------------

/// Compares text with each tool's example phrases.
///
/// An example's score is the mean of how well the text's tokens are covered
/// by the example and how well the example's tokens are covered by the
/// text.  A tool scores its best example; tools without examples score 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExampleStrategy;

impl ExampleStrategy {
    fn coverage(from: &[String], to: &[String]) -> f64 {
        if from.is_empty() || to.is_empty() {
            return 0.0;
        }
        let total: f64 = from
            .iter()
            .map(|a| {
                to.iter()
                    .map(|b| fuzzy::similarity(a, b))
                    .fold(0.0, f64::max)
            })
            .sum();
        total / from.len() as f64
    }

    fn example_score(text: &[String], example: &str) -> f64 {
        let example = fuzzy::tokenize(example);
        (0.5 * Self::coverage(text, &example) + 0.5 * Self::coverage(&example, text)).clamp(0.0, 1.0)
    }
}

impl MatchStrategy for ExampleStrategy {
    fn name(&self) -> &str {
        "examples"
    }

    fn rank(&self, text: &str, catalog: &Catalog) -> Vec<Candidate> {
        let tokens = fuzzy::tokenize(text);
        let mut ranked: Vec<Candidate> = catalog
            .tools
            .iter()
            .map(|meta| Candidate {
                tool: meta.name.clone(),
                score: meta
                    .examples
                    .iter()
                    .map(|e| Self::example_score(&tokens, e))
                    .fold(0.0, f64::max),
                correction: None,
            })
            .collect();
        ranked.sort_by(|a, b| compare(catalog, a, b));
        ranked
    }
}

fn compare(catalog: &Catalog, a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| catalog.order(&a.tool).cmp(&catalog.order(&b.tool)))
        .then_with(|| a.tool.cmp(&b.tool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_kernel::ToolCategory;

    fn catalog() -> Catalog {
        Catalog::new(vec![
            ToolMetadata::new("take_screenshot", "Capture the screen", ToolCategory::MediaProcessing)
                .with_examples(["grab an image of my display", "snap the screen"]),
            ToolMetadata::new("system_info", "Show system metrics", ToolCategory::SystemControl)
                .with_keywords(["cpu", "memory"])
                .with_examples(["how busy is my cpu", "show memory usage"]),
        ])
    }

    #[test]
    fn examples_match_paraphrases() {
        let ranked = ExampleStrategy.rank("grab image of display", &catalog());
        assert_eq!(ranked[0].tool, "take_screenshot");
        assert!(ranked[0].score > 0.8);
        assert!(ranked[1].score < ranked[0].score);
    }

    #[test]
    fn fuzzy_uses_keywords() {
        let ranked = FuzzyStrategy.rank("memroy", &catalog());
        assert_eq!(ranked[0].tool, "system_info");
        assert_eq!(
            ranked[0].correction,
            Some(("memroy".to_string(), "memory".to_string()))
        );
    }

    #[test]
    fn tools_without_examples_score_zero() {
        let catalog = Catalog::new(vec![ToolMetadata::new("bare", "No examples", ToolCategory::Custom)]);
        assert_eq!(ExampleStrategy.rank("anything at all", &catalog)[0].score, 0.0);
    }
}
