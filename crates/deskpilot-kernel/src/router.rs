//! Deterministic command rules.
//!
//! A [`RuleSet`] maps command text to a tool name plus named slot values.
//! Rules are evaluated in the order they were added and the first match
//! wins.  Two forms are supported:
//!
//! | Form | Example | Compiles to |
//! |------|---------|-------------|
//! | Template | `copy {source} to {dest}` | anchored, case-insensitive regex |
//! | Raw regex | `^shot(?:\s+(?P<region>\w+))?$` | used verbatim |
//!
//! In a template, `{slot}` captures one whitespace-free token or a quoted
//! string (quotes are stripped), and `{slot...}` captures the rest of the
//! text lazily.  Runs of whitespace in the literal parts match any
//! whitespace.
//!
//! An Aho-Corasick automaton over each template's leading keyword prefilters
//! the candidates so that large rule sets only run the regexes that can
//! possibly match.  The automaton is rebuilt whenever a rule brings a new
//! keyword.
//!
//! # Example
//!
//! ```rust
//! # use deskpilot_kernel::router::RuleSet;
//! let mut rules = RuleSet::new();
//! rules.add_template("copy_files", "copy {source} to {dest}").unwrap();
//!
//! let m = rules.match_text("Copy ~/a.txt to \"/tmp/b dir\"").unwrap();
//! assert_eq!(m.tool, "copy_files");
//! assert_eq!(m.captures["dest"], "/tmp/b dir");
//! ```

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A successful rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub tool: String,
    /// The template or regex source that matched.
    pub rule: String,
    /// Slot values, quotes stripped.
    pub captures: BTreeMap<String, String>,
    /// Byte ranges of the captured slots in the input text.
    pub spans: Vec<Range<usize>>,
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct CommandRule {
    pub tool: String,
    /// The original template or regex source.
    pub source: String,
    /// Lowercased leading literal word, used by the prefilter.
    keyword: Option<String>,
    compiled: Regex,
}

impl CommandRule {
    /// Slot names declared by this rule.
    pub fn slots(&self) -> Vec<String> {
        self.compiled
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RuleSet
// ---------------------------------------------------------------------------

/// Ordered collection of command rules.
///
/// The keyword prefilter is rebuilt as rules are added, so matching only
/// needs `&self` and a built set can be shared behind an `Arc`.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<CommandRule>,
    automaton: Option<AhoCorasick>,
    /// Keyword for each automaton pattern index.
    automaton_keywords: Vec<String>,
}

impl RuleSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `{slot}` template rule for `tool`.
    pub fn add_template(&mut self, tool: impl Into<String>, template: &str) -> Result<()> {
        let (pattern, keyword) = compile_template(template)?;
        let compiled = Regex::new(&pattern).map_err(|e| KernelError::InvalidPattern {
            pattern: template.to_string(),
            reason: e.to_string(),
        })?;
        self.push(CommandRule {
            tool: tool.into(),
            source: template.to_string(),
            keyword,
            compiled,
        });
        Ok(())
    }

    /// Add a raw regex rule.  Named captures become slots.
    pub fn add_regex(&mut self, tool: impl Into<String>, pattern: &str) -> Result<()> {
        let compiled = Regex::new(pattern).map_err(|e| KernelError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.push(CommandRule {
            tool: tool.into(),
            source: pattern.to_string(),
            keyword: None,
            compiled,
        });
        Ok(())
    }

    fn push(&mut self, rule: CommandRule) {
        tracing::debug!(tool = %rule.tool, rule = %rule.source, "command rule added");
        let new_keyword = rule
            .keyword
            .as_ref()
            .is_some_and(|k| !self.automaton_keywords.contains(k));
        self.rules.push(rule);
        if new_keyword {
            self.rebuild_prefilter();
        }
    }

    /// First rule (in insertion order) that matches `text`.
    pub fn match_text(&self, text: &str) -> Option<RuleMatch> {
        self.match_filtered(text, |_| true)
    }

    /// First rule for `tool` that matches `text`.
    pub fn match_tool(&self, text: &str, tool: &str) -> Option<RuleMatch> {
        self.match_filtered(text, |rule| rule.tool == tool)
    }

    fn match_filtered(
        &self,
        text: &str,
        accept: impl Fn(&CommandRule) -> bool,
    ) -> Option<RuleMatch> {
        let present = self.keywords_in(text);

        self.rules
            .iter()
            .filter(|rule| accept(*rule))
            .filter(|rule| rule.keyword.as_ref().is_none_or(|k| present.contains(k)))
            .find_map(|rule| capture(rule, text))
    }

    pub fn rules(&self) -> &[CommandRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    // -- Private helpers ----------------------------------------------------

    fn rebuild_prefilter(&mut self) {
        let mut keywords: Vec<String> = Vec::new();
        for k in self.rules.iter().filter_map(|r| r.keyword.as_ref()) {
            if !keywords.contains(k) {
                keywords.push(k.clone());
            }
        }

        if keywords.is_empty() {
            self.automaton = None;
            self.automaton_keywords.clear();
            return;
        }

        match AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(&keywords)
        {
            Ok(ac) => {
                tracing::trace!(count = keywords.len(), "rule prefilter rebuilt");
                self.automaton = Some(ac);
                self.automaton_keywords = keywords;
            }
            Err(e) => {
                // Without a prefilter every rule is a candidate.
                tracing::error!(error = %e, "failed to build rule prefilter");
                self.automaton = None;
                self.automaton_keywords.clear();
                for rule in &mut self.rules {
                    rule.keyword = None;
                }
            }
        }
    }

    fn keywords_in(&self, text: &str) -> HashSet<String> {
        let Some(ac) = &self.automaton else {
            return HashSet::new();
        };
        ac.find_overlapping_iter(text)
            .map(|m| self.automaton_keywords[m.pattern().as_usize()].clone())
            .collect()
    }
}

fn capture(rule: &CommandRule, text: &str) -> Option<RuleMatch> {
    let caps = rule.compiled.captures(text)?;
    let mut captures = BTreeMap::new();
    let mut spans = Vec::new();
    for name in rule.compiled.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            captures.insert(name.to_string(), unquote(m.as_str().trim()).to_string());
            spans.push(m.range());
        }
    }
    Some(RuleMatch {
        tool: rule.tool.clone(),
        rule: rule.source.clone(),
        captures,
        spans,
    })
}

/// Strip one layer of matching single or double quotes.
pub fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Translate a template into an anchored regex plus its leading keyword.
fn compile_template(template: &str) -> Result<(String, Option<String>)> {
    let invalid = |reason: &str| KernelError::InvalidPattern {
        pattern: template.to_string(),
        reason: reason.to_string(),
    };

    let mut pattern = String::from(r"(?i)^\s*");
    let mut keyword = None;
    let mut literal = String::new();
    let mut seen_slot = false;
    let mut slots = HashSet::new();
    let mut rest = template.trim();

    while !rest.is_empty() {
        match rest.find('{') {
            Some(start) => {
                literal.push_str(&rest[..start]);
                let end = rest[start..]
                    .find('}')
                    .map(|i| start + i)
                    .ok_or_else(|| invalid("unclosed `{`"))?;
                let slot = rest[start + 1..end].trim();

                if !seen_slot && keyword.is_none() {
                    keyword = first_word(&literal);
                }
                pattern.push_str(&literal_regex(&literal));
                literal.clear();

                let (name, greedy) = match slot.strip_suffix("...") {
                    Some(name) => (name, true),
                    None => (slot, false),
                };
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid("slot names must be alphanumeric"));
                }
                if !slots.insert(name.to_string()) {
                    return Err(invalid("duplicate slot"));
                }
                if greedy {
                    pattern.push_str(&format!("(?P<{name}>.+?)"));
                } else {
                    pattern.push_str(&format!(r#"(?P<{name}>"[^"]*"|'[^']*'|\S+)"#));
                }
                seen_slot = true;
                rest = &rest[end + 1..];
            }
            None => {
                literal.push_str(rest);
                rest = "";
            }
        }
    }

    if !seen_slot && keyword.is_none() {
        keyword = first_word(&literal);
    }
    pattern.push_str(&literal_regex(&literal));
    pattern.push_str(r"\s*$");
    Ok((pattern, keyword))
}

fn literal_regex(literal: &str) -> String {
    if literal.is_empty() {
        return String::new();
    }
    let words: Vec<String> = literal.split_whitespace().map(regex::escape).collect();
    if words.is_empty() {
        return r"\s+".to_string();
    }
    let mut out = words.join(r"\s+");
    if literal.starts_with(char::is_whitespace) {
        out.insert_str(0, r"\s+");
    }
    if literal.ends_with(char::is_whitespace) {
        out.push_str(r"\s+");
    }
    out
}

fn first_word(literal: &str) -> Option<String> {
    literal
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
        .filter(|w| !w.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_extracts_slots_case_insensitively() {
        let mut rules = RuleSet::new();
        rules.add_template("copy_files", "copy {source} to {dest}").unwrap();

        let m = rules.match_text("  COPY notes.txt   to /backup ").unwrap();
        assert_eq!(m.tool, "copy_files");
        assert_eq!(m.captures["source"], "notes.txt");
        assert_eq!(m.captures["dest"], "/backup");
        assert_eq!(m.spans.len(), 2);
    }

    #[test]
    fn quoted_slot_keeps_spaces() {
        let mut rules = RuleSet::new();
        rules.add_template("open_app", "open {app}").unwrap();
        let m = rules.match_text("open 'Visual Studio Code'").unwrap();
        assert_eq!(m.captures["app"], "Visual Studio Code");
    }

    #[test]
    fn rest_slot_captures_remaining_text() {
        let mut rules = RuleSet::new();
        rules.add_template("search_web", "search for {query...}").unwrap();
        let m = rules.match_text("search for rust async traits").unwrap();
        assert_eq!(m.captures["query"], "rust async traits");
    }

    #[test]
    fn template_is_anchored() {
        let mut rules = RuleSet::new();
        rules.add_template("open_app", "open {app}").unwrap();
        assert!(rules.match_text("please open safari now").is_none());
        assert!(rules.match_text("open").is_none());
    }

    #[test]
    fn first_rule_wins() {
        let mut rules = RuleSet::new();
        rules.add_template("specific", "open browser").unwrap();
        rules.add_template("generic", "open {app}").unwrap();
        assert_eq!(rules.match_text("open browser").unwrap().tool, "specific");
        assert_eq!(rules.match_text("open terminal").unwrap().tool, "generic");
    }

    #[test]
    fn slot_first_templates_bypass_prefilter() {
        let mut rules = RuleSet::new();
        rules.add_template("move_file", "{source} -> {dest}").unwrap();
        let m = rules.match_text("a.txt -> b.txt").unwrap();
        assert_eq!(m.captures["dest"], "b.txt");
    }

    #[test]
    fn raw_regex_rules() {
        let mut rules = RuleSet::new();
        rules
            .add_regex("take_screenshot", r"(?i)^(?:take a )?screenshot(?: of (?P<region>\w+))?$")
            .unwrap();
        let m = rules.match_text("Take a screenshot of desktop").unwrap();
        assert_eq!(m.captures["region"], "desktop");
        assert!(rules.match_text("screenshot").unwrap().captures.is_empty());
    }

    #[test]
    fn match_tool_restricts_candidates() {
        let mut rules = RuleSet::new();
        rules.add_template("a", "go {x}").unwrap();
        rules.add_template("b", "go {y}").unwrap();
        assert_eq!(rules.match_tool("go home", "b").unwrap().tool, "b");
        assert!(rules.match_tool("go home", "c").is_none());
    }

    #[test]
    fn malformed_templates_are_rejected() {
        let mut rules = RuleSet::new();
        assert!(rules.add_template("t", "open {app").is_err());
        assert!(rules.add_template("t", "open {my app}").is_err());
        assert!(rules.add_template("t", "move {x} to {x}").is_err());
        assert!(rules.add_regex("t", "[unclosed(").is_err());
        assert!(rules.is_empty());
    }

    #[test]
    fn rules_added_after_matching_are_seen() {
        let mut rules = RuleSet::new();
        rules.add_template("one", "first {x}").unwrap();
        assert!(rules.match_text("second thing").is_none());
        rules.add_template("two", "second {x}").unwrap();
        assert_eq!(rules.match_text("second thing").unwrap().tool, "two");
    }

    #[test]
    fn matching_is_shared_through_arc() {
        let mut rules = RuleSet::new();
        rules.add_template("open_app", "open {app}").unwrap();
        rules.add_template("open_app", "launch {app}").unwrap();
        let shared = std::sync::Arc::new(rules);

        let threads: Vec<_> = ["open mail", "launch notes"]
            .into_iter()
            .map(|text| {
                let rules = std::sync::Arc::clone(&shared);
                std::thread::spawn(move || rules.match_text(text).map(|m| m.captures["app"].clone()))
            })
            .collect();
        let apps: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(apps, vec![Some("mail".to_string()), Some("notes".to_string())]);
    }

    #[test]
    fn slots_are_listed() {
        let mut rules = RuleSet::new();
        rules.add_template("copy_files", "copy {source} to {dest}").unwrap();
        assert_eq!(rules.rules()[0].slots(), vec!["source", "dest"]);
    }
}
