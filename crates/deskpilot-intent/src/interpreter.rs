//! Command interpreter.
//!
//! Turns free-form text into a [`ParsedCommand`]: a tool name, parameters,
//! and a confidence score.  Resolution is tiered:
//!
//! 1. **Rules** -- explicitly added rules, then every registered tool's
//!    `patterns`, first match wins (confidence 1.0).
//! 2. **Alternate strategy** -- if one is configured, its best candidate is
//!    accepted when it reaches the acceptance threshold.
//! 3. **Fuzzy** -- the default [`FuzzyStrategy`].  When the best tool is
//!    accepted, the misspelled token is corrected and the tool's rules are
//!    retried so slots can still be extracted.
//!
//! Below the threshold the command is unresolved and carries suggestions.
//! Entities and context references then fill whatever slots are still
//! empty.  Parsing never fails, and the same text with the same history and
//! registry always produces the same result.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deskpilot_kernel::{
    ExecutionCoordinator, KernelError, Origin, ParamType, ParameterSpec, RuleSet, ToolErrorKind,
    ToolMetadata, ToolParams, ToolRegistry, ToolResult, params,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::InterpreterConfig;
use crate::context;
use crate::entities::{self, Entity};
use crate::strategy::{Candidate, Catalog, FuzzyStrategy, MatchStrategy};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a command was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchSource {
    /// A deterministic rule matched.
    Rule { rule: String },
    /// The default fuzzy matcher accepted the tool.
    Fuzzy { score: f64 },
    /// The alternate strategy accepted the tool.
    Strategy { name: String, score: f64 },
    /// Nothing reached the acceptance threshold.
    Unresolved,
}

/// A tool the caller may have meant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub tool: String,
    pub score: f64,
}

/// The interpreter's reading of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub raw_text: String,
    /// `None` when the command is unresolved.
    pub tool: Option<String>,
    pub parameters: ToolParams,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub source: MatchSource,
    pub suggestions: Vec<Suggestion>,
    pub entities: Vec<Entity>,
    /// Referring words that could not be resolved from recent commands.
    pub unresolved_references: Vec<String>,
}

impl ParsedCommand {
    fn unresolved(raw_text: &str, suggestions: Vec<Suggestion>, entities: Vec<Entity>) -> Self {
        Self {
            raw_text: raw_text.to_string(),
            tool: None,
            parameters: ToolParams::new(),
            confidence: 0.0,
            source: MatchSource::Unresolved,
            suggestions,
            entities,
            unresolved_references: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tool.is_some()
    }

    /// Dispatch through `coordinator`, recording the command as the origin.
    ///
    /// An unresolved command is not dispatched (and not recorded); it yields
    /// a `not_found` result listing the suggestions.
    pub async fn dispatch(&self, coordinator: &ExecutionCoordinator) -> ToolResult {
        let Some(tool) = &self.tool else {
            let mut message = format!("could not resolve command: {}", self.raw_text);
            if !self.suggestions.is_empty() {
                let names: Vec<&str> = self.suggestions.iter().map(|s| s.tool.as_str()).collect();
                message.push_str(&format!(" (did you mean: {}?)", names.join(", ")));
            }
            return ToolResult::failure(ToolErrorKind::NotFound, message);
        };
        coordinator
            .dispatch_with_origin(
                tool,
                self.parameters.clone(),
                Origin::Command {
                    raw_text: self.raw_text.clone(),
                    confidence: self.confidence,
                },
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RuleSpec {
    Template(String),
    Regex(String),
}

/// Immutable once built; `parse` works on a clone of the `Arc`s so the
/// state lock is held only while looking them up.
struct Compiled {
    generation: u64,
    rules: Arc<RuleSet>,
    catalog: Arc<Catalog>,
}

#[derive(Default)]
struct State {
    explicit: Vec<(String, RuleSpec)>,
    compiled: Option<Compiled>,
}

/// Resolves text to tool invocations against a [`ToolRegistry`].
pub struct CommandInterpreter {
    registry: ToolRegistry,
    config: InterpreterConfig,
    default_strategy: Arc<dyn MatchStrategy>,
    alternate: Option<Arc<dyn MatchStrategy>>,
    state: Mutex<State>,
}

impl CommandInterpreter {
    pub fn new(registry: ToolRegistry, config: InterpreterConfig) -> Self {
        Self {
            registry,
            config,
            default_strategy: Arc::new(FuzzyStrategy),
            alternate: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Consult `strategy` after rules and before the fuzzy fallback.
    pub fn with_strategy(mut self, strategy: Arc<dyn MatchStrategy>) -> Self {
        self.alternate = Some(strategy);
        self
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Add a `{slot}` template rule.  Explicit rules take priority over
    /// tool patterns, in the order they were added.
    pub fn add_rule(&self, tool: impl Into<String>, template: &str) -> Result<(), KernelError> {
        let tool = tool.into();
        RuleSet::new().add_template(tool.as_str(), template)?;
        self.push_rule(tool, RuleSpec::Template(template.to_string()));
        Ok(())
    }

    /// Add a raw regex rule with named captures.
    pub fn add_regex_rule(&self, tool: impl Into<String>, pattern: &str) -> Result<(), KernelError> {
        let tool = tool.into();
        RuleSet::new().add_regex(tool.as_str(), pattern)?;
        self.push_rule(tool, RuleSpec::Regex(pattern.to_string()));
        Ok(())
    }

    fn push_rule(&self, tool: String, spec: RuleSpec) {
        let mut state = self.lock();
        state.explicit.push((tool, spec));
        state.compiled = None;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interpret `text`.  `history` holds recent commands, oldest first.
    pub fn parse(&self, text: &str, history: &[ParsedCommand]) -> ParsedCommand {
        if text.trim().is_empty() {
            return ParsedCommand::unresolved(text, Vec::new(), Vec::new());
        }

        let (rules, catalog) = self.snapshot();

        // Tier 1: rules.
        if let Some(m) = rules.match_text(text) {
            tracing::debug!(tool = %m.tool, rule = %m.rule, "rule match");
            let ranking = self.default_strategy.rank(text, &catalog);
            return self.finish(
                Resolution {
                    text,
                    tool: &m.tool,
                    source: MatchSource::Rule { rule: m.rule.clone() },
                    confidence: 1.0,
                    captures: m.captures.into_iter().collect(),
                    spans: m.spans,
                },
                &catalog,
                &ranking,
                history,
            );
        }

        // Tier 2: alternate strategy.
        if let Some(alternate) = &self.alternate
            && let Some(best) = alternate.rank(text, &catalog).into_iter().next()
            && best.score >= self.config.acceptance_threshold
        {
            tracing::debug!(tool = %best.tool, strategy = alternate.name(), score = best.score, "strategy match");
            let ranking = self.default_strategy.rank(text, &catalog);
            return self.finish(
                Resolution {
                    text,
                    tool: &best.tool,
                    source: MatchSource::Strategy {
                        name: alternate.name().to_string(),
                        score: best.score,
                    },
                    confidence: best.score,
                    captures: Vec::new(),
                    spans: Vec::new(),
                },
                &catalog,
                &ranking,
                history,
            );
        }

        // Tier 3: fuzzy fallback.
        let ranking = self.default_strategy.rank(text, &catalog);
        match ranking.first() {
            Some(best) if best.score >= self.config.acceptance_threshold => {
                tracing::debug!(tool = %best.tool, score = best.score, "fuzzy match");
                let corrected = best
                    .correction
                    .as_ref()
                    .filter(|(token, word)| token != word)
                    .map(|(token, word)| replace_word(text, token, word));
                let recovered = corrected
                    .as_deref()
                    .and_then(|c| rules.match_tool(c, &best.tool).map(|m| (c, m)));

                let resolution = match recovered {
                    Some((corrected_text, m)) => Resolution {
                        text: corrected_text,
                        tool: &best.tool,
                        source: MatchSource::Fuzzy { score: best.score },
                        confidence: best.score,
                        captures: m.captures.into_iter().collect(),
                        spans: m.spans,
                    },
                    None => Resolution {
                        text,
                        tool: &best.tool,
                        source: MatchSource::Fuzzy { score: best.score },
                        confidence: best.score,
                        captures: Vec::new(),
                        spans: Vec::new(),
                    },
                };
                let mut parsed = self.finish(resolution, &catalog, &ranking, history);
                parsed.raw_text = text.to_string();
                parsed
            }
            _ => {
                tracing::debug!(text = %text, "command unresolved");
                ParsedCommand::unresolved(
                    text,
                    self.suggestions(&ranking, None),
                    entities::extract(text),
                )
            }
        }
    }

    /// Rules and catalog for the registry's current generation.
    fn snapshot(&self) -> (Arc<RuleSet>, Arc<Catalog>) {
        let generation = self.registry.generation();
        let mut state = self.lock();
        let compiled = match state.compiled.take() {
            Some(compiled) if compiled.generation == generation => compiled,
            _ => self.build(&state.explicit, generation),
        };
        let compiled = state.compiled.insert(compiled);
        (Arc::clone(&compiled.rules), Arc::clone(&compiled.catalog))
    }

    /// Explicit rules for registered tools first, then every tool's
    /// patterns in registration order.
    fn build(&self, explicit: &[(String, RuleSpec)], generation: u64) -> Compiled {
        let tools = self.registry.list_metadata();
        let names: HashSet<&str> = tools.iter().map(|m| m.name.as_str()).collect();
        let mut rules = RuleSet::new();

        for (tool, spec) in explicit.iter().filter(|(t, _)| names.contains(t.as_str())) {
            let added = match spec {
                RuleSpec::Template(t) => rules.add_template(tool.as_str(), t),
                RuleSpec::Regex(r) => rules.add_regex(tool.as_str(), r),
            };
            if let Err(e) = added {
                tracing::warn!(tool = %tool, error = %e, "skipping explicit rule");
            }
        }
        for meta in &tools {
            for pattern in &meta.patterns {
                if let Err(e) = rules.add_template(meta.name.as_str(), pattern) {
                    tracing::warn!(tool = %meta.name, error = %e, "skipping tool pattern");
                }
            }
        }

        tracing::debug!(generation, rules = rules.len(), tools = tools.len(), "interpreter rules rebuilt");
        Compiled {
            generation,
            rules: Arc::new(rules),
            catalog: Arc::new(Catalog::new(tools)),
        }
    }

    fn suggestions(&self, ranking: &[Candidate], exclude: Option<&str>) -> Vec<Suggestion> {
        ranking
            .iter()
            .filter(|c| c.score > 0.0 && Some(c.tool.as_str()) != exclude)
            .take(self.config.max_suggestions)
            .map(|c| Suggestion {
                tool: c.tool.clone(),
                score: c.score,
            })
            .collect()
    }

    /// Fill parameters from captures, entities, and context.
    fn finish(
        &self,
        resolution: Resolution<'_>,
        catalog: &Catalog,
        ranking: &[Candidate],
        history: &[ParsedCommand],
    ) -> ParsedCommand {
        let Resolution {
            text,
            tool,
            source,
            confidence,
            captures,
            spans,
        } = resolution;

        let suggestions = self.suggestions(ranking, Some(tool));
        let entities = entities::extract(text);
        let Some(metadata) = catalog.metadata(tool) else {
            return ParsedCommand::unresolved(text, suggestions, entities);
        };

        let mut parameters = ToolParams::new();
        for (slot, value) in captures {
            if metadata.parameter(&slot).is_some() {
                parameters.insert(slot, Value::String(value));
            }
        }

        for entity in entities.iter().filter(|e| !overlaps_any(&e.span, &spans)) {
            if let Some(spec) = metadata
                .parameters
                .iter()
                .find(|p| !parameters.contains_key(&p.name) && entity.fits(p))
            {
                parameters.insert(spec.name.clone(), entity.json_value());
            }
        }

        let mut unresolved = Vec::new();
        self.resolve_slot_references(metadata, &mut parameters, history, &mut unresolved);
        self.resolve_text_references(text, &spans, metadata, &mut parameters, history, &mut unresolved);

        let penalty = self.config.context_penalty * unresolved.len() as f64;
        ParsedCommand {
            raw_text: text.to_string(),
            tool: Some(tool.to_string()),
            parameters,
            confidence: (confidence - penalty).clamp(0.0, 1.0),
            source,
            suggestions,
            entities,
            unresolved_references: unresolved,
        }
    }

    /// Slot values that are themselves referring words ("delete it").
    fn resolve_slot_references(
        &self,
        metadata: &ToolMetadata,
        parameters: &mut ToolParams,
        history: &[ParsedCommand],
        unresolved: &mut Vec<String>,
    ) {
        let referring: Vec<(String, String)> = parameters
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .filter(|(_, v)| context::is_reference(v))
            .collect();

        for (name, phrase) in referring {
            let resolved = metadata
                .parameter(&name)
                .and_then(|spec| context::resolve(&phrase, spec, history, self.config.context_window));
            match resolved {
                Some(value) => {
                    parameters.insert(name, value);
                }
                None => {
                    parameters.remove(&name);
                    unresolved.push(phrase);
                }
            }
        }
    }

    /// Referring words elsewhere in the text fill empty required slots.
    fn resolve_text_references(
        &self,
        text: &str,
        spans: &[Range<usize>],
        metadata: &ToolMetadata,
        parameters: &mut ToolParams,
        history: &[ParsedCommand],
        unresolved: &mut Vec<String>,
    ) {
        for reference in context::find_references(text)
            .into_iter()
            .filter(|r| !overlaps_any(&r.span, spans))
        {
            let Some(spec) = metadata
                .parameters
                .iter()
                .find(|p| p.required && !parameters.contains_key(&p.name) && can_refer(p))
            else {
                break;
            };
            match context::resolve(&reference.phrase, spec, history, self.config.context_window) {
                Some(value) => {
                    parameters.insert(spec.name.clone(), value);
                }
                None => unresolved.push(reference.phrase),
            }
        }
    }
}

struct Resolution<'a> {
    text: &'a str,
    tool: &'a str,
    source: MatchSource,
    confidence: f64,
    captures: Vec<(String, String)>,
    spans: Vec<Range<usize>>,
}

fn can_refer(spec: &ParameterSpec) -> bool {
    matches!(spec.kind, ParamType::String | ParamType::File)
}

fn overlaps_any(span: &Range<usize>, spans: &[Range<usize>]) -> bool {
    spans.iter().any(|s| s.start < span.end && span.start < s.end)
}

/// Replace the first whole-word, case-insensitive occurrence of `token`.
fn replace_word(text: &str, token: &str, word: &str) -> String {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(token))) {
        Ok(re) => re.replacen(text, 1, regex::NoExpand(word)).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Check parameters the interpreter filled, for callers that want to
/// surface problems before dispatching.
pub fn check_parameters(metadata: &ToolMetadata, command: &ParsedCommand) -> Vec<params::ParamError> {
    params::validate(&metadata.parameters, &command.parameters)
        .err()
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
