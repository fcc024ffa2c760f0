//! Rule parsing, serialization, and contingent predicates.
//!
//! Textual form: `target|labels|actions|contingent` where `contingent` is
//! optional. Actions are comma-separated `k=v` pairs; recognized keys are
//! `track`, `report`, `label`, `scope` (any|profile), `match`
//! (substring|whole-word) and `block` (block-list group, no hyphens).
//! Contingent items prefixed `!` must be absent; the rest, at least one
//! must be present.

use aho_corasick::AhoCorasick;
use fh_atproto::fold::canonicalize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("blank {0} field in rule '{1}'")]
    BlankField(&'static str, String),
    #[error("fewer than 3 fields in rule '{0}'")]
    TooFewFields(String),
    #[error("more than 4 fields in rule '{0}'")]
    TooManyFields(String),
    #[error("bad bool value '{0}'")]
    BadBool(String),
    #[error("bad match mode '{0}'")]
    BadMatch(String),
    #[error("bad content scope '{0}'")]
    BadScope(String),
    #[error("hyphen not permitted in block group name '{0}'")]
    BadBlockName(String),
    #[error("bad action '{0}', expected key=value")]
    BadAction(String),
    #[error("duplicate rule for target '{0}'")]
    DuplicateRule(String),
    #[error("automaton build failed: {0}")]
    Automaton(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentScope {
    #[default]
    Any,
    Profile,
}

impl ContentScope {
    fn parse(text: &str) -> Result<Self, RuleError> {
        match text {
            "any" => Ok(ContentScope::Any),
            "profile" => Ok(ContentScope::Profile),
            other => Err(RuleError::BadScope(other.to_owned())),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ContentScope::Any => "any",
            ContentScope::Profile => "profile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Substring,
    WholeWord,
}

impl MatchMode {
    fn parse(text: &str) -> Result<Self, RuleError> {
        match text {
            "substring" => Ok(MatchMode::Substring),
            "whole-word" => Ok(MatchMode::WholeWord),
            other => Err(RuleError::BadMatch(other.to_owned())),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MatchMode::Substring => "substring",
            MatchMode::WholeWord => "whole-word",
        }
    }
}

// ---------------------------------------------------------------------------
// Contingent predicate
// ---------------------------------------------------------------------------

/// Context confirmation for a matched rule: at least one `required` string
/// present AND no `absent` string present. An empty predicate always passes.
#[derive(Debug, Clone, Default)]
pub struct ContingentPredicate {
    required_raw: Vec<String>,
    absent_raw: Vec<String>,
    required: Option<AhoCorasick>,
    absent: Option<AhoCorasick>,
}

impl ContingentPredicate {
    pub fn parse(items: &str) -> Result<Self, RuleError> {
        let mut required_raw = Vec::new();
        let mut absent_raw = Vec::new();
        for item in items.split(',') {
            if item.is_empty() {
                continue;
            }
            if let Some(stripped) = item.strip_prefix('!') {
                absent_raw.push(stripped.to_owned());
            } else {
                required_raw.push(item.to_owned());
            }
        }
        let required = build_automaton(&required_raw)?;
        let absent = build_automaton(&absent_raw)?;
        Ok(ContingentPredicate {
            required_raw,
            absent_raw,
            required,
            absent,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.required_raw.is_empty() && self.absent_raw.is_empty()
    }

    /// Evaluate against already-canonicalized candidate text.
    pub fn passes(&self, canonical_text: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        if let Some(absent) = &self.absent {
            if absent.is_match(canonical_text) {
                return false;
            }
        }
        match &self.required {
            Some(required) => required.is_match(canonical_text),
            // Only absent constraints: nothing further required.
            None => true,
        }
    }

    fn serialize(&self) -> String {
        let mut parts: Vec<String> = self.required_raw.clone();
        parts.extend(self.absent_raw.iter().map(|s| format!("!{s}")));
        parts.join(",")
    }
}

fn build_automaton(patterns: &[String]) -> Result<Option<AhoCorasick>, RuleError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let canonical: Vec<String> = patterns.iter().map(|p| canonicalize(p)).collect();
    AhoCorasick::new(&canonical)
        .map(Some)
        .map_err(|e| RuleError::Automaton(e.to_string()))
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Rule {
    pub target: String,
    pub labels: Vec<String>,
    pub track: bool,
    pub report: bool,
    pub label: bool,
    pub scope: ContentScope,
    pub block_group: Option<String>,
    pub match_mode: MatchMode,
    pub contingent: ContingentPredicate,
}

impl Rule {
    /// Parse the pipe-delimited textual form.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let fields: Vec<&str> = text.split('|').collect();
        if fields.len() < 3 {
            return Err(RuleError::TooFewFields(text.to_owned()));
        }
        if fields.len() > 4 {
            return Err(RuleError::TooManyFields(text.to_owned()));
        }
        Self::from_fields(
            fields[0],
            fields[1],
            fields[2],
            fields.get(3).copied().unwrap_or(""),
        )
    }

    /// Build from the four stored columns (`contingent` may be empty).
    pub fn from_fields(
        target: &str,
        labels: &str,
        actions: &str,
        contingent: &str,
    ) -> Result<Self, RuleError> {
        if target.is_empty() {
            return Err(RuleError::BlankField("target", target.to_owned()));
        }
        if labels.is_empty() {
            return Err(RuleError::BlankField("labels", target.to_owned()));
        }
        let mut rule = Rule {
            target: target.to_owned(),
            labels: labels.split(',').map(str::to_owned).collect(),
            track: true,
            report: false,
            label: false,
            scope: ContentScope::Any,
            block_group: None,
            match_mode: MatchMode::Substring,
            contingent: ContingentPredicate::default(),
        };
        rule.store_actions(actions)?;
        if !contingent.is_empty() {
            rule.contingent = ContingentPredicate::parse(contingent)?;
        }
        Ok(rule)
    }

    fn store_actions(&mut self, actions: &str) -> Result<(), RuleError> {
        if actions.is_empty() {
            return Err(RuleError::BlankField("actions", self.target.clone()));
        }
        for pair in actions.split(',') {
            let (key, value) = pair
                .split_once('=')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| RuleError::BadAction(pair.to_owned()))?;
            match key {
                "track" => self.track = parse_bool(value)?,
                "report" => self.report = parse_bool(value)?,
                "label" => self.label = parse_bool(value)?,
                "scope" => self.scope = ContentScope::parse(value)?,
                "match" => self.match_mode = MatchMode::parse(value)?,
                "block" => {
                    if value.contains('-') {
                        return Err(RuleError::BadBlockName(value.to_owned()));
                    }
                    self.block_group = Some(value.to_owned());
                }
                _ => return Err(RuleError::BadAction(pair.to_owned())),
            }
        }
        Ok(())
    }

    /// The canonical form used as the automaton pattern and lookup key.
    pub fn canonical_target(&self) -> String {
        canonicalize(&self.target)
    }

    pub fn passes_contingent_checks(&self, candidate_text: &str) -> bool {
        self.contingent.passes(&canonicalize(candidate_text))
    }

    /// Inverse of [`Rule::parse`] for well-formed rules.
    pub fn serialize(&self) -> String {
        let mut actions = vec![
            format!("track={}", self.track),
            format!("report={}", self.report),
            format!("label={}", self.label),
            format!("scope={}", self.scope.as_str()),
            format!("match={}", self.match_mode.as_str()),
        ];
        if let Some(group) = &self.block_group {
            actions.push(format!("block={group}"));
        }
        format!(
            "{}|{}|{}|{}",
            self.target,
            self.labels.join(","),
            actions.join(","),
            self.contingent.serialize()
        )
    }
}

fn parse_bool(text: &str) -> Result<bool, RuleError> {
    match text {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(RuleError::BadBool(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rule_parses() {
        let rule =
            Rule::parse("bank|fraud|track=true,report=true,match=substring|scam,!educational")
                .unwrap();
        assert_eq!(rule.target, "bank");
        assert_eq!(rule.labels, vec!["fraud"]);
        assert!(rule.track);
        assert!(rule.report);
        assert!(!rule.label);
        assert_eq!(rule.match_mode, MatchMode::Substring);
        assert!(!rule.contingent.is_empty());
    }

    #[test]
    fn contingent_field_is_optional() {
        assert!(Rule::parse("blah|spam|track=false,match=whole-word|").is_ok());
        assert!(Rule::parse("blah|spam|track=false,match=substring").is_ok());
        assert!(Rule::parse("blah|spam|track=false,match=substring|blah").is_ok());
        assert!(Rule::parse("blah|spam|track=false,match=substring|a,b,c").is_ok());
    }

    #[test]
    fn blank_fields_rejected() {
        assert!(matches!(
            Rule::parse("|spam|track=true|x"),
            Err(RuleError::BlankField("target", _))
        ));
        assert!(matches!(
            Rule::parse("blah||track=true|x"),
            Err(RuleError::BlankField("labels", _))
        ));
    }

    #[test]
    fn field_count_enforced() {
        assert!(matches!(
            Rule::parse("blah|spam"),
            Err(RuleError::TooFewFields(_))
        ));
        assert!(matches!(
            Rule::parse("blah|spam|track=true|x|extra"),
            Err(RuleError::TooManyFields(_))
        ));
    }

    #[test]
    fn bad_action_values_rejected() {
        assert!(matches!(
            Rule::parse("blah|spam|track=yes"),
            Err(RuleError::BadBool(_))
        ));
        assert!(matches!(
            Rule::parse("blah|spam|match=word"),
            Err(RuleError::BadMatch(_))
        ));
        assert!(matches!(
            Rule::parse("blah|spam|scope=everything"),
            Err(RuleError::BadScope(_))
        ));
        assert!(matches!(
            Rule::parse("blah|spam|block=bad-name"),
            Err(RuleError::BadBlockName(_))
        ));
        assert!(matches!(
            Rule::parse("blah|spam|track"),
            Err(RuleError::BadAction(_))
        ));
    }

    #[test]
    fn contingent_predicate_semantics() {
        let rule =
            Rule::parse("bank|fraud|track=true,report=true,match=substring|scam,!educational")
                .unwrap();
        assert!(rule.passes_contingent_checks("a bank scam in progress"));
        assert!(!rule.passes_contingent_checks("educational bank scam"));
        assert!(!rule.passes_contingent_checks("a bank with no context"));
    }

    #[test]
    fn absent_only_predicate() {
        let rule = Rule::parse("bank|fraud|track=true|!educational").unwrap();
        assert!(rule.passes_contingent_checks("bank holiday"));
        assert!(!rule.passes_contingent_checks("educational bank material"));
    }

    #[test]
    fn contingent_matching_is_case_folded() {
        let rule = Rule::parse("bank|fraud|track=true|scam,!educational").unwrap();
        assert!(rule.passes_contingent_checks("BANK SCAM"));
        assert!(!rule.passes_contingent_checks("EDUCATIONAL bank SCAM"));
    }

    #[test]
    fn serialize_round_trip() {
        for text in [
            "bank|fraud|track=true,report=true,label=false,scope=any,match=substring|scam,!educational",
            "Хохол|slur|track=true,report=true,label=false,scope=any,match=substring|",
            "symbol|hate|track=true,report=false,label=true,scope=profile,match=whole-word,block=hate|",
        ] {
            let rule = Rule::parse(text).unwrap();
            let serialized = rule.serialize();
            let reparsed = Rule::parse(&serialized).unwrap();
            assert_eq!(reparsed.serialize(), serialized);
        }
    }
}
