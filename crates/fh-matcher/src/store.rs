//! Matcher state, candidate scanning, and the hot-swappable store.

use crate::rule::{MatchMode, Rule, RuleError};
use aho_corasick::AhoCorasick;
use fh_atproto::collections::Candidate;
use fh_atproto::fold::canonicalize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// One candidate and the canonical keywords that survived contingent checks.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub candidate: Candidate,
    pub keywords: Vec<String>,
}

/// Matches grouped by record path within one message.
pub type PathMatches = Vec<(String, Vec<MatchResult>)>;

// ---------------------------------------------------------------------------
// MatcherBuilder
// ---------------------------------------------------------------------------

/// Accumulates rules, then compiles an immutable [`MatcherState`].
#[derive(Default)]
pub struct MatcherBuilder {
    rules: HashMap<String, Rule>,
}

impl MatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and stage one textual rule. Returns `Ok(false)` when the rule
    /// is intentionally skipped (`track=false`) or a duplicate.
    pub fn add_rule_text(&mut self, text: &str) -> Result<bool, RuleError> {
        self.add_rule(Rule::parse(text)?)
    }

    pub fn add_rule(&mut self, rule: Rule) -> Result<bool, RuleError> {
        if !rule.track {
            warn!(target_rule = %rule.serialize(), "skipped untracked rule");
            return Ok(false);
        }
        let key = rule.canonical_target();
        if self.rules.contains_key(&key) {
            warn!(target_rule = %rule.serialize(), "duplicate rule");
            return Ok(false);
        }
        info!(target_rule = %rule.serialize(), "stored rule");
        self.rules.insert(key, rule);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn build(self) -> Result<MatcherState, RuleError> {
        let mut substring_keys = Vec::new();
        let mut whole_word_keys = Vec::new();
        let mut block_groups: HashMap<String, Vec<String>> = HashMap::new();
        for (key, rule) in &self.rules {
            match rule.match_mode {
                MatchMode::Substring => substring_keys.push(key.clone()),
                MatchMode::WholeWord => whole_word_keys.push(key.clone()),
            }
            if let Some(group) = &rule.block_group {
                block_groups
                    .entry(group.clone())
                    .or_default()
                    .push(rule.target.clone());
            }
        }
        let substring = compile(&substring_keys)?;
        let whole_word = compile(&whole_word_keys)?;
        Ok(MatcherState {
            rules: self.rules,
            substring,
            substring_keys,
            whole_word,
            whole_word_keys,
            block_groups,
        })
    }
}

fn compile(patterns: &[String]) -> Result<Option<AhoCorasick>, RuleError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    AhoCorasick::new(patterns)
        .map(Some)
        .map_err(|e| RuleError::Automaton(e.to_string()))
}

// ---------------------------------------------------------------------------
// MatcherState
// ---------------------------------------------------------------------------

/// An immutable compiled rule set. Shared behind an `Arc`; a refresh builds
/// a replacement off the hot path and swaps the pointer, so a scan in
/// flight keeps the state it started with and never mixes two rule sets.
pub struct MatcherState {
    rules: HashMap<String, Rule>,
    substring: Option<AhoCorasick>,
    substring_keys: Vec<String>,
    whole_word: Option<AhoCorasick>,
    whole_word_keys: Vec<String>,
    block_groups: HashMap<String, Vec<String>>,
}

impl MatcherState {
    pub fn empty() -> Self {
        MatcherBuilder::new().build().expect("empty state compiles")
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn find_rule(&self, canonical_keyword: &str) -> Option<&Rule> {
        self.rules.get(canonical_keyword)
    }

    /// Registered block-list groups and the rule targets feeding each.
    pub fn block_groups(&self) -> &HashMap<String, Vec<String>> {
        &self.block_groups
    }

    /// Fast-path scan: does any substring rule hit this text at all?
    pub fn matches_any(&self, text: &str) -> bool {
        let canonical = canonicalize(text);
        self.substring
            .as_ref()
            .is_some_and(|ac| ac.is_match(canonical.as_str()))
    }

    /// Scan each candidate against both automatons, merge hits, then drop
    /// keywords whose rule fails its contingent predicate.
    pub fn all_matches_for_candidates(&self, candidates: &[Candidate]) -> Vec<MatchResult> {
        let mut results = Vec::new();
        for candidate in candidates {
            if candidate.value.is_empty() {
                continue;
            }
            let canonical = canonicalize(&candidate.value);
            let mut keywords = Vec::new();
            if let Some(ac) = &self.substring {
                for hit in ac.find_overlapping_iter(canonical.as_str()) {
                    let keyword = &self.substring_keys[hit.pattern().as_usize()];
                    if !keywords.contains(keyword) {
                        keywords.push(keyword.clone());
                    }
                }
            }
            if let Some(ac) = &self.whole_word {
                for hit in ac.find_overlapping_iter(canonical.as_str()) {
                    if !on_word_boundary(&canonical, hit.start(), hit.end()) {
                        continue;
                    }
                    let keyword = &self.whole_word_keys[hit.pattern().as_usize()];
                    if !keywords.contains(keyword) {
                        keywords.push(keyword.clone());
                    }
                }
            }
            keywords.retain(|keyword| {
                self.find_rule(keyword)
                    .is_some_and(|rule| rule.contingent.passes(&canonical))
            });
            if !keywords.is_empty() {
                results.push(MatchResult {
                    candidate: candidate.clone(),
                    keywords,
                });
            }
        }
        results
    }

    pub fn all_matches_for_path_candidates(
        &self,
        path_candidates: &[(String, Vec<Candidate>)],
    ) -> PathMatches {
        let mut results = PathMatches::new();
        for (path, candidates) in path_candidates {
            let matched = self.all_matches_for_candidates(candidates);
            if !matched.is_empty() {
                results.push((path.clone(), matched));
            }
        }
        results
    }
}

/// Word boundaries are non-alphanumeric neighbors (or the text edges).
fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
}

// ---------------------------------------------------------------------------
// MatcherStore
// ---------------------------------------------------------------------------

/// Shared handle to the installed state. Readers take a cheap `Arc` clone;
/// the refresher installs a fully-built replacement.
pub struct MatcherStore {
    state: RwLock<Arc<MatcherState>>,
    use_db: bool,
    ready: std::sync::atomic::AtomicBool,
}

impl MatcherStore {
    pub fn new(use_db: bool) -> Self {
        MatcherStore {
            state: RwLock::new(Arc::new(MatcherState::empty())),
            use_db,
            ready: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn use_db_for_rules(&self) -> bool {
        self.use_db
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn current(&self) -> Arc<MatcherState> {
        self.state.read().expect("matcher lock poisoned").clone()
    }

    /// Atomically replace the installed rule set.
    pub fn install(&self, replacement: MatcherState) {
        let mut guard = self.state.write().expect("matcher lock poisoned");
        *guard = Arc::new(replacement);
        self.ready.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Load rules from a filter file, one per line. `##` lines are
    /// comments; malformed lines are logged and skipped.
    pub fn load_filter_file(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::open(path)?;
        let mut builder = MatcherBuilder::new();
        for (number, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            let number = number + 1;
            if line.len() < 2 {
                warn!(line = number, content = %line, "malformed rule line");
                continue;
            }
            if line.starts_with("##") {
                info!(line = number, "comment skipped");
                continue;
            }
            if let Err(error) = builder.add_rule_text(&line) {
                warn!(line = number, %error, "skipped rule");
            }
        }
        match builder.build() {
            Ok(state) => {
                info!(rules = state.rule_count(), file = %path.display(), "filter file loaded");
                self.install(state);
                Ok(())
            }
            Err(error) => Err(std::io::Error::other(error)),
        }
    }
}
