// fh-matcher: rule model and the hot-swappable multi-pattern matcher.
//
// Rules are pipe-delimited records loaded from a filter file or the
// auxiliary database. Matching runs over two Aho-Corasick automatons
// (substring and whole-word) built from canonicalized targets; contingent
// predicates then confirm or reject each hit in context. The installed
// state is swapped wholesale so readers never observe a partial rule set.

mod rule;
mod store;

pub use rule::{ContentScope, ContingentPredicate, MatchMode, Rule, RuleError};
pub use store::{MatchResult, MatcherBuilder, MatcherState, MatcherStore, PathMatches};

pub use fh_atproto::collections::Candidate;
