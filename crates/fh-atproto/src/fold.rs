//! Unicode canonicalization for case- and locale-insensitive matching.
//!
//! Every trie insert and every lookup passes through [`canonicalize`] so that
//! rule targets and candidate text compare in the same form. Invalid UTF-8
//! never reaches this layer: the CBOR decoder rejects it with a
//! `bad-encoding` error and the offending unit is skipped upstream.

use unicode_normalization::UnicodeNormalization;

/// Normalize to NFC, then apply the Unicode default case fold.
///
/// The result is suitable for equality comparison and automaton insertion
/// across scripts (Cyrillic, Greek, and friends included).
pub fn canonicalize(input: &str) -> String {
    let composed: String = input.nfc().collect();
    caseless::default_case_fold_str(&composed)
}
