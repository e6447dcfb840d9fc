//! Key-segment encoding.
//!
//! Keys are sequences of string segments joined with the ASCII unit
//! separator. Segments are stripped of the separator on write rather than
//! rejected, so a hostile segment cannot smuggle itself into a sibling key
//! family.

/// The reserved segment separator (ASCII 0x1F, unit separator).
pub const SEPARATOR: char = '\u{1f}';

/// Joins key segments into the stored string form.
///
/// Any separator characters inside a segment are silently stripped.
#[must_use]
pub fn join_key(segments: &[String]) -> String {
    let mut joined = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            joined.push(SEPARATOR);
        }
        joined.extend(segment.chars().filter(|c| *c != SEPARATOR));
    }
    joined
}

/// Splits a stored key string back into its segments.
#[must_use]
pub fn split_key(joined: &str) -> Vec<String> {
    joined.split(SEPARATOR).map(ToString::to_string).collect()
}

/// Returns `true` if a joined key falls under a joined prefix.
///
/// A key matches when it equals the prefix or continues it at a segment
/// boundary; `"ab"` is not a match for prefix `"a"`.
#[must_use]
pub fn key_matches_prefix(joined: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match joined.strip_prefix(prefix) {
        None => false,
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
    }
}

/// Builds the joined scan prefix for a segment sequence.
///
/// The trailing separator pins the match to a segment boundary, so scanning
/// `["oauth:refresh", "sub"]` never yields keys under `"sub2"`.
#[must_use]
pub fn scan_prefix(segments: &[String]) -> String {
    let mut prefix = join_key(segments);
    prefix.push(SEPARATOR);
    prefix
}
