//! Scope string parsing and narrowing.
//!
//! Scopes are opaque space-delimited strings (RFC 6749 §3.3). The issuer does
//! not enforce any scope ontology; the only rule is the narrowing
//! intersection applied at token-request time.

/// Parses a space-delimited scope string into its individual scopes.
///
/// Empty fragments produced by repeated whitespace are dropped; order is
/// preserved and duplicates are kept as given.
#[must_use]
pub fn parse_scopes(scope: &str) -> Vec<String> {
    scope
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

/// Narrows a requested scope string against the scopes previously authorized.
///
/// The rule, in order:
/// - no request (`None`) → the authorized scopes pass through unchanged;
/// - no authorized set (`None`) → `None` (scopes were never part of the grant);
/// - otherwise → the requested scopes that appear in the authorized set, in
///   request order.
#[must_use]
pub fn validate_scopes(
    requested: Option<&str>,
    authorized: Option<&[String]>,
) -> Option<Vec<String>> {
    let authorized = authorized?;
    match requested {
        None => Some(authorized.to_vec()),
        Some(requested) => Some(
            parse_scopes(requested)
                .into_iter()
                .filter(|scope| authorized.iter().any(|a| a == scope))
                .collect(),
        ),
    }
}
