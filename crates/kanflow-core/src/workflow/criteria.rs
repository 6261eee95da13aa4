//! Acceptance criterion checks for step output.
//!
//! A criterion is tried, in order, as:
//! 1. a regex literal `/pattern/flags`
//! 2. a field equality `path == value` against the parsed output
//! 3. a substring of the raw output
//!
//! Regexes are hardened: long patterns and unsupported flags are never
//! compiled, the compiled program size is capped, and matching runs on a
//! blocking worker bounded by a deadline.

use std::time::Duration;

use kanflow_types::config::MAX_REGEX_PATTERN_LEN;
use regex::RegexBuilder;
use serde_json::{json, Value};

use super::expression::{resolve_path, split_once_unquoted, strip_quotes, value_to_string};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on the compiled regex program size.
pub const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Flags accepted in `/pattern/flags` criteria.
const ALLOWED_FLAGS: &str = "ims";

// ---------------------------------------------------------------------------
// Criterion classification
// ---------------------------------------------------------------------------

/// How a criterion string will be checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion<'a> {
    /// `/pattern/flags` with a short pattern and supported flags.
    Regex { pattern: &'a str, flags: &'a str },
    /// `path == value`.
    FieldEquals { path: &'a str, expected: &'a str },
    /// Raw output must contain the needle.
    Contains(&'a str),
}

impl<'a> Criterion<'a> {
    /// Classify a criterion string.
    pub fn parse(criterion: &'a str) -> Self {
        if let Some((pattern, flags)) = split_regex_literal(criterion) {
            if pattern.len() > MAX_REGEX_PATTERN_LEN
                || !flags.chars().all(|c| ALLOWED_FLAGS.contains(c))
            {
                return Criterion::Contains(criterion);
            }
            return Criterion::Regex { pattern, flags };
        }

        if let Some((path, expected)) = split_once_unquoted(criterion, "==") {
            let path = path.trim();
            if !path.is_empty() {
                return Criterion::FieldEquals {
                    path,
                    expected: strip_quotes(expected),
                };
            }
        }

        Criterion::Contains(criterion)
    }
}

fn split_regex_literal(criterion: &str) -> Option<(&str, &str)> {
    let body = criterion.strip_prefix('/')?;
    let close = body.rfind('/')?;
    Some((&body[..close], &body[close + 1..]))
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Check a single criterion against raw and parsed output.
pub async fn check_criterion(
    criterion: &str,
    raw: &str,
    parsed: &Value,
    regex_timeout: Duration,
) -> bool {
    match Criterion::parse(criterion) {
        Criterion::Regex { pattern, flags } => {
            check_regex(pattern, flags, raw, regex_timeout).await
        }
        Criterion::FieldEquals { path, expected } => check_field(path, expected, parsed),
        Criterion::Contains(needle) => raw.contains(needle),
    }
}

/// Return the first criterion that fails, if any.
///
/// Criteria after the first failure are not evaluated.
pub async fn first_failing<'c>(
    criteria: &'c [String],
    raw: &str,
    parsed: &Value,
    regex_timeout: Duration,
) -> Option<&'c str> {
    for criterion in criteria {
        if !check_criterion(criterion, raw, parsed, regex_timeout).await {
            return Some(criterion.as_str());
        }
    }
    None
}

fn check_field(path: &str, expected: &str, parsed: &Value) -> bool {
    let wrapped = json!({ "output": parsed });
    let actual = resolve_path(&wrapped, path).or_else(|| resolve_path(parsed, path));
    actual.is_some_and(|v| value_to_string(v) == expected)
}

async fn check_regex(pattern: &str, flags: &str, raw: &str, deadline: Duration) -> bool {
    let regex = match RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
    {
        Ok(re) => re,
        Err(e) => {
            tracing::debug!(pattern, error = %e, "invalid criterion regex, using substring match");
            return raw.contains(pattern);
        }
    };

    let haystack = raw.to_owned();
    let handle = tokio::task::spawn_blocking(move || regex.is_match(&haystack));

    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(matched)) => matched,
        Ok(Err(e)) => {
            tracing::warn!(pattern, error = %e, "criterion regex worker failed");
            false
        }
        Err(_) => {
            tracing::warn!(
                pattern,
                timeout_ms = deadline.as_millis() as u64,
                "criterion regex exceeded deadline"
            );
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
