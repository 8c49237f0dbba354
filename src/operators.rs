//! Clause operator semantics.
//!
//! Every operator is typed: a type mismatch between the context value
//! and the clause value yields `false`, never an error. `segmentMatch`
//! is resolved by the evaluator (it needs store access) and `Unknown`
//! matches nothing.

use crate::models::Op;
use chrono::DateTime;
use semver::Version;
use serde_json::Value;

/// Apply one operator to a context value and a single clause constant.
pub fn apply(op: Op, context_value: &Value, clause_value: &Value) -> bool {
    match op {
        Op::In => equal(context_value, clause_value),
        Op::StartsWith => string_op(context_value, clause_value, |a, b| a.starts_with(b)),
        Op::EndsWith => string_op(context_value, clause_value, |a, b| a.ends_with(b)),
        Op::Contains => string_op(context_value, clause_value, |a, b| a.contains(b)),
        Op::Matches => string_op(context_value, clause_value, |a, pattern| {
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(a),
                Err(_) => false,
            }
        }),
        Op::LessThan => numeric_op(context_value, clause_value, |a, b| a < b),
        Op::LessThanOrEqual => numeric_op(context_value, clause_value, |a, b| a <= b),
        Op::GreaterThan => numeric_op(context_value, clause_value, |a, b| a > b),
        Op::GreaterThanOrEqual => numeric_op(context_value, clause_value, |a, b| a >= b),
        Op::Before => date_op(context_value, clause_value, |a, b| a < b),
        Op::After => date_op(context_value, clause_value, |a, b| a > b),
        Op::SemVerEqual => semver_op(context_value, clause_value, |a, b| a == b),
        Op::SemVerLessThan => semver_op(context_value, clause_value, |a, b| a < b),
        Op::SemVerGreaterThan => semver_op(context_value, clause_value, |a, b| a > b),
        Op::SegmentMatch | Op::Unknown => false,
    }
}

/// Equality with cross-representation numeric comparison, so that `3`
/// and `3.0` are equal regardless of how serde parsed them.
fn equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn string_op(a: &Value, b: &Value, op: impl Fn(&str, &str) -> bool) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn numeric_op(a: &Value, b: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn date_op(a: &Value, b: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (millis(a), millis(b)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Milliseconds since epoch: numbers pass through, strings are parsed as
/// RFC3339.
fn millis(value: &Value) -> Option<f64> {
    match value {
        Value::Number(_) => value.as_f64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64),
        _ => None,
    }
}

fn semver_op(a: &Value, b: &Value, op: impl Fn(&Version, &Version) -> bool) -> bool {
    match (parse_semver(a), parse_semver(b)) {
        (Some(a), Some(b)) => op(&a, &b),
        _ => false,
    }
}

/// Parse a version, padding missing minor/patch components with `.0`
/// (two retries) so that `2` and `2.0-rc1` are accepted.
fn parse_semver(value: &Value) -> Option<Version> {
    let raw = value.as_str()?;
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    // split the numeric core from any prerelease/build suffix before
    // inserting the missing components
    let split = raw.find(|c: char| c == '-' || c == '+').unwrap_or_else(|| raw.len());
    let (core, suffix) = raw.split_at(split);
    let mut padded = core.to_string();
    for _ in 0..2 {
        padded.push_str(".0");
        if let Ok(version) = Version::parse(&format!("{}{}", padded, suffix)) {
            return Some(version);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(op: Op, a: Value, b: Value) -> bool {
        apply(op, &a, &b)
    }

    #[test]
    fn in_op_compares_all_types() {
        assert!(check(Op::In, json!("x"), json!("x")));
        assert!(!check(Op::In, json!("x"), json!("y")));
        assert!(check(Op::In, json!(3), json!(3.0)));
        assert!(check(Op::In, json!(true), json!(true)));
        assert!(check(Op::In, json!(["a"]), json!(["a"])));
        assert!(!check(Op::In, json!("3"), json!(3)));
    }

    #[test]
    fn string_ops() {
        assert!(check(Op::StartsWith, json!("hello"), json!("he")));
        assert!(!check(Op::StartsWith, json!("hello"), json!("lo")));
        assert!(check(Op::EndsWith, json!("hello"), json!("lo")));
        assert!(check(Op::Contains, json!("hello"), json!("ell")));
        // type mismatch is false, not an error
        assert!(!check(Op::StartsWith, json!(7), json!("7")));
        assert!(!check(Op::Contains, json!("7"), json!(7)));
    }

    #[test]
    fn regex_matches_and_bad_patterns() {
        assert!(check(Op::Matches, json!("hello-42"), json!("^hello-\\d+$")));
        assert!(!check(Op::Matches, json!("hello"), json!("^nope$")));
        assert!(!check(Op::Matches, json!("hello"), json!("(unclosed")));
        assert!(!check(Op::Matches, json!(42), json!("42")));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(check(Op::LessThan, json!(1), json!(1.5)));
        assert!(!check(Op::LessThan, json!(2), json!(2)));
        assert!(check(Op::LessThanOrEqual, json!(2), json!(2)));
        assert!(check(Op::GreaterThan, json!(3.5), json!(3)));
        assert!(check(Op::GreaterThanOrEqual, json!(3), json!(3)));
        assert!(!check(Op::GreaterThan, json!("3"), json!(2)));
    }

    #[test]
    fn date_comparisons_accept_rfc3339_and_millis() {
        let earlier = json!("2021-01-01T00:00:00Z");
        let later = json!("2021-06-01T12:30:00.500-07:00");
        assert!(check(Op::Before, earlier.clone(), later.clone()));
        assert!(check(Op::After, later.clone(), earlier.clone()));
        // numbers are taken as millis since epoch
        assert!(check(Op::Before, json!(1_000_000), later));
        assert!(!check(Op::Before, earlier, json!("not a date")));
    }

    #[test]
    fn semver_comparisons_pad_missing_components() {
        assert!(check(Op::SemVerEqual, json!("2.0"), json!("2.0.0")));
        assert!(check(Op::SemVerEqual, json!("2"), json!("2.0.0")));
        assert!(check(Op::SemVerEqual, json!("2-rc1"), json!("2.0.0-rc1")));
        assert!(check(Op::SemVerLessThan, json!("2.0.0-rc1"), json!("2.0.0")));
        assert!(check(Op::SemVerGreaterThan, json!("10.0.1"), json!("9.9")));
        assert!(!check(Op::SemVerEqual, json!("not-a-version"), json!("1.0.0")));
        assert!(!check(Op::SemVerEqual, json!(2), json!("2.0.0")));
    }

    #[test]
    fn segment_match_and_unknown_never_match_here() {
        assert!(!check(Op::SegmentMatch, json!("seg"), json!("seg")));
        assert!(!check(Op::Unknown, json!("x"), json!("x")));
    }
}
