//! Clause operator semantics.
//!
//! Every operator applied to value types it does not accept is a non-match
//! for that pair, never an error; so are bad regexes, unparsable dates, and
//! unparsable versions.
use std::sync::OnceLock;

use chrono::DateTime;
use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::flagdata::Operator;

impl Operator {
    /// Apply the operator to one user value / clause value pair.
    ///
    /// `SegmentMatch` is resolved by the evaluator (it needs store access) and
    /// always reports a non-match here.
    pub(crate) fn matches(&self, user_value: &Value, clause_value: &Value) -> bool {
        self.try_matches(user_value, clause_value).unwrap_or(false)
    }

    /// Returns `None` when the operator cannot be applied to the value types.
    fn try_matches(&self, user_value: &Value, clause_value: &Value) -> Option<bool> {
        match self {
            Operator::In => Some(values_equal(user_value, clause_value)),

            Operator::StartsWith => {
                Some(as_str(user_value)?.starts_with(as_str(clause_value)?))
            }
            Operator::EndsWith => Some(as_str(user_value)?.ends_with(as_str(clause_value)?)),
            Operator::Contains => Some(as_str(user_value)?.contains(as_str(clause_value)?)),

            Operator::Matches => {
                let regex = Regex::new(as_str(clause_value)?).ok()?;
                Some(regex.is_match(as_str(user_value)?))
            }

            Operator::LessThan => Some(as_f64(user_value)? < as_f64(clause_value)?),
            Operator::LessThanOrEqual => Some(as_f64(user_value)? <= as_f64(clause_value)?),
            Operator::GreaterThan => Some(as_f64(user_value)? > as_f64(clause_value)?),
            Operator::GreaterThanOrEqual => Some(as_f64(user_value)? >= as_f64(clause_value)?),

            Operator::Before => Some(as_unix_millis(user_value)? < as_unix_millis(clause_value)?),
            Operator::After => Some(as_unix_millis(user_value)? > as_unix_millis(clause_value)?),

            Operator::SemVerEqual => {
                Some(as_semver(user_value)? == as_semver(clause_value)?)
            }
            Operator::SemVerLessThan => Some(as_semver(user_value)? < as_semver(clause_value)?),
            Operator::SemVerGreaterThan => {
                Some(as_semver(user_value)? > as_semver(clause_value)?)
            }

            Operator::SegmentMatch | Operator::Unknown => None,
        }
    }
}

/// Equality for the `in` operator: when both sides are numeric they compare
/// as `f64` (so integers and floats cross-match; precision is lost above
/// 2^53), otherwise equality is strict.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// A timestamp is either a number of unix milliseconds or an RFC 3339 string.
fn as_unix_millis(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis() as f64),
        _ => None,
    }
}

/// Parse a version, tolerating a missing minor and/or patch component
/// ("2" and "2.1" read as "2.0.0" and "2.1.0").
fn as_semver(value: &Value) -> Option<Version> {
    static COMPONENTS: OnceLock<Regex> = OnceLock::new();
    let components = COMPONENTS
        .get_or_init(|| Regex::new(r"^(\d+)(\.(\d+))?(\.(\d+))?(.*)$").expect("static regex"));

    let s = value.as_str()?;
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }

    let caps = components.captures(s)?;
    let major = caps.get(1)?.as_str();
    let minor = caps.get(3).map_or("0", |m| m.as_str());
    let patch = caps.get(5).map_or("0", |m| m.as_str());
    let rest = caps.get(6).map_or("", |m| m.as_str());
    Version::parse(&format!("{major}.{minor}.{patch}{rest}")).ok()
}
