//! Wire model for flag and segment rule definitions as delivered by the
//! control plane.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A feature flag definition.
///
/// Versions are monotonically increasing per key; the store only ever keeps
/// the highest version it has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub off_variation: Option<i64>,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub client_side: bool,
    /// Legacy field. Accepted on input for compatibility and ignored.
    #[serde(default, skip_serializing)]
    pub sampling_interval: Option<i64>,
}

/// A prerequisite: the named flag must evaluate to exactly `variation` for the
/// dependent flag to proceed past the prerequisite check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: i64,
}

/// Individual user targeting: any user whose key is in `values` receives
/// `variation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: i64,
}

/// A targeting rule: all clauses must match (conjunctive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default)]
    pub track_events: bool,
}

/// A single attribute check within a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operators.
///
/// Applying an operator to value types it does not accept is a non-match,
/// never an error. An operator name this version does not know deserializes to
/// [`Operator::Unknown`], which matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

/// Either a fixed variation index or a percentage rollout.
///
/// The wire format carries the two alternatives as sibling optional fields, so
/// this is a struct rather than an enum; [`VariationOrRollout::is_empty`]
/// detects the malformed case where neither is present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

impl VariationOrRollout {
    pub fn is_empty(&self) -> bool {
        self.variation.is_none() && self.rollout.is_none()
    }
}

/// A percentage rollout across weighted variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

/// Rollout kinds. `Experiment` rollouts mark matching evaluations as
/// experiment traffic unless the chosen branch is untracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
    #[serde(other)]
    Unknown,
}

/// One branch of a rollout. Weights are in hundred-thousandths; the sum over
/// all branches may be under 100000.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: i64,
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub untracked: bool,
}

/// A user segment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub included: HashSet<String>,
    #[serde(default)]
    pub excluded: HashSet<String>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub deleted: bool,
    /// True for big segments, whose membership lives in an external store and
    /// is queried per user.
    #[serde(default)]
    pub unbounded: bool,
    /// Generation counter for big segments; part of the membership reference.
    #[serde(default)]
    pub generation: Option<i64>,
}

impl Segment {
    /// The reference under which an external store keys this segment's
    /// membership. `None` when the segment is not usable as a big segment.
    pub fn big_segment_ref(&self) -> Option<String> {
        match (self.unbounded, self.generation) {
            (true, Some(generation)) => Some(format!("{}.g{}", self.key, generation)),
            _ => None,
        }
    }
}

/// A rule within a segment: all clauses must match, and when `weight` is
/// present the user's bucket must additionally land under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}
