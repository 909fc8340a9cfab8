use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result of evaluating a flag for a user: the chosen value, the index of
/// the chosen variation, and the reason for the choice.
///
/// `value` and `variation_index` are `None` when the flag evaluated to its
/// null off-state or when evaluation failed; callers substitute their own
/// default value in that case.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationDetail {
    pub value: Option<Value>,
    pub variation_index: Option<i64>,
    pub reason: Reason,
}

impl EvaluationDetail {
    pub(crate) fn error(kind: ErrorKind) -> EvaluationDetail {
        EvaluationDetail {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind: kind },
        }
    }
}

/// Explanation of why an evaluation produced its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Reason {
    /// The flag was off and the off variation (if any) was served.
    Off,
    /// The user matched no target or rule and the fallthrough variation was
    /// served.
    Fallthrough {
        #[serde(default, skip_serializing_if = "is_false")]
        in_experiment: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        big_segments_status: Option<BigSegmentsStatus>,
    },
    /// The user's key was individually targeted.
    TargetMatch,
    /// The user matched the rule at `rule_index`.
    RuleMatch {
        rule_index: usize,
        rule_id: String,
        #[serde(default, skip_serializing_if = "is_false")]
        in_experiment: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        big_segments_status: Option<BigSegmentsStatus>,
    },
    /// A prerequisite flag did not return the required variation, so the off
    /// variation was served.
    PrerequisiteFailed { prerequisite_key: String },
    /// Evaluation failed; the caller's default value was served.
    Error { error_kind: ErrorKind },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Reason {
    /// Whether this result is experiment traffic whose events must always be
    /// tracked in full.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::Fallthrough { in_experiment, .. } => *in_experiment,
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            _ => false,
        }
    }

    pub(crate) fn with_big_segments_status(self, status: BigSegmentsStatus) -> Reason {
        match self {
            Reason::Fallthrough { in_experiment, .. } => Reason::Fallthrough {
                in_experiment,
                big_segments_status: Some(status),
            },
            Reason::RuleMatch {
                rule_index,
                rule_id,
                in_experiment,
                ..
            } => Reason::RuleMatch {
                rule_index,
                rule_id,
                in_experiment,
                big_segments_status: Some(status),
            },
            other => other,
        }
    }
}

/// Error categories for failed evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The client has not yet received any flag data.
    ClientNotReady,
    /// No flag with the requested key exists.
    FlagNotFound,
    /// The user or its key was missing or empty.
    UserNotSpecified,
    /// The flag definition is internally inconsistent (bad variation index,
    /// empty rollout, prerequisite cycle, ...).
    MalformedFlag,
    /// The flag value does not have the requested type.
    WrongType,
    /// An unexpected panic was caught during evaluation.
    Exception,
}

/// Health of the big segment subsystem as observed by a single evaluation
/// that consulted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// Membership data was available and fresh.
    Healthy,
    /// Membership data was served but has not been updated recently enough.
    Stale,
    /// A big segment was referenced but no big segment store is configured.
    NotConfigured,
    /// The membership query failed.
    StoreError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reasons_serialize_in_wire_form() {
        assert_eq!(serde_json::to_value(Reason::Off).unwrap(), json!({"kind": "OFF"}));
        assert_eq!(
            serde_json::to_value(Reason::TargetMatch).unwrap(),
            json!({"kind": "TARGET_MATCH"})
        );
        assert_eq!(
            serde_json::to_value(Reason::RuleMatch {
                rule_index: 2,
                rule_id: "abc".into(),
                in_experiment: false,
                big_segments_status: None,
            })
            .unwrap(),
            json!({"kind": "RULE_MATCH", "ruleIndex": 2, "ruleId": "abc"})
        );
        assert_eq!(
            serde_json::to_value(Reason::PrerequisiteFailed {
                prerequisite_key: "dep".into()
            })
            .unwrap(),
            json!({"kind": "PREREQUISITE_FAILED", "prerequisiteKey": "dep"})
        );
        assert_eq!(
            serde_json::to_value(Reason::Error {
                error_kind: ErrorKind::WrongType
            })
            .unwrap(),
            json!({"kind": "ERROR", "errorKind": "WRONG_TYPE"})
        );
    }

    #[test]
    fn in_experiment_and_big_segments_status_appear_when_set() {
        let reason = Reason::Fallthrough {
            in_experiment: true,
            big_segments_status: Some(BigSegmentsStatus::Stale),
        };
        assert_eq!(
            serde_json::to_value(reason).unwrap(),
            json!({"kind": "FALLTHROUGH", "inExperiment": true, "bigSegmentsStatus": "STALE"})
        );
    }

    #[test]
    fn status_attaches_to_rule_match_and_fallthrough_only() {
        let rule = Reason::RuleMatch {
            rule_index: 0,
            rule_id: "r".into(),
            in_experiment: false,
            big_segments_status: None,
        };
        assert!(matches!(
            rule.with_big_segments_status(BigSegmentsStatus::Healthy),
            Reason::RuleMatch {
                big_segments_status: Some(BigSegmentsStatus::Healthy),
                ..
            }
        ));
        assert_eq!(
            Reason::Off.with_big_segments_status(BigSegmentsStatus::Healthy),
            Reason::Off
        );
    }
}
