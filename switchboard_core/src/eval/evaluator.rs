use std::sync::Arc;

use serde_json::Value;

use crate::{
    bigseg::{BigSegmentMembership, MembershipProvider},
    flagdata::{Clause, FeatureFlag, Operator, RolloutKind, Rule, Segment, SegmentRule, VariationOrRollout},
    User,
};

use super::{bucket_user, BigSegmentsStatus, ErrorKind, EvaluationDetail, Reason};

/// Read access to flag and segment definitions during evaluation.
///
/// Implemented for every [`crate::store::DataStore`]; tests may substitute a
/// plain map.
pub trait EvaluationStore {
    fn flag(&self, key: &str) -> Option<FeatureFlag>;
    fn segment(&self, key: &str) -> Option<Segment>;
}

/// A prerequisite evaluation performed on the way to a flag's result. Each one
/// becomes a feature-request event, emitted before the terminal event.
#[derive(Debug, Clone, PartialEq)]
pub struct PrerequisiteEvent {
    /// Key of the flag that required the prerequisite.
    pub prerequisite_of: String,
    pub flag_key: String,
    pub flag_version: u64,
    pub detail: EvaluationDetail,
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
}

/// Everything produced by evaluating one flag.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub detail: EvaluationDetail,
    pub prerequisite_events: Vec<PrerequisiteEvent>,
}

/// Whether an evaluation result must always be tracked in full (rather than
/// only contributing to the summary), because the branch taken carries
/// experiment traffic or rule-level tracking.
pub fn is_experimentation_enabled(flag: &FeatureFlag, reason: &Reason) -> bool {
    match reason {
        Reason::Fallthrough { in_experiment, .. } => {
            *in_experiment || flag.track_events_fallthrough
        }
        Reason::RuleMatch {
            rule_index,
            in_experiment,
            ..
        } => {
            *in_experiment
                || flag
                    .rules
                    .get(*rule_index)
                    .map_or(false, |rule| rule.track_events)
        }
        _ => false,
    }
}

/// The evaluation engine.
///
/// Evaluation is a pure function of the flag, the user, and the current store
/// contents: it has no side effects on any of them, and errors never
/// propagate out. Every failure is folded into an [`ErrorKind`]-tagged detail
/// so that one bad flag cannot poison a batch of evaluations.
pub struct Evaluator<'a> {
    store: &'a dyn EvaluationStore,
    big_segments: Option<&'a dyn MembershipProvider>,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn EvaluationStore) -> Evaluator<'a> {
        Evaluator {
            store,
            big_segments: None,
        }
    }

    pub fn with_big_segments(
        store: &'a dyn EvaluationStore,
        big_segments: &'a dyn MembershipProvider,
    ) -> Evaluator<'a> {
        Evaluator {
            store,
            big_segments: Some(big_segments),
        }
    }

    /// Evaluate `flag` for `user`, producing the detail plus one prerequisite
    /// event per prerequisite flag evaluated along the way (in evaluation
    /// order).
    pub fn evaluate(&self, flag: &FeatureFlag, user: &User) -> EvalResult {
        if user.key().is_empty() {
            log::warn!(target: "switchboard",
                "user has no key; returning default for flag '{}'", flag.key);
            return EvalResult {
                detail: EvaluationDetail::error(ErrorKind::UserNotSpecified),
                prerequisite_events: Vec::new(),
            };
        }

        let mut scope = EvalScope {
            store: self.store,
            big_segments: self.big_segments,
            user,
            prerequisite_events: Vec::new(),
            flag_stack: Vec::new(),
            segment_stack: Vec::new(),
            membership: None,
            big_segments_status: None,
        };

        let mut detail = scope.eval_flag(flag);
        if let Some(status) = scope.big_segments_status {
            detail.reason = detail.reason.with_big_segments_status(status);
        }
        EvalResult {
            detail,
            prerequisite_events: scope.prerequisite_events,
        }
    }
}

/// State for a single evaluation: the prerequisite chain (cycle guard), the
/// collected prerequisite events, and the per-evaluation big segment
/// membership fetched at most once.
struct EvalScope<'a> {
    store: &'a dyn EvaluationStore,
    big_segments: Option<&'a dyn MembershipProvider>,
    user: &'a User,
    prerequisite_events: Vec<PrerequisiteEvent>,
    flag_stack: Vec<String>,
    segment_stack: Vec<String>,
    membership: Option<Option<Arc<BigSegmentMembership>>>,
    big_segments_status: Option<BigSegmentsStatus>,
}

enum Resolved {
    Variation { index: i64, in_experiment: bool },
    /// A rollout whose weights did not cover the user's bucket.
    NoMatch,
    Malformed,
}

impl EvalScope<'_> {
    fn eval_flag(&mut self, flag: &FeatureFlag) -> EvaluationDetail {
        if self.flag_stack.iter().any(|key| key == &flag.key) {
            log::error!(target: "switchboard",
                "prerequisite cycle detected involving flag '{}'", flag.key);
            return EvaluationDetail::error(ErrorKind::MalformedFlag);
        }

        if !flag.on {
            return off_value(flag, Reason::Off);
        }

        if let Some(short_circuit) = self.check_prerequisites(flag) {
            return short_circuit;
        }

        for target in &flag.targets {
            if target.values.iter().any(|key| key == self.user.key()) {
                return variation_value(flag, target.variation, Reason::TargetMatch);
            }
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if !self.rule_matches(rule) {
                continue;
            }
            match self.resolve(&rule.variation_or_rollout, flag) {
                Resolved::Variation {
                    index,
                    in_experiment,
                } => {
                    let reason = Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                        big_segments_status: None,
                    };
                    return variation_value(flag, index, reason);
                }
                // Residual rollout weight: the rule does not capture this
                // user; keep scanning.
                Resolved::NoMatch => continue,
                Resolved::Malformed => {
                    return EvaluationDetail::error(ErrorKind::MalformedFlag)
                }
            }
        }

        match self.resolve(&flag.fallthrough, flag) {
            Resolved::Variation {
                index,
                in_experiment,
            } => variation_value(
                flag,
                index,
                Reason::Fallthrough {
                    in_experiment,
                    big_segments_status: None,
                },
            ),
            Resolved::NoMatch | Resolved::Malformed => {
                log::error!(target: "switchboard",
                    "flag '{}' has an invalid fallthrough", flag.key);
                EvaluationDetail::error(ErrorKind::MalformedFlag)
            }
        }
    }

    /// Evaluate prerequisites in order. `Some` short-circuits the outer flag.
    fn check_prerequisites(&mut self, flag: &FeatureFlag) -> Option<EvaluationDetail> {
        for prerequisite in &flag.prerequisites {
            let failed = Reason::PrerequisiteFailed {
                prerequisite_key: prerequisite.key.clone(),
            };

            let Some(prereq_flag) = self.store.flag(&prerequisite.key) else {
                log::warn!(target: "switchboard",
                    "flag '{}' references missing prerequisite '{}'",
                    flag.key, prerequisite.key);
                return Some(off_value(flag, failed));
            };

            self.flag_stack.push(flag.key.clone());
            let detail = self.eval_flag(&prereq_flag);
            self.flag_stack.pop();

            if detail.reason
                == (Reason::Error {
                    error_kind: ErrorKind::MalformedFlag,
                })
            {
                return Some(EvaluationDetail::error(ErrorKind::MalformedFlag));
            }

            let track_events = prereq_flag.track_events
                || is_experimentation_enabled(&prereq_flag, &detail.reason);
            let satisfied =
                prereq_flag.on && detail.variation_index == Some(prerequisite.variation);
            self.prerequisite_events.push(PrerequisiteEvent {
                prerequisite_of: flag.key.clone(),
                flag_key: prereq_flag.key.clone(),
                flag_version: prereq_flag.version,
                detail,
                track_events,
                debug_events_until_date: prereq_flag.debug_events_until_date,
            });

            if !satisfied {
                return Some(off_value(flag, failed));
            }
        }
        None
    }

    fn resolve(&mut self, vr: &VariationOrRollout, flag: &FeatureFlag) -> Resolved {
        if let Some(index) = vr.variation {
            return Resolved::Variation {
                index,
                in_experiment: false,
            };
        }
        let Some(rollout) = &vr.rollout else {
            return Resolved::Malformed;
        };
        if rollout.variations.is_empty() || rollout.kind == RolloutKind::Unknown {
            return Resolved::Malformed;
        }

        let bucket_by = rollout.bucket_by.as_deref().unwrap_or("key");
        let bucket = bucket_user(self.user, &flag.key, bucket_by, &flag.salt);

        let mut sum = 0.0;
        for weighted in &rollout.variations {
            sum += weighted.weight as f64 / 100_000.0;
            if bucket < sum {
                return Resolved::Variation {
                    index: weighted.variation,
                    in_experiment: rollout.kind == RolloutKind::Experiment
                        && !weighted.untracked,
                };
            }
        }
        Resolved::NoMatch
    }

    fn rule_matches(&mut self, rule: &Rule) -> bool {
        rule.clauses.iter().all(|clause| self.clause_matches(clause))
    }

    fn clause_matches(&mut self, clause: &Clause) -> bool {
        if clause.op == Operator::SegmentMatch {
            let matched = clause.values.iter().any(|value| {
                value.as_str().map_or(false, |segment_key| {
                    self.store
                        .segment(segment_key)
                        .map_or(false, |segment| self.segment_matches(&segment))
                })
            });
            return matched != clause.negate;
        }

        // A user without the attribute fails the clause outright; negation is
        // not applied in that case.
        let Some(user_value) = self.user.attribute(&clause.attribute) else {
            return false;
        };

        let matched = match &user_value {
            Value::Array(elements) => elements
                .iter()
                .any(|element| clause_value_match(clause, element)),
            single => clause_value_match(clause, single),
        };
        matched != clause.negate
    }

    fn segment_matches(&mut self, segment: &Segment) -> bool {
        if self.segment_stack.iter().any(|key| key == &segment.key) {
            log::error!(target: "switchboard",
                "segment rule cycle detected involving segment '{}'", segment.key);
            return false;
        }

        if segment.unbounded {
            return self.big_segment_matches(segment);
        }

        let key = self.user.key();
        if segment.included.contains(key) {
            // Inclusion wins over exclusion.
            return true;
        }
        if segment.excluded.contains(key) {
            return false;
        }
        self.segment_rules_match(segment)
    }

    fn segment_rules_match(&mut self, segment: &Segment) -> bool {
        self.segment_stack.push(segment.key.clone());
        let matched = segment
            .rules
            .iter()
            .any(|rule| self.segment_rule_matches(rule, segment));
        self.segment_stack.pop();
        matched
    }

    fn segment_rule_matches(&mut self, rule: &SegmentRule, segment: &Segment) -> bool {
        if !rule.clauses.iter().all(|clause| self.clause_matches(clause)) {
            return false;
        }
        match rule.weight {
            None => true,
            Some(weight) => {
                let bucket_by = rule.bucket_by.as_deref().unwrap_or("key");
                let bucket = bucket_user(self.user, &segment.key, bucket_by, &segment.salt);
                bucket * 100_000.0 < weight as f64
            }
        }
    }

    fn big_segment_matches(&mut self, segment: &Segment) -> bool {
        let Some(reference) = segment.big_segment_ref() else {
            self.record_big_segments_status(BigSegmentsStatus::NotConfigured);
            return false;
        };
        let Some(provider) = self.big_segments else {
            self.record_big_segments_status(BigSegmentsStatus::NotConfigured);
            return false;
        };

        // Membership is fetched at most once per evaluation, no matter how
        // many big segments the flag references.
        if self.membership.is_none() {
            let (membership, status) = provider.query_membership(self.user.key());
            self.membership = Some(membership);
            self.record_big_segments_status(status);
        }

        let known = self
            .membership
            .as_ref()
            .and_then(|m| m.as_ref())
            .and_then(|m| m.check(&reference));
        match known {
            Some(included) => included,
            // Unknown membership falls back to the segment's own rules.
            None => self.segment_rules_match(segment),
        }
    }

    fn record_big_segments_status(&mut self, status: BigSegmentsStatus) {
        fn severity(status: BigSegmentsStatus) -> u8 {
            match status {
                BigSegmentsStatus::Healthy => 0,
                BigSegmentsStatus::Stale => 1,
                BigSegmentsStatus::NotConfigured => 2,
                BigSegmentsStatus::StoreError => 3,
            }
        }
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) if severity(current) >= severity(status) => current,
            _ => status,
        });
    }
}

fn off_value(flag: &FeatureFlag, reason: Reason) -> EvaluationDetail {
    match flag.off_variation {
        None => EvaluationDetail {
            value: None,
            variation_index: None,
            reason,
        },
        Some(index) => variation_value(flag, index, reason),
    }
}

fn variation_value(flag: &FeatureFlag, index: i64, reason: Reason) -> EvaluationDetail {
    let value = usize::try_from(index)
        .ok()
        .and_then(|i| flag.variations.get(i));
    match value {
        Some(value) => EvaluationDetail {
            value: Some(value.clone()),
            variation_index: Some(index),
            reason,
        },
        None => {
            log::error!(target: "switchboard",
                "flag '{}' selected nonexistent variation index {}", flag.key, index);
            EvaluationDetail::error(ErrorKind::MalformedFlag)
        }
    }
}

fn clause_value_match(clause: &Clause, user_value: &Value) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| clause.op.matches(user_value, clause_value))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::*;
    use crate::bigseg::BigSegmentMembership;

    #[derive(Default)]
    struct TestStore {
        flags: HashMap<String, FeatureFlag>,
        segments: HashMap<String, Segment>,
    }

    impl TestStore {
        fn with_flags(flags: Vec<Value>) -> TestStore {
            let mut store = TestStore::default();
            for raw in flags {
                let flag: FeatureFlag = serde_json::from_value(raw).unwrap();
                store.flags.insert(flag.key.clone(), flag);
            }
            store
        }

        fn add_segment(mut self, raw: Value) -> TestStore {
            let segment: Segment = serde_json::from_value(raw).unwrap();
            self.segments.insert(segment.key.clone(), segment);
            self
        }
    }

    impl EvaluationStore for TestStore {
        fn flag(&self, key: &str) -> Option<FeatureFlag> {
            self.flags.get(key).cloned()
        }
        fn segment(&self, key: &str) -> Option<Segment> {
            self.segments.get(key).cloned()
        }
    }

    fn bool_flag(key: &str, on: bool) -> Value {
        json!({
            "key": key,
            "version": 1,
            "on": on,
            "salt": "salt",
            "offVariation": 0,
            "fallthrough": {"variation": 1},
            "variations": [false, true]
        })
    }

    #[test]
    fn off_flag_returns_off_variation() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": false,
            "offVariation": 0,
            "variations": [true]
        })]);
        let flag = store.flag("key").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key("userkey"));

        assert_eq!(result.detail.value, Some(json!(true)));
        assert_eq!(result.detail.variation_index, Some(0));
        assert_eq!(result.detail.reason, Reason::Off);
        assert!(result.prerequisite_events.is_empty());
    }

    #[test]
    fn off_flag_without_off_variation_returns_null_detail() {
        let store = TestStore::with_flags(vec![json!({
            "key": "key", "version": 1, "on": false, "variations": [true]
        })]);
        let flag = store.flag("key").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert_eq!(detail.value, None);
        assert_eq!(detail.variation_index, None);
        assert_eq!(detail.reason, Reason::Off);
    }

    #[test]
    fn blank_user_key_is_an_error_and_emits_nothing() {
        let store = TestStore::with_flags(vec![bool_flag("key", true)]);
        let flag = store.flag("key").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key(""));

        assert_eq!(
            result.detail.reason,
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            }
        );
        assert!(result.prerequisite_events.is_empty());
    }

    #[test]
    fn target_match_takes_precedence_over_rules() {
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "targets": [{"values": ["lucky"], "variation": 0}],
            "rules": [{
                "id": "r",
                "variation": 1,
                "clauses": [{"attribute": "key", "op": "in", "values": ["lucky"]}]
            }],
            "fallthrough": {"variation": 1},
            "variations": ["target", "other"]
        })]);
        let flag = store.flag("key").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("lucky"))
            .detail;
        assert_eq!(detail.value, Some(json!("target")));
        assert_eq!(detail.reason, Reason::TargetMatch);
    }

    #[test]
    fn rule_match_reports_index_and_id() {
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "rules": [
                {"id": "never", "variation": 0,
                 "clauses": [{"attribute": "country", "op": "in", "values": ["XX"]}]},
                {"id": "se-rule", "variation": 1,
                 "clauses": [{"attribute": "country", "op": "in", "values": ["SE"]}]}
            ],
            "fallthrough": {"variation": 0},
            "variations": ["fallthrough", "matched"]
        })]);
        let flag = store.flag("key").unwrap();
        let user = User::with_key("u").country("SE");

        let detail = Evaluator::new(&store).evaluate(&flag, &user).detail;
        assert_eq!(detail.value, Some(json!("matched")));
        assert_eq!(
            detail.reason,
            Reason::RuleMatch {
                rule_index: 1,
                rule_id: "se-rule".into(),
                in_experiment: false,
                big_segments_status: None,
            }
        );
    }

    #[test]
    fn negated_clause_inverts_match_but_not_missing_attribute() {
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "rules": [{
                "id": "not-se",
                "variation": 1,
                "clauses": [{"attribute": "country", "op": "in", "values": ["SE"], "negate": true}]
            }],
            "fallthrough": {"variation": 0},
            "variations": ["fallthrough", "matched"]
        })]);
        let flag = store.flag("key").unwrap();
        let evaluator = Evaluator::new(&store);

        let outside = User::with_key("u").country("NO");
        assert_eq!(
            evaluator.evaluate(&flag, &outside).detail.value,
            Some(json!("matched"))
        );

        let inside = User::with_key("u").country("SE");
        assert_eq!(
            evaluator.evaluate(&flag, &inside).detail.value,
            Some(json!("fallthrough"))
        );

        // Missing attribute: clause fails even though it is negated.
        let unknown = User::with_key("u");
        assert_eq!(
            evaluator.evaluate(&flag, &unknown).detail.value,
            Some(json!("fallthrough"))
        );
    }

    #[test]
    fn array_attributes_match_element_wise() {
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "rules": [{
                "id": "beta",
                "variation": 1,
                "clauses": [{"attribute": "groups", "op": "in", "values": ["beta"]}]
            }],
            "fallthrough": {"variation": 0},
            "variations": [false, true]
        })]);
        let flag = store.flag("key").unwrap();
        let user = User::with_key("u").custom_attribute("groups", json!(["alpha", "beta"]));

        let detail = Evaluator::new(&store).evaluate(&flag, &user).detail;
        assert_eq!(detail.value, Some(json!(true)));
    }

    #[test]
    fn rollout_is_deterministic_and_covers_all_weight() {
        let store = TestStore::with_flags(vec![json!({
            "key": "feature",
            "version": 1,
            "on": true,
            "salt": "abcd",
            "fallthrough": {"rollout": {"variations": [
                {"variation": 0, "weight": 60000},
                {"variation": 1, "weight": 40000}
            ]}},
            "variations": ["a", "b"]
        })]);
        let flag = store.flag("feature").unwrap();
        let evaluator = Evaluator::new(&store);
        let user = User::with_key("userKeyA");

        let first = evaluator.evaluate(&flag, &user).detail;
        let second = evaluator.evaluate(&flag, &user).detail;
        assert_eq!(first, second);
        assert!(matches!(first.reason, Reason::Fallthrough { .. }));
        assert!(first.variation_index.is_some());
    }

    #[test]
    fn experiment_rollout_sets_in_experiment_except_untracked() {
        let flag_json = |untracked: bool| {
            json!({
                "key": "exp",
                "version": 1,
                "on": true,
                "salt": "salt",
                "fallthrough": {"rollout": {
                    "kind": "experiment",
                    "variations": [{"variation": 0, "weight": 100000, "untracked": untracked}]
                }},
                "variations": ["only"]
            })
        };

        let store = TestStore::with_flags(vec![flag_json(false)]);
        let flag = store.flag("exp").unwrap();
        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert!(detail.reason.is_in_experiment());

        let store = TestStore::with_flags(vec![flag_json(true)]);
        let flag = store.flag("exp").unwrap();
        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert!(!detail.reason.is_in_experiment());
    }

    #[test]
    fn residual_rollout_weight_skips_the_rule() {
        // A zero-weight rule rollout can never capture the user, so the scan
        // proceeds to the next rule.
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "rules": [
                {"id": "residual",
                 "rollout": {"variations": [{"variation": 1, "weight": 0}]},
                 "clauses": [{"attribute": "key", "op": "in", "values": ["u"]}]},
                {"id": "catch", "variation": 1,
                 "clauses": [{"attribute": "key", "op": "in", "values": ["u"]}]}
            ],
            "fallthrough": {"variation": 0},
            "variations": ["fallthrough", "matched"]
        })]);
        let flag = store.flag("key").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert_eq!(detail.value, Some(json!("matched")));
        assert!(matches!(detail.reason, Reason::RuleMatch { rule_index: 1, .. }));
    }

    #[test]
    fn malformed_flags_yield_error_details() {
        let cases = vec![
            // Out-of-range off variation.
            json!({"key": "k", "version": 1, "on": false, "offVariation": 9,
                   "variations": [true]}),
            // Empty fallthrough.
            json!({"key": "k", "version": 1, "on": true, "fallthrough": {},
                   "variations": [true]}),
            // Rollout with no variations.
            json!({"key": "k", "version": 1, "on": true,
                   "fallthrough": {"rollout": {"variations": []}}, "variations": [true]}),
            // Unknown rollout kind.
            json!({"key": "k", "version": 1, "on": true,
                   "fallthrough": {"rollout": {"kind": "futureKind",
                       "variations": [{"variation": 0, "weight": 100000}]}},
                   "variations": [true]}),
        ];
        for raw in cases {
            let store = TestStore::with_flags(vec![raw.clone()]);
            let flag = store.flag("k").unwrap();
            let detail = Evaluator::new(&store)
                .evaluate(&flag, &User::with_key("u"))
                .detail;
            assert_eq!(
                detail.reason,
                Reason::Error {
                    error_kind: ErrorKind::MalformedFlag
                },
                "flag {raw} should be malformed"
            );
        }
    }

    #[test]
    fn satisfied_prerequisite_records_event_and_proceeds() {
        let store = TestStore::with_flags(vec![
            json!({
                "key": "outer",
                "version": 2,
                "on": true,
                "salt": "salt",
                "prerequisites": [{"key": "inner", "variation": 1}],
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": ["off", "on"]
            }),
            bool_flag("inner", true),
        ]);
        let flag = store.flag("outer").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key("u"));

        assert_eq!(result.detail.value, Some(json!("on")));
        assert_eq!(result.prerequisite_events.len(), 1);
        let event = &result.prerequisite_events[0];
        assert_eq!(event.prerequisite_of, "outer");
        assert_eq!(event.flag_key, "inner");
        assert_eq!(event.detail.variation_index, Some(1));
    }

    #[test]
    fn failed_prerequisite_short_circuits_to_off_variation() {
        let store = TestStore::with_flags(vec![
            json!({
                "key": "outer",
                "version": 2,
                "on": true,
                "salt": "salt",
                "prerequisites": [{"key": "inner", "variation": 0}],
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": ["off", "on"]
            }),
            // inner serves variation 1, not the required 0
            bool_flag("inner", true),
        ]);
        let flag = store.flag("outer").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key("u"));

        assert_eq!(result.detail.value, Some(json!("off")));
        assert_eq!(
            result.detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "inner".into()
            }
        );
        // The prerequisite evaluation itself is still reported.
        assert_eq!(result.prerequisite_events.len(), 1);
    }

    #[test]
    fn off_prerequisite_fails_even_when_variation_matches() {
        let store = TestStore::with_flags(vec![
            json!({
                "key": "outer",
                "version": 2,
                "on": true,
                "salt": "salt",
                "prerequisites": [{"key": "inner", "variation": 0}],
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": ["off", "on"]
            }),
            // Off flag serving its off variation 0; prerequisite requires 0
            // but the flag being off still fails it.
            json!({
                "key": "inner",
                "version": 1,
                "on": false,
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            }),
        ]);
        let flag = store.flag("outer").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key("u"));
        assert_eq!(
            result.detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "inner".into()
            }
        );
    }

    #[test]
    fn missing_prerequisite_fails_without_an_event() {
        let store = TestStore::with_flags(vec![json!({
            "key": "outer",
            "version": 2,
            "on": true,
            "salt": "salt",
            "prerequisites": [{"key": "ghost", "variation": 0}],
            "offVariation": 0,
            "fallthrough": {"variation": 1},
            "variations": ["off", "on"]
        })]);
        let flag = store.flag("outer").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key("u"));
        assert_eq!(
            result.detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "ghost".into()
            }
        );
        assert!(result.prerequisite_events.is_empty());
    }

    #[test]
    fn prerequisite_events_precede_nested_ones_in_evaluation_order() {
        let store = TestStore::with_flags(vec![
            json!({
                "key": "a",
                "version": 1,
                "on": true,
                "salt": "salt",
                "prerequisites": [{"key": "b", "variation": 1}],
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            }),
            json!({
                "key": "b",
                "version": 1,
                "on": true,
                "salt": "salt",
                "prerequisites": [{"key": "c", "variation": 1}],
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            }),
            bool_flag("c", true),
        ]);
        let flag = store.flag("a").unwrap();

        let result = Evaluator::new(&store).evaluate(&flag, &User::with_key("u"));
        let keys: Vec<&str> = result
            .prerequisite_events
            .iter()
            .map(|e| e.flag_key.as_str())
            .collect();
        // Depth-first: c is evaluated (and reported) before b completes.
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[test]
    fn prerequisite_cycle_is_malformed_not_a_stack_overflow() {
        let cyclic = |key: &str, prereq: &str| {
            json!({
                "key": key,
                "version": 1,
                "on": true,
                "salt": "salt",
                "prerequisites": [{"key": prereq, "variation": 1}],
                "offVariation": 0,
                "fallthrough": {"variation": 1},
                "variations": [false, true]
            })
        };
        let store = TestStore::with_flags(vec![cyclic("a", "b"), cyclic("b", "a")]);
        let flag = store.flag("a").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            }
        );
    }

    fn segment_match_flag(segment_key: &str) -> Value {
        json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "rules": [{
                "id": "seg",
                "variation": 1,
                "clauses": [{"attribute": "", "op": "segmentMatch", "values": [segment_key]}]
            }],
            "fallthrough": {"variation": 0},
            "variations": [false, true]
        })
    }

    #[test]
    fn segment_inclusion_wins_over_exclusion() {
        let store = TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(json!({
            "key": "s",
            "version": 1,
            "salt": "salt",
            "included": ["foo"],
            "excluded": ["foo"]
        }));
        let flag = store.flag("key").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("foo"))
            .detail;
        assert_eq!(detail.value, Some(json!(true)));
    }

    #[test]
    fn excluded_user_never_matches_segment_rules() {
        let store = TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(json!({
            "key": "s",
            "version": 1,
            "salt": "salt",
            "excluded": ["foo"],
            "rules": [{"clauses": [{"attribute": "key", "op": "in", "values": ["foo"]}]}]
        }));
        let flag = store.flag("key").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("foo"))
            .detail;
        assert_eq!(detail.value, Some(json!(false)));
    }

    #[test]
    fn segment_rule_with_weight_buckets_the_user() {
        let full = json!({
            "key": "s",
            "version": 1,
            "salt": "salt",
            "rules": [{
                "clauses": [{"attribute": "key", "op": "in", "values": ["foo"]}],
                "weight": 100000
            }]
        });
        let none = json!({
            "key": "s",
            "version": 1,
            "salt": "salt",
            "rules": [{
                "clauses": [{"attribute": "key", "op": "in", "values": ["foo"]}],
                "weight": 0
            }]
        });

        let store = TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(full);
        let flag = store.flag("key").unwrap();
        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("foo"))
            .detail;
        assert_eq!(detail.value, Some(json!(true)));

        let store = TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(none);
        let flag = store.flag("key").unwrap();
        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("foo"))
            .detail;
        assert_eq!(detail.value, Some(json!(false)));
    }

    struct FakeMembershipProvider {
        membership: Option<Arc<BigSegmentMembership>>,
        status: BigSegmentsStatus,
        queries: AtomicUsize,
    }

    impl MembershipProvider for FakeMembershipProvider {
        fn query_membership(
            &self,
            _user_key: &str,
        ) -> (Option<Arc<BigSegmentMembership>>, BigSegmentsStatus) {
            self.queries.fetch_add(1, Ordering::SeqCst);
            (self.membership.clone(), self.status)
        }
    }

    fn big_segment(key: &str) -> Value {
        json!({"key": key, "version": 1, "salt": "salt", "unbounded": true, "generation": 1})
    }

    #[test]
    fn big_segment_membership_is_fetched_once_and_status_attached() {
        let store = TestStore::with_flags(vec![json!({
            "key": "key",
            "version": 1,
            "on": true,
            "salt": "salt",
            "rules": [
                {"id": "s1", "variation": 1,
                 "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["s1"]}]},
                {"id": "s2", "variation": 1,
                 "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["s2"]}]}
            ],
            "fallthrough": {"variation": 0},
            "variations": [false, true]
        })])
        .add_segment(big_segment("s1"))
        .add_segment(big_segment("s2"));
        let flag = store.flag("key").unwrap();

        let membership = BigSegmentMembership::from_entries(vec![("s2.g1".to_owned(), true)]);
        let provider = FakeMembershipProvider {
            membership: Some(Arc::new(membership)),
            status: BigSegmentsStatus::Stale,
            queries: AtomicUsize::new(0),
        };

        let detail = Evaluator::with_big_segments(&store, &provider)
            .evaluate(&flag, &User::with_key("u"))
            .detail;

        assert_eq!(provider.queries.load(Ordering::SeqCst), 1);
        assert_eq!(detail.value, Some(json!(true)));
        assert!(matches!(
            detail.reason,
            Reason::RuleMatch {
                rule_index: 1,
                big_segments_status: Some(BigSegmentsStatus::Stale),
                ..
            }
        ));
    }

    #[test]
    fn big_segment_excluded_membership_blocks_the_rules() {
        let store = TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(json!({
            "key": "s",
            "version": 1,
            "salt": "salt",
            "unbounded": true,
            "generation": 1,
            "rules": [{"clauses": [{"attribute": "key", "op": "in", "values": ["u"]}]}]
        }));
        let flag = store.flag("key").unwrap();

        let membership = BigSegmentMembership::from_entries(vec![("s.g1".to_owned(), false)]);
        let provider = FakeMembershipProvider {
            membership: Some(Arc::new(membership)),
            status: BigSegmentsStatus::Healthy,
            queries: AtomicUsize::new(0),
        };

        let detail = Evaluator::with_big_segments(&store, &provider)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert_eq!(detail.value, Some(json!(false)));
    }

    #[test]
    fn big_segment_unknown_membership_falls_back_to_rules() {
        let store = TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(json!({
            "key": "s",
            "version": 1,
            "salt": "salt",
            "unbounded": true,
            "generation": 1,
            "rules": [{"clauses": [{"attribute": "key", "op": "in", "values": ["u"]}]}]
        }));
        let flag = store.flag("key").unwrap();

        let provider = FakeMembershipProvider {
            membership: None,
            status: BigSegmentsStatus::Healthy,
            queries: AtomicUsize::new(0),
        };

        let detail = Evaluator::with_big_segments(&store, &provider)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert_eq!(detail.value, Some(json!(true)));
    }

    #[test]
    fn big_segment_without_provider_is_not_configured() {
        let store =
            TestStore::with_flags(vec![segment_match_flag("s")]).add_segment(big_segment("s"));
        let flag = store.flag("key").unwrap();

        let detail = Evaluator::new(&store)
            .evaluate(&flag, &User::with_key("u"))
            .detail;
        assert_eq!(detail.value, Some(json!(false)));
        assert!(matches!(
            detail.reason,
            Reason::Fallthrough {
                big_segments_status: Some(BigSegmentsStatus::NotConfigured),
                ..
            }
        ));
    }
}
