use crate::bigsegments::{Membership, MembershipResolver};
use crate::context::{Reference, DEFAULT_KIND};
use crate::detail::BigSegmentsStatus;
use crate::models::{
    Clause, Flag, FlagRule, Op, Prerequisite, Rollout, RolloutKind, Segment, SegmentRule,
    SegmentTarget, Target, VariationOrRollout, WeightedVariation,
};
use crate::store::{AllData, ItemDescriptor};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A full data set from plain flag/segment lists.
pub fn basis_of(flags: Vec<Flag>, segments: Vec<Segment>) -> AllData {
    AllData {
        flags: flags
            .into_iter()
            .map(|f| (f.key.clone(), ItemDescriptor::Item(f.into())))
            .collect(),
        segments: segments
            .into_iter()
            .map(|s| (s.key.clone(), ItemDescriptor::Item(s.into())))
            .collect(),
    }
}

pub struct FlagBuilder(Flag);

impl FlagBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(Flag {
            key: key.into(),
            version: 1,
            salt: "salty".into(),
            ..Flag::default()
        })
    }

    pub fn version(mut self, version: u64) -> Self {
        self.0.version = version;
        self
    }

    pub fn on(mut self, on: bool) -> Self {
        self.0.on = on;
        self
    }

    pub fn salt<S: Into<String>>(mut self, salt: S) -> Self {
        self.0.salt = salt.into();
        self
    }

    pub fn variations(mut self, variations: Vec<Value>) -> Self {
        self.0.variations = variations;
        self
    }

    pub fn off_variation(mut self, index: usize) -> Self {
        self.0.off_variation = Some(index);
        self
    }

    pub fn fallthrough_variation(mut self, index: usize) -> Self {
        self.0.fallthrough = VariationOrRollout::Variation { variation: index };
        self
    }

    pub fn fallthrough_rollout<I: IntoIterator<Item = (usize, u32)>>(mut self, weights: I) -> Self {
        self.0.fallthrough = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Rollout,
                context_kind: None,
                bucket_by: None,
                seed: None,
                variations: weights
                    .into_iter()
                    .map(|(variation, weight)| WeightedVariation {
                        variation,
                        weight,
                        untracked: false,
                    })
                    .collect(),
            },
        };
        self
    }

    pub fn experiment_rollout<I: IntoIterator<Item = (usize, u32, bool)>>(
        mut self,
        seed: i64,
        weights: I,
    ) -> Self {
        self.0.fallthrough = VariationOrRollout::Rollout {
            rollout: Rollout {
                kind: RolloutKind::Experiment,
                context_kind: None,
                bucket_by: None,
                seed: Some(seed),
                variations: weights
                    .into_iter()
                    .map(|(variation, weight, untracked)| WeightedVariation {
                        variation,
                        weight,
                        untracked,
                    })
                    .collect(),
            },
        };
        self
    }

    pub fn prerequisite<K: Into<String>>(mut self, key: K, variation: usize) -> Self {
        self.0.prerequisites.push(Prerequisite {
            key: key.into(),
            variation,
        });
        self
    }

    pub fn target(mut self, variation: usize, keys: &[&str]) -> Self {
        self.0.targets.push(Target {
            values: keys.iter().map(|k| k.to_string()).collect(),
            variation,
            context_kind: DEFAULT_KIND.to_string(),
        });
        self
    }

    pub fn context_target(mut self, kind: &str, variation: usize, keys: &[&str]) -> Self {
        self.0.context_targets.push(Target {
            values: keys.iter().map(|k| k.to_string()).collect(),
            variation,
            context_kind: kind.to_string(),
        });
        self
    }

    pub fn rule_with_clause<I: Into<String>>(
        mut self,
        id: I,
        variation: usize,
        clause: Clause,
    ) -> Self {
        self.0.rules.push(FlagRule {
            id: id.into(),
            clauses: vec![clause],
            variation_or_rollout: VariationOrRollout::Variation { variation },
            track_events: false,
        });
        self
    }

    /// Rule matching the named segments, returning variation 1.
    pub fn segment_match_rule(mut self, segment_keys: &[&str]) -> Self {
        let id = format!("segment-rule-{}", self.0.rules.len());
        self.0.rules.push(FlagRule {
            id,
            clauses: vec![segment_match_clause(segment_keys)],
            variation_or_rollout: VariationOrRollout::Variation { variation: 1 },
            track_events: false,
        });
        self
    }

    pub fn build(self) -> Flag {
        self.0
    }
}

fn segment_match_clause(segment_keys: &[&str]) -> Clause {
    Clause {
        context_kind: DEFAULT_KIND.to_string(),
        attribute: Reference::default(),
        op: Op::SegmentMatch,
        values: segment_keys.iter().map(|k| Value::String(k.to_string())).collect(),
        negate: false,
    }
}

pub struct SegmentBuilder(Segment);

impl SegmentBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(Segment {
            key: key.into(),
            version: 1,
            salt: "salty".into(),
            ..Segment::default()
        })
    }

    pub fn version(mut self, version: u64) -> Self {
        self.0.version = version;
        self
    }

    pub fn included(mut self, keys: &[&str]) -> Self {
        self.0.included = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn excluded(mut self, keys: &[&str]) -> Self {
        self.0.excluded = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn included_contexts(mut self, kind: &str, keys: &[&str]) -> Self {
        self.0.included_contexts.push(SegmentTarget {
            values: keys.iter().map(|k| k.to_string()).collect(),
            context_kind: kind.to_string(),
        });
        self
    }

    pub fn segment_match_rule(mut self, segment_keys: &[&str]) -> Self {
        self.0.rules.push(SegmentRule {
            id: format!("rule-{}", self.0.rules.len()),
            clauses: vec![segment_match_clause(segment_keys)],
            weight: None,
            bucket_by: None,
            rollout_context_kind: None,
        });
        self
    }

    /// A rule with no clauses, which matches every context.
    pub fn match_everyone_rule(mut self) -> Self {
        self.0.rules.push(SegmentRule {
            id: format!("rule-{}", self.0.rules.len()),
            clauses: Vec::new(),
            weight: None,
            bucket_by: None,
            rollout_context_kind: None,
        });
        self
    }

    pub fn everyone_rule_with_weight(mut self, weight: u32) -> Self {
        self.0.rules.push(SegmentRule {
            id: format!("rule-{}", self.0.rules.len()),
            clauses: Vec::new(),
            weight: Some(weight),
            bucket_by: None,
            rollout_context_kind: None,
        });
        self
    }

    pub fn unbounded(mut self, generation: i64) -> Self {
        self.0.unbounded = true;
        self.0.generation = Some(generation);
        self
    }

    pub fn unbounded_without_generation(mut self) -> Self {
        self.0.unbounded = true;
        self.0.generation = None;
        self
    }

    pub fn build(self) -> Segment {
        self.0
    }
}

/// Membership resolver with one fixed answer, for evaluator tests.
pub struct SingleValueMembership {
    membership: Option<Arc<Membership>>,
    status: BigSegmentsStatus,
}

impl SingleValueMembership {
    pub fn healthy(reference: &str, included: bool) -> Self {
        let mut membership = HashMap::new();
        membership.insert(reference.to_string(), included);
        Self {
            membership: Some(Arc::new(membership)),
            status: BigSegmentsStatus::Healthy,
        }
    }

    pub fn store_error() -> Self {
        Self {
            membership: None,
            status: BigSegmentsStatus::StoreError,
        }
    }
}

impl MembershipResolver for SingleValueMembership {
    fn query_membership(&self, _context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        (self.membership.clone(), self.status)
    }
}
