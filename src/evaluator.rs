//! Flag evaluation.
//!
//! A pure function over (flag, context, store snapshot, big-segment
//! membership): no I/O besides store reads and the optional big-segment
//! lookup, no panics, and every failure surfaced as an error reason.

use crate::bigsegments::MembershipResolver;
use crate::context::{Context, Reference, DEFAULT_KIND};
use crate::detail::{
    BigSegmentsStatus, ErrorKind, EvaluationDetail, PrerequisiteEvalRecord, Reason,
};
use crate::models::{Clause, Flag, Op, Rollout, RolloutKind, Segment, SegmentRule, VariationOrRollout};
use crate::operators;
use crate::store::Store;
use hex::ToHex;
use parking_lot::Mutex;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

const BUCKET_DIVIDER: f64 = 0xFFFFFFFFFFFFFFFu64 as f64;

/// Complete outcome of one evaluation.
#[derive(Clone, Debug)]
pub struct EvalResult {
    pub detail: EvaluationDetail<Value>,
    /// Every prerequisite evaluated along the way, in declared order.
    pub prereq_evals: Vec<PrerequisiteEvalRecord>,
    /// Set when the evaluation consulted (or should have consulted) the
    /// big-segment store; also stamped onto the reason.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl EvalResult {
    fn err(kind: ErrorKind) -> Self {
        EvalResult {
            detail: EvaluationDetail::err(kind),
            prereq_evals: Vec::new(),
            big_segments_status: None,
        }
    }
}

/// Flag-definition faults detected mid-evaluation. The message is logged
/// once per flag key and the evaluation yields `MALFORMED_FLAG`.
#[derive(Debug)]
struct Malformed(String);

/// Evaluates flags by reading from a [Store], optionally consulting a
/// big-segment membership resolver.
pub struct Evaluator<S> {
    store: S,
    big_segments: Option<Arc<dyn MembershipResolver>>,
    // keys whose malformed definitions were already logged
    reported_malformed: Mutex<HashSet<String>>,
}

impl<S: Store> Evaluator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            big_segments: None,
            reported_malformed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_big_segments(store: S, resolver: Arc<dyn MembershipResolver>) -> Self {
        Self {
            store,
            big_segments: Some(resolver),
            reported_malformed: Mutex::new(HashSet::new()),
        }
    }

    /// Evaluate a flag by key; an unknown key yields `FLAG_NOT_FOUND`.
    pub fn evaluate_key(&self, flag_key: &str, context: &Context) -> EvalResult {
        match self.store.flag(flag_key) {
            Some(flag) => self.evaluate(&flag, context),
            None => EvalResult::err(ErrorKind::FlagNotFound),
        }
    }

    pub fn evaluate(&self, flag: &Flag, context: &Context) -> EvalResult {
        let mut scope = EvaluationScope {
            store: &self.store,
            context,
            big_segments: self.big_segments.as_deref(),
            flag_stack: KeyStack::new(&flag.key),
            segment_stack: KeyStack::new(""),
            prereq_evals: Vec::new(),
            big_segments_state: None,
            membership_cache: HashMap::new(),
        };

        let mut detail = match scope.evaluate_flag(flag) {
            Ok(detail) => detail,
            Err(Malformed(message)) => {
                if self.reported_malformed.lock().insert(flag.key.clone()) {
                    warn!(flag_key = %flag.key, %message, "malformed flag definition");
                }
                EvaluationDetail::err(ErrorKind::MalformedFlag)
            }
        };

        if let Some(status) = scope.big_segments_state {
            detail.reason.big_segments_status = Some(status);
        }
        EvalResult {
            detail,
            prereq_evals: scope.prereq_evals,
            big_segments_status: scope.big_segments_state,
        }
    }
}

/// Stack of keys used for cycle detection. Optimized for the common
/// case of one key and no dependencies: the root key is held by
/// reference and the overflow list only allocates once recursion
/// actually happens.
struct KeyStack<'a> {
    original: &'a str,
    overflow: Vec<String>,
}

impl<'a> KeyStack<'a> {
    fn new(original: &'a str) -> Self {
        Self {
            original,
            overflow: Vec::new(),
        }
    }

    fn contains(&self, key: &str) -> bool {
        (!self.original.is_empty() && self.original == key)
            || self.overflow.iter().any(|k| k == key)
    }

    fn push(&mut self, key: &str) {
        self.overflow.push(key.to_string());
    }

    fn pop(&mut self) {
        self.overflow.pop();
    }
}

/// Scratch state for a single evaluation.
struct EvaluationScope<'a, S> {
    store: &'a S,
    context: &'a Context,
    big_segments: Option<&'a dyn MembershipResolver>,
    flag_stack: KeyStack<'a>,
    segment_stack: KeyStack<'a>,
    prereq_evals: Vec<PrerequisiteEvalRecord>,
    big_segments_state: Option<BigSegmentsStatus>,
    // one membership fetch per context key per evaluation
    membership_cache: HashMap<String, (Option<Arc<HashMap<String, bool>>>, BigSegmentsStatus)>,
}

impl<'a, S: Store> EvaluationScope<'a, S> {
    /// The full short-circuiting algorithm: off check, prerequisites,
    /// targets, rules, fallthrough.
    fn evaluate_flag(&mut self, flag: &Flag) -> Result<EvaluationDetail<Value>, Malformed> {
        if !flag.on {
            return self.off_result(flag, Reason::off());
        }

        if let Some(failed_key) = self.check_prerequisites(flag)? {
            return self.off_result(flag, Reason::prerequisite_failed(failed_key));
        }

        if let Some(variation) = self.match_targets(flag) {
            return self.variation_result(flag, variation, Reason::target_match());
        }

        for (index, rule) in flag.rules.iter().enumerate() {
            if self.rule_matches(&rule.clauses, &flag.key)? {
                let (variation, in_experiment) =
                    self.resolve(&rule.variation_or_rollout, flag)?.ok_or_else(|| {
                        Malformed(format!("rule {:?} has no variation or rollout", rule.id))
                    })?;
                return self.variation_result(
                    flag,
                    variation,
                    Reason::rule_match(index, rule.id.clone(), in_experiment),
                );
            }
        }

        match self.resolve(&flag.fallthrough, flag)? {
            Some((variation, in_experiment)) => {
                self.variation_result(flag, variation, Reason::fallthrough(in_experiment))
            }
            // fallthrough left undefined: report the reason with no value
            None => Ok(EvaluationDetail {
                value: None,
                variation_index: None,
                reason: Reason::fallthrough(false),
            }),
        }
    }

    // -- prerequisites ------------------------------------------------------

    /// Walk prerequisites in declared order; `Some(key)` names the first
    /// failure. A key already on the evaluation stack is a cycle.
    fn check_prerequisites(&mut self, flag: &Flag) -> Result<Option<String>, Malformed> {
        for prereq in &flag.prerequisites {
            if self.flag_stack.contains(&prereq.key) {
                return Err(Malformed(format!(
                    "prerequisite relationship to {:?} caused a circular reference",
                    prereq.key
                )));
            }

            let prereq_flag = match self.store.flag(&prereq.key) {
                Some(prereq_flag) => prereq_flag,
                None => return Ok(Some(prereq.key.clone())),
            };

            self.flag_stack.push(&prereq.key);
            let evaluated = self.evaluate_flag(&prereq_flag);
            self.flag_stack.pop();
            let detail = evaluated?;

            let satisfied = prereq_flag.on
                && !detail.reason.is_error()
                && detail.variation_index == Some(prereq.variation);
            self.prereq_evals.push(PrerequisiteEvalRecord {
                prerequisite_key: prereq.key.clone(),
                flag_key: flag.key.clone(),
                detail,
            });
            if !satisfied {
                return Ok(Some(prereq.key.clone()));
            }
        }
        Ok(None)
    }

    // -- individual targeting ----------------------------------------------

    /// Context-aware target lists take precedence; a user-kind entry
    /// with no values defers to the legacy list for the same variation.
    fn match_targets(&self, flag: &Flag) -> Option<usize> {
        if flag.context_targets.is_empty() {
            for target in &flag.targets {
                if self.key_in_list(DEFAULT_KIND, &target.values) {
                    return Some(target.variation);
                }
            }
            return None;
        }

        for target in &flag.context_targets {
            if target.context_kind == DEFAULT_KIND && target.values.is_empty() {
                let legacy = flag
                    .targets
                    .iter()
                    .find(|t| t.variation == target.variation);
                if let Some(legacy) = legacy {
                    if self.key_in_list(DEFAULT_KIND, &legacy.values) {
                        return Some(target.variation);
                    }
                }
            } else if self.key_in_list(&target.context_kind, &target.values) {
                return Some(target.variation);
            }
        }
        None
    }

    fn key_in_list(&self, kind: &str, values: &[String]) -> bool {
        match self.context.as_kind(kind) {
            Some(single) => values.iter().any(|v| v == single.key()),
            None => false,
        }
    }

    // -- rules and clauses --------------------------------------------------

    fn rule_matches(&mut self, clauses: &[Clause], owner_key: &str) -> Result<bool, Malformed> {
        for clause in clauses {
            if !self.clause_matches(clause, owner_key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(&mut self, clause: &Clause, owner_key: &str) -> Result<bool, Malformed> {
        if clause.op == Op::SegmentMatch {
            let mut matched = false;
            for value in &clause.values {
                let segment_key = match value.as_str() {
                    Some(key) => key,
                    None => continue,
                };
                if let Some(segment) = self.store.segment(segment_key) {
                    if self.segment_matches(&segment)? {
                        matched = true;
                        break;
                    }
                }
            }
            return Ok(maybe_negate(clause, matched));
        }

        if clause.attribute.is_kind() {
            let matched = self.context.individual_contexts().any(|single| {
                clause_match_value(clause, &Value::String(single.kind().as_str().to_string()))
            });
            return Ok(maybe_negate(clause, matched));
        }

        if !clause.attribute.is_valid() {
            return Err(Malformed(format!(
                "clause in {:?} has invalid attribute reference {:?}",
                owner_key,
                clause.attribute.raw()
            )));
        }

        // a missing kind or missing attribute is a non-match, with no
        // negation applied
        let single = match self.context.as_kind(&clause.context_kind) {
            Some(single) => single,
            None => return Ok(false),
        };
        let value = match single.get_value(&clause.attribute) {
            Some(value) => value,
            None => return Ok(false),
        };

        let matched = match &value {
            Value::Array(elements) => elements.iter().any(|e| clause_match_value(clause, e)),
            other => clause_match_value(clause, other),
        };
        Ok(maybe_negate(clause, matched))
    }

    // -- segments -----------------------------------------------------------

    fn segment_matches(&mut self, segment: &Segment) -> Result<bool, Malformed> {
        if self.segment_stack.contains(&segment.key) {
            return Err(Malformed(format!(
                "segment rule referencing segment {:?} caused a circular reference",
                segment.key
            )));
        }
        self.segment_stack.push(&segment.key);
        let result = if segment.unbounded {
            self.big_segment_matches(segment)
        } else {
            self.simple_segment_matches(segment, true)
        };
        self.segment_stack.pop();
        result
    }

    fn simple_segment_matches(
        &mut self,
        segment: &Segment,
        use_includes: bool,
    ) -> Result<bool, Malformed> {
        if use_includes {
            if self.key_in_list(DEFAULT_KIND, &segment.included) {
                return Ok(true);
            }
            for target in &segment.included_contexts {
                if self.key_in_list(&target.context_kind, &target.values) {
                    return Ok(true);
                }
            }
            if self.key_in_list(DEFAULT_KIND, &segment.excluded) {
                return Ok(false);
            }
            for target in &segment.excluded_contexts {
                if self.key_in_list(&target.context_kind, &target.values) {
                    return Ok(false);
                }
            }
        }

        for rule in &segment.rules {
            if self.segment_rule_matches(segment, rule)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn segment_rule_matches(
        &mut self,
        segment: &Segment,
        rule: &SegmentRule,
    ) -> Result<bool, Malformed> {
        for clause in &rule.clauses {
            // segment rules may themselves reference other segments
            if !self.clause_matches(clause, &segment.key)? {
                return Ok(false);
            }
        }

        match rule.weight {
            None => Ok(true),
            Some(weight) => {
                let (bucket, _) = self.bucket(
                    rule.rollout_context_kind.as_deref(),
                    rule.bucket_by.as_ref(),
                    &segment.key,
                    &segment.salt,
                    None,
                )?;
                Ok(bucket < f64::from(weight) / 100_000f64)
            }
        }
    }

    fn big_segment_matches(&mut self, segment: &Segment) -> Result<bool, Malformed> {
        let reference = match segment.unbounded_segment_reference() {
            Some(reference) => reference,
            None => {
                // no generation recorded: membership cannot be queried
                self.note_big_segments_status(BigSegmentsStatus::NotConfigured);
                return self.simple_segment_matches(segment, false);
            }
        };

        let kind = segment
            .unbounded_context_kind
            .as_deref()
            .unwrap_or(DEFAULT_KIND);
        let single = match self.context.as_kind(kind) {
            Some(single) => single,
            None => return Ok(false),
        };
        let key = single.key().to_string();

        let (membership, status) = match self.membership_cache.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let looked_up = match self.big_segments {
                    Some(resolver) => resolver.query_membership(&key),
                    None => (None, BigSegmentsStatus::NotConfigured),
                };
                self.membership_cache.insert(key, looked_up.clone());
                looked_up
            }
        };
        self.note_big_segments_status(status);

        if let Some(membership) = membership {
            // an explicit boolean decides; absence falls through to rules
            if let Some(included) = membership.get(&reference) {
                return Ok(*included);
            }
        }
        self.simple_segment_matches(segment, false)
    }

    fn note_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_state = Some(match self.big_segments_state {
            Some(previous) => previous.worst(status),
            None => status,
        });
    }

    // -- variation selection ------------------------------------------------

    /// Resolve a variation-or-rollout to (index, in_experiment).
    /// `Ok(None)` means the field was left undefined.
    fn resolve(
        &mut self,
        vr: &VariationOrRollout,
        flag: &Flag,
    ) -> Result<Option<(usize, bool)>, Malformed> {
        match vr {
            VariationOrRollout::Variation { variation } => Ok(Some((*variation, false))),
            VariationOrRollout::Rollout { rollout } => {
                self.resolve_rollout(rollout, flag).map(Some)
            }
            VariationOrRollout::Malformed(_) => Ok(None),
        }
    }

    fn resolve_rollout(
        &mut self,
        rollout: &Rollout,
        flag: &Flag,
    ) -> Result<(usize, bool), Malformed> {
        if rollout.variations.is_empty() {
            return Err(Malformed(format!(
                "rollout in flag {:?} has no variations",
                flag.key
            )));
        }

        let is_experiment = rollout.kind == RolloutKind::Experiment;
        // experiments always bucket by key
        let bucket_by = if is_experiment {
            None
        } else {
            rollout.bucket_by.as_ref()
        };
        let (bucket, context_found) = self.bucket(
            rollout.context_kind.as_deref(),
            bucket_by,
            &flag.key,
            &flag.salt,
            rollout.seed,
        )?;

        let mut sum = 0f64;
        for weighted in &rollout.variations {
            sum += f64::from(weighted.weight) / 100_000f64;
            if bucket < sum {
                let in_experiment = is_experiment && context_found && !weighted.untracked;
                return Ok((weighted.variation, in_experiment));
            }
        }
        // weights summed short of the bucket: the last variation wins
        let last = rollout.variations.last().unwrap();
        let in_experiment = is_experiment && context_found && !last.untracked;
        Ok((last.variation, in_experiment))
    }

    /// Deterministic bucket in [0, 1). The second element reports
    /// whether a context of the requested kind was present.
    fn bucket(
        &self,
        kind: Option<&str>,
        bucket_by: Option<&Reference>,
        key: &str,
        salt: &str,
        seed: Option<i64>,
    ) -> Result<(f64, bool), Malformed> {
        let kind = kind.unwrap_or(DEFAULT_KIND);
        let single = match self.context.as_kind(kind) {
            Some(single) => single,
            None => return Ok((0.0, false)),
        };

        let attr_value = match bucket_by {
            None => Some(Value::String(single.key().to_string())),
            Some(reference) => {
                if !reference.is_valid() {
                    return Err(Malformed(format!(
                        "invalid bucket-by attribute reference {:?}",
                        reference.raw()
                    )));
                }
                single.get_value(reference)
            }
        };

        let hash_key = match attr_value {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            _ => return Ok((0.0, true)),
        };

        let hash_input = match seed {
            Some(seed) => format!("{}.{}", seed, hash_key),
            None => format!("{}.{}.{}", key, salt, hash_key),
        };
        Ok((bucket_of(&hash_input), true))
    }

    fn off_result(
        &self,
        flag: &Flag,
        reason: Reason,
    ) -> Result<EvaluationDetail<Value>, Malformed> {
        match flag.off_variation {
            Some(index) => self.variation_result(flag, index, reason),
            None => Ok(EvaluationDetail {
                value: None,
                variation_index: None,
                reason,
            }),
        }
    }

    fn variation_result(
        &self,
        flag: &Flag,
        index: usize,
        reason: Reason,
    ) -> Result<EvaluationDetail<Value>, Malformed> {
        let value = flag.variation(index).ok_or_else(|| {
            Malformed(format!(
                "variation index {} out of range in flag {:?}",
                index, flag.key
            ))
        })?;
        Ok(EvaluationDetail {
            value: Some(value.clone()),
            variation_index: Some(index),
            reason,
        })
    }
}

/// SHA-1 of the input, first 15 hex digits scaled into [0, 1).
fn bucket_of(hash_input: &str) -> f64 {
    let hash = &Sha1::new().chain(hash_input).finalize()[..];
    let mut hex: String = hash.encode_hex();
    hex.truncate(15);
    // 15 hex digits always fit in a u64
    let value = u64::from_str_radix(&hex, 16).unwrap() as f64;
    value / BUCKET_DIVIDER
}

fn clause_match_value(clause: &Clause, context_value: &Value) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| operators::apply(clause.op, context_value, clause_value))
}

fn maybe_negate(clause: &Clause, matched: bool) -> bool {
    if clause.negate {
        !matched
    } else {
        matched
    }
}
