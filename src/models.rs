//! Parsed flag and segment models.
//!
//! Wire JSON is normalized into these types on ingest; everything past
//! the protocol codecs (evaluation, dependency extraction, stores) only
//! ever sees the parsed form.

use crate::context::Reference;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named decision point with variations, targeting and rollout rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default)]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub context_targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<i64>,
    #[serde(default)]
    pub exclude_from_summaries: bool,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
}

impl Flag {
    /// Variation value at `index`, if in range.
    pub fn variation(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// Individual targeting entry: context keys mapped to one variation.
///
/// Legacy `targets` entries carry no kind and apply to the default
/// (`user`) kind; `contextTargets` entries name theirs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
    #[serde(default = "default_kind", skip_serializing_if = "is_default_kind")]
    pub context_kind: String,
}

fn default_kind() -> String {
    crate::context::DEFAULT_KIND.to_string()
}

fn is_default_kind(kind: &str) -> bool {
    kind == crate::context::DEFAULT_KIND
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default = "default_kind", skip_serializing_if = "is_default_kind")]
    pub context_kind: String,
    #[serde(default)]
    pub attribute: Reference,
    pub op: Op,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operators.
///
/// Unrecognized operator tags deserialize to [Op::Unknown], which matches
/// nothing but never aborts rule iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
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
    Unknown,
}

impl Op {
    fn tag(&self) -> &'static str {
        match self {
            Op::In => "in",
            Op::StartsWith => "startsWith",
            Op::EndsWith => "endsWith",
            Op::Contains => "contains",
            Op::Matches => "matches",
            Op::LessThan => "lessThan",
            Op::LessThanOrEqual => "lessThanOrEqual",
            Op::GreaterThan => "greaterThan",
            Op::GreaterThanOrEqual => "greaterThanOrEqual",
            Op::Before => "before",
            Op::After => "after",
            Op::SemVerEqual => "semVerEqual",
            Op::SemVerLessThan => "semVerLessThan",
            Op::SemVerGreaterThan => "semVerGreaterThan",
            Op::SegmentMatch => "segmentMatch",
            Op::Unknown => "unknown",
        }
    }
}

impl Serialize for Op {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "in" => Op::In,
            "startsWith" => Op::StartsWith,
            "endsWith" => Op::EndsWith,
            "contains" => Op::Contains,
            "matches" => Op::Matches,
            "lessThan" => Op::LessThan,
            "lessThanOrEqual" => Op::LessThanOrEqual,
            "greaterThan" => Op::GreaterThan,
            "greaterThanOrEqual" => Op::GreaterThanOrEqual,
            "before" => Op::Before,
            "after" => Op::After,
            "semVerEqual" => Op::SemVerEqual,
            "semVerLessThan" => Op::SemVerLessThan,
            "semVerGreaterThan" => Op::SemVerGreaterThan,
            "segmentMatch" => Op::SegmentMatch,
            _ => Op::Unknown,
        })
    }
}

/// Either a fixed variation index or a weighted rollout.
///
/// The `Malformed` arm captures anything that is neither, so a bad
/// fallthrough surfaces as a malformed-flag evaluation error rather than
/// a parse failure for the whole payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum VariationOrRollout {
    Variation { variation: usize },
    Rollout { rollout: Rollout },
    Malformed(Value),
}

impl Default for VariationOrRollout {
    fn default() -> Self {
        VariationOrRollout::Malformed(Value::Null)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    Rollout,
    Experiment,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

/// One slice of a rollout: weights are in units of 0.001%.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: u32,
    #[serde(default)]
    pub untracked: bool,
}

/// A named group of contexts.
///
/// Simple segments store their membership locally; big segments
/// (`unbounded`) only carry a generation and delegate membership to an
/// external store.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded_context_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

impl Segment {
    /// Key under which a big-segment membership is stored externally.
    pub fn unbounded_segment_reference(&self) -> Option<String> {
        self.generation.map(|g| format!("{}.g{}", self.key, g))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default = "default_kind", skip_serializing_if = "is_default_kind")]
    pub context_kind: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_context_kind: Option<String>,
}
