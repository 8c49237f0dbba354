//! Evaluation results and the reasons behind them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result of evaluating a flag: the chosen value, its index into the
/// flag's variation list, and why it was chosen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail<T> {
    /// `None` when evaluation failed and no off variation applied; the
    /// caller substitutes its default.
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl<T> EvaluationDetail<T> {
    pub fn err(kind: ErrorKind) -> Self {
        Self {
            value: None,
            variation_index: None,
            reason: Reason::error(kind),
        }
    }

    /// Convert the carried value, turning a failed conversion into a
    /// `WRONG_TYPE` error detail.
    pub fn try_map<U>(
        self,
        convert: impl FnOnce(T) -> Option<U>,
        default: U,
    ) -> EvaluationDetail<U> {
        match self.value {
            None => EvaluationDetail {
                value: Some(default),
                variation_index: self.variation_index,
                reason: self.reason,
            },
            Some(value) => match convert(value) {
                Some(value) => EvaluationDetail {
                    value: Some(value),
                    variation_index: self.variation_index,
                    reason: self.reason,
                },
                None => EvaluationDetail::err(ErrorKind::WrongType),
            },
        }
    }
}

/// Why an evaluation produced its value.
///
/// The `kind` discriminates; a big-segments status is stamped on whenever
/// the evaluation consulted (or should have consulted) a big-segment
/// store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    #[serde(flatten)]
    pub kind: ReasonKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub big_segments_status: Option<BigSegmentsStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonKind {
    Off,
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        rule_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

impl Reason {
    pub fn off() -> Self {
        ReasonKind::Off.into()
    }

    pub fn target_match() -> Self {
        ReasonKind::TargetMatch.into()
    }

    pub fn rule_match(rule_index: usize, rule_id: String, in_experiment: bool) -> Self {
        ReasonKind::RuleMatch {
            rule_index,
            rule_id,
            in_experiment,
        }
        .into()
    }

    pub fn prerequisite_failed(prerequisite_key: String) -> Self {
        ReasonKind::PrerequisiteFailed { prerequisite_key }.into()
    }

    pub fn fallthrough(in_experiment: bool) -> Self {
        ReasonKind::Fallthrough { in_experiment }.into()
    }

    pub fn error(error_kind: ErrorKind) -> Self {
        ReasonKind::Error { error_kind }.into()
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ReasonKind::Error { .. })
    }

    /// Whether the chosen variation came from an experiment, which makes
    /// the evaluation eligible for experiment tracking.
    pub fn in_experiment(&self) -> bool {
        match self.kind {
            ReasonKind::RuleMatch { in_experiment, .. } => in_experiment,
            ReasonKind::Fallthrough { in_experiment } => in_experiment,
            _ => false,
        }
    }
}

impl From<ReasonKind> for Reason {
    fn from(kind: ReasonKind) -> Self {
        Reason {
            kind,
            big_segments_status: None,
        }
    }
}

/// Evaluation failure classes, surfaced in reasons and never as panics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ClientNotReady,
    FlagNotFound,
    MalformedFlag,
    UserNotSpecified,
    WrongType,
    Exception,
}

/// Health of the big-segments subsystem as observed by one evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    StoreError,
    NotConfigured,
}

impl BigSegmentsStatus {
    /// Combine statuses from multiple big-segment lookups in one
    /// evaluation, keeping the least healthy.
    pub fn worst(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        use BigSegmentsStatus::*;
        let rank = |s: BigSegmentsStatus| match s {
            Healthy => 0,
            Stale => 1,
            NotConfigured => 2,
            StoreError => 3,
        };
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

/// Record of one prerequisite evaluation performed while evaluating a
/// parent flag, in declared order.
#[derive(Clone, Debug, PartialEq)]
pub struct PrerequisiteEvalRecord {
    /// Key of the prerequisite flag that was evaluated.
    pub prerequisite_key: String,
    /// Key of the flag whose prerequisite list triggered the evaluation.
    pub flag_key: String,
    pub detail: EvaluationDetail<Value>,
}
