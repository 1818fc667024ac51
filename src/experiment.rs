//! Experiment definitions: variants, traffic allocation, targeting rules, lifecycle.
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[allow(missing_docs)]
pub type Timestamp = DateTime<Utc>;

/// A versioned experiment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    /// Test identifier (`testId`). Part of the bucketing input, so it must never be renamed for a
    /// live experiment.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Lifecycle status. Only [`ExperimentStatus::Running`] accepts new assignments.
    pub status: ExperimentStatus,
    /// Variants in stable declaration order.
    pub variants: Vec<Variant>,
    /// Percentage of eligible users included in the experiment, in `[0, 100]`.
    pub traffic_allocation_percent: f64,
    /// Targeting rules; all must pass. Empty means everyone is eligible.
    #[serde(default)]
    pub targeting_rules: Vec<TargetingRule>,
    /// No assignments before this instant.
    #[serde(default)]
    pub start_at: Option<Timestamp>,
    /// No assignments after this instant.
    #[serde(default)]
    pub end_at: Option<Timestamp>,
    /// Incremented on every change to variants or weights.
    #[serde(default = "default_version")]
    pub version: u32,
    /// If `true`, users assigned under an older version are bucketed again under the current one.
    #[serde(default)]
    pub rebucket_on_version_change: bool,
    #[allow(missing_docs)]
    pub created_at: Timestamp,
    #[allow(missing_docs)]
    pub updated_at: Timestamp,
}

fn default_version() -> u32 {
    1
}

/// Experiment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    /// Return `true` if the experiment can move from `self` to `to`.
    pub fn can_transition_to(self, to: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, to),
            (Draft, Running)
                | (Draft, Archived)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Paused, Completed)
                | (Completed, Archived)
        )
    }

    /// Completed and archived experiments do not accept structural edits.
    pub fn is_read_only(self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Archived)
    }
}

/// A single arm of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    #[allow(missing_docs)]
    pub variant_id: String,
    #[allow(missing_docs)]
    pub name: String,
    /// Relative weight. Must be finite and greater than zero.
    pub weight: f64,
}

impl Variant {
    /// Create a variant whose name equals its id.
    pub fn new(variant_id: impl Into<String>, weight: f64) -> Variant {
        let variant_id = variant_id.into();
        Variant {
            name: variant_id.clone(),
            variant_id,
            weight,
        }
    }
}

/// A predicate over one request attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRule {
    #[allow(missing_docs)]
    pub attribute: String,
    #[allow(missing_docs)]
    pub operator: RuleOperator,
    #[allow(missing_docs)]
    pub value: RuleValue,
}

impl TargetingRule {
    #[allow(missing_docs)]
    pub fn new(
        attribute: impl Into<String>,
        operator: RuleOperator,
        value: impl Into<RuleValue>,
    ) -> TargetingRule {
        TargetingRule {
            attribute: attribute.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum RuleOperator {
    Equals,
    In,
    NotIn,
    MatchesRegex,
}

/// Right-hand side of a [`TargetingRule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    /// Used by `in` and `notIn`.
    Multiple(Vec<Value>),
    /// Used by `equals` and `matchesRegex`.
    Single(Value),
}

impl From<Value> for RuleValue {
    fn from(value: Value) -> Self {
        Self::Single(value)
    }
}
impl From<Vec<Value>> for RuleValue {
    fn from(value: Vec<Value>) -> Self {
        Self::Multiple(value)
    }
}

macro_rules! rule_value_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for RuleValue {
                fn from(value: $t) -> Self {
                    Self::Single(value.into())
                }
            }
            impl From<Vec<$t>> for RuleValue {
                fn from(value: Vec<$t>) -> Self {
                    Self::Multiple(value.into_iter().map(Value::from).collect())
                }
            }
        )*
    };
}

rule_value_from!(&str, String, f64, bool);

/// Scalar value in a rule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum Value {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl Value {
    /// Canonical string form used for comparisons against attributes.
    pub(crate) fn to_comparable(&self) -> String {
        match self {
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
        }
    }
}

impl Experiment {
    /// Create a `draft` experiment at version 1 with full allocation and no targeting.
    pub fn new(id: impl Into<String>, name: impl Into<String>, variants: Vec<Variant>) -> Self {
        let now = Utc::now();
        Experiment {
            id: id.into(),
            name: name.into(),
            status: ExperimentStatus::Draft,
            variants,
            traffic_allocation_percent: 100.0,
            targeting_rules: Vec::new(),
            start_at: None,
            end_at: None,
            version: 1,
            rebucket_on_version_change: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[allow(missing_docs)]
    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = status;
        self
    }

    #[allow(missing_docs)]
    pub fn with_allocation(mut self, percent: f64) -> Self {
        self.traffic_allocation_percent = percent;
        self
    }

    #[allow(missing_docs)]
    pub fn with_rules(mut self, rules: Vec<TargetingRule>) -> Self {
        self.targeting_rules = rules;
        self
    }

    #[allow(missing_docs)]
    pub fn with_schedule(mut self, start_at: Option<Timestamp>, end_at: Option<Timestamp>) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }

    #[allow(missing_docs)]
    pub fn with_rebucket_on_version_change(mut self, rebucket: bool) -> Self {
        self.rebucket_on_version_change = rebucket;
        self
    }

    /// Check structural constraints on the definition.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidExperiment("id must not be empty".into()));
        }
        if self.variants.is_empty() {
            return Err(Error::InvalidExperiment(format!(
                "experiment {:?} has no variants",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.variant_id.trim().is_empty() {
                return Err(Error::InvalidExperiment(format!(
                    "experiment {:?} has a variant with an empty id",
                    self.id
                )));
            }
            if !seen.insert(variant.variant_id.as_str()) {
                return Err(Error::InvalidExperiment(format!(
                    "duplicate variant id {:?}",
                    variant.variant_id
                )));
            }
            if !(variant.weight.is_finite() && variant.weight > 0.0) {
                return Err(Error::InvalidExperiment(format!(
                    "variant {:?} has non-positive weight {}",
                    variant.variant_id, variant.weight
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.traffic_allocation_percent) {
            return Err(Error::InvalidExperiment(format!(
                "traffic allocation {} is outside [0, 100]",
                self.traffic_allocation_percent
            )));
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if end <= start {
                return Err(Error::InvalidExperiment("endAt must be after startAt".into()));
            }
        }
        Ok(())
    }

    /// Return `true` if `now` falls inside the optional `[startAt, endAt]` window.
    pub fn is_within_schedule(&self, now: Timestamp) -> bool {
        let forbidden = matches!(self.start_at, Some(t) if now < t)
            || matches!(self.end_at, Some(t) if now > t);
        !forbidden
    }

    #[allow(missing_docs)]
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }
}
