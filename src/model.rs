use std::collections::HashMap;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Attributes = Value;
pub type Condition = Value;
pub type FeatureMap = HashMap<String, Feature>;
pub type ForcedVariationsMap = HashMap<String, i32>;

fn default_true() -> bool {
    true
}

fn default_filter_hash_version() -> i32 {
    2
}

fn default_filter_attribute() -> String {
    "id".to_string()
}

/// Half-open bucket interval `[range_start, range_end)`.
///
/// The wire format is a two-element JSON array `[lo, hi]`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(from = "(f32, f32)", into = "(f32, f32)")]
pub struct BucketRange {
    pub range_start: f32,
    pub range_end: f32,
}

impl From<(f32, f32)> for BucketRange {
    fn from((range_start, range_end): (f32, f32)) -> Self {
        BucketRange {
            range_start,
            range_end,
        }
    }
}

impl From<BucketRange> for (f32, f32) {
    fn from(range: BucketRange) -> Self {
        (range.range_start, range.range_end)
    }
}

impl PartialEq for BucketRange {
    fn eq(&self, other: &Self) -> bool {
        let tolerance = 0.001f32;
        (self.range_start - other.range_start).abs() < tolerance
            && (self.range_end - other.range_end).abs() < tolerance
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct VariationMeta {
    pub key: Option<String>,
    pub name: Option<String>,
    pub passthrough: bool,
}

/// Mutually-exclusive experiment namespace: the wire format is `[id, lo, hi]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "(String, f32, f32)", into = "(String, f32, f32)")]
pub struct Namespace {
    pub id: String,
    pub range_start: f32,
    pub range_end: f32,
}

impl From<(String, f32, f32)> for Namespace {
    fn from((id, range_start, range_end): (String, f32, f32)) -> Self {
        Namespace {
            id,
            range_start,
            range_end,
        }
    }
}

impl From<Namespace> for (String, f32, f32) {
    fn from(ns: Namespace) -> Self {
        (ns.id, ns.range_start, ns.range_end)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Filter {
    #[serde(default)]
    pub seed: String,
    #[serde(default)]
    pub ranges: Vec<BucketRange>,
    #[serde(default = "default_filter_hash_version")]
    pub hash_version: i32,
    #[serde(default = "default_filter_attribute")]
    pub attribute: String,
}

/// Condition on another feature's value that gates a rule or experiment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentCondition {
    pub id: String,
    pub condition: Condition,
    #[serde(default)]
    pub gate: bool,
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[builder(default)]
#[serde(default, rename_all = "camelCase")]
pub struct Experiment {
    pub key: String,
    pub variations: Vec<Value>,
    pub weights: Vec<f32>,
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub active: bool,
    pub coverage: Option<f32>,
    pub ranges: Vec<BucketRange>,
    pub condition: Option<Condition>,
    pub parent_conditions: Vec<ParentCondition>,
    pub namespace: Option<Namespace>,
    pub force: Option<i32>,
    pub hash_attribute: Option<String>,
    pub fallback_attribute: Option<String>,
    pub hash_version: Option<i32>,
    pub meta: Vec<VariationMeta>,
    pub filters: Vec<Filter>,
    pub seed: Option<String>,
    pub name: Option<String>,
    pub phase: Option<String>,
    pub disable_sticky_bucketing: bool,
    pub bucket_version: Option<i32>,
    pub min_bucket_version: Option<i32>,
}

impl Default for Experiment {
    fn default() -> Self {
        Experiment {
            key: String::new(),
            variations: Vec::new(),
            weights: Vec::new(),
            active: true,
            coverage: None,
            ranges: Vec::new(),
            condition: None,
            parent_conditions: Vec::new(),
            namespace: None,
            force: None,
            hash_attribute: None,
            fallback_attribute: None,
            hash_version: None,
            meta: Vec::new(),
            filters: Vec::new(),
            seed: None,
            name: None,
            phase: None,
            disable_sticky_bucketing: false,
            bucket_version: None,
            min_bucket_version: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentResult {
    pub in_experiment: bool,
    pub variation_id: i32,
    pub value: Value,
    pub hash_used: bool,
    pub hash_attribute: String,
    pub hash_value: String,
    pub feature_id: Option<String>,
    pub key: String,
    pub bucket: f32,
    pub name: Option<String>,
    pub passthrough: bool,
    pub sticky_bucket_used: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureRule {
    pub condition: Option<Condition>,
    pub parent_conditions: Vec<ParentCondition>,
    pub coverage: Option<f32>,
    pub force: Option<Value>,
    pub variations: Vec<Value>,
    pub key: Option<String>,
    pub weights: Vec<f32>,
    pub namespace: Option<Namespace>,
    pub hash_attribute: Option<String>,
    pub fallback_attribute: Option<String>,
    pub hash_version: Option<i32>,
    pub range: Option<BucketRange>,
    pub ranges: Vec<BucketRange>,
    pub meta: Vec<VariationMeta>,
    pub filters: Vec<Filter>,
    pub seed: Option<String>,
    pub name: Option<String>,
    pub phase: Option<String>,
    pub disable_sticky_bucketing: bool,
    pub bucket_version: Option<i32>,
    pub min_bucket_version: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    UnknownFeature,
    DefaultValue,
    Force,
    Experiment,
    CyclicPrerequisite,
    Prerequisite,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureResult {
    pub value: Value,
    pub on: bool,
    pub off: bool,
    pub source: Source,
    pub experiment: Option<Experiment>,
    pub experiment_result: Option<ExperimentResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Feature {
    pub default_value: Value,
    pub rules: Vec<FeatureRule>,
}

/// Per-evaluation user context: attributes plus evaluation switches.
///
/// Immutable during evaluation. Features come either from the embedded map
/// or, when the client is wired to a repository, from its latest snapshot.
#[derive(Builder, Deserialize, Debug, Clone)]
#[builder(default)]
#[serde(default, rename_all = "camelCase")]
pub struct Context {
    pub attributes: Attributes,
    pub features: FeatureMap,
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    pub qa_mode: bool,
    pub forced_variations: ForcedVariationsMap,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            attributes: Value::Null,
            features: FeatureMap::default(),
            enabled: true,
            url: String::new(),
            qa_mode: false,
            forced_variations: ForcedVariationsMap::default(),
        }
    }
}
