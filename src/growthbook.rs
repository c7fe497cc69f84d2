use std::sync::Arc;

use derive_builder::Builder;
use serde_json::{json, Value};

use crate::condition::eval_condition;
use crate::model::{
    BucketRange, Context, Experiment, ExperimentResult, FeatureMap, FeatureResult, FeatureRule,
    Filter, ParentCondition, Source,
};
use crate::repository::FeatureRepository;
use crate::util;
use crate::util::{choose_variation, in_range};

// should match Cargo.toml
pub const SDK_VERSION: &str = "0.1.0";

/// Outcome of a rule's parent-condition walk. Cycles and unmet gates abort
/// the whole feature evaluation; an unmet non-gating parent only skips the
/// rule at hand.
enum ParentOutcome {
    Pass,
    Skip,
    Cycle,
    Gated,
}

/// The evaluation façade: a user [`Context`] plus an optional feature
/// repository. With a repository attached, every evaluation works on the
/// repository's latest immutable snapshot; otherwise the context's embedded
/// feature map is used.
#[derive(Builder, Debug, Default)]
#[builder(default)]
pub struct GrowthBook {
    pub context: Context,
    pub repository: Option<Arc<FeatureRepository>>,
}

impl GrowthBook {
    fn get_feature_result(
        &self,
        value: Value,
        source: Source,
        experiment: Option<Experiment>,
        experiment_result: Option<ExperimentResult>,
    ) -> FeatureResult {
        let on = !value.is_null()
            && !(value.is_boolean() && !value.as_bool().unwrap_or(false))
            && !(value.is_string() && value.as_str().unwrap_or("").is_empty())
            && !(value.is_i64() && value.as_i64().unwrap_or(0) == 0)
            && !(value.is_f64() && value.as_f64().unwrap_or(0.0) == 0.0);
        let off = !on;

        FeatureResult {
            value,
            on,
            off,
            source,
            experiment,
            experiment_result,
        }
    }

    fn attribute_as_string(&self, attribute: &str) -> String {
        match self.context.attributes.get(attribute) {
            Some(Value::String(s)) => s.clone(),
            Some(value) => value.as_i64().map(|n| n.to_string()).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Resolves the bucketing identifier: the hash attribute's value, or the
    /// fallback attribute's when the primary one is empty. Returns the
    /// attribute actually used alongside its value.
    fn get_hash_value(
        &self,
        hash_attribute: Option<&str>,
        fallback_attribute: Option<&str>,
    ) -> (String, String) {
        let attribute = hash_attribute.unwrap_or("id");
        let value = self.attribute_as_string(attribute);
        if value.is_empty() {
            if let Some(fallback) = fallback_attribute {
                let fallback_value = self.attribute_as_string(fallback);
                if !fallback_value.is_empty() {
                    return (fallback.to_string(), fallback_value);
                }
            }
        }
        (attribute.to_string(), value)
    }

    /// A rule or experiment is filtered out when any one filter excludes the
    /// user: an empty attribute value, or a hash outside every range.
    fn is_filtered_out(&self, filters: &[Filter]) -> bool {
        for filter in filters {
            let hash_value = self.attribute_as_string(&filter.attribute);
            if hash_value.is_empty() {
                return true;
            }

            if let Some(n) = util::hash(&filter.seed, &hash_value, filter.hash_version) {
                if !filter.ranges.iter().any(|filter_range| in_range(n, filter_range)) {
                    return true;
                }
            }
        }

        false
    }

    fn is_included_in_rollout(
        &self,
        seed: &str,
        hash_attribute: Option<&str>,
        range: Option<&BucketRange>,
        coverage: Option<f32>,
        hash_version: Option<i32>,
    ) -> bool {
        if range.is_none() && coverage.is_none() {
            return true;
        }

        let hash_value = self.attribute_as_string(hash_attribute.unwrap_or("id"));
        if hash_value.is_empty() {
            return false;
        }

        match util::hash(seed, &hash_value, hash_version.unwrap_or(1)) {
            Some(n) => {
                if let Some(range) = range {
                    in_range(n, range)
                } else if let Some(coverage) = coverage {
                    n <= coverage
                } else {
                    true
                }
            }
            None => false,
        }
    }

    fn get_experiment_result(
        &self,
        experiment: &Experiment,
        variation_index: Option<i32>,
        hash_used: bool,
        feature_id: Option<&str>,
        bucket: Option<f32>,
    ) -> ExperimentResult {
        let mut in_experiment = true;
        let mut variation_index = variation_index.unwrap_or(-1);
        if variation_index < 0 || variation_index >= experiment.variations.len() as i32 {
            variation_index = 0;
            in_experiment = false;
        }

        let (hash_attribute, hash_value) = self.get_hash_value(
            experiment.hash_attribute.as_deref(),
            experiment.fallback_attribute.as_deref(),
        );

        let meta = experiment.meta.get(variation_index as usize);
        ExperimentResult {
            in_experiment,
            variation_id: variation_index,
            value: experiment
                .variations
                .get(variation_index as usize)
                .cloned()
                .unwrap_or(Value::Null),
            hash_used,
            hash_attribute,
            hash_value,
            feature_id: feature_id.map(|f| f.to_owned()),
            key: meta
                .and_then(|m| m.key.clone())
                .unwrap_or_else(|| variation_index.to_string()),
            bucket: bucket.unwrap_or(0.0),
            name: meta.and_then(|m| m.name.clone()),
            passthrough: meta.map(|m| m.passthrough).unwrap_or(false),
            sticky_bucket_used: false,
        }
    }

    fn experiment_from_rule(&self, rule: &FeatureRule, feature_key: &str) -> Experiment {
        Experiment {
            key: rule.key.clone().unwrap_or_else(|| feature_key.to_string()),
            variations: rule.variations.clone(),
            weights: rule.weights.clone(),
            coverage: rule.coverage,
            ranges: rule.ranges.clone(),
            namespace: rule.namespace.clone(),
            meta: rule.meta.clone(),
            filters: rule.filters.clone(),
            seed: rule.seed.clone(),
            name: rule.name.clone(),
            phase: rule.phase.clone(),
            hash_attribute: rule.hash_attribute.clone(),
            fallback_attribute: rule.fallback_attribute.clone(),
            hash_version: rule.hash_version,
            disable_sticky_bucketing: rule.disable_sticky_bucketing,
            bucket_version: rule.bucket_version,
            min_bucket_version: rule.min_bucket_version,
            ..Default::default()
        }
    }

    /// Walks a rule's parent conditions. `path` is the chain of feature ids
    /// currently under evaluation, newest first; a parent already on the
    /// chain is a cycle.
    fn eval_parent_conditions(
        &self,
        features: &FeatureMap,
        parent_conditions: &[ParentCondition],
        path: &[String],
    ) -> ParentOutcome {
        for parent in parent_conditions {
            if path.iter().any(|id| id == &parent.id) {
                return ParentOutcome::Cycle;
            }
            let parent_result = self.eval_feature_with_path(features, &parent.id, path);
            if parent_result.source == Source::CyclicPrerequisite {
                return ParentOutcome::Cycle;
            }
            let parent_value = json!({ "value": parent_result.value });
            if !eval_condition(&parent_value, &parent.condition) {
                if parent.gate {
                    return ParentOutcome::Gated;
                }
                return ParentOutcome::Skip;
            }
        }
        ParentOutcome::Pass
    }

    /// Evaluates a feature against the context. Never fails; unknown
    /// features, prerequisite cycles and unmet gates are encoded in the
    /// result's `source`.
    pub fn eval_feature(&self, key: &str) -> FeatureResult {
        let snapshot = self.repository.as_ref().map(|repo| repo.get_features());
        let features = snapshot.as_deref().unwrap_or(&self.context.features);
        self.eval_feature_with_path(features, key, &[])
    }

    fn eval_feature_with_path(
        &self,
        features: &FeatureMap,
        key: &str,
        path: &[String],
    ) -> FeatureResult {
        let feature = match features.get(key) {
            Some(feature) => feature,
            None => return self.get_feature_result(Value::Null, Source::UnknownFeature, None, None),
        };

        for rule in feature.rules.iter() {
            if !rule.parent_conditions.is_empty() {
                let mut chain = Vec::with_capacity(path.len() + 1);
                chain.push(key.to_string());
                chain.extend_from_slice(path);
                match self.eval_parent_conditions(features, &rule.parent_conditions, &chain) {
                    ParentOutcome::Pass => {}
                    ParentOutcome::Skip => continue,
                    ParentOutcome::Cycle => {
                        return self.get_feature_result(
                            Value::Null,
                            Source::CyclicPrerequisite,
                            None,
                            None,
                        )
                    }
                    ParentOutcome::Gated => {
                        return self.get_feature_result(Value::Null, Source::Prerequisite, None, None)
                    }
                }
            }

            if self.is_filtered_out(&rule.filters) {
                continue;
            }

            if let Some(condition) = &rule.condition {
                if !eval_condition(&self.context.attributes, condition) {
                    continue;
                }
            }

            if let Some(force) = &rule.force {
                let seed = rule.seed.as_deref().unwrap_or(key);
                if !self.is_included_in_rollout(
                    seed,
                    rule.hash_attribute.as_deref(),
                    rule.range.as_ref(),
                    rule.coverage,
                    rule.hash_version,
                ) {
                    continue;
                }
                return self.get_feature_result(force.clone(), Source::Force, None, None);
            }

            let experiment = self.experiment_from_rule(rule, key);
            let result = self.run_with_path(features, &experiment, Some(key), path);

            if !result.in_experiment || result.passthrough {
                continue;
            }

            return self.get_feature_result(
                result.value.clone(),
                Source::Experiment,
                Some(experiment),
                Some(result),
            );
        }

        self.get_feature_result(feature.default_value.clone(), Source::DefaultValue, None, None)
    }

    /// Runs an experiment against the context.
    pub fn run(&self, experiment: &Experiment) -> ExperimentResult {
        let snapshot = self.repository.as_ref().map(|repo| repo.get_features());
        let features = snapshot.as_deref().unwrap_or(&self.context.features);
        self.run_with_path(features, experiment, None, &[])
    }

    fn run_with_path(
        &self,
        features: &FeatureMap,
        experiment: &Experiment,
        id: Option<&str>,
        path: &[String],
    ) -> ExperimentResult {
        if experiment.variations.len() < 2 || !self.context.enabled {
            return self.get_experiment_result(experiment, None, false, id, None);
        }

        if !self.context.url.is_empty() {
            let qs_override = util::get_query_string_override(
                &experiment.key,
                &self.context.url,
                experiment.variations.len() as i32,
            );
            if let Some(qs) = qs_override {
                return self.get_experiment_result(experiment, Some(qs), false, id, None);
            }
        }

        if let Some(forced) = self.context.forced_variations.get(&experiment.key) {
            return self.get_experiment_result(experiment, Some(*forced), false, id, None);
        }

        if !experiment.active {
            return self.get_experiment_result(experiment, None, false, id, None);
        }

        let (_, hash_value) = self.get_hash_value(
            experiment.hash_attribute.as_deref(),
            experiment.fallback_attribute.as_deref(),
        );
        if hash_value.is_empty() {
            return self.get_experiment_result(experiment, None, false, id, None);
        }

        if !experiment.filters.is_empty() {
            if self.is_filtered_out(&experiment.filters) {
                return self.get_experiment_result(experiment, None, false, id, None);
            }
        } else if let Some(namespace) = &experiment.namespace {
            if !namespace.id.is_empty() && !util::in_namespace(&hash_value, namespace) {
                return self.get_experiment_result(experiment, None, false, id, None);
            }
        }

        if let Some(condition) = &experiment.condition {
            if !eval_condition(&self.context.attributes, condition) {
                return self.get_experiment_result(experiment, None, false, id, None);
            }
        }

        if !experiment.parent_conditions.is_empty() {
            let mut chain = Vec::with_capacity(path.len() + 1);
            if let Some(id) = id {
                chain.push(id.to_string());
            }
            chain.extend_from_slice(path);
            match self.eval_parent_conditions(features, &experiment.parent_conditions, &chain) {
                ParentOutcome::Pass => {}
                _ => return self.get_experiment_result(experiment, None, false, id, None),
            }
        }

        let ranges = if !experiment.ranges.is_empty() {
            experiment.ranges.clone()
        } else {
            util::get_bucket_ranges(
                experiment.variations.len() as i32,
                experiment.coverage.unwrap_or(1.0f32),
                Some(experiment.weights.clone()),
            )
        };

        let seed = experiment.seed.as_deref().unwrap_or(&experiment.key);
        let n = match util::hash(seed, &hash_value, experiment.hash_version.unwrap_or(1)) {
            Some(n) => n,
            None => return self.get_experiment_result(experiment, None, false, id, None),
        };
        let assigned = choose_variation(n, &ranges);

        if assigned == -1 {
            return self.get_experiment_result(experiment, None, false, id, None);
        }

        if experiment.force.is_some() {
            return self.get_experiment_result(experiment, experiment.force, false, id, None);
        }

        if self.context.qa_mode {
            return self.get_experiment_result(experiment, None, false, id, None);
        }

        self.get_experiment_result(experiment, Some(assigned), true, id, Some(n))
    }

    pub fn is_on(&self, key: &str) -> bool {
        self.eval_feature(key).on
    }

    pub fn is_off(&self, key: &str) -> bool {
        self.eval_feature(key).off
    }

    pub fn get_feature_value(&self, key: &str, fallback: &Value) -> Value {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            return fallback.clone();
        }
        value
    }

    pub fn get_feature_value_as_str(&self, key: &str, fallback: &str) -> String {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            return fallback.to_string();
        }
        value.as_str().unwrap_or("").to_string()
    }

    pub fn get_feature_value_as_int(&self, key: &str, fallback: i64) -> i64 {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            return fallback;
        }
        value.as_i64().unwrap_or(fallback)
    }

    pub fn get_feature_value_as_bool(&self, key: &str, fallback: bool) -> bool {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            return fallback;
        }
        value.as_bool().unwrap_or(fallback)
    }

    pub fn get_feature_value_as_float(&self, key: &str, fallback: f64) -> f64 {
        let value = self.eval_feature(key).value;
        if value.is_null() {
            return fallback;
        }
        value.as_f64().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_value, json};

    use super::*;
    use crate::model::{ContextBuilder, ExperimentBuilder, ForcedVariationsMap};

    fn features(value: Value) -> FeatureMap {
        from_value(value).expect("failed to parse features")
    }

    fn growthbook(attributes: Value, feature_map: FeatureMap) -> GrowthBook {
        let context = ContextBuilder::default()
            .attributes(attributes)
            .features(feature_map)
            .build()
            .expect("failed to build context");
        GrowthBookBuilder::default()
            .context(context)
            .build()
            .expect("failed to build GrowthBook")
    }

    #[test]
    fn test_unknown_feature() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());
        let result = gb.eval_feature("missing");
        assert_eq!(result.value, Value::Null);
        assert_eq!(result.source, Source::UnknownFeature);
        assert!(!result.on);
        assert!(result.off);
    }

    #[test]
    fn test_default_value_only() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({"answer": {"defaultValue": 42}})),
        );
        let result = gb.eval_feature("answer");
        assert_eq!(result.value, json!(42));
        assert_eq!(result.source, Source::DefaultValue);
        assert!(result.on);
        assert!(result.experiment.is_none());
        assert!(result.experiment_result.is_none());
    }

    #[test]
    fn test_feature_result_truthiness() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "zero": {"defaultValue": 0},
                "empty-string": {"defaultValue": ""},
                "false": {"defaultValue": false},
                "null": {"defaultValue": null},
                "string": {"defaultValue": "on"}
            })),
        );
        for key in ["zero", "empty-string", "false", "null"] {
            assert!(gb.eval_feature(key).off, "{} should be off", key);
        }
        assert!(gb.eval_feature("string").on);
    }

    #[test]
    fn test_forced_by_condition() {
        let map = features(json!({
            "banner": {
                "defaultValue": false,
                "rules": [{"condition": {"browser": "chrome"}, "force": true}]
            }
        }));

        let gb = growthbook(json!({"id": "u", "browser": "chrome"}), map.clone());
        let result = gb.eval_feature("banner");
        assert_eq!(result.value, json!(true));
        assert_eq!(result.source, Source::Force);

        let gb = growthbook(json!({"id": "u", "browser": "safari"}), map);
        let result = gb.eval_feature("banner");
        assert_eq!(result.value, json!(false));
        assert_eq!(result.source, Source::DefaultValue);
    }

    #[test]
    fn test_experiment_rule_matches_bucketing_math() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "exp-feature": {
                    "defaultValue": "x",
                    "rules": [{"variations": ["a", "b"]}]
                }
            })),
        );
        let result = gb.eval_feature("exp-feature");
        assert_eq!(result.source, Source::Experiment);

        let n = util::hash("exp-feature", "u1", 1).unwrap();
        let expected = util::choose_variation(n, &util::get_bucket_ranges(2, 1.0, None));
        let exp_result = result.experiment_result.unwrap();
        assert_eq!(exp_result.variation_id, expected);
        assert_eq!(result.value, json!(["a", "b"][expected as usize]));
        assert!(exp_result.in_experiment);
        assert!(exp_result.hash_used);
        assert_eq!(exp_result.bucket, n);
        assert_eq!(exp_result.hash_attribute, "id");
        assert_eq!(exp_result.hash_value, "u1");
        assert_eq!(exp_result.feature_id.as_deref(), Some("exp-feature"));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "exp-feature": {"rules": [{"variations": ["a", "b"]}]}
            })),
        );
        assert_eq!(gb.eval_feature("exp-feature"), gb.eval_feature("exp-feature"));
    }

    #[test]
    fn test_weighted_variations_are_deterministic() {
        let exp_zero = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .weights(vec![1.0, 0.0])
            .build()
            .unwrap();
        let exp_one = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .weights(vec![0.0, 1.0])
            .build()
            .unwrap();

        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());
        let result = gb.run(&exp_zero);
        assert!(result.in_experiment);
        assert_eq!(result.variation_id, 0);
        let result = gb.run(&exp_one);
        assert!(result.in_experiment);
        assert_eq!(result.variation_id, 1);
    }

    #[test]
    fn test_experiment_requires_two_variations_and_enabled_context() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());
        let single = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("only")])
            .build()
            .unwrap();
        let result = gb.run(&single);
        assert!(!result.in_experiment);
        assert!(!result.hash_used);
        assert_eq!(result.variation_id, 0);
        assert_eq!(result.value, json!("only"));

        let context = ContextBuilder::default()
            .attributes(json!({"id": "u1"}))
            .enabled(false)
            .build()
            .unwrap();
        let gb = GrowthBookBuilder::default().context(context).build().unwrap();
        let pair = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .build()
            .unwrap();
        assert!(!gb.run(&pair).in_experiment);
    }

    #[test]
    fn test_query_string_override() {
        let context = ContextBuilder::default()
            .attributes(json!({"id": "u1"}))
            .url("http://example.com/?exp=1".to_string())
            .build()
            .unwrap();
        let gb = GrowthBookBuilder::default().context(context).build().unwrap();
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .build()
            .unwrap();

        let result = gb.run(&exp);
        assert!(result.in_experiment);
        assert!(!result.hash_used);
        assert_eq!(result.variation_id, 1);
        assert_eq!(result.value, json!("b"));
    }

    #[test]
    fn test_forced_variation_in_context() {
        let mut forced = ForcedVariationsMap::default();
        forced.insert("exp".to_string(), 1);
        let context = ContextBuilder::default()
            .attributes(json!({"id": "u1"}))
            .forced_variations(forced)
            .build()
            .unwrap();
        let gb = GrowthBookBuilder::default().context(context).build().unwrap();
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .build()
            .unwrap();

        let result = gb.run(&exp);
        assert!(result.in_experiment);
        assert!(!result.hash_used);
        assert_eq!(result.variation_id, 1);
    }

    #[test]
    fn test_inactive_experiment() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .active(false)
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn test_missing_hash_attribute_and_fallback() {
        let gb = growthbook(json!({"deviceId": "d1"}), FeatureMap::default());

        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);

        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .fallback_attribute(Some("deviceId".to_string()))
            .build()
            .unwrap();
        let result = gb.run(&exp);
        assert!(result.in_experiment);
        assert_eq!(result.hash_attribute, "deviceId");
        assert_eq!(result.hash_value, "d1");
    }

    #[test]
    fn test_numeric_hash_attribute_is_stringified() {
        let gb = growthbook(json!({"id": 123}), FeatureMap::default());
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .build()
            .unwrap();
        let result = gb.run(&exp);
        assert!(result.in_experiment);
        assert_eq!(result.hash_value, "123");
    }

    #[test]
    fn test_namespace_exclusion() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());

        let excluded = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .namespace(Some(("ns".to_string(), 0.0, 0.0).into()))
            .build()
            .unwrap();
        assert!(!gb.run(&excluded).in_experiment);

        let included = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .namespace(Some(("ns".to_string(), 0.0, 1.0).into()))
            .build()
            .unwrap();
        assert!(gb.run(&included).in_experiment);
    }

    #[test]
    fn test_experiment_condition_gates_assignment() {
        let gb = growthbook(json!({"id": "u1", "plan": "free"}), FeatureMap::default());
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .condition(Some(json!({"plan": "pro"})))
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn test_experiment_filters() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());

        // a filter covering the whole unit interval excludes nobody
        let all: Filter =
            from_value(json!({"seed": "s", "ranges": [[0.0, 1.0]]})).unwrap();
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .filters(vec![all])
            .build()
            .unwrap();
        assert!(gb.run(&exp).in_experiment);

        // empty ranges exclude everybody
        let none: Filter = from_value(json!({"seed": "s", "ranges": []})).unwrap();
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .filters(vec![none.clone()])
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);

        // missing filter attribute excludes as well
        let missing_attr: Filter =
            from_value(json!({"seed": "s", "ranges": [[0.0, 1.0]], "attribute": "company"}))
                .unwrap();
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .filters(vec![missing_attr])
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn test_experiment_forced_index() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .force(Some(1))
            .build()
            .unwrap();
        let result = gb.run(&exp);
        assert!(result.in_experiment);
        assert!(!result.hash_used);
        assert_eq!(result.variation_id, 1);
    }

    #[test]
    fn test_qa_mode_disables_assignment() {
        let context = ContextBuilder::default()
            .attributes(json!({"id": "u1"}))
            .qa_mode(true)
            .build()
            .unwrap();
        let gb = GrowthBookBuilder::default().context(context).build().unwrap();
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .build()
            .unwrap();
        let result = gb.run(&exp);
        assert!(!result.in_experiment);
        assert!(!result.hash_used);
    }

    #[test]
    fn test_zero_coverage_skips_assignment() {
        let gb = growthbook(json!({"id": "u1"}), FeatureMap::default());
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .coverage(Some(0.0))
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn test_variation_meta_keys_and_names() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "exp-feature": {
                    "rules": [{
                        "variations": ["a", "b"],
                        "weights": [1.0, 0.0],
                        "meta": [
                            {"key": "control", "name": "Control"},
                            {"key": "treatment", "name": "Treatment"}
                        ]
                    }]
                }
            })),
        );
        let result = gb.eval_feature("exp-feature").experiment_result.unwrap();
        assert_eq!(result.variation_id, 0);
        assert_eq!(result.key, "control");
        assert_eq!(result.name.as_deref(), Some("Control"));

        // without meta the key falls back to the stringified index
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "exp-feature": {
                    "rules": [{"variations": ["a", "b"], "weights": [1.0, 0.0]}]
                }
            })),
        );
        let result = gb.eval_feature("exp-feature").experiment_result.unwrap();
        assert_eq!(result.key, "0");
    }

    #[test]
    fn test_passthrough_variation_falls_through() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "exp-feature": {
                    "defaultValue": "default",
                    "rules": [{
                        "variations": ["a", "b"],
                        "weights": [1.0, 0.0],
                        "meta": [{"passthrough": true}, {}]
                    }]
                }
            })),
        );
        let result = gb.eval_feature("exp-feature");
        assert_eq!(result.source, Source::DefaultValue);
        assert_eq!(result.value, json!("default"));
    }

    #[test]
    fn test_rule_rollout_coverage() {
        // no range and no coverage: everyone is included
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "flag": {"defaultValue": false, "rules": [{"force": true}]}
            })),
        );
        assert_eq!(gb.eval_feature("flag").source, Source::Force);

        // an empty range excludes everyone
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "flag": {
                    "defaultValue": false,
                    "rules": [{"force": true, "range": [0.0, 0.0]}]
                }
            })),
        );
        assert_eq!(gb.eval_feature("flag").source, Source::DefaultValue);

        // full coverage includes everyone with a hashable attribute
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "flag": {
                    "defaultValue": false,
                    "rules": [{"force": true, "coverage": 1.0}]
                }
            })),
        );
        assert_eq!(gb.eval_feature("flag").source, Source::Force);

        // missing hash attribute keeps the user out of the rollout
        let gb = growthbook(
            json!({}),
            features(json!({
                "flag": {
                    "defaultValue": false,
                    "rules": [{"force": true, "coverage": 1.0}]
                }
            })),
        );
        assert_eq!(gb.eval_feature("flag").source, Source::DefaultValue);
    }

    #[test]
    fn test_rule_filter_skips_rule() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "flag": {
                    "defaultValue": false,
                    "rules": [{"force": true, "filters": [{"seed": "s", "ranges": []}]}]
                }
            })),
        );
        assert_eq!(gb.eval_feature("flag").source, Source::DefaultValue);
    }

    #[test]
    fn test_prerequisite_gating() {
        let map = features(json!({
            "parent": {"defaultValue": false},
            "gated-child": {
                "defaultValue": "off",
                "rules": [{
                    "parentConditions": [{"id": "parent", "condition": {"value": true}, "gate": true}],
                    "force": "on"
                }]
            },
            "soft-child": {
                "defaultValue": "off",
                "rules": [{
                    "parentConditions": [{"id": "parent", "condition": {"value": true}}],
                    "force": "on"
                }]
            }
        }));
        let gb = growthbook(json!({"id": "u1"}), map);

        // unmet gate blocks the whole feature
        let result = gb.eval_feature("gated-child");
        assert_eq!(result.source, Source::Prerequisite);
        assert_eq!(result.value, Value::Null);

        // unmet non-gating parent only skips the rule
        let result = gb.eval_feature("soft-child");
        assert_eq!(result.source, Source::DefaultValue);
        assert_eq!(result.value, json!("off"));
    }

    #[test]
    fn test_prerequisite_met() {
        let map = features(json!({
            "parent": {"defaultValue": true},
            "child": {
                "defaultValue": "off",
                "rules": [{
                    "parentConditions": [{"id": "parent", "condition": {"value": true}}],
                    "force": "on"
                }]
            }
        }));
        let gb = growthbook(json!({"id": "u1"}), map);
        let result = gb.eval_feature("child");
        assert_eq!(result.source, Source::Force);
        assert_eq!(result.value, json!("on"));
    }

    #[test]
    fn test_prerequisite_on_parent_value() {
        // the parent condition operates on {"value": <parent value>}
        let map = features(json!({
            "limit": {"defaultValue": 25},
            "child": {
                "defaultValue": "off",
                "rules": [{
                    "parentConditions": [{"id": "limit", "condition": {"value": {"$gt": 10}}}],
                    "force": "on"
                }]
            }
        }));
        let gb = growthbook(json!({"id": "u1"}), map);
        assert_eq!(gb.eval_feature("child").source, Source::Force);
    }

    #[test]
    fn test_cyclic_prerequisites() {
        let map = features(json!({
            "a": {
                "defaultValue": true,
                "rules": [{
                    "parentConditions": [{"id": "b", "condition": {"value": true}}],
                    "force": false
                }]
            },
            "b": {
                "defaultValue": true,
                "rules": [{
                    "parentConditions": [{"id": "a", "condition": {"value": true}}],
                    "force": false
                }]
            }
        }));
        let gb = growthbook(json!({"id": "u1"}), map);

        for key in ["a", "b"] {
            let result = gb.eval_feature(key);
            assert_eq!(result.source, Source::CyclicPrerequisite, "feature {}", key);
            assert_eq!(result.value, Value::Null);
        }
    }

    #[test]
    fn test_self_referential_prerequisite() {
        let map = features(json!({
            "a": {
                "defaultValue": true,
                "rules": [{
                    "parentConditions": [{"id": "a", "condition": {"value": true}}],
                    "force": false
                }]
            }
        }));
        let gb = growthbook(json!({"id": "u1"}), map);
        assert_eq!(gb.eval_feature("a").source, Source::CyclicPrerequisite);
    }

    #[test]
    fn test_unknown_parent_feature_value_is_null() {
        // an unknown parent evaluates to null, so a null condition matches
        let map = features(json!({
            "child": {
                "defaultValue": "off",
                "rules": [{
                    "parentConditions": [{"id": "ghost", "condition": {"value": null}}],
                    "force": "on"
                }]
            }
        }));
        let gb = growthbook(json!({"id": "u1"}), map);
        assert_eq!(gb.eval_feature("child").source, Source::Force);
    }

    #[test]
    fn test_experiment_parent_conditions() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({"parent": {"defaultValue": false}})),
        );
        let exp = ExperimentBuilder::default()
            .key("exp".to_string())
            .variations(vec![json!("a"), json!("b")])
            .parent_conditions(vec![from_value(
                json!({"id": "parent", "condition": {"value": true}, "gate": true}),
            )
            .unwrap()])
            .build()
            .unwrap();
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn test_feature_value_accessors() {
        let gb = growthbook(
            json!({"id": "u1"}),
            features(json!({
                "str": {"defaultValue": "hello"},
                "int": {"defaultValue": 7},
                "bool": {"defaultValue": true},
                "float": {"defaultValue": 1.5}
            })),
        );
        assert!(gb.is_on("bool"));
        assert!(gb.is_off("missing"));
        assert_eq!(gb.get_feature_value_as_str("str", "fallback"), "hello");
        assert_eq!(gb.get_feature_value_as_str("missing", "fallback"), "fallback");
        assert_eq!(gb.get_feature_value_as_int("int", 0), 7);
        assert_eq!(gb.get_feature_value_as_bool("bool", false), true);
        assert_eq!(gb.get_feature_value_as_float("float", 0.0), 1.5);
        assert_eq!(gb.get_feature_value("missing", &json!("fb")), json!("fb"));
    }
}
