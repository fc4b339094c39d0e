use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};
use time::Duration;

use crate::PromotionError;

/// Upper bound for every window, interval and lookback setting (ten years).
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 86_400;

/// Global safety guard thresholds, compared against prod vs. aggregate cand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardThresholds {
    pub min_required_samples: u64,
    pub success_pp_min: f64,
    pub halluc_pp_max: f64,
    pub p95_rel_max: f64,
    pub cost_rel_max: f64,
}

/// Per-candidate thresholds applied by the decision gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionThresholds {
    pub min_prod_samples: u64,
    pub min_cand_samples: u64,
    pub halluc_pp_max: f64,
    pub p95_rel_max: f64,
    pub cost_rel_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreWeights {
    pub success: f64,
    pub hallu: f64,
    pub p95: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// The last `count` decisions, however far apart.
    Consecutive,
    /// The last `count` decisions, all of which must fall inside the lookback.
    ConsecutiveWithinLookback,
}

impl ConfirmationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consecutive => "consecutive",
            Self::ConsecutiveWithinLookback => "consecutive_within_lookback",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "consecutive" => Some(Self::Consecutive),
            "consecutive_within_lookback" => Some(Self::ConsecutiveWithinLookback),
            _ => None,
        }
    }
}

impl fmt::Display for ConfirmationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationPolicy {
    pub count: usize,
    pub lookback_secs: u64,
    pub mode: ConfirmationMode,
}

impl ConfirmationPolicy {
    #[must_use]
    pub fn lookback(&self) -> Option<Duration> {
        match self.mode {
            ConfirmationMode::Consecutive => None,
            ConfirmationMode::ConsecutiveWithinLookback => Some(secs(self.lookback_secs)),
        }
    }

    /// Shortest lookback in which `count` ticks spaced `tick_interval_secs`
    /// apart can all be seen.
    fn reachable_lookback_secs(&self, tick_interval_secs: u64) -> u64 {
        u64::try_from(self.count.saturating_sub(1))
            .unwrap_or(u64::MAX)
            .saturating_mul(tick_interval_secs)
            .min(MAX_WINDOW_SECS)
    }
}

/// Immutable snapshot of every threshold and weight for one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    pub tick_interval_secs: u64,
    pub global_window_secs: u64,
    pub candidate_window_secs: u64,
    pub top_k: usize,
    pub dedupe_window_secs: u64,
    pub guard: GuardThresholds,
    pub promotion: PromotionThresholds,
    pub weights: ScoreWeights,
    pub baseline_model_id: Option<String>,
    pub confirmation: ConfirmationPolicy,
    pub require_guard_pass: bool,
}

/// A policy value that was rejected and replaced by its default.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConfigWarning {
    pub source: String,
    pub key: String,
    pub message: String,
}

// (policy key, environment variable)
const ENV_KEYS: &[(&str, &str)] = &[
    ("tick_interval_secs", "CANARY_TICK_INTERVAL_SECS"),
    ("global_window_secs", "CANARY_GLOBAL_WINDOW_SECS"),
    ("candidate_window_secs", "CANARY_CANDIDATE_WINDOW_SECS"),
    ("top_k", "CANARY_TOP_K"),
    ("dedupe_window_secs", "CANARY_DEDUPE_WINDOW_SECS"),
    ("guard.min_required_samples", "CANARY_MIN_REQUIRED_SAMPLES"),
    ("guard.success_pp_min", "CANARY_SUCCESS_PP_MIN"),
    ("guard.halluc_pp_max", "CANARY_HALLUC_PP_MAX"),
    ("guard.p95_rel_max", "CANARY_P95_REL_MAX"),
    ("guard.cost_rel_max", "CANARY_COST_REL_MAX"),
    ("promotion.min_prod_samples", "CANARY_PROMOTION_MIN_PROD_SAMPLES"),
    ("promotion.min_cand_samples", "CANARY_PROMOTION_MIN_CAND_SAMPLES"),
    ("promotion.halluc_pp_max", "CANARY_PROMOTION_HALLUC_PP_MAX"),
    ("promotion.p95_rel_max", "CANARY_PROMOTION_P95_REL_MAX"),
    ("promotion.cost_rel_max", "CANARY_PROMOTION_COST_REL_MAX"),
    ("weights.success", "CANARY_WEIGHT_SUCCESS"),
    ("weights.hallu", "CANARY_WEIGHT_HALLU"),
    ("weights.p95", "CANARY_WEIGHT_P95"),
    ("weights.cost", "CANARY_WEIGHT_COST"),
    ("baseline_model_id", "CANARY_BASELINE_MODEL_ID"),
    ("confirmation.count", "CANARY_CONFIRMATION_COUNT"),
    ("confirmation.lookback_secs", "CANARY_CONFIRMATION_LOOKBACK_SECS"),
    ("confirmation.mode", "CANARY_CONFIRMATION_MODE"),
    ("require_guard_pass", "CANARY_REQUIRE_GUARD_PASS"),
];

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            global_window_secs: 86_400,
            candidate_window_secs: 3_600,
            top_k: 5,
            dedupe_window_secs: 30,
            guard: GuardThresholds {
                min_required_samples: 200,
                success_pp_min: -0.5,
                halluc_pp_max: 0.5,
                p95_rel_max: 1.10,
                cost_rel_max: 1.15,
            },
            promotion: PromotionThresholds {
                min_prod_samples: 200,
                min_cand_samples: 200,
                halluc_pp_max: 0.5,
                p95_rel_max: 1.10,
                cost_rel_max: 1.15,
            },
            weights: ScoreWeights {
                success: 0.40,
                hallu: 0.30,
                p95: 0.20,
                cost: 0.10,
            },
            baseline_model_id: None,
            confirmation: ConfirmationPolicy {
                count: 3,
                lookback_secs: 900,
                mode: ConfirmationMode::ConsecutiveWithinLookback,
            },
            require_guard_pass: false,
        }
    }
}

impl PolicyConfig {
    /// Builds the policy for one tick: defaults, then the optional YAML file,
    /// then `CANARY_*` overrides from `env`.
    ///
    /// Never fails. Every unreadable file, unknown key or rejected value is
    /// reported as a [`ConfigWarning`] and the affected field keeps its prior
    /// value. The result always passes [`PolicyConfig::validate`].
    pub fn load<F>(path: Option<&Path>, env: F) -> (Self, Vec<ConfigWarning>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut warnings = Vec::new();

        if let Some(path) = path {
            let source = path.display().to_string();
            match std::fs::read_to_string(path) {
                Ok(content) => config.apply_yaml(&content, &source, &mut warnings),
                Err(err) => warnings.push(ConfigWarning {
                    source,
                    key: "*".to_string(),
                    message: format!("policy file unreadable, using defaults: {err}"),
                }),
            }
        }

        config.apply_env(env, &mut warnings);
        config.reconcile(&mut warnings);
        (config, warnings)
    }

    /// Parses a YAML policy document on top of the defaults.
    #[must_use]
    pub fn from_yaml_str(yaml: &str) -> (Self, Vec<ConfigWarning>) {
        let mut config = Self::default();
        let mut warnings = Vec::new();
        config.apply_yaml(yaml, "yaml", &mut warnings);
        config.reconcile(&mut warnings);
        (config, warnings)
    }

    /// Checks every field against its bounds, then that the confirmation
    /// lookback can hold `confirmation.count` ticks.
    ///
    /// # Errors
    /// Returns [`PromotionError::Configuration`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), PromotionError> {
        let checks = [
            ("tick_interval_secs", window_secs(&self.tick_interval_secs)),
            ("global_window_secs", window_secs(&self.global_window_secs)),
            ("candidate_window_secs", window_secs(&self.candidate_window_secs)),
            ("top_k", positive_count(&self.top_k)),
            ("dedupe_window_secs", window_secs(&self.dedupe_window_secs)),
            ("guard.success_pp_min", finite(&self.guard.success_pp_min)),
            ("guard.halluc_pp_max", finite(&self.guard.halluc_pp_max)),
            ("guard.p95_rel_max", positive(&self.guard.p95_rel_max)),
            ("guard.cost_rel_max", positive(&self.guard.cost_rel_max)),
            ("promotion.halluc_pp_max", finite(&self.promotion.halluc_pp_max)),
            ("promotion.p95_rel_max", positive(&self.promotion.p95_rel_max)),
            ("promotion.cost_rel_max", positive(&self.promotion.cost_rel_max)),
            ("weights.success", weight(&self.weights.success)),
            ("weights.hallu", weight(&self.weights.hallu)),
            ("weights.p95", weight(&self.weights.p95)),
            ("weights.cost", weight(&self.weights.cost)),
            ("confirmation.count", positive_count(&self.confirmation.count)),
            ("confirmation.lookback_secs", window_secs(&self.confirmation.lookback_secs)),
        ];
        for (key, check) in checks {
            check.map_err(|message| PromotionError::Configuration(format!("{key}: {message}")))?;
        }

        let reachable = self
            .confirmation
            .reachable_lookback_secs(self.tick_interval_secs);
        if self.confirmation.mode == ConfirmationMode::ConsecutiveWithinLookback
            && self.confirmation.lookback_secs < reachable
        {
            return Err(PromotionError::Configuration(format!(
                "confirmation.lookback_secs: {} cannot hold {} ticks of {}s (needs >= {reachable})",
                self.confirmation.lookback_secs, self.confirmation.count, self.tick_interval_secs
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        secs(self.tick_interval_secs)
    }

    #[must_use]
    pub fn global_window(&self) -> Duration {
        secs(self.global_window_secs)
    }

    #[must_use]
    pub fn candidate_window(&self) -> Duration {
        secs(self.candidate_window_secs)
    }

    fn apply_yaml(&mut self, yaml: &str, source: &str, warnings: &mut Vec<ConfigWarning>) {
        match serde_yaml::from_str::<YamlValue>(yaml) {
            Ok(document) => self.apply_document(document, source, warnings),
            Err(err) => warnings.push(ConfigWarning {
                source: source.to_string(),
                key: "*".to_string(),
                message: format!("invalid policy YAML, using defaults: {err}"),
            }),
        }
    }

    fn apply_env<F>(&mut self, env: F, warnings: &mut Vec<ConfigWarning>)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, var) in ENV_KEYS {
            if let Some(raw) = env(var) {
                let value = if *key == "baseline_model_id" {
                    YamlValue::String(raw.trim().to_string())
                } else {
                    env_scalar(&raw)
                };
                self.apply_document(nest(key, value), var, warnings);
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn apply_document(
        &mut self,
        document: YamlValue,
        source: &str,
        warnings: &mut Vec<ConfigWarning>,
    ) {
        let mut layer = Layer { source, warnings };
        if document.is_null() {
            return;
        }
        if !document.is_mapping() {
            layer.warn("*", "policy YAML root MUST be a mapping".to_string());
            return;
        }
        let overlay = match serde_yaml::from_value::<PolicyOverlay>(document) {
            Ok(overlay) => overlay,
            Err(err) => {
                layer.warn(
                    "*",
                    format!("policy document has an invalid layout, using defaults: {err}"),
                );
                return;
            }
        };

        layer.unknown("", overlay.unknown);
        layer.set(
            "tick_interval_secs",
            &mut self.tick_interval_secs,
            overlay.tick_interval_secs,
            window_secs,
        );
        layer.set(
            "global_window_secs",
            &mut self.global_window_secs,
            overlay.global_window_secs,
            window_secs,
        );
        layer.set(
            "candidate_window_secs",
            &mut self.candidate_window_secs,
            overlay.candidate_window_secs,
            window_secs,
        );
        layer.set("top_k", &mut self.top_k, overlay.top_k, positive_count);
        layer.set(
            "dedupe_window_secs",
            &mut self.dedupe_window_secs,
            overlay.dedupe_window_secs,
            window_secs,
        );
        layer.set(
            "require_guard_pass",
            &mut self.require_guard_pass,
            overlay.require_guard_pass,
            unchecked,
        );

        if let Some(raw) = overlay.baseline_model_id {
            match serde_yaml::from_value::<String>(raw) {
                Ok(id) if id.trim().is_empty() => self.baseline_model_id = None,
                Ok(id) => self.baseline_model_id = Some(id.trim().to_string()),
                Err(err) => layer.warn(
                    "baseline_model_id",
                    format!("{err}; keeping current baseline"),
                ),
            }
        }

        if let Some(guard) = layer.section::<GuardOverlay>("guard", overlay.guard) {
            let target = &mut self.guard;
            layer.unknown("guard.", guard.unknown);
            layer.set(
                "guard.min_required_samples",
                &mut target.min_required_samples,
                guard.min_required_samples,
                unchecked,
            );
            layer.set(
                "guard.success_pp_min",
                &mut target.success_pp_min,
                guard.success_pp_min,
                finite,
            );
            layer.set(
                "guard.halluc_pp_max",
                &mut target.halluc_pp_max,
                guard.halluc_pp_max,
                finite,
            );
            layer.set("guard.p95_rel_max", &mut target.p95_rel_max, guard.p95_rel_max, positive);
            layer.set("guard.cost_rel_max", &mut target.cost_rel_max, guard.cost_rel_max, positive);
        }

        if let Some(promotion) = layer.section::<PromotionOverlay>("promotion", overlay.promotion) {
            let target = &mut self.promotion;
            layer.unknown("promotion.", promotion.unknown);
            layer.set(
                "promotion.min_prod_samples",
                &mut target.min_prod_samples,
                promotion.min_prod_samples,
                unchecked,
            );
            layer.set(
                "promotion.min_cand_samples",
                &mut target.min_cand_samples,
                promotion.min_cand_samples,
                unchecked,
            );
            layer.set(
                "promotion.halluc_pp_max",
                &mut target.halluc_pp_max,
                promotion.halluc_pp_max,
                finite,
            );
            layer.set(
                "promotion.p95_rel_max",
                &mut target.p95_rel_max,
                promotion.p95_rel_max,
                positive,
            );
            layer.set(
                "promotion.cost_rel_max",
                &mut target.cost_rel_max,
                promotion.cost_rel_max,
                positive,
            );
        }

        if let Some(weights) = layer.section::<WeightsOverlay>("weights", overlay.weights) {
            let target = &mut self.weights;
            layer.unknown("weights.", weights.unknown);
            layer.set("weights.success", &mut target.success, weights.success, weight);
            layer.set("weights.hallu", &mut target.hallu, weights.hallu, weight);
            layer.set("weights.p95", &mut target.p95, weights.p95, weight);
            layer.set("weights.cost", &mut target.cost, weights.cost, weight);
        }

        if let Some(confirmation) =
            layer.section::<ConfirmationOverlay>("confirmation", overlay.confirmation)
        {
            let target = &mut self.confirmation;
            layer.unknown("confirmation.", confirmation.unknown);
            layer.set("confirmation.count", &mut target.count, confirmation.count, positive_count);
            layer.set(
                "confirmation.lookback_secs",
                &mut target.lookback_secs,
                confirmation.lookback_secs,
                window_secs,
            );
            layer.set("confirmation.mode", &mut target.mode, confirmation.mode, unchecked);
        }
    }

    /// Settles combinations that are valid field by field but not together.
    fn reconcile(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let mut layer = Layer {
            source: "policy",
            warnings,
        };

        let reachable = self
            .confirmation
            .reachable_lookback_secs(self.tick_interval_secs);
        if self.confirmation.mode == ConfirmationMode::ConsecutiveWithinLookback
            && self.confirmation.lookback_secs < reachable
        {
            layer.warn(
                "confirmation.lookback_secs",
                format!(
                    "{}s cannot hold {} ticks of {}s; raised to {reachable}",
                    self.confirmation.lookback_secs, self.confirmation.count, self.tick_interval_secs
                ),
            );
            self.confirmation.lookback_secs = reachable;
        }

        // Ticks closer together than the dedupe window can share a bucket, and
        // the later decision is then absorbed.
        if self.dedupe_window_secs > self.tick_interval_secs {
            layer.warn(
                "dedupe_window_secs",
                format!(
                    "{}s exceeds tick_interval_secs {}s; consecutive decisions may be deduplicated",
                    self.dedupe_window_secs, self.tick_interval_secs
                ),
            );
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyOverlay {
    tick_interval_secs: Option<YamlValue>,
    global_window_secs: Option<YamlValue>,
    candidate_window_secs: Option<YamlValue>,
    top_k: Option<YamlValue>,
    dedupe_window_secs: Option<YamlValue>,
    guard: Option<YamlValue>,
    promotion: Option<YamlValue>,
    weights: Option<YamlValue>,
    baseline_model_id: Option<YamlValue>,
    confirmation: Option<YamlValue>,
    require_guard_pass: Option<YamlValue>,
    #[serde(flatten)]
    unknown: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct GuardOverlay {
    min_required_samples: Option<YamlValue>,
    success_pp_min: Option<YamlValue>,
    halluc_pp_max: Option<YamlValue>,
    p95_rel_max: Option<YamlValue>,
    cost_rel_max: Option<YamlValue>,
    #[serde(flatten)]
    unknown: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct PromotionOverlay {
    min_prod_samples: Option<YamlValue>,
    min_cand_samples: Option<YamlValue>,
    halluc_pp_max: Option<YamlValue>,
    p95_rel_max: Option<YamlValue>,
    cost_rel_max: Option<YamlValue>,
    #[serde(flatten)]
    unknown: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct WeightsOverlay {
    success: Option<YamlValue>,
    hallu: Option<YamlValue>,
    p95: Option<YamlValue>,
    cost: Option<YamlValue>,
    #[serde(flatten)]
    unknown: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct ConfirmationOverlay {
    count: Option<YamlValue>,
    lookback_secs: Option<YamlValue>,
    mode: Option<YamlValue>,
    #[serde(flatten)]
    unknown: BTreeMap<String, YamlValue>,
}

/// One configuration source being applied, collecting its warnings.
struct Layer<'a> {
    source: &'a str,
    warnings: &'a mut Vec<ConfigWarning>,
}

impl Layer<'_> {
    fn warn(&mut self, key: &str, message: String) {
        self.warnings.push(ConfigWarning {
            source: self.source.to_string(),
            key: key.to_string(),
            message,
        });
    }

    fn unknown(&mut self, prefix: &str, keys: BTreeMap<String, YamlValue>) {
        for key in keys.into_keys() {
            self.warn(&format!("{prefix}{key}"), "unknown policy key ignored".to_string());
        }
    }

    fn section<T: DeserializeOwned>(&mut self, key: &str, value: Option<YamlValue>) -> Option<T> {
        match serde_yaml::from_value::<T>(value?) {
            Ok(section) => Some(section),
            Err(err) => {
                self.warn(key, format!("{key} MUST be a mapping ({err}); keeping every {key} value"));
                None
            }
        }
    }

    /// Replaces `slot` with `value` when it deserializes and passes `check`.
    fn set<T>(
        &mut self,
        key: &str,
        slot: &mut T,
        value: Option<YamlValue>,
        check: fn(&T) -> Result<(), String>,
    ) where
        T: DeserializeOwned + fmt::Display,
    {
        let Some(value) = value else {
            return;
        };
        let parsed = serde_yaml::from_value::<T>(value)
            .map_err(|err| err.to_string())
            .and_then(|parsed| check(&parsed).map(|()| parsed));
        match parsed {
            Ok(parsed) => *slot = parsed,
            Err(message) => self.warn(key, format!("{message}; keeping {slot}")),
        }
    }
}

/// Environment values are read as YAML scalars so `50`, `0.4` and `true`
/// take their typed form; anything unparsable stays a string.
fn env_scalar(raw: &str) -> YamlValue {
    let trimmed = raw.trim();
    match serde_yaml::from_str::<YamlValue>(trimmed) {
        Ok(value @ (YamlValue::Bool(_) | YamlValue::Number(_) | YamlValue::String(_))) => value,
        _ => YamlValue::String(trimmed.to_string()),
    }
}

/// Wraps `value` in one mapping level per dotted segment of `key`.
fn nest(key: &str, value: YamlValue) -> YamlValue {
    key.rsplit('.').fold(value, |inner, part| {
        let mut map = Mapping::new();
        map.insert(YamlValue::String(part.to_string()), inner);
        YamlValue::Mapping(map)
    })
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value.min(MAX_WINDOW_SECS)).unwrap_or(i64::MAX))
}

fn unchecked<T>(_: &T) -> Result<(), String> {
    Ok(())
}

fn window_secs(value: &u64) -> Result<(), String> {
    match *value {
        0 => Err("value MUST be >= 1".to_string()),
        value if value > MAX_WINDOW_SECS => {
            Err(format!("value {value} MUST be <= {MAX_WINDOW_SECS} (ten years)"))
        }
        _ => Ok(()),
    }
}

fn positive_count(value: &usize) -> Result<(), String> {
    if *value == 0 {
        Err("value MUST be >= 1".to_string())
    } else {
        Ok(())
    }
}

fn finite(value: &f64) -> Result<(), String> {
    if value.is_finite() {
        Ok(())
    } else {
        Err("value MUST be finite".to_string())
    }
}

fn positive(value: &f64) -> Result<(), String> {
    finite(value)?;
    if *value > 0.0 {
        Ok(())
    } else {
        Err("value MUST be > 0".to_string())
    }
}

fn weight(value: &f64) -> Result<(), String> {
    finite(value)?;
    if *value >= 0.0 {
        Ok(())
    } else {
        Err("weight MUST be >= 0".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(PolicyConfig::default().validate().is_ok());
        let config = PolicyConfig::default();
        assert_eq!(config.confirmation.count, 3);
        assert_eq!(config.confirmation.lookback_secs, 900);
        assert_eq!(config.top_k, 5);
    }

    #[test]
    fn yaml_overrides_nested_fields() {
        let (config, warnings) = PolicyConfig::from_yaml_str(
            "guard:\n  min_required_samples: 50\nweights:\n  success: 0.5\nbaseline_model_id: gpt-prod\nconfirmation:\n  mode: consecutive\n",
        );

        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(config.guard.min_required_samples, 50);
        assert!((config.weights.success - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.baseline_model_id.as_deref(), Some("gpt-prod"));
        assert_eq!(config.confirmation.mode, ConfirmationMode::Consecutive);
        assert!(config.confirmation.lookback().is_none());
    }

    #[test]
    fn invalid_values_fall_back_to_defaults_with_warnings() {
        let (config, warnings) = PolicyConfig::from_yaml_str(
            "top_k: 0\nweights:\n  hallu: -1\nguard:\n  p95_rel_max: banana\nmystery: 1\n",
        );

        let defaults = PolicyConfig::default();
        assert_eq!(config.top_k, defaults.top_k);
        assert!((config.weights.hallu - defaults.weights.hallu).abs() < f64::EPSILON);
        assert!((config.guard.p95_rel_max - defaults.guard.p95_rel_max).abs() < f64::EPSILON);

        let keys: Vec<&str> = warnings.iter().map(|item| item.key.as_str()).collect();
        assert!(keys.contains(&"top_k"));
        assert!(keys.contains(&"weights.hallu"));
        assert!(keys.contains(&"guard.p95_rel_max"));
        assert!(keys.contains(&"mystery"));
    }

    #[test]
    fn malformed_yaml_keeps_all_defaults() {
        let (config, warnings) = PolicyConfig::from_yaml_str("guard: [unclosed");
        assert_eq!(config, PolicyConfig::default());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn env_overrides_win_over_defaults() {
        let env = env_from(&[
            ("CANARY_MIN_REQUIRED_SAMPLES", "50"),
            ("CANARY_CONFIRMATION_COUNT", "5"),
            ("CANARY_REQUIRE_GUARD_PASS", "true"),
            ("CANARY_WEIGHT_COST", "nope"),
        ]);
        let (config, warnings) = PolicyConfig::load(None, env);

        assert_eq!(config.guard.min_required_samples, 50);
        assert_eq!(config.confirmation.count, 5);
        assert!(config.require_guard_pass);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].source, "CANARY_WEIGHT_COST");
    }

    #[test]
    fn missing_policy_file_is_a_warning_not_an_error() {
        let path = std::env::temp_dir().join("canary-policy-does-not-exist.yaml");
        let (config, warnings) = PolicyConfig::load(Some(&path), |_| None);

        assert_eq!(config, PolicyConfig::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("unreadable"));
    }

    #[test]
    fn empty_baseline_env_clears_baseline() {
        let env = env_from(&[("CANARY_BASELINE_MODEL_ID", "")]);
        let (config, warnings) = PolicyConfig::load(None, env);
        assert!(warnings.is_empty());
        assert!(config.baseline_model_id.is_none());
    }

    #[test]
    fn oversized_windows_fall_back_with_warnings() {
        let env = env_from(&[
            ("CANARY_GLOBAL_WINDOW_SECS", "10000000000000"),
            ("CANARY_CANDIDATE_WINDOW_SECS", "10000000000000"),
            ("CANARY_CONFIRMATION_LOOKBACK_SECS", "10000000000000"),
        ]);
        let (config, warnings) = PolicyConfig::load(None, env);

        let defaults = PolicyConfig::default();
        assert_eq!(config.global_window_secs, defaults.global_window_secs);
        assert_eq!(config.candidate_window_secs, defaults.candidate_window_secs);
        assert_eq!(config.confirmation.lookback_secs, defaults.confirmation.lookback_secs);
        let keys: Vec<&str> = warnings.iter().map(|item| item.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "global_window_secs",
                "candidate_window_secs",
                "confirmation.lookback_secs"
            ]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn every_env_variable_reaches_its_field() {
        for (key, var) in ENV_KEYS {
            let raw = match *key {
                "baseline_model_id" => "prod-x",
                "confirmation.mode" => "consecutive",
                "require_guard_pass" => "true",
                "confirmation.count" => "2",
                "confirmation.lookback_secs" => "600",
                key if key.starts_with("weights.") || key.contains("pp_") || key.contains("rel_max") => {
                    "0.7"
                }
                _ => "45",
            };
            let (config, warnings) = PolicyConfig::load(None, env_from(&[(*var, raw)]));

            assert!(warnings.is_empty(), "{var}={raw} warned: {warnings:?}");
            assert_ne!(config, PolicyConfig::default(), "{var} had no effect");
        }
    }

    #[test]
    fn misshapen_section_only_discards_that_section() {
        let (config, warnings) = PolicyConfig::from_yaml_str("guard: 5
top_k: 2
");

        assert_eq!(config.top_k, 2);
        assert_eq!(config.guard, PolicyConfig::default().guard);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, "guard");
    }

    #[test]
    fn lookback_too_short_for_count_is_raised() {
        let (config, warnings) = PolicyConfig::from_yaml_str(
            "tick_interval_secs: 300
confirmation:
  count: 4
  lookback_secs: 600
",
        );

        assert_eq!(config.confirmation.lookback_secs, 900);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, "confirmation.lookback_secs");
        assert!(config.validate().is_ok());

        let mut unreachable = config.clone();
        unreachable.confirmation.lookback_secs = 600;
        let err = match unreachable.validate() {
            Ok(()) => panic!("expected unreachable lookback to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("confirmation.lookback_secs"));

        let spacing_free = ConfirmationPolicy {
            mode: ConfirmationMode::Consecutive,
            ..unreachable.confirmation.clone()
        };
        unreachable.confirmation = spacing_free;
        assert!(unreachable.validate().is_ok());
    }

    #[test]
    fn dedupe_wider_than_tick_interval_is_reported() {
        let (config, warnings) = PolicyConfig::from_yaml_str("dedupe_window_secs: 120
");

        assert_eq!(config.dedupe_window_secs, 120);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, "dedupe_window_secs");
        assert!(PolicyConfig::default().dedupe_window_secs < PolicyConfig::default().tick_interval_secs);
    }

    #[test]
    fn validate_rejects_hand_built_oversized_window() {
        let config = PolicyConfig {
            global_window_secs: u64::MAX,
            ..PolicyConfig::default()
        };
        let err = match config.validate() {
            Ok(()) => panic!("expected oversized window to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("global_window_secs"));
    }

    #[test]
    fn validate_reports_out_of_bounds_fields() {
        let mut config = PolicyConfig::default();
        config.confirmation.count = 0;
        let err = match config.validate() {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("confirmation.count"));
    }
}
