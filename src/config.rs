//! Aggregator configuration
//!
//! Every field has a default, so an empty JSON object is a valid config and
//! only the values that need to change have to be specified.

use crate::error::ChurnError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Tunable caps, weights and thresholds for metric derivation
///
/// # Example
///
/// ```json
/// {
///   "monthly_active_cap": 20,
///   "usage_trend_clamp": 5.0,
///   "key_features": ["search", "export"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Active days per month that saturate the monthly term
    pub monthly_active_cap: f64,
    /// Active days per week that saturate the weekly term
    pub weekly_active_cap: f64,
    /// Distinct features that saturate the breadth term
    pub feature_breadth_cap: f64,

    pub monthly_weight: f64,
    pub weekly_weight: f64,
    pub feature_weight: f64,

    /// Symmetric bound applied to `usage_trend`. `None` leaves it unbounded.
    pub usage_trend_clamp: Option<f64>,

    /// Feature names whose adoption feeds the churn risk factor
    pub key_features: Vec<String>,
    /// Fewer key features than this counts as a risk factor
    pub min_key_features: usize,
    /// More inactive days than this counts as a risk factor
    pub inactivity_risk_days: i64,
    /// Average sessions shorter than this (seconds) count as a risk factor
    pub short_session_seconds: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            monthly_active_cap: 30.0,
            weekly_active_cap: 7.0,
            feature_breadth_cap: 5.0,
            monthly_weight: 0.4,
            weekly_weight: 0.3,
            feature_weight: 0.3,
            usage_trend_clamp: None,
            key_features: ["search", "export", "reports", "analytics"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            min_key_features: 2,
            inactivity_risk_days: 7,
            short_session_seconds: 60,
        }
    }
}

impl AggregatorConfig {
    /// Parse and validate a config from JSON
    pub fn from_json(json: &str) -> Result<Self, ChurnError> {
        let config: AggregatorConfig = serde_json::from_str(json)
            .map_err(|e| ChurnError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ChurnError> {
        let json = fs::read_to_string(path).map_err(|e| {
            ChurnError::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Check caps, weights and thresholds for consistency
    pub fn validate(&self) -> Result<(), ChurnError> {
        for (name, cap) in [
            ("monthly_active_cap", self.monthly_active_cap),
            ("weekly_active_cap", self.weekly_active_cap),
            ("feature_breadth_cap", self.feature_breadth_cap),
        ] {
            if cap.is_nan() || cap <= 0.0 || cap.is_infinite() {
                return Err(ChurnError::Config(format!(
                    "{} must be a positive number, got {}",
                    name, cap
                )));
            }
        }

        for (name, weight) in [
            ("monthly_weight", self.monthly_weight),
            ("weekly_weight", self.weekly_weight),
            ("feature_weight", self.feature_weight),
        ] {
            if weight < 0.0 || !weight.is_finite() {
                return Err(ChurnError::Config(format!(
                    "{} must be non-negative, got {}",
                    name, weight
                )));
            }
        }

        let weight_sum = self.monthly_weight + self.weekly_weight + self.feature_weight;
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ChurnError::Config(format!(
                "engagement weights must sum to 1.0, got {}",
                weight_sum
            )));
        }

        if let Some(clamp) = self.usage_trend_clamp {
            if clamp.is_nan() || clamp <= 0.0 {
                return Err(ChurnError::Config(format!(
                    "usage_trend_clamp must be positive, got {}",
                    clamp
                )));
            }
        }

        if self.inactivity_risk_days < 0 {
            return Err(ChurnError::Config(
                "inactivity_risk_days must be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_is_valid() {
        assert!(AggregatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_object_yields_defaults() {
        let config = AggregatorConfig::from_json("{}").unwrap();
        assert_eq!(config, AggregatorConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config =
            AggregatorConfig::from_json(r#"{"usage_trend_clamp": 2.0, "min_key_features": 1}"#)
                .unwrap();
        assert_eq!(config.usage_trend_clamp, Some(2.0));
        assert_eq!(config.min_key_features, 1);
        assert_eq!(config.monthly_active_cap, 30.0);
    }

    #[test]
    fn test_rejects_weights_not_summing_to_one() {
        let result = AggregatorConfig::from_json(r#"{"monthly_weight": 0.5}"#);
        assert!(matches!(result, Err(ChurnError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_cap() {
        let result = AggregatorConfig::from_json(r#"{"weekly_active_cap": 0}"#);
        assert!(matches!(result, Err(ChurnError::Config(_))));
    }

    #[test]
    fn test_rejects_non_positive_clamp() {
        let result = AggregatorConfig::from_json(r#"{"usage_trend_clamp": -1.0}"#);
        assert!(matches!(result, Err(ChurnError::Config(_))));
    }

    #[test]
    fn test_invalid_json() {
        assert!(AggregatorConfig::from_json("not json").is_err());
    }
}
