//! Behavioral metrics recomputation
//!
//! `MetricsAggregator` reads a user's full session and feature history from an
//! `EventStore`, derives the `BehavioralMetrics` record and writes it back as a
//! full replacement.
//!
//! Recomputation: history → windows → formulas → assemble → upsert

use crate::config::AggregatorConfig;
use crate::error::ChurnError;
use crate::features::{
    average_session_duration, churn_risk_score, distinct_features, engagement_score,
    inactive_days, key_features_used, usage_trend, window_activity, RiskInputs,
};
use crate::store::EventStore;
use crate::types::{BehavioralMetrics, FeatureUsageEvent, Session};
use crate::windows::ActivityWindows;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Derive a metrics record from a history snapshot (no store access).
pub fn derive_metrics(
    user_id: &str,
    sessions: &[Session],
    feature_events: &[FeatureUsageEvent],
    now: DateTime<Utc>,
    config: &AggregatorConfig,
) -> BehavioralMetrics {
    let windows = ActivityWindows::at(now);
    let activity = window_activity(sessions, &windows);

    let average = average_session_duration(sessions);
    let features = distinct_features(feature_events);
    let features_used = features.len() as u32;

    let trend = usage_trend(
        activity.this_week_sessions,
        activity.last_week_sessions,
        config.usage_trend_clamp,
    );
    let inactive = inactive_days(sessions, now);

    let engagement = engagement_score(
        activity.month_active_days,
        activity.week_active_days,
        features_used,
        config,
    );
    let churn_risk = churn_risk_score(
        RiskInputs {
            inactive_days: inactive,
            key_features_used: key_features_used(&features, config),
            usage_trend: trend,
            average_session_duration: average,
        },
        config,
    );

    BehavioralMetrics {
        user_id: user_id.to_string(),
        daily_active_days: activity.month_active_days,
        weekly_active_days: activity.week_active_days,
        average_session_duration: average,
        features_used,
        core_features_used: features,
        usage_trend: trend,
        inactive_days: inactive,
        engagement_score: engagement,
        churn_risk_score: churn_risk,
        last_seen_date: now,
        updated_at: now,
    }
}

/// Recomputes and persists behavioral metrics for one user at a time.
///
/// Holds no per-user state; every call re-reads the full history. Concurrent
/// calls for the same user are not serialized and the last write wins.
pub struct MetricsAggregator {
    store: Arc<dyn EventStore>,
    config: AggregatorConfig,
}

impl MetricsAggregator {
    /// Create an aggregator with default settings
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            config: AggregatorConfig::default(),
        }
    }

    /// Create an aggregator with custom settings
    ///
    /// Fails with `ChurnError::Config` if the settings do not validate.
    pub fn with_config(
        store: Arc<dyn EventStore>,
        config: AggregatorConfig,
    ) -> Result<Self, ChurnError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Recompute a user's metrics against the current wall clock
    pub fn recompute(&self, user_id: &str) -> Result<BehavioralMetrics, ChurnError> {
        self.recompute_at(user_id, Utc::now())
    }

    /// Recompute a user's metrics against an explicit "now"
    ///
    /// A user with no history gets a zeroed record rather than an error. On a
    /// read or write failure nothing is stored and the previous record stays.
    pub fn recompute_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BehavioralMetrics, ChurnError> {
        let sessions = self.store.list_sessions(user_id)?;
        let feature_events = self.store.list_feature_events(user_id)?;

        let metrics = derive_metrics(user_id, &sessions, &feature_events, now, &self.config);

        self.store.upsert_behavioral_metrics(user_id, &metrics)?;

        tracing::debug!(
            user_id,
            sessions = sessions.len(),
            feature_events = feature_events.len(),
            engagement_score = metrics.engagement_score,
            usage_trend = metrics.usage_trend,
            "recomputed behavioral metrics"
        );

        Ok(metrics)
    }

    /// The last stored metrics record for a user
    pub fn metrics(&self, user_id: &str) -> Result<Option<BehavioralMetrics>, ChurnError> {
        self.store.get_behavioral_metrics(user_id)
    }
}
