//! Tracking event ingestion
//!
//! `Tracker` is the single entry point for incoming tracking events. Each
//! event is validated, persisted, and then the user's behavioral metrics are
//! recomputed. A failed recomputation leaves the metrics stale but never
//! undoes the event write.

use crate::aggregator::MetricsAggregator;
use crate::config::AggregatorConfig;
use crate::error::ChurnError;
use crate::features::{feature_analytics, feature_usage_summary};
use crate::store::EventStore;
use crate::types::{
    BehavioralMetrics, FeatureAnalytics, FeatureUsage, FeatureUsageEvent, Session, UserProfile,
    UserStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Plan assigned to users that do not report one
pub const DEFAULT_PLAN_TYPE: &str = "free";

/// An incoming tracking event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackingEvent {
    /// A session ended
    Session {
        user_id: String,
        /// Defaults to the ingestion instant
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
        #[serde(default, alias = "duration")]
        duration_seconds: i64,
    },
    /// A feature was used
    Feature {
        user_id: String,
        feature_name: String,
        #[serde(default)]
        occurred_at: Option<DateTime<Utc>>,
    },
    /// A user profile was created or updated
    User {
        email: String,
        #[serde(default, alias = "planType")]
        plan_type: Option<String>,
        #[serde(default)]
        status: Option<UserStatus>,
    },
}

impl TrackingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackingEvent::Session { .. } => "session",
            TrackingEvent::Feature { .. } => "feature",
            TrackingEvent::User { .. } => "user",
        }
    }
}

/// Result of ingesting one event
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    /// User the event was attributed to
    pub user_id: String,
    /// Freshly recomputed metrics, `None` if recomputation failed
    pub metrics: Option<BehavioralMetrics>,
    /// Why recomputation failed, if it did
    pub recompute_error: Option<String>,
}

impl TrackOutcome {
    pub fn metrics_stale(&self) -> bool {
        self.metrics.is_none()
    }
}

/// Ingestion layer over one store and one aggregator
pub struct Tracker {
    store: Arc<dyn EventStore>,
    aggregator: MetricsAggregator,
}

impl Tracker {
    /// Create a tracker with default aggregator settings
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        let aggregator = MetricsAggregator::new(store.clone());
        Self { store, aggregator }
    }

    /// Create a tracker with custom aggregator settings, validated first
    pub fn with_config(
        store: Arc<dyn EventStore>,
        config: AggregatorConfig,
    ) -> Result<Self, ChurnError> {
        let aggregator = MetricsAggregator::with_config(store.clone(), config)?;
        Ok(Self { store, aggregator })
    }

    /// Record a finished session
    pub fn track_session(
        &self,
        user_id: &str,
        started_at: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<TrackOutcome, ChurnError> {
        self.track_session_at(user_id, started_at, duration_seconds, Utc::now())
    }

    /// Record a finished session, recomputing against `now`
    pub fn track_session_at(
        &self,
        user_id: &str,
        started_at: DateTime<Utc>,
        duration_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome, ChurnError> {
        validate_user_id(user_id)?;
        if duration_seconds < 0 {
            return Err(ChurnError::InvalidInput(format!(
                "session duration must be non-negative, got {}",
                duration_seconds
            )));
        }

        self.store.append_session(Session {
            user_id: user_id.to_string(),
            started_at,
            duration_seconds,
        })?;
        tracing::info!(user_id, duration_seconds, "tracked session");

        Ok(self.refresh(user_id, now))
    }

    /// Record a feature usage
    pub fn track_feature(
        &self,
        user_id: &str,
        feature_name: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<TrackOutcome, ChurnError> {
        self.track_feature_at(user_id, feature_name, occurred_at, Utc::now())
    }

    /// Record a feature usage, recomputing against `now`
    ///
    /// The name is trimmed; any other character is kept as-is.
    pub fn track_feature_at(
        &self,
        user_id: &str,
        feature_name: &str,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome, ChurnError> {
        validate_user_id(user_id)?;
        let feature_name = feature_name.trim();
        if feature_name.is_empty() {
            return Err(ChurnError::InvalidInput(
                "feature_name must not be empty".to_string(),
            ));
        }

        self.store.append_feature_event(FeatureUsageEvent {
            user_id: user_id.to_string(),
            feature_name: feature_name.to_string(),
            occurred_at,
        })?;
        tracing::info!(user_id, feature_name, "tracked feature usage");

        Ok(self.refresh(user_id, now))
    }

    /// Create or update a user profile, keyed by email
    pub fn track_user(
        &self,
        email: &str,
        plan_type: Option<&str>,
        status: Option<UserStatus>,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome, ChurnError> {
        let email = email.trim();
        validate_email(email)?;

        let profile = match self.store.find_user_by_email(email)? {
            Some(existing) => UserProfile {
                plan_type: plan_type
                    .map(str::to_string)
                    .unwrap_or(existing.plan_type),
                status: status.unwrap_or(existing.status),
                updated_at: now,
                ..existing
            },
            None => UserProfile {
                user_id: Uuid::new_v4().to_string(),
                email: email.to_string(),
                plan_type: plan_type.unwrap_or(DEFAULT_PLAN_TYPE).to_string(),
                status: status.unwrap_or_default(),
                created_at: now,
                updated_at: now,
            },
        };
        let user_id = profile.user_id.clone();
        let status = profile.status.as_str();

        self.store.upsert_user(profile)?;
        tracing::info!(user_id = %user_id, status, "tracked user profile");

        Ok(self.refresh(&user_id, now))
    }

    /// Apply a tracking event at `now`
    ///
    /// Missing timestamps default to `now` and the recomputation runs against
    /// it, so replaying the same events at the same `now` is deterministic.
    pub fn apply_at(
        &self,
        event: TrackingEvent,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome, ChurnError> {
        match event {
            TrackingEvent::Session {
                user_id,
                started_at,
                duration_seconds,
            } => self.track_session_at(&user_id, started_at.unwrap_or(now), duration_seconds, now),
            TrackingEvent::Feature {
                user_id,
                feature_name,
                occurred_at,
            } => self.track_feature_at(&user_id, &feature_name, occurred_at.unwrap_or(now), now),
            TrackingEvent::User {
                email,
                plan_type,
                status,
            } => self.track_user(&email, plan_type.as_deref(), status, now),
        }
    }

    /// Apply a tracking event against the wall clock
    pub fn apply(&self, event: TrackingEvent) -> Result<TrackOutcome, ChurnError> {
        self.apply_at(event, Utc::now())
    }

    /// Last stored metrics for a user
    pub fn metrics(&self, user_id: &str) -> Result<Option<BehavioralMetrics>, ChurnError> {
        self.aggregator.metrics(user_id)
    }

    /// Per-feature usage counts and first/last use for one user
    pub fn feature_usage(&self, user_id: &str) -> Result<Vec<FeatureUsage>, ChurnError> {
        let events = self.store.list_feature_events(user_id)?;
        Ok(feature_usage_summary(&events))
    }

    /// Usage of one feature across all users
    pub fn feature_analytics(&self, feature_name: &str) -> Result<FeatureAnalytics, ChurnError> {
        let events = self.store.list_feature_events_by_name(feature_name)?;
        Ok(feature_analytics(feature_name, &events))
    }

    fn refresh(&self, user_id: &str, now: DateTime<Utc>) -> TrackOutcome {
        match self.aggregator.recompute_at(user_id, now) {
            Ok(metrics) => TrackOutcome {
                user_id: user_id.to_string(),
                metrics: Some(metrics),
                recompute_error: None,
            },
            Err(e) => {
                tracing::warn!(user_id, error = %e, "metrics recomputation failed, keeping stale record");
                TrackOutcome {
                    user_id: user_id.to_string(),
                    metrics: None,
                    recompute_error: Some(e.to_string()),
                }
            }
        }
    }
}

fn validate_user_id(user_id: &str) -> Result<(), ChurnError> {
    if user_id.trim().is_empty() {
        return Err(ChurnError::InvalidInput(
            "user_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ChurnError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        }
        None => false,
    };
    if !valid {
        return Err(ChurnError::InvalidInput(format!("invalid email: {:?}", email)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn tracker() -> (Arc<InMemoryEventStore>, Tracker) {
        let store = Arc::new(InMemoryEventStore::new());
        let tracker = Tracker::new(store.clone());
        (store, tracker)
    }

    #[test]
    fn test_track_session_recomputes_metrics() {
        let (store, tracker) = tracker();
        let outcome = tracker.track_session("u1", Utc::now(), 120).unwrap();

        assert!(!outcome.metrics_stale());
        let metrics = outcome.metrics.unwrap();
        assert_eq!(metrics.average_session_duration, 120);
        assert_eq!(metrics.weekly_active_days, 1);
        assert_eq!(store.get_behavioral_metrics("u1").unwrap(), Some(metrics));
    }

    #[test]
    fn test_negative_duration_rejected_and_not_persisted() {
        let (store, tracker) = tracker();
        let result = tracker.track_session("u1", Utc::now(), -5);

        assert!(matches!(result, Err(ChurnError::InvalidInput(_))));
        assert!(store.list_sessions("u1").unwrap().is_empty());
        assert!(store.get_behavioral_metrics("u1").unwrap().is_none());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let (_, tracker) = tracker();
        assert!(tracker.track_session("  ", Utc::now(), 10).is_err());
        assert!(tracker.track_feature("", "export", Utc::now()).is_err());
    }

    #[test]
    fn test_feature_name_validation() {
        let (store, tracker) = tracker();
        assert!(tracker.track_feature("u1", "   ", Utc::now()).is_err());
        assert!(store.list_feature_events("u1").unwrap().is_empty());

        let outcome = tracker.track_feature("u1", " export ", Utc::now()).unwrap();
        let metrics = outcome.metrics.unwrap();
        assert!(metrics.core_features_used.contains("export"));
    }

    #[test]
    fn test_delimiter_in_feature_name_survives_snapshot() {
        let (store, tracker) = tracker();
        tracker.track_feature("u1", "reports,pdf", Utc::now()).unwrap();
        tracker.track_feature("u1", "reports", Utc::now()).unwrap();

        let restored = InMemoryEventStore::from_json(&store.to_json().unwrap()).unwrap();
        let metrics = restored.get_behavioral_metrics("u1").unwrap().unwrap();

        assert_eq!(metrics.features_used, 2);
        assert_eq!(metrics.core_features_used.len(), 2);
        assert!(metrics.core_features_used.contains("reports,pdf"));
    }

    #[test]
    fn test_with_config_rejects_invalid_settings() {
        let config = AggregatorConfig {
            weekly_active_cap: -7.0,
            ..AggregatorConfig::default()
        };
        let result = Tracker::with_config(Arc::new(InMemoryEventStore::new()), config);
        assert!(matches!(result, Err(ChurnError::Config(_))));
    }

    #[test]
    fn test_apply_at_recomputes_against_given_now() {
        let (store, tracker) = tracker();
        let now = Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap();
        let events = [
            TrackingEvent::Session {
                user_id: "u1".to_string(),
                started_at: Some(now - Duration::days(3)),
                duration_seconds: 300,
            },
            TrackingEvent::Feature {
                user_id: "u1".to_string(),
                feature_name: "search".to_string(),
                occurred_at: None,
            },
        ];

        let mut outcomes = Vec::new();
        for event in events {
            outcomes.push(tracker.apply_at(event, now).unwrap());
        }
        let first = outcomes[1].metrics.clone().unwrap();
        assert_eq!(first.updated_at, now);
        assert_eq!(first.last_seen_date, now);
        assert_eq!(first.inactive_days, Some(3));

        // Replaying at the same instant reproduces the record
        let replayed = tracker
            .apply_at(
                TrackingEvent::Feature {
                    user_id: "u1".to_string(),
                    feature_name: "search".to_string(),
                    occurred_at: None,
                },
                now,
            )
            .unwrap()
            .metrics
            .unwrap();
        assert_eq!(replayed, first);
        assert_eq!(store.get_behavioral_metrics("u1").unwrap(), Some(first));
    }

    #[test]
    fn test_feature_usage_and_analytics() {
        let (_, tracker) = tracker();
        let monday_morning = Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap();
        tracker.track_feature("u1", "export", monday_morning).unwrap();
        tracker
            .track_feature("u1", "export", monday_morning + Duration::hours(10))
            .unwrap();
        tracker.track_feature("u2", "export", monday_morning).unwrap();
        tracker.track_feature("u2", "search", monday_morning).unwrap();

        let usage = tracker.feature_usage("u1").unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].usage_count, 2);
        assert_eq!(usage[0].first_used_at, monday_morning);
        assert_eq!(usage[0].last_used_at, monday_morning + Duration::hours(10));

        let analytics = tracker.feature_analytics("export").unwrap();
        assert_eq!(analytics.total_usage_count, 3);
        assert_eq!(analytics.unique_users_count, 2);
        assert_eq!(analytics.peak_usage_times.morning, 2);
        assert_eq!(analytics.peak_usage_times.evening, 1);
        assert_eq!(analytics.usage_by_day.mon, 3);
    }

    #[test]
    fn test_track_user_creates_then_updates() {
        let (store, tracker) = tracker();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();

        let created = tracker.track_user("ada@example.com", None, None, now).unwrap();
        let profile = store.find_user_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(profile.user_id, created.user_id);
        assert_eq!(profile.plan_type, DEFAULT_PLAN_TYPE);
        assert_eq!(profile.status, UserStatus::Active);

        let later = now + Duration::days(1);
        let updated = tracker
            .track_user("ADA@example.com", Some("pro"), Some(UserStatus::Inactive), later)
            .unwrap();
        assert_eq!(updated.user_id, created.user_id);

        let profile = store.find_user_by_email("ada@example.com").unwrap().unwrap();
        assert_eq!(profile.plan_type, "pro");
        assert_eq!(profile.status, UserStatus::Inactive);
        assert_eq!(profile.created_at, now);
        assert_eq!(profile.updated_at, later);
        assert_eq!(store.stats().unwrap().users, 1);
    }

    #[test]
    fn test_track_user_rejects_bad_email() {
        let (_, tracker) = tracker();
        for email in ["", "no-at-sign", "@example.com", "ada@", "a@b@c"] {
            let result = tracker.track_user(email, None, None, Utc::now());
            assert!(matches!(result, Err(ChurnError::InvalidInput(_))), "{}", email);
        }
    }

    #[test]
    fn test_tracking_event_parsing() {
        let json = r#"{"type":"session","user_id":"u1","started_at":"2024-05-06T10:00:00Z","duration":90}"#;
        let event: TrackingEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), "session");
        assert_eq!(
            event,
            TrackingEvent::Session {
                user_id: "u1".to_string(),
                started_at: Some(Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap()),
                duration_seconds: 90,
            }
        );

        let json = r#"{"type":"user","email":"a@b.co","planType":"pro"}"#;
        let event: TrackingEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            TrackingEvent::User {
                email: "a@b.co".to_string(),
                plan_type: Some("pro".to_string()),
                status: None,
            }
        );
    }

    #[test]
    fn test_apply_defaults_missing_timestamps() {
        let (store, tracker) = tracker();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();

        tracker
            .apply_at(
                TrackingEvent::Feature {
                    user_id: "u1".to_string(),
                    feature_name: "search".to_string(),
                    occurred_at: None,
                },
                now,
            )
            .unwrap();

        let events = store.list_feature_events("u1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].occurred_at, now);
    }

    struct UnwritableMetricsStore(InMemoryEventStore);

    impl EventStore for UnwritableMetricsStore {
        fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ChurnError> {
            self.0.list_sessions(user_id)
        }

        fn list_feature_events(
            &self,
            user_id: &str,
        ) -> Result<Vec<FeatureUsageEvent>, ChurnError> {
            self.0.list_feature_events(user_id)
        }

        fn list_feature_events_by_name(
            &self,
            feature_name: &str,
        ) -> Result<Vec<FeatureUsageEvent>, ChurnError> {
            self.0.list_feature_events_by_name(feature_name)
        }

        fn upsert_behavioral_metrics(
            &self,
            _user_id: &str,
            _metrics: &BehavioralMetrics,
        ) -> Result<(), ChurnError> {
            Err(ChurnError::DataAccess("metrics table offline".to_string()))
        }

        fn get_behavioral_metrics(
            &self,
            user_id: &str,
        ) -> Result<Option<BehavioralMetrics>, ChurnError> {
            self.0.get_behavioral_metrics(user_id)
        }

        fn append_session(&self, session: Session) -> Result<(), ChurnError> {
            self.0.append_session(session)
        }

        fn append_feature_event(&self, event: FeatureUsageEvent) -> Result<(), ChurnError> {
            self.0.append_feature_event(event)
        }

        fn find_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, ChurnError> {
            self.0.find_user_by_email(email)
        }

        fn upsert_user(&self, profile: UserProfile) -> Result<(), ChurnError> {
            self.0.upsert_user(profile)
        }
    }

    #[test]
    fn test_failed_recompute_keeps_event_write() {
        let store = Arc::new(UnwritableMetricsStore(InMemoryEventStore::new()));
        let tracker = Tracker::new(store.clone());

        let outcome = tracker.track_session("u1", Utc::now(), 60).unwrap();

        assert!(outcome.metrics_stale());
        assert!(outcome.recompute_error.is_some());
        assert_eq!(store.list_sessions("u1").unwrap().len(), 1);
    }
}
