//! Behavioral metric formulas
//!
//! Pure functions from a user's raw session and feature history to the
//! individual derived indicators. `MetricsAggregator` composes these.

use crate::config::AggregatorConfig;
use crate::types::{
    FeatureAnalytics, FeatureUsage, FeatureUsageEvent, Session, TimeOfDay, TimeOfDayCounts,
    WeekdayCounts,
};
use crate::windows::ActivityWindows;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Session counts and distinct active days per window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowActivity {
    pub month_active_days: u32,
    pub week_active_days: u32,
    pub this_week_sessions: u32,
    pub last_week_sessions: u32,
}

/// Bucket sessions into the month / week / last-week windows
pub fn window_activity(sessions: &[Session], windows: &ActivityWindows) -> WindowActivity {
    let mut month_days: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut week_days: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut this_week_sessions = 0u32;
    let mut last_week_sessions = 0u32;

    for session in sessions {
        let day = session.started_at.date_naive();
        if windows.in_month(session.started_at) {
            month_days.insert(day);
        }
        if windows.in_this_week(session.started_at) {
            week_days.insert(day);
            this_week_sessions += 1;
        } else if windows.in_last_week(session.started_at) {
            last_week_sessions += 1;
        }
    }

    WindowActivity {
        month_active_days: month_days.len() as u32,
        week_active_days: week_days.len() as u32,
        this_week_sessions,
        last_week_sessions,
    }
}

/// Truncated mean session duration, 0 with no sessions
pub fn average_session_duration(sessions: &[Session]) -> i64 {
    if sessions.is_empty() {
        return 0;
    }
    let total: i128 = sessions.iter().map(|s| s.duration_seconds as i128).sum();
    (total / sessions.len() as i128) as i64
}

/// Distinct feature names used
pub fn distinct_features(events: &[FeatureUsageEvent]) -> BTreeSet<String> {
    events.iter().map(|e| e.feature_name.clone()).collect()
}

/// Compute usage trend
///
/// Formula: `(this_week - last_week) / (last_week + 1)`
///
/// The `+ 1` keeps the ratio defined when last week was empty and damps it
/// while history is sparse. Unbounded unless a positive clamp is given; a
/// zero, negative or NaN bound is ignored.
pub fn usage_trend(this_week_sessions: u32, last_week_sessions: u32, clamp: Option<f64>) -> f64 {
    let trend = (this_week_sessions as f64 - last_week_sessions as f64)
        / (last_week_sessions as f64 + 1.0);
    match clamp {
        Some(bound) if bound > 0.0 => trend.clamp(-bound, bound),
        _ => trend,
    }
}

/// Whole days since the latest session, `None` if there are no sessions
pub fn inactive_days(sessions: &[Session], now: DateTime<Utc>) -> Option<i64> {
    sessions
        .iter()
        .map(|s| s.started_at)
        .max()
        .map(|latest| (now - latest).num_days().max(0))
}

/// Compute engagement score (weighted combination)
///
/// Formula (defaults):
/// ```text
/// Engagement = 0.4 * min(daily_active_days / 30, 1)
///            + 0.3 * min(weekly_active_days / 7, 1)
///            + 0.3 * min(features_used / 5, 1)
/// ```
pub fn engagement_score(
    daily_active_days: u32,
    weekly_active_days: u32,
    features_used: u32,
    config: &AggregatorConfig,
) -> f64 {
    let monthly = saturate(daily_active_days, config.monthly_active_cap);
    let weekly = saturate(weekly_active_days, config.weekly_active_cap);
    let breadth = saturate(features_used, config.feature_breadth_cap);

    config.monthly_weight * monthly + config.weekly_weight * weekly + config.feature_weight * breadth
}

/// Per-feature usage for one user's events, sorted by feature name
pub fn feature_usage_summary(events: &[FeatureUsageEvent]) -> Vec<FeatureUsage> {
    let mut by_name: BTreeMap<&str, FeatureUsage> = BTreeMap::new();

    for event in events {
        by_name
            .entry(event.feature_name.as_str())
            .and_modify(|usage| {
                usage.usage_count += 1;
                usage.first_used_at = usage.first_used_at.min(event.occurred_at);
                usage.last_used_at = usage.last_used_at.max(event.occurred_at);
            })
            .or_insert_with(|| FeatureUsage {
                feature_name: event.feature_name.clone(),
                usage_count: 1,
                first_used_at: event.occurred_at,
                last_used_at: event.occurred_at,
            });
    }

    by_name.into_values().collect()
}

/// Usage of one feature across users, bucketed by time of day and weekday (UTC)
///
/// Events for other features are ignored.
pub fn feature_analytics(feature_name: &str, events: &[FeatureUsageEvent]) -> FeatureAnalytics {
    let mut users: BTreeSet<&str> = BTreeSet::new();
    let mut peak_usage_times = TimeOfDayCounts::default();
    let mut usage_by_day = WeekdayCounts::default();
    let mut total_usage_count = 0u64;

    for event in events.iter().filter(|e| e.feature_name == feature_name) {
        total_usage_count += 1;
        users.insert(event.user_id.as_str());
        peak_usage_times.record(TimeOfDay::from_hour(event.occurred_at.hour()));
        usage_by_day.record(event.occurred_at.weekday());
    }

    FeatureAnalytics {
        feature_name: feature_name.to_string(),
        total_usage_count,
        unique_users_count: users.len() as u64,
        peak_usage_times,
        usage_by_day,
    }
}

/// Inputs to the churn risk proxy
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub inactive_days: Option<i64>,
    pub key_features_used: usize,
    pub usage_trend: f64,
    pub average_session_duration: i64,
}

/// Compute churn risk as the share of risk factors present
///
/// Factors:
/// - inactive longer than `inactivity_risk_days`, or never active
/// - fewer than `min_key_features` key features used
/// - declining usage trend
/// - average session shorter than `short_session_seconds`
pub fn churn_risk_score(inputs: RiskInputs, config: &AggregatorConfig) -> f64 {
    let factors = [
        inputs
            .inactive_days
            .map_or(true, |days| days > config.inactivity_risk_days),
        inputs.key_features_used < config.min_key_features,
        inputs.usage_trend < 0.0,
        inputs.average_session_duration < config.short_session_seconds,
    ];
    let present = factors.iter().filter(|f| **f).count();
    present as f64 / factors.len() as f64
}

/// Number of configured key features present in `used`
pub fn key_features_used(used: &BTreeSet<String>, config: &AggregatorConfig) -> usize {
    config
        .key_features
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|name| used.contains(*name))
        .count()
}

/// `min(value / cap, 1)`. A non-positive or NaN cap contributes nothing.
fn saturate(value: u32, cap: f64) -> f64 {
    if cap.is_nan() || cap <= 0.0 {
        return 0.0;
    }
    (value as f64 / cap).min(1.0)
}
