//! Core data types
//!
//! Raw tracking records (sessions, feature usage, user profiles) and the
//! derived per-user behavioral metrics record.

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Delimiter used for the persisted form of `core_features_used`
pub const FEATURE_SET_DELIMITER: char = ',';

/// One user activity session, reported when the session ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    /// Session start (UTC)
    pub started_at: DateTime<Utc>,
    /// Session length in seconds. Not validated by the aggregator.
    pub duration_seconds: i64,
}

/// One occurrence of a named feature being used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUsageEvent {
    pub user_id: String,
    pub feature_name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Account status reported by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
        }
    }
}

/// User profile, keyed by `user_id` and looked up by email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: String,
    /// Subscription plan (e.g. "free", "pro")
    pub plan_type: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived behavioral indicators for a single user.
///
/// Always recomputed wholesale from the user's session and feature history;
/// never patched incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralMetrics {
    pub user_id: String,
    /// Distinct days with a session in the current calendar month
    pub daily_active_days: u32,
    /// Distinct days with a session in the current ISO week
    pub weekly_active_days: u32,
    /// Truncated mean session duration in seconds
    pub average_session_duration: i64,
    /// Number of distinct features ever used
    pub features_used: u32,
    /// Distinct feature names, persisted as a delimited string
    #[serde(with = "feature_set")]
    pub core_features_used: BTreeSet<String>,
    /// `(this_week - last_week) / (last_week + 1)` session counts
    pub usage_trend: f64,
    /// Whole days since the latest session; `None` if the user never had one
    pub inactive_days: Option<i64>,
    /// Weighted activity/feature breadth composite, nominally 0-1
    pub engagement_score: f64,
    /// Share of churn risk factors present (0-1)
    pub churn_risk_score: f64,
    pub last_seen_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BehavioralMetrics {
    /// Whether two records carry the same derived values, ignoring the
    /// computation timestamps.
    pub fn same_indicators(&self, other: &BehavioralMetrics) -> bool {
        self.user_id == other.user_id
            && self.daily_active_days == other.daily_active_days
            && self.weekly_active_days == other.weekly_active_days
            && self.average_session_duration == other.average_session_duration
            && self.features_used == other.features_used
            && self.core_features_used == other.core_features_used
            && self.usage_trend == other.usage_trend
            && self.inactive_days == other.inactive_days
            && self.engagement_score == other.engagement_score
            && self.churn_risk_score == other.churn_risk_score
    }
}

/// Time-of-day bucket for feature usage (UTC hour)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    /// 05:00 to 11:59
    Morning,
    /// 12:00 to 16:59
    Afternoon,
    /// 17:00 to 21:59
    Evening,
    /// 22:00 to 04:59
    Night,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            17..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }
}

/// Usage counts per time of day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDayCounts {
    pub morning: u64,
    pub afternoon: u64,
    pub evening: u64,
    pub night: u64,
}

impl TimeOfDayCounts {
    pub fn record(&mut self, bucket: TimeOfDay) {
        match bucket {
            TimeOfDay::Morning => self.morning += 1,
            TimeOfDay::Afternoon => self.afternoon += 1,
            TimeOfDay::Evening => self.evening += 1,
            TimeOfDay::Night => self.night += 1,
        }
    }
}

/// Usage counts per weekday
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdayCounts {
    pub mon: u64,
    pub tue: u64,
    pub wed: u64,
    pub thu: u64,
    pub fri: u64,
    pub sat: u64,
    pub sun: u64,
}

impl WeekdayCounts {
    pub fn record(&mut self, day: Weekday) {
        let slot = match day {
            Weekday::Mon => &mut self.mon,
            Weekday::Tue => &mut self.tue,
            Weekday::Wed => &mut self.wed,
            Weekday::Thu => &mut self.thu,
            Weekday::Fri => &mut self.fri,
            Weekday::Sat => &mut self.sat,
            Weekday::Sun => &mut self.sun,
        };
        *slot += 1;
    }
}

/// One user's usage of one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUsage {
    pub feature_name: String,
    pub usage_count: u64,
    pub first_used_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Usage of one feature across all users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAnalytics {
    pub feature_name: String,
    pub total_usage_count: u64,
    pub unique_users_count: u64,
    pub peak_usage_times: TimeOfDayCounts,
    pub usage_by_day: WeekdayCounts,
}

/// Serialize a feature set as a single delimited string.
///
/// Names are escaped so any set round-trips: `\` and the delimiter get a
/// backslash prefix, and an empty name is written as `\-`. The empty set is
/// `""`.
pub mod feature_set {
    use super::FEATURE_SET_DELIMITER;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeSet;

    const ESCAPE: char = '\\';
    const EMPTY_NAME: char = '-';

    pub fn encode(set: &BTreeSet<String>) -> String {
        let mut out = String::new();
        for (i, name) in set.iter().enumerate() {
            if i > 0 {
                out.push(FEATURE_SET_DELIMITER);
            }
            if name.is_empty() {
                out.push(ESCAPE);
                out.push(EMPTY_NAME);
            }
            for c in name.chars() {
                if c == ESCAPE || c == FEATURE_SET_DELIMITER {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        out
    }

    pub fn decode(raw: &str) -> BTreeSet<String> {
        let mut set = BTreeSet::new();
        if raw.is_empty() {
            return set;
        }

        let mut current = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                ESCAPE => match chars.next() {
                    Some(EMPTY_NAME) | None => {}
                    Some(escaped) => current.push(escaped),
                },
                FEATURE_SET_DELIMITER => {
                    set.insert(std::mem::take(&mut current));
                }
                other => current.push(other),
            }
        }
        set.insert(current);
        set
    }

    pub fn serialize<S>(set: &BTreeSet<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode(set))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(decode(&raw))
    }
}
