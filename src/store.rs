//! Event store abstraction
//!
//! `EventStore` is the only way the aggregator and the ingestion layer touch
//! persisted data. `InMemoryEventStore` is the bundled implementation; its
//! contents can be snapshotted to JSON between runs.

use crate::error::ChurnError;
use crate::types::{BehavioralMetrics, FeatureUsageEvent, Session, UserProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Record store for raw tracking events and derived metrics.
///
/// Implementations must make `upsert_behavioral_metrics` all-or-nothing: on
/// failure the previously stored record stays in place.
pub trait EventStore: Send + Sync {
    /// All sessions recorded for a user
    fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ChurnError>;

    /// All feature usage events recorded for a user
    fn list_feature_events(&self, user_id: &str) -> Result<Vec<FeatureUsageEvent>, ChurnError>;

    /// Feature usage events for one feature name, across all users
    fn list_feature_events_by_name(
        &self,
        feature_name: &str,
    ) -> Result<Vec<FeatureUsageEvent>, ChurnError>;

    /// Replace the derived metrics record for a user
    fn upsert_behavioral_metrics(
        &self,
        user_id: &str,
        metrics: &BehavioralMetrics,
    ) -> Result<(), ChurnError>;

    /// The last stored derived metrics record, if any
    fn get_behavioral_metrics(&self, user_id: &str)
        -> Result<Option<BehavioralMetrics>, ChurnError>;

    fn append_session(&self, session: Session) -> Result<(), ChurnError>;

    fn append_feature_event(&self, event: FeatureUsageEvent) -> Result<(), ChurnError>;

    fn find_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, ChurnError>;

    fn upsert_user(&self, profile: UserProfile) -> Result<(), ChurnError>;
}

/// Serializable contents of an `InMemoryEventStore`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub users: BTreeMap<String, UserProfile>,
    pub sessions: BTreeMap<String, Vec<Session>>,
    pub feature_events: BTreeMap<String, Vec<FeatureUsageEvent>>,
    pub behavioral_metrics: BTreeMap<String, BehavioralMetrics>,
}

/// Summary counts for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub users: usize,
    pub sessions: usize,
    pub feature_events: usize,
    pub metrics_records: usize,
}

/// Thread-safe in-process event store
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<StoreSnapshot>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Serialize the store contents to JSON
    pub fn to_json(&self) -> Result<String, ChurnError> {
        let state = self.read()?;
        Ok(serde_json::to_string_pretty(&*state)?)
    }

    /// Restore a store from JSON produced by `to_json`
    ///
    /// Malformed input is reported as `DataAccess`: the persisted data is
    /// unreadable, not the caller's request.
    pub fn from_json(json: &str) -> Result<Self, ChurnError> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)
            .map_err(|e| ChurnError::DataAccess(format!("corrupt store snapshot: {}", e)))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Load a store file
    pub fn load(path: &Path) -> Result<Self, ChurnError> {
        let json = fs::read_to_string(path).map_err(|e| {
            ChurnError::DataAccess(format!("Cannot read store {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Load a store file, or start empty if it does not exist yet
    pub fn open(path: &Path) -> Result<Self, ChurnError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "store file not found, starting empty");
            Ok(Self::new())
        }
    }

    /// Write the store contents to a file
    ///
    /// The snapshot goes to a sibling `.tmp` file that is then renamed over
    /// `path`, so a failed save leaves the previous file intact.
    pub fn save(&self, path: &Path) -> Result<(), ChurnError> {
        let json = self.to_json()?;
        let tmp_path = temp_path_for(path);

        let result = fs::write(&tmp_path, json).and_then(|_| fs::rename(&tmp_path, path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(ChurnError::DataAccess(format!(
                "Cannot write store {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, ChurnError> {
        let state = self.read()?;
        Ok(StoreStats {
            users: state.users.len(),
            sessions: state.sessions.values().map(Vec::len).sum(),
            feature_events: state.feature_events.values().map(Vec::len).sum(),
            metrics_records: state.behavioral_metrics.len(),
        })
    }

    /// Every user id that has a profile or any recorded activity
    pub fn known_user_ids(&self) -> Result<Vec<String>, ChurnError> {
        let state = self.read()?;
        let mut ids: Vec<String> = state
            .users
            .keys()
            .chain(state.sessions.keys())
            .chain(state.feature_events.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreSnapshot>, ChurnError> {
        self.state
            .read()
            .map_err(|_| ChurnError::DataAccess("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreSnapshot>, ChurnError> {
        self.state
            .write()
            .map_err(|_| ChurnError::DataAccess("store lock poisoned".to_string()))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

impl EventStore for InMemoryEventStore {
    fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ChurnError> {
        Ok(self
            .read()?
            .sessions
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    fn list_feature_events(&self, user_id: &str) -> Result<Vec<FeatureUsageEvent>, ChurnError> {
        Ok(self
            .read()?
            .feature_events
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    fn list_feature_events_by_name(
        &self,
        feature_name: &str,
    ) -> Result<Vec<FeatureUsageEvent>, ChurnError> {
        Ok(self
            .read()?
            .feature_events
            .values()
            .flatten()
            .filter(|e| e.feature_name == feature_name)
            .cloned()
            .collect())
    }

    fn upsert_behavioral_metrics(
        &self,
        user_id: &str,
        metrics: &BehavioralMetrics,
    ) -> Result<(), ChurnError> {
        self.write()?
            .behavioral_metrics
            .insert(user_id.to_string(), metrics.clone());
        Ok(())
    }

    fn get_behavioral_metrics(
        &self,
        user_id: &str,
    ) -> Result<Option<BehavioralMetrics>, ChurnError> {
        Ok(self.read()?.behavioral_metrics.get(user_id).cloned())
    }

    fn append_session(&self, session: Session) -> Result<(), ChurnError> {
        self.write()?
            .sessions
            .entry(session.user_id.clone())
            .or_default()
            .push(session);
        Ok(())
    }

    fn append_feature_event(&self, event: FeatureUsageEvent) -> Result<(), ChurnError> {
        self.write()?
            .feature_events
            .entry(event.user_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<UserProfile>, ChurnError> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    fn upsert_user(&self, profile: UserProfile) -> Result<(), ChurnError> {
        self.write()?
            .users
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserStatus;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn sample_session(user_id: &str, duration_seconds: i64) -> Session {
        Session {
            user_id: user_id.to_string(),
            started_at: Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap(),
            duration_seconds,
        }
    }

    fn sample_user(user_id: &str, email: &str) -> UserProfile {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        UserProfile {
            user_id: user_id.to_string(),
            email: email.to_string(),
            plan_type: "free".to_string(),
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_sessions_are_scoped_by_user() {
        let store = InMemoryEventStore::new();
        store.append_session(sample_session("a", 10)).unwrap();
        store.append_session(sample_session("a", 20)).unwrap();
        store.append_session(sample_session("b", 30)).unwrap();

        assert_eq!(store.list_sessions("a").unwrap().len(), 2);
        assert_eq!(store.list_sessions("b").unwrap().len(), 1);
        assert!(store.list_sessions("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_find_user_by_email_is_case_insensitive() {
        let store = InMemoryEventStore::new();
        store.upsert_user(sample_user("u1", "Ada@Example.com")).unwrap();

        let found = store.find_user_by_email("ada@example.com").unwrap();
        assert_eq!(found.map(|u| u.user_id), Some("u1".to_string()));
        assert!(store.find_user_by_email("bob@example.com").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = InMemoryEventStore::new();
        store.upsert_user(sample_user("u1", "ada@example.com")).unwrap();
        store.append_session(sample_session("u1", 42)).unwrap();

        let json = store.to_json().unwrap();
        let restored = InMemoryEventStore::from_json(&json).unwrap();

        assert_eq!(restored.list_sessions("u1").unwrap(), store.list_sessions("u1").unwrap());
        assert_eq!(restored.stats().unwrap(), store.stats().unwrap());
    }

    #[test]
    fn test_known_user_ids_deduplicated() {
        let store = InMemoryEventStore::new();
        store.upsert_user(sample_user("u1", "ada@example.com")).unwrap();
        store.append_session(sample_session("u1", 42)).unwrap();
        store.append_session(sample_session("u2", 42)).unwrap();

        assert_eq!(store.known_user_ids().unwrap(), vec!["u1", "u2"]);
    }

    #[test]
    fn test_empty_json_object_is_empty_store() {
        let store = InMemoryEventStore::from_json("{}").unwrap();
        assert_eq!(store.stats().unwrap(), StoreStats::default());
    }

    #[test]
    fn test_corrupt_snapshot_is_data_access_error() {
        let result = InMemoryEventStore::from_json("{\"sessions\": [1, 2");
        assert!(matches!(result, Err(ChurnError::DataAccess(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();
        let result = InMemoryEventStore::open(&path);
        assert!(result.unwrap_err().is_data_access());
    }

    #[test]
    fn test_save_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = InMemoryEventStore::new();
        store.append_session(sample_session("u1", 42)).unwrap();

        store.save(&path).unwrap();
        let reopened = InMemoryEventStore::open(&path).unwrap();

        assert_eq!(reopened.list_sessions("u1").unwrap().len(), 1);
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = InMemoryEventStore::new();
        store.append_session(sample_session("u1", 42)).unwrap();
        store.save(&path).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // A directory at the temp path makes the write fail
        fs::create_dir(temp_path_for(&path)).unwrap();
        store.append_session(sample_session("u2", 7)).unwrap();
        let result = store.save(&path);

        assert!(matches!(result, Err(ChurnError::DataAccess(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_feature_events_by_name_spans_users() {
        let store = InMemoryEventStore::new();
        let occurred_at = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
        for (user_id, name) in [("a", "export"), ("b", "export"), ("b", "search")] {
            store
                .append_feature_event(FeatureUsageEvent {
                    user_id: user_id.to_string(),
                    feature_name: name.to_string(),
                    occurred_at,
                })
                .unwrap();
        }

        let events = store.list_feature_events_by_name("export").unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.feature_name == "export"));
        assert!(store.list_feature_events_by_name("reports").unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_file_is_data_access_error() {
        let path = std::env::temp_dir().join("churn-tracker-missing-store-7f3a.json");
        let result = InMemoryEventStore::load(&path);
        assert!(matches!(result, Err(ChurnError::DataAccess(_))));
    }
}
