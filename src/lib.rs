//! churn-tracker - Behavioral metrics engine for user analytics
//!
//! Tracking events (sessions, feature usage, user profile updates) are
//! persisted to an event store, and each user's behavioral indicators are
//! recomputed wholesale from their raw history:
//! history → activity windows → formulas → metrics record → upsert.
//!
//! ## Modules
//!
//! - **Aggregator**: Derive and persist `BehavioralMetrics` for one user
//! - **Ingestion**: Validate and persist tracking events, then recompute
//! - **Store**: The `EventStore` contract and an in-memory implementation

pub mod aggregator;
pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod store;
pub mod types;
pub mod windows;

pub use aggregator::{derive_metrics, MetricsAggregator};
pub use config::AggregatorConfig;
pub use error::ChurnError;
pub use ingest::{TrackOutcome, Tracker, TrackingEvent};
pub use store::{EventStore, InMemoryEventStore, StoreSnapshot};
pub use types::{
    BehavioralMetrics, FeatureAnalytics, FeatureUsage, FeatureUsageEvent, Session, TimeOfDay,
    TimeOfDayCounts, UserProfile, UserStatus, WeekdayCounts,
};

/// Crate version, reported by the CLI
pub const TRACKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "churn-tracker";
