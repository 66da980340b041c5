//! Persistence module for scored events and baselines
//!
//! Destination tables are append-only: a write creates the table when it
//! is missing and otherwise adds rows, it never rewrites existing ones.

pub mod sqlite_store;

pub use sqlite_store::SqliteEventStore;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detection::ActorBaseline;
use crate::models::{RiskEventRecord, RiskLevel};

/// Table receiving every scored event, backing the query interface
pub const ALL_EVENTS_TABLE: &str = "risk_events";

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-day, per-level aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRiskSummary {
    pub date: NaiveDate,
    pub risk_level: RiskLevel,
    pub event_count: u64,
    pub avg_risk_score: f64,
    pub max_risk_score: f64,
}

/// Per-actor aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorRiskProfile {
    pub actor_id: String,
    pub total_events: u64,
    pub avg_risk_score: f64,
    pub max_risk_score: f64,
    pub high_risk_events: u64,
}

/// Destination for scored event records
pub trait EventSink: Send + Sync {
    /// Append records to `table`, creating it if needed
    ///
    /// Returns the number of rows written.
    fn append(&self, table: &str, records: &[RiskEventRecord]) -> Result<usize, PersistenceError>;
}

/// Read side over an event table
pub trait RiskQuery: Send + Sync {
    /// Most recent events first, optionally restricted to one level
    fn recent_events(
        &self,
        limit: usize,
        risk_level: Option<RiskLevel>,
    ) -> Result<Vec<RiskEventRecord>, PersistenceError>;

    /// Daily aggregates for events at or after `cutoff`, newest day first
    fn risk_summary_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DailyRiskSummary>, PersistenceError>;

    /// Daily aggregates over the trailing `days`
    fn risk_summary(&self, days: i64) -> Result<Vec<DailyRiskSummary>, PersistenceError> {
        self.risk_summary_since(Utc::now() - chrono::Duration::days(days))
    }

    /// Aggregates for one actor, `None` when the actor has no events
    fn actor_risk_profile(
        &self,
        actor_id: &str,
    ) -> Result<Option<ActorRiskProfile>, PersistenceError>;
}

/// Storage for trained baselines
pub trait BaselineStore: Send + Sync {
    /// Replace the stored baselines with `baselines`
    fn save_baselines(
        &self,
        baselines: &HashMap<String, ActorBaseline>,
    ) -> Result<(), PersistenceError>;

    fn load_baselines(&self) -> Result<HashMap<String, ActorBaseline>, PersistenceError>;
}
