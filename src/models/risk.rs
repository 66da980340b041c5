use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::event::{Event, EventError};

pub const HIGH_THRESHOLD: u8 = 70;
pub const MEDIUM_THRESHOLD: u8 = 40;

/// Categorical severity derived from the rule-based score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Thresholds are inclusive on the lower bound
    pub fn from_score(score: u8) -> Self {
        if score >= HIGH_THRESHOLD {
            RiskLevel::High
        } else if score >= MEDIUM_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Outcome of scoring an event against its actor's baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    /// Evaluation order: access count, transfer size, hour, sensitive data
    pub reasons: Vec<String>,
}

/// Five-column projection written to every destination table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEventRecord {
    pub actor_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
}

impl RiskEventRecord {
    /// Project an enriched event. The level is recomputed from the score
    /// so the two columns never disagree.
    pub fn from_event(event: &Event) -> Result<Self, EventError> {
        let risk_score = event.risk_score().clamp(0.0, 100.0);
        Ok(RiskEventRecord {
            actor_id: event.actor_id().to_string(),
            event_type: event.event_type().to_string(),
            timestamp: event.timestamp()?,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score as u8),
        })
    }
}
