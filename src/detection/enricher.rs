//! Rule-based risk enrichment
//!
//! Adds a fixed weight for every behavioural flag raised on an event and
//! maps the capped total onto a risk level.

use crate::models::event::{
    LARGE_DATA_TRANSFER, PRIVILEGED_ACTION, RISK_LEVEL, RISK_SCORE, SENSITIVE_DATA_ACCESS,
    UNUSUAL_TIME,
};
use crate::models::{Event, RiskLevel};

pub const MAX_RISK_SCORE: u32 = 100;

/// Flag name and the weight it contributes when set
pub const FLAG_WEIGHTS: [(&str, u32); 4] = [
    (SENSITIVE_DATA_ACCESS, 30),
    (UNUSUAL_TIME, 20),
    (LARGE_DATA_TRANSFER, 40),
    (PRIVILEGED_ACTION, 25),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub risk_score: u8,
    pub risk_level: RiskLevel,
}

/// Stateless rule-based scorer
#[derive(Debug, Clone, Default)]
pub struct RiskEnricher;

impl RiskEnricher {
    pub fn new() -> Self {
        RiskEnricher
    }

    /// Score an event without touching it
    pub fn assess(&self, event: &Event) -> RiskAssessment {
        let risk_score = Self::calculate_risk_score(event);
        RiskAssessment {
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
        }
    }

    /// Return a copy of the event carrying `risk_score` and `risk_level`
    pub fn enrich(&self, event: &Event) -> Event {
        let assessment = self.assess(event);
        let mut enriched = event.clone();
        enriched.set(RISK_SCORE, assessment.risk_score);
        enriched.set(RISK_LEVEL, assessment.risk_level.as_str());
        enriched
    }

    pub fn calculate_risk_score(event: &Event) -> u8 {
        let total: u32 = FLAG_WEIGHTS
            .iter()
            .filter(|(flag, _)| event.flag(flag))
            .map(|(_, weight)| weight)
            .sum();
        total.min(MAX_RISK_SCORE) as u8
    }
}
