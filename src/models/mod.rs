pub mod event;
pub mod risk;

pub use event::{Event, EventError};
pub use risk::{AnomalyResult, RiskEventRecord, RiskLevel};
