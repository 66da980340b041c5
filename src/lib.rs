pub mod config;
pub mod detection;
pub mod input;
pub mod models;
pub mod output;
pub mod persistence;
pub mod alerting;
pub mod pipeline;

// Re-export commonly used types
pub use models::{Event, AnomalyResult, RiskEventRecord, RiskLevel};
pub use detection::{BaselineDetector, RiskEnricher, EventRouter, Category};
pub use persistence::{EventSink, RiskQuery, BaselineStore, SqliteEventStore};
pub use pipeline::{RiskPipeline, ScoredEvent, PipelineStats};
pub use alerting::{AlertDispatcher, AlertQueue, AlertConfig, RiskAlert};
