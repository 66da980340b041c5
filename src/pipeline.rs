//! Scoring pipeline
//!
//! raw line -> enrich -> anomaly score -> route -> append to every
//! destination table. Failures stay local to the record or table they
//! concern; the rest of the batch carries on.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::detection::{BaselineDetector, Category, EventRouter, RiskEnricher};
use crate::input::{read_events, InputError};
use crate::models::{AnomalyResult, Event, RiskEventRecord, RiskLevel};
use crate::persistence::{BaselineStore, EventSink, PersistenceError, ALL_EVENTS_TABLE};

/// Errors raised while setting up a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Build the detector described by `config`
///
/// Trains from `history_path` when the file exists, storing the result if
/// `persist_baselines` is set. Otherwise stored baselines are restored, and
/// without either every actor is scored as unknown.
pub fn load_detector(
    config: &DetectionConfig,
    store: &dyn BaselineStore,
) -> Result<BaselineDetector, PipelineError> {
    let detector = BaselineDetector::new();
    if !config.enable_anomaly_detection {
        log::info!("Anomaly detection disabled");
        return Ok(detector);
    }

    match config.history_path {
        Some(ref path) if path.exists() => {
            let history = read_events(path)?;
            log::info!("Training from {:?}", path);
            detector.train(&history);
            if config.persist_baselines {
                store.save_baselines(&detector.snapshot())?;
            }
        }
        _ if config.persist_baselines => {
            let baselines = store.load_baselines()?;
            log::info!("Restored baselines for {} actor(s)", baselines.len());
            detector.replace_baselines(baselines);
        }
        _ => {
            log::warn!("No training history available, every actor is unknown");
        }
    }

    Ok(detector)
}

/// A fully scored event and where it was routed
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEvent {
    /// Original fields plus every score attached by the pipeline
    pub event: Event,
    pub anomaly: AnomalyResult,
    pub combined_risk_score: f64,
    pub categories: Vec<Category>,
}

impl ScoredEvent {
    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_score(self.event.risk_score().clamp(0.0, 100.0) as u8)
    }

    /// Anomalous or HIGH risk
    pub fn is_flagged(&self) -> bool {
        self.anomaly.is_anomaly || self.risk_level() == RiskLevel::High
    }
}

/// Counters for one or more processed batches
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub received: usize,
    /// Lines that were not a JSON object
    pub dropped: usize,
    pub scored: usize,
    pub anomalies: usize,
    /// Scored events that could not be projected to a table row
    pub skipped_records: usize,
    pub rows_written: BTreeMap<String, usize>,
    pub failed_writes: usize,
}

impl PipelineStats {
    pub fn merge(&mut self, other: &PipelineStats) {
        self.received += other.received;
        self.dropped += other.dropped;
        self.scored += other.scored;
        self.anomalies += other.anomalies;
        self.skipped_records += other.skipped_records;
        self.failed_writes += other.failed_writes;
        for (table, rows) in &other.rows_written {
            *self.rows_written.entry(table.clone()).or_insert(0) += rows;
        }
    }
}

/// Result of processing a batch
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub scored: Vec<ScoredEvent>,
    pub stats: PipelineStats,
}

/// Enrich, score, route and persist events
pub struct RiskPipeline {
    enricher: RiskEnricher,
    detector: Arc<BaselineDetector>,
    router: EventRouter,
    sink: Arc<dyn EventSink>,
    all_events_table: Option<String>,
}

impl RiskPipeline {
    /// Create a pipeline writing category tables plus `risk_events`
    pub fn new(detector: Arc<BaselineDetector>, sink: Arc<dyn EventSink>) -> Self {
        RiskPipeline {
            enricher: RiskEnricher::new(),
            detector,
            router: EventRouter::new(),
            sink,
            all_events_table: Some(ALL_EVENTS_TABLE.to_string()),
        }
    }

    /// Change or disable (`None`) the table receiving every event
    pub fn with_all_events_table(mut self, table: Option<String>) -> Self {
        self.all_events_table = table;
        self
    }

    pub fn detector(&self) -> &Arc<BaselineDetector> {
        &self.detector
    }

    /// Parse one input line, logging and dropping anything that is not a
    /// JSON object
    pub fn parse_line(line: &str) -> Option<Event> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match Event::from_json(trimmed) {
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("Dropping malformed event: {}", e);
                None
            }
        }
    }

    /// Score a single event without persisting it
    pub fn score(&self, event: &Event) -> ScoredEvent {
        let enriched = self.enricher.enrich(event);
        let anomaly = self.detector.predict(&enriched);
        let combined_risk_score = BaselineDetector::combine(&enriched, &anomaly);
        let categories = self.router.classify(&enriched);

        ScoredEvent {
            event: BaselineDetector::attach(&enriched, &anomaly),
            anomaly,
            combined_risk_score,
            categories,
        }
    }

    /// Parse, score and persist raw lines
    pub fn process_lines<S: AsRef<str>>(&self, lines: &[S]) -> BatchOutcome {
        let mut dropped = 0;
        let events: Vec<Event> = lines
            .iter()
            .map(AsRef::as_ref)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let parsed = Self::parse_line(line);
                if parsed.is_none() {
                    dropped += 1;
                }
                parsed
            })
            .collect();

        let mut outcome = self.process_batch(&events);
        outcome.stats.received += dropped;
        outcome.stats.dropped += dropped;
        outcome
    }

    /// Score and persist already parsed events
    pub fn process_batch(&self, events: &[Event]) -> BatchOutcome {
        let mut stats = PipelineStats {
            received: events.len(),
            ..Default::default()
        };
        let mut per_table: BTreeMap<String, Vec<RiskEventRecord>> = BTreeMap::new();
        let mut scored = Vec::with_capacity(events.len());

        for event in events {
            let result = self.score(event);
            stats.scored += 1;
            if result.anomaly.is_anomaly {
                stats.anomalies += 1;
                log::info!(
                    "Anomalous event for actor '{}': {}",
                    result.event.actor_id(),
                    result.anomaly.reasons.join("; ")
                );
            }

            match RiskEventRecord::from_event(&result.event) {
                Ok(record) => {
                    for category in &result.categories {
                        per_table
                            .entry(category.table_name().to_string())
                            .or_default()
                            .push(record.clone());
                    }
                    if let Some(ref table) = self.all_events_table {
                        per_table.entry(table.clone()).or_default().push(record);
                    }
                }
                Err(e) => {
                    stats.skipped_records += 1;
                    log::warn!(
                        "Not persisting event for actor '{}': {}",
                        result.event.actor_id(),
                        e
                    );
                }
            }

            scored.push(result);
        }

        for (table, records) in per_table {
            match self.sink.append(&table, &records) {
                Ok(written) => {
                    *stats.rows_written.entry(table).or_insert(0) += written;
                }
                Err(e) => {
                    stats.failed_writes += 1;
                    log::error!("Failed to append {} row(s) to {}: {}", records.len(), table, e);
                }
            }
        }

        BatchOutcome { scored, stats }
    }
}
