//! Per-actor baseline anomaly detection
//!
//! Training summarises each actor's history (access volume, transfer size,
//! hours of activity). Prediction measures how far a new event deviates from
//! that summary and explains every check that fired.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::event::{
    COMBINED_RISK_SCORE, ML_ANOMALY_SCORE, ML_IS_ANOMALY, ML_REASONS, SENSITIVE_DATA_ACCESS,
};
use crate::models::{AnomalyResult, Event};

pub const Z_SCORE_THRESHOLD: f64 = 2.0;
pub const ACCESS_WEIGHT: f64 = 0.3;
pub const TRANSFER_WEIGHT: f64 = 0.4;
pub const HOUR_WEIGHT: f64 = 0.2;
pub const SENSITIVE_WEIGHT: f64 = 0.1;
pub const ANOMALY_THRESHOLD: f64 = 0.5;

pub const ANOMALY_SHARE: f64 = 0.6;
pub const RULE_SHARE: f64 = 0.4;

pub const UNKNOWN_ACTOR_REASON: &str = "User not in training data";

/// Immutable map of actor id to baseline
pub type BaselineSnapshot = Arc<HashMap<String, ActorBaseline>>;

/// Statistical summary of one actor's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorBaseline {
    pub mean_access_count: f64,
    pub std_access_count: f64,
    pub mean_transfer_size: f64,
    pub std_transfer_size: f64,
    pub normal_hours: BTreeSet<i64>,
}

impl ActorBaseline {
    /// Summarise a set of events belonging to one actor
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut access_counts = Vec::new();
        let mut transfer_sizes = Vec::new();
        let mut normal_hours = BTreeSet::new();

        for event in events {
            access_counts.push(event.file_access_count());
            transfer_sizes.push(event.data_transfer_size_mb());
            normal_hours.insert(event.hour_of_day());
        }

        let (mean_access_count, std_access_count) = mean_and_std(&access_counts);
        let (mean_transfer_size, std_transfer_size) = mean_and_std(&transfer_sizes);

        ActorBaseline {
            mean_access_count,
            std_access_count,
            mean_transfer_size,
            std_transfer_size,
            normal_hours,
        }
    }
}

/// Mean and population standard deviation; (0, 0) for an empty slice
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// `Some(z)` when the baseline has spread, `None` otherwise
fn z_score(value: f64, mean: f64, std: f64) -> Option<f64> {
    if std > 0.0 {
        Some(((value - mean) / std).abs())
    } else {
        None
    }
}

/// Baseline anomaly detector
///
/// Baselines are published as a whole snapshot. Readers clone the `Arc`
/// and score without holding the lock, so retraining never disturbs
/// predictions already in flight.
pub struct BaselineDetector {
    baselines: RwLock<BaselineSnapshot>,
    /// Set by the first `train` or `replace_baselines`, even an empty one
    trained: AtomicBool,
}

impl BaselineDetector {
    /// Create an untrained detector
    pub fn new() -> Self {
        BaselineDetector {
            baselines: RwLock::new(Arc::new(HashMap::new())),
            trained: AtomicBool::new(false),
        }
    }

    /// Create a detector from previously computed baselines
    pub fn from_baselines(baselines: HashMap<String, ActorBaseline>) -> Self {
        BaselineDetector {
            baselines: RwLock::new(Arc::new(baselines)),
            trained: AtomicBool::new(true),
        }
    }

    /// Learn baselines from historical events
    ///
    /// Every actor present in `historical_events` gets a freshly computed
    /// baseline; actors absent from the batch keep their previous one.
    pub fn train(&self, historical_events: &[Event]) {
        let mut grouped: HashMap<&str, Vec<&Event>> = HashMap::new();
        for event in historical_events {
            grouped.entry(event.actor_id()).or_default().push(event);
        }

        let trained: Vec<(String, ActorBaseline)> = grouped
            .into_iter()
            .map(|(actor, events)| (actor.to_string(), ActorBaseline::from_events(events)))
            .collect();

        let mut guard = self.baselines.write();
        let mut next = HashMap::clone(&guard);
        let actors = trained.len();
        next.extend(trained);
        *guard = Arc::new(next);
        self.trained.store(true, Ordering::SeqCst);

        log::info!(
            "Trained baselines for {} actor(s) from {} event(s)",
            actors,
            historical_events.len()
        );
    }

    /// Replace every baseline at once
    pub fn replace_baselines(&self, baselines: HashMap<String, ActorBaseline>) {
        *self.baselines.write() = Arc::new(baselines);
        self.trained.store(true, Ordering::SeqCst);
    }

    /// Current immutable view of all baselines
    pub fn snapshot(&self) -> BaselineSnapshot {
        Arc::clone(&self.baselines.read())
    }

    pub fn baseline(&self, actor_id: &str) -> Option<ActorBaseline> {
        self.snapshot().get(actor_id).cloned()
    }

    pub fn actor_count(&self) -> usize {
        self.baselines.read().len()
    }

    /// Whether training has happened, regardless of how many actors it saw
    pub fn is_trained(&self) -> bool {
        self.trained.load(Ordering::SeqCst)
    }

    /// Score an event against its actor's baseline
    pub fn predict(&self, event: &Event) -> AnomalyResult {
        let snapshot = self.snapshot();
        let baseline = match snapshot.get(event.actor_id()) {
            Some(baseline) => baseline,
            None => {
                return AnomalyResult {
                    is_anomaly: false,
                    anomaly_score: 0.0,
                    reasons: vec![UNKNOWN_ACTOR_REASON.to_string()],
                }
            }
        };

        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        if let Some(z) = z_score(
            event.file_access_count(),
            baseline.mean_access_count,
            baseline.std_access_count,
        ) {
            if z > Z_SCORE_THRESHOLD {
                score += ACCESS_WEIGHT;
                reasons.push(format!("Unusual access volume (z-score: {:.2})", z));
            }
        }

        if let Some(z) = z_score(
            event.data_transfer_size_mb(),
            baseline.mean_transfer_size,
            baseline.std_transfer_size,
        ) {
            if z > Z_SCORE_THRESHOLD {
                score += TRANSFER_WEIGHT;
                reasons.push(format!("Unusual data transfer (z-score: {:.2})", z));
            }
        }

        let hour = event.hour_of_day();
        if !baseline.normal_hours.contains(&hour) {
            score += HOUR_WEIGHT;
            reasons.push(format!("Access outside normal hours (hour: {})", hour));
        }

        if event.flag(SENSITIVE_DATA_ACCESS) {
            score += SENSITIVE_WEIGHT;
            reasons.push("Sensitive data access".to_string());
        }

        // Threshold applies to the uncapped total
        AnomalyResult {
            is_anomaly: score > ANOMALY_THRESHOLD,
            anomaly_score: score.min(1.0),
            reasons,
        }
    }

    /// Blend the anomaly score with the event's rule-based risk score
    pub fn combine(event: &Event, result: &AnomalyResult) -> f64 {
        let rule_based = event.risk_score() / 100.0;
        result.anomaly_score * ANOMALY_SHARE + rule_based * RULE_SHARE
    }

    /// Return a copy of the event carrying the anomaly fields and combined score
    pub fn enhance(&self, event: &Event) -> Event {
        let result = self.predict(event);
        Self::attach(event, &result)
    }

    /// Copy `event` and attach an already computed result
    pub fn attach(event: &Event, result: &AnomalyResult) -> Event {
        let combined = Self::combine(event, result);

        let mut enhanced = event.clone();
        enhanced.set(ML_ANOMALY_SCORE, result.anomaly_score);
        enhanced.set(ML_IS_ANOMALY, result.is_anomaly);
        enhanced.set(ML_REASONS, result.reasons.clone());
        enhanced.set(COMBINED_RISK_SCORE, combined);
        enhanced
    }
}

impl Default for BaselineDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{
        ACTOR_ID, DATA_TRANSFER_SIZE_MB, FILE_ACCESS_COUNT, HOUR_OF_DAY, RISK_SCORE,
    };

    fn history_event(actor: &str, access: f64, transfer: f64, hour: i64) -> Event {
        Event::new()
            .with(ACTOR_ID, actor)
            .with(FILE_ACCESS_COUNT, access)
            .with(DATA_TRANSFER_SIZE_MB, transfer)
            .with(HOUR_OF_DAY, hour)
    }

    fn trained_detector() -> BaselineDetector {
        let detector = BaselineDetector::new();
        detector.train(&[
            history_event("user1", 10.0, 5.0, 9),
            history_event("user1", 12.0, 7.0, 10),
            history_event("user1", 8.0, 3.0, 14),
            history_event("user2", 50.0, 20.0, 11),
            history_event("user2", 45.0, 18.0, 12),
        ]);
        detector
    }

    fn baseline_with(mean_access: f64, std_access: f64) -> ActorBaseline {
        ActorBaseline {
            mean_access_count: mean_access,
            std_access_count: std_access,
            mean_transfer_size: 0.0,
            std_transfer_size: 0.0,
            normal_hours: BTreeSet::from([12]),
        }
    }

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean_and_std(&[]), (0.0, 0.0));
        assert_eq!(mean_and_std(&[7.0]), (7.0, 0.0));

        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_statistics() {
        let detector = trained_detector();
        let baseline = detector.baseline("user1").unwrap();

        assert!((baseline.mean_access_count - 10.0).abs() < 1e-9);
        assert!((baseline.std_access_count - (8.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!((baseline.mean_transfer_size - 5.0).abs() < 1e-9);
        assert_eq!(baseline.normal_hours, BTreeSet::from([9, 10, 14]));
    }

    #[test]
    fn test_baseline_defaults_for_missing_fields() {
        let detector = BaselineDetector::new();
        detector.train(&[Event::new().with(ACTOR_ID, "quiet")]);
        let baseline = detector.baseline("quiet").unwrap();

        assert_eq!(baseline.mean_access_count, 0.0);
        assert_eq!(baseline.std_access_count, 0.0);
        assert_eq!(baseline.mean_transfer_size, 0.0);
        assert_eq!(baseline.std_transfer_size, 0.0);
        assert_eq!(baseline.normal_hours, BTreeSet::from([12]));
    }

    #[test]
    fn test_unknown_actor() {
        let result = BaselineDetector::new().predict(&history_event("ghost", 1.0, 1.0, 3));
        assert_eq!(
            result,
            AnomalyResult {
                is_anomaly: false,
                anomaly_score: 0.0,
                reasons: vec!["User not in training data".to_string()],
            }
        );

        let trained = trained_detector().predict(&history_event("ghost", 1.0, 1.0, 3));
        assert_eq!(trained.reasons, vec![UNKNOWN_ACTOR_REASON.to_string()]);
    }

    #[test]
    fn test_single_event_history_scores_zero() {
        let detector = BaselineDetector::new();
        let event = history_event("solo", 25.0, 4.0, 9);
        detector.train(&[event.clone()]);

        let result = detector.predict(&event);
        assert_eq!(result.anomaly_score, 0.0);
        assert!(!result.is_anomaly);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn test_single_event_history_off_hours_and_sensitive() {
        let detector = BaselineDetector::new();
        detector.train(&[history_event("solo", 25.0, 4.0, 9)]);

        let event = history_event("solo", 25.0, 4.0, 23).with(SENSITIVE_DATA_ACCESS, true);
        let result = detector.predict(&event);
        assert!((result.anomaly_score - 0.3).abs() < 1e-9);
        assert!(!result.is_anomaly);
        assert_eq!(
            result.reasons,
            vec![
                "Access outside normal hours (hour: 23)".to_string(),
                "Sensitive data access".to_string(),
            ]
        );
    }

    #[test]
    fn test_access_z_score_reason() {
        let mut baselines = HashMap::new();
        baselines.insert("user1".to_string(), baseline_with(10.0, 2.0));
        let detector = BaselineDetector::from_baselines(baselines);

        let event = history_event("user1", 500.0, 0.0, 12);
        let result = detector.predict(&event);

        assert!((result.anomaly_score - 0.3).abs() < 1e-9);
        assert!(!result.is_anomaly);
        assert_eq!(result.reasons, vec!["Unusual access volume (z-score: 245.00)".to_string()]);
    }

    #[test]
    fn test_z_score_at_threshold_does_not_fire() {
        let mut baselines = HashMap::new();
        baselines.insert("user1".to_string(), baseline_with(10.0, 2.0));
        let detector = BaselineDetector::from_baselines(baselines);

        // z == 2 exactly
        let result = detector.predict(&history_event("user1", 14.0, 0.0, 12));
        assert_eq!(result.anomaly_score, 0.0);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn test_full_anomaly_reason_order() {
        let detector = trained_detector();
        let event = history_event("user1", 500.0, 1000.0, 2)
            .with(SENSITIVE_DATA_ACCESS, true)
            .with(RISK_SCORE, 75);

        let result = detector.predict(&event);
        assert!(result.is_anomaly);
        assert!((result.anomaly_score - 1.0).abs() < 1e-9);
        assert_eq!(result.reasons.len(), 4);
        assert!(result.reasons[0].starts_with("Unusual access volume (z-score: "));
        assert!(result.reasons[1].starts_with("Unusual data transfer (z-score: "));
        assert_eq!(result.reasons[2], "Access outside normal hours (hour: 2)");
        assert_eq!(result.reasons[3], "Sensitive data access");
    }

    #[test]
    fn test_transfer_and_hour_cross_threshold() {
        let detector = trained_detector();
        // transfer 0.4 + hour 0.2 = 0.6
        let result = detector.predict(&history_event("user1", 10.0, 1000.0, 3));
        assert!(result.is_anomaly);
        assert!((result.anomaly_score - 0.6).abs() < 1e-9);
        assert_eq!(result.reasons.len(), 2);
    }

    #[test]
    fn test_normal_hours_are_exact() {
        let detector = trained_detector();
        // 9 and 14 were seen, 11 was not
        let result = detector.predict(&history_event("user1", 10.0, 5.0, 11));
        assert_eq!(result.reasons, vec!["Access outside normal hours (hour: 11)".to_string()]);
    }

    #[test]
    fn test_combine_is_linear() {
        let full = AnomalyResult {
            is_anomaly: true,
            anomaly_score: 1.0,
            reasons: vec![],
        };
        let none = AnomalyResult {
            is_anomaly: false,
            anomaly_score: 0.0,
            reasons: vec![],
        };

        let high = Event::new().with(RISK_SCORE, 100);
        assert!((BaselineDetector::combine(&high, &full) - 1.0).abs() < 1e-9);
        assert_eq!(BaselineDetector::combine(&Event::new(), &none), 0.0);

        let mixed = Event::new().with(RISK_SCORE, 50);
        let half = AnomalyResult {
            anomaly_score: 0.5,
            ..none
        };
        assert!((BaselineDetector::combine(&mixed, &half) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_enhance_attaches_fields() {
        let detector = trained_detector();
        let event = history_event("user1", 500.0, 1000.0, 2)
            .with(SENSITIVE_DATA_ACCESS, true)
            .with(RISK_SCORE, 75)
            .with("device", "laptop-7");

        let enhanced = detector.enhance(&event);
        assert_eq!(enhanced.get(ML_IS_ANOMALY).and_then(|v| v.as_bool()), Some(true));
        assert!((enhanced.number(ML_ANOMALY_SCORE) - 1.0).abs() < 1e-9);
        assert!((enhanced.number(COMBINED_RISK_SCORE) - 0.9).abs() < 1e-9);
        assert_eq!(
            enhanced.get(ML_REASONS).and_then(|v| v.as_array()).map(|a| a.len()),
            Some(4)
        );
        assert_eq!(enhanced.get("device"), event.get("device"));
        assert!(event.get(ML_ANOMALY_SCORE).is_none());
    }

    #[test]
    fn test_retrain_replaces_only_present_actors() {
        let detector = trained_detector();
        let user2_before = detector.baseline("user2").unwrap();

        detector.train(&[history_event("user1", 100.0, 50.0, 20)]);

        let user1 = detector.baseline("user1").unwrap();
        assert_eq!(user1.mean_access_count, 100.0);
        assert_eq!(user1.std_access_count, 0.0);
        assert_eq!(user1.normal_hours, BTreeSet::from([20]));
        assert_eq!(detector.baseline("user2").unwrap(), user2_before);
    }

    #[test]
    fn test_retrain_is_idempotent() {
        let detector = trained_detector();
        let first = detector.snapshot();
        detector.train(&[
            history_event("user1", 10.0, 5.0, 9),
            history_event("user1", 12.0, 7.0, 10),
            history_event("user1", 8.0, 3.0, 14),
            history_event("user2", 50.0, 20.0, 11),
            history_event("user2", 45.0, 18.0, 12),
        ]);
        assert_eq!(*first, *detector.snapshot());
    }

    #[test]
    fn test_snapshot_survives_retraining() {
        let detector = trained_detector();
        let before = detector.snapshot();

        detector.replace_baselines(HashMap::new());

        assert_eq!(before.len(), 2);
        assert!(detector.is_trained());
        assert_eq!(detector.actor_count(), 0);
    }

    #[test]
    fn test_empty_training_still_trains() {
        let detector = BaselineDetector::new();
        assert!(!detector.is_trained());

        detector.train(&[]);

        assert!(detector.is_trained());
        assert_eq!(detector.actor_count(), 0);
        assert_eq!(
            detector.predict(&Event::new().with(ACTOR_ID, "user1")).reasons,
            vec![UNKNOWN_ACTOR_REASON.to_string()]
        );
    }

    #[test]
    fn test_predictions_see_whole_snapshots_while_retraining() {
        let detector = BaselineDetector::new();
        detector.train(&[
            history_event("user1", 10.0, 5.0, 9),
            history_event("user1", 12.0, 7.0, 10),
        ]);

        // Quiet under the first baseline, anomalous on every check under the
        // second one
        let event = history_event("user1", 11.0, 6.0, 9);
        let before = detector.predict(&event);
        let retrained = BaselineDetector::new();
        let second_history = [
            history_event("user1", 500.0, 900.0, 22),
            history_event("user1", 520.0, 950.0, 23),
        ];
        retrained.train(&second_history);
        let after = retrained.predict(&event);
        assert_ne!(before, after);

        std::thread::scope(|scope| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..500)
                            .map(|_| detector.predict(&event))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            scope.spawn(|| {
                for round in 0..50 {
                    if round % 2 == 0 {
                        detector.train(&second_history);
                    } else {
                        detector.train(&[
                            history_event("user1", 10.0, 5.0, 9),
                            history_event("user1", 12.0, 7.0, 10),
                        ]);
                    }
                }
            });

            for reader in readers {
                for result in reader.join().unwrap() {
                    assert!(result == before || result == after, "torn result: {:?}", result);
                }
            }
        });
    }
}
