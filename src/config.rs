use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::persistence::ALL_EVENTS_TABLE;

/// Configuration for the riskflow daemon and CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input source configuration
    pub input: InputConfig,
    /// Anomaly detection configuration
    pub detection: DetectionConfig,
    /// Event store configuration
    pub store: StoreConfig,
    /// Output configuration
    pub output: OutputConfig,
    /// Alerting configuration
    #[serde(default)]
    pub alerting: AlertConfig,
}

/// Input source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// JSON-lines file of live events
    pub events_path: PathBuf,
    /// Process lines already in the file before tailing
    #[serde(default)]
    pub read_from_start: bool,
    /// Maximum events scored per batch
    pub batch_size: usize,
}

/// Anomaly detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Score events against per-actor baselines
    pub enable_anomaly_detection: bool,
    /// JSON-lines file of historical events to train on at startup
    pub history_path: Option<PathBuf>,
    /// Store trained baselines and reuse them when no history is given
    pub persist_baselines: bool,
}

/// Event store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    pub database_path: PathBuf,
    /// Table receiving every scored event; empty disables it
    pub all_events_table: String,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (stdout when absent)
    pub file_path: Option<PathBuf>,
    /// Only write events flagged as anomalous or HIGH risk
    #[serde(default)]
    pub only_flagged: bool,
}

/// Alert dispatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    pub enabled: bool,
    /// Minimum combined risk score (0.0 - 1.0) that raises an alert
    pub min_combined_score: f64,
    /// Alert on anomalous events regardless of their combined score
    pub always_alert_on_anomaly: bool,
    pub slack: Option<SlackConfig>,
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    /// "POST" (default) or "PUT"
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

impl StoreConfig {
    /// The all-events table, `None` when disabled
    pub fn all_events_table(&self) -> Option<String> {
        let table = self.all_events_table.trim();
        if table.is_empty() {
            None
        } else {
            Some(table.to_string())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: InputConfig {
                events_path: PathBuf::from("events.jsonl"),
                read_from_start: false,
                batch_size: 500,
            },
            detection: DetectionConfig {
                enable_anomaly_detection: true,
                history_path: Some(PathBuf::from("history.jsonl")),
                persist_baselines: true,
            },
            store: StoreConfig {
                database_path: PathBuf::from("riskflow.db"),
                all_events_table: ALL_EVENTS_TABLE.to_string(),
            },
            output: OutputConfig {
                format: "jsonl".to_string(),
                file_path: Some(PathBuf::from("scored_events.jsonl")),
                only_flagged: false,
            },
            alerting: AlertConfig {
                enabled: false,
                min_combined_score: 0.7,
                always_alert_on_anomaly: true,
                slack: None,
                discord: None,
                webhooks: vec![],
            },
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
