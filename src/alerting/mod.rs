//! Alerting module for webhook notifications
//!
//! Scored events that cross the configured thresholds are turned into
//! alerts and dispatched asynchronously to Slack, Discord and generic
//! webhooks.

pub use crate::config::{AlertConfig, DiscordConfig, SlackConfig, WebhookConfig};
use crate::models::RiskLevel;
use crate::pipeline::ScoredEvent;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 100;

/// Errors that can occur during alert dispatch
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Alert channel closed")]
    ChannelClosed,
}

/// Notification payload for one scored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub actor_id: String,
    pub event_type: String,
    /// Event timestamp as received, empty when absent
    pub timestamp: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub combined_risk_score: f64,
    pub reasons: Vec<String>,
}

impl RiskAlert {
    pub fn from_scored(scored: &ScoredEvent) -> Self {
        let risk_score = scored.event.risk_score();
        RiskAlert {
            actor_id: scored.event.actor_id().to_string(),
            event_type: scored.event.event_type().to_string(),
            timestamp: scored
                .event
                .timestamp()
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default(),
            risk_score,
            risk_level: scored.risk_level(),
            anomaly_score: scored.anomaly.anomaly_score,
            is_anomaly: scored.anomaly.is_anomaly,
            combined_risk_score: scored.combined_risk_score,
            reasons: scored.anomaly.reasons.clone(),
        }
    }

    fn title(&self) -> String {
        format!("{} risk event for {}", self.risk_level, self.actor_id)
    }

    fn description(&self) -> String {
        if self.reasons.is_empty() {
            format!("{} (combined score {:.2})", self.event_type, self.combined_risk_score)
        } else {
            format!(
                "{} (combined score {:.2}): {}",
                self.event_type,
                self.combined_risk_score,
                self.reasons.join("; ")
            )
        }
    }
}

/// Whether `alert` passes the configured thresholds
pub fn should_alert(config: &AlertConfig, alert: &RiskAlert) -> bool {
    if !config.enabled {
        return false;
    }
    (config.always_alert_on_anomaly && alert.is_anomaly)
        || alert.combined_risk_score >= config.min_combined_score
}

/// Async alert dispatcher
///
/// Runs as a tokio task and sends alerts to every configured
/// notification channel.
pub struct AlertDispatcher {
    config: AlertConfig,
    client: Client,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        AlertDispatcher {
            config,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Create a channel for queueing alerts
    pub fn create_channel() -> (mpsc::Sender<RiskAlert>, mpsc::Receiver<RiskAlert>) {
        mpsc::channel(CHANNEL_CAPACITY)
    }

    /// Run the alert dispatch loop until every sender is dropped
    pub async fn run(self, mut rx: mpsc::Receiver<RiskAlert>) {
        log::info!("Alert dispatcher started");

        while let Some(alert) = rx.recv().await {
            if !should_alert(&self.config, &alert) {
                log::debug!(
                    "Skipping alert for {} (combined score {:.2})",
                    alert.actor_id,
                    alert.combined_risk_score
                );
                continue;
            }

            log::info!(
                "Dispatching alert: {} (combined score {:.2})",
                alert.title(),
                alert.combined_risk_score
            );

            if let Err(e) = self.dispatch_alert(&alert).await {
                log::error!("Failed to dispatch alert: {}", e);
            }
        }

        log::info!("Alert dispatcher stopped");
    }

    /// Dispatch an alert to all configured channels
    async fn dispatch_alert(&self, alert: &RiskAlert) -> Result<(), AlertError> {
        let mut errors = Vec::new();

        if let Some(ref slack) = self.config.slack {
            if let Err(e) = self.send_slack_alert(slack, alert).await {
                log::error!("Slack alert failed: {}", e);
                errors.push(e);
            }
        }

        if let Some(ref discord) = self.config.discord {
            if let Err(e) = self.send_discord_alert(discord, alert).await {
                log::error!("Discord alert failed: {}", e);
                errors.push(e);
            }
        }

        for webhook in &self.config.webhooks {
            if let Err(e) = self.send_generic_webhook(webhook, alert).await {
                log::error!("Webhook {} failed: {}", webhook.name, e);
                errors.push(e);
            }
        }

        match errors.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(first),
        }
    }

    async fn send_slack_alert(
        &self,
        config: &SlackConfig,
        alert: &RiskAlert,
    ) -> Result<(), AlertError> {
        let color = match alert.risk_level {
            RiskLevel::High => "danger",
            RiskLevel::Medium => "warning",
            RiskLevel::Low => "good",
        };

        let payload = serde_json::json!({
            "channel": config.channel,
            "username": config.username.as_deref().unwrap_or("Riskflow"),
            "icon_emoji": ":shield:",
            "attachments": [{
                "color": color,
                "title": alert.title(),
                "fields": [
                    { "title": "Actor", "value": &alert.actor_id, "short": true },
                    { "title": "Event", "value": &alert.event_type, "short": true },
                    { "title": "Risk score", "value": alert.risk_score.to_string(), "short": true },
                    { "title": "Combined", "value": format!("{:.2}", alert.combined_risk_score), "short": true },
                ],
                "text": alert.description(),
            }]
        });

        let response = self
            .client
            .post(&config.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            log::warn!("Slack returned non-success status: {}", response.status());
        }

        Ok(())
    }

    async fn send_discord_alert(
        &self,
        config: &DiscordConfig,
        alert: &RiskAlert,
    ) -> Result<(), AlertError> {
        let color = match alert.risk_level {
            RiskLevel::High => 0xFF0000,
            RiskLevel::Medium => 0xFFCC00,
            RiskLevel::Low => 0x00CCFF,
        };

        let payload = serde_json::json!({
            "username": config.username.as_deref().unwrap_or("Riskflow"),
            "embeds": [{
                "title": format!(":shield: {}", alert.title()),
                "description": alert.description(),
                "color": color,
                "fields": [
                    { "name": "Actor", "value": &alert.actor_id, "inline": true },
                    { "name": "Risk", "value": format!("{}/100", alert.risk_score), "inline": true },
                    { "name": "Anomaly", "value": format!("{:.2}", alert.anomaly_score), "inline": true },
                ],
                "timestamp": &alert.timestamp,
                "footer": {
                    "text": "Riskflow insider risk monitoring"
                }
            }]
        });

        let response = self
            .client
            .post(&config.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            log::warn!("Discord returned non-success status: {}", response.status());
        }

        Ok(())
    }

    async fn send_generic_webhook(
        &self,
        config: &WebhookConfig,
        alert: &RiskAlert,
    ) -> Result<(), AlertError> {
        let method = config.method.as_deref().unwrap_or("POST");

        let mut request = match method.to_uppercase().as_str() {
            "PUT" => self.client.put(&config.url),
            _ => self.client.post(&config.url),
        };

        if let Some(ref headers) = config.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let response = request.json(alert).send().await?;

        if !response.status().is_success() {
            log::warn!(
                "Webhook {} returned non-success status: {}",
                config.name,
                response.status()
            );
        }

        Ok(())
    }
}

/// Synchronous alert queue for use in sync code
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<RiskAlert>,
}

impl AlertQueue {
    pub fn new(tx: mpsc::Sender<RiskAlert>) -> Self {
        AlertQueue { tx }
    }

    /// Queue an alert without blocking; drops it when the queue is full
    pub fn queue_alert(&self, alert: RiskAlert) {
        if let Err(e) = self.tx.try_send(alert) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!("Alert queue full, dropping alert");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::warn!("Alert queue closed");
                }
            }
        }
    }

    /// Queue `alert` only when it passes the configured thresholds,
    /// returning whether it was queued
    pub fn queue_qualifying(&self, config: &AlertConfig, alert: RiskAlert) -> bool {
        if !should_alert(config, &alert) {
            return false;
        }
        self.queue_alert(alert);
        true
    }

    pub async fn queue_alert_async(&self, alert: RiskAlert) -> Result<(), AlertError> {
        self.tx
            .send(alert)
            .await
            .map_err(|_| AlertError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
