use crate::pipeline::ScoredEvent;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Output handler for scored events
pub struct OutputHandler {
    format: OutputFormat,
    writer: Box<dyn Write + Send>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Jsonl, // Default
        }
    }
}

impl OutputHandler {
    /// Create a handler appending to `file_path`, or stdout when `None`
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, OutputError> {
        let writer: Box<dyn Write + Send> = match file_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Box::new(BufWriter::new(file))
            }
            None => Box::new(io::stdout()),
        };

        Ok(OutputHandler { format, writer })
    }

    /// Create a handler around any writer
    pub fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputHandler { format, writer }
    }

    /// Write one scored event
    pub fn write_event(&mut self, scored: &ScoredEvent) -> Result<(), OutputError> {
        let output = match self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&scored.event)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(&scored.event)?),
            OutputFormat::Console => {
                let categories: Vec<&str> = scored.categories.iter().map(|c| c.as_str()).collect();
                format!(
                    "[{}] actor={} type={} risk={} combined={:.2} anomaly={} routes={} {}\n",
                    scored
                        .event
                        .get(crate::models::event::RISK_LEVEL)
                        .and_then(|v| v.as_str())
                        .unwrap_or("LOW"),
                    scored.event.actor_id(),
                    scored.event.event_type(),
                    scored.event.risk_score(),
                    scored.combined_risk_score,
                    scored.anomaly.is_anomaly,
                    categories.join(","),
                    scored.anomaly.reasons.join("; "),
                )
            }
        };
        self.writer.write_all(output.as_bytes())?;
        Ok(())
    }

    /// Flush any buffered output
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}
