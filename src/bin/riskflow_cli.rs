use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

use riskflow::config::Config;
use riskflow::input::{read_events, read_lines};
use riskflow::models::RiskLevel;
use riskflow::output::{OutputFormat, OutputHandler};
use riskflow::persistence::{RiskQuery, SqliteEventStore};
use riskflow::pipeline::{load_detector, PipelineStats, RiskPipeline};

/// Riskflow Command Line Interface
#[derive(StructOpt, Debug)]
#[structopt(name = "riskflow", about = "Insider risk scoring CLI")]
pub enum Cli {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Train baselines from a history file and store them
    Train {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// JSON-lines history file (defaults to the configured one)
        #[structopt(short = "f", long)]
        history: Option<PathBuf>,
    },
    /// Score a JSON-lines file and write it to the event store
    Score {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// JSON-lines event file
        #[structopt(short, long)]
        file: PathBuf,
        /// Write scored events here instead of the configured output
        #[structopt(short, long)]
        output: Option<PathBuf>,
    },
    /// Query the event store
    Query {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[structopt(subcommand)]
        query: QueryCommand,
    },
    /// Parse and display events from a file
    Parse {
        /// Path to JSON-lines file
        #[structopt(short, long)]
        file: PathBuf,
        /// Number of events to show
        #[structopt(short, long, default_value = "10")]
        lines: usize,
    },
}

#[derive(StructOpt, Debug)]
pub enum QueryCommand {
    /// Most recent events
    Recent {
        #[structopt(short, long, default_value = "20")]
        limit: usize,
        /// Only events at this level (LOW, MEDIUM, HIGH)
        #[structopt(long)]
        level: Option<RiskLevel>,
    },
    /// Daily counts per risk level
    Summary {
        #[structopt(short, long, default_value = "7")]
        days: i64,
    },
    /// Aggregates for one actor
    Actor {
        actor_id: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Train { config, history } => {
            let mut config = load_config(&config)?;
            if history.is_some() {
                config.detection.history_path = history;
            }
            let path = match config.detection.history_path {
                Some(ref path) if path.exists() => path.clone(),
                _ => {
                    eprintln!("History file not found: {:?}", config.detection.history_path);
                    std::process::exit(1);
                }
            };
            config.detection.enable_anomaly_detection = true;
            config.detection.persist_baselines = true;

            let store = open_store(&config)?;
            let detector = load_detector(&config.detection, &store)?;
            println!(
                "Trained baselines for {} actor(s) from {:?} into {:?}",
                detector.actor_count(),
                path,
                config.store.database_path
            );
        }
        Cli::Score { config, file, output } => {
            let config = load_config(&config)?;
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }

            let store = Arc::new(open_store(&config)?);
            let detector = Arc::new(load_detector(&config.detection, &*store)?);
            let pipeline = RiskPipeline::new(detector, store)
                .with_all_events_table(config.store.all_events_table());

            let mut handler = OutputHandler::new(
                OutputFormat::from_str(&config.output.format),
                output.or_else(|| config.output.file_path.clone()),
            )?;

            let lines = read_lines(&file)?;
            let mut totals = PipelineStats::default();
            for chunk in lines.chunks(config.input.batch_size.max(1)) {
                let outcome = pipeline.process_lines(chunk);
                for result in &outcome.scored {
                    if !config.output.only_flagged || result.is_flagged() {
                        handler.write_event(result)?;
                    }
                }
                totals.merge(&outcome.stats);
            }
            handler.flush()?;

            eprintln!("{}", serde_json::to_string_pretty(&totals)?);
        }
        Cli::Query { config, query } => {
            let config = load_config(&config)?;
            let store = open_store(&config)?;

            match query {
                QueryCommand::Recent { limit, level } => {
                    for record in store.recent_events(limit, level)? {
                        println!(
                            "{}  {:<6}  {:>5.1}  {:<16}  {}",
                            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            record.risk_level,
                            record.risk_score,
                            record.actor_id,
                            record.event_type
                        );
                    }
                }
                QueryCommand::Summary { days } => {
                    for day in store.risk_summary(days)? {
                        println!(
                            "{}  {:<6}  count={}  avg={:.1}  max={:.1}",
                            day.date,
                            day.risk_level,
                            day.event_count,
                            day.avg_risk_score,
                            day.max_risk_score
                        );
                    }
                }
                QueryCommand::Actor { actor_id } => match store.actor_risk_profile(&actor_id)? {
                    Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                    None => println!("No events recorded for actor: {}", actor_id),
                },
            }
        }
        Cli::Parse { file, lines } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }

            let events = read_events(&file)?;
            let display_count = std::cmp::min(lines, events.len());

            println!("Parsed {} event(s) (showing {}):\n", events.len(), display_count);
            for event in events.iter().take(display_count) {
                println!(
                    "  Actor: {}, Type: {}, Timestamp: {}",
                    event.actor_id(),
                    event.event_type(),
                    event
                        .timestamp()
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|e| format!("<{}>", e))
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Config::from_file(path)
    } else {
        log::warn!("Config file {:?} not found, using defaults", path);
        Ok(Config::default())
    }
}

fn open_store(config: &Config) -> Result<SqliteEventStore, Box<dyn std::error::Error>> {
    let store = SqliteEventStore::new(&config.store.database_path)?;
    Ok(match config.store.all_events_table() {
        Some(table) => store.with_query_table(&table)?,
        None => store,
    })
}
