use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use riskflow::alerting::{AlertDispatcher, AlertQueue, RiskAlert};
use riskflow::config::Config;
use riskflow::input::AsyncFileTailer;
use riskflow::output::{OutputError, OutputFormat, OutputHandler};
use riskflow::persistence::SqliteEventStore;
use riskflow::pipeline::{load_detector, PipelineStats, RiskPipeline, ScoredEvent};

/// Partial batches are scored at least this often
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Main daemon entry point: tail the event file and score it continuously
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting riskflow daemon...");

    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!("Config file not found, using defaults");
        Config::default()
    };

    // Setup graceful shutdown signal handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut store = SqliteEventStore::new(&config.store.database_path)?;
    if let Some(table) = config.store.all_events_table() {
        store = store.with_query_table(&table)?;
    }
    let store = Arc::new(store);
    log::info!("Event store: {:?}", config.store.database_path);

    let detector = Arc::new(load_detector(&config.detection, &*store)?);
    let pipeline = RiskPipeline::new(detector, store)
        .with_all_events_table(config.store.all_events_table());

    let output_handler = OutputHandler::new(
        OutputFormat::from_str(&config.output.format),
        config.output.file_path.clone(),
    )?;

    let runtime = tokio::runtime::Runtime::new()?;
    let totals = runtime.block_on(run(&config, &pipeline, output_handler, running))?;

    log::info!("Totals: {}", serde_json::to_string(&totals)?);
    log::info!("Riskflow daemon stopped");
    Ok(())
}

async fn run(
    config: &Config,
    pipeline: &RiskPipeline,
    mut output: OutputHandler,
    running: Arc<AtomicBool>,
) -> Result<PipelineStats, Box<dyn std::error::Error>> {
    let batch_size = config.input.batch_size.max(1);

    // Input source
    let (line_tx, mut line_rx) = mpsc::channel::<String>(batch_size * 2);
    let mut tailer = AsyncFileTailer::new(config.input.events_path.clone());
    if config.input.read_from_start {
        tailer = tailer.from_start();
    }
    log::info!("Monitoring event file: {:?}", config.input.events_path);
    let tailer_handle = tokio::spawn(async move {
        if let Err(e) = tailer.run(line_tx).await {
            log::error!("File tailer stopped: {}", e);
        }
    });

    // Alerting
    let alerts = if config.alerting.enabled {
        let (tx, rx) = AlertDispatcher::create_channel();
        let dispatcher = AlertDispatcher::new(config.alerting.clone());
        Some((AlertQueue::new(tx), tokio::spawn(dispatcher.run(rx))))
    } else {
        None
    };

    log::info!("Daemon running. Press Ctrl+C to stop.");

    let mut totals = PipelineStats::default();
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let mut input_closed = false;

    while running.load(Ordering::SeqCst) && !input_closed {
        let flush = tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => {
                    batch.push(line);
                    batch.len() >= batch_size
                }
                None => {
                    log::warn!("Input stream ended");
                    input_closed = true;
                    true
                }
            },
            _ = ticker.tick() => true,
        };

        if flush && !batch.is_empty() {
            let outcome = pipeline.process_lines(&batch);
            batch.clear();
            publish(
                &outcome.scored,
                config,
                &mut output,
                alerts.as_ref().map(|(queue, _)| queue),
            )?;
            log::debug!(
                "Batch: {} scored, {} anomalous, {} dropped",
                outcome.stats.scored,
                outcome.stats.anomalies,
                outcome.stats.dropped
            );
            totals.merge(&outcome.stats);
        }
    }

    // Lines already received are still scored
    if !batch.is_empty() {
        let outcome = pipeline.process_lines(&batch);
        publish(
            &outcome.scored,
            config,
            &mut output,
            alerts.as_ref().map(|(queue, _)| queue),
        )?;
        totals.merge(&outcome.stats);
    }

    drop(line_rx);
    tailer_handle.await?;

    if let Some((queue, handle)) = alerts {
        drop(queue);
        handle.await?;
    }

    output.flush()?;
    Ok(totals)
}

/// Write scored events and queue the alerts that pass the thresholds
fn publish(
    scored: &[ScoredEvent],
    config: &Config,
    output: &mut OutputHandler,
    alerts: Option<&AlertQueue>,
) -> Result<(), OutputError> {
    for result in scored {
        if !config.output.only_flagged || result.is_flagged() {
            output.write_event(result)?;
        }
        if let Some(queue) = alerts {
            queue.queue_qualifying(&config.alerting, RiskAlert::from_scored(result));
        }
    }
    output.flush()
}
