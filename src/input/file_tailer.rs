use crate::models::Event;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading event sources
#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read every line of a JSON-lines file
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>, InputError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Read every event of a JSON-lines file, skipping malformed lines
pub fn read_events<P: AsRef<Path>>(path: P) -> Result<Vec<Event>, InputError> {
    let path = path.as_ref();
    let mut events = Vec::new();
    for (index, line) in read_lines(path)?.iter().enumerate() {
        match Event::from_json(line) {
            Ok(event) => events.push(event),
            Err(e) => log::warn!("{:?}:{}: skipping malformed event: {}", path, index + 1, e),
        }
    }
    Ok(events)
}

// ============================================
// Async File Tailer
// ============================================

use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader as AsyncBufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration as TokioDuration};

/// Follow a JSON-lines file from tokio, streaming appended lines
pub struct AsyncFileTailer {
    file_path: PathBuf,
    from_start: bool,
}

impl AsyncFileTailer {
    /// Create a new async file tailer that starts at end of file
    pub fn new(file_path: PathBuf) -> Self {
        AsyncFileTailer {
            file_path,
            from_start: false,
        }
    }

    /// Also deliver lines already present in the file
    pub fn from_start(mut self) -> Self {
        self.from_start = true;
        self
    }

    /// Run the file tailer, sending raw lines through the channel
    ///
    /// Runs until the receiving side of the channel is dropped.
    pub async fn run(&mut self, tx: mpsc::Sender<String>) -> Result<(), InputError> {
        let file = AsyncFile::open(&self.file_path).await?;
        let mut reader = AsyncBufReader::new(file);

        if !self.from_start {
            reader.seek(std::io::SeekFrom::End(0)).await?;
        }

        log::info!("Async file tailer started for {:?}", self.file_path);

        let mut pending = String::new();
        loop {
            let mut chunk = String::new();

            match reader.read_line(&mut chunk).await {
                Ok(0) => {
                    if tx.is_closed() {
                        break;
                    }
                    sleep(TokioDuration::from_millis(100)).await;
                }
                Ok(_) => {
                    pending.push_str(&chunk);
                    if !pending.ends_with('\n') {
                        continue;
                    }
                    let line = std::mem::take(&mut pending);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line.to_string()).await.is_err() {
                        log::info!("Channel closed, stopping file tailer");
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Error reading file: {}", e);
                    sleep(TokioDuration::from_secs(1)).await;
                }
            }
        }

        Ok(())
    }
}
