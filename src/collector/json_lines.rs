use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Collection, Collector};

const CHANNEL_CAPACITY: usize = 1024;

/// Streams records from a JSON-lines file, or from every `.json` / `.jsonl`
/// file in a directory in name order. Malformed lines are skipped.
#[derive(Debug, Clone)]
pub struct JsonLinesCollector {
    source: PathBuf,
}

impl JsonLinesCollector {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl Collector for JsonLinesCollector {
    fn collect(&self, cancel: CancellationToken) -> Collection {
        let source = self.source.clone();

        Collection::spawn(CHANNEL_CAPACITY, move |tx| async move {
            let files = match list_sources(&source).await {
                Ok(files) => files,
                Err(e) => {
                    error!(error = %e, source = %source.display(), "Unable to read collection source");
                    return;
                }
            };

            let mut total = 0usize;
            for file in files {
                match stream_file(&file, &tx, &cancel).await {
                    Ok(Some(count)) => total += count,
                    Ok(None) => {
                        debug!(file = %file.display(), "Collection stopped");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, file = %file.display(), "Failed to read collection file");
                    }
                }
            }
            info!(records = total, "Collection finished");
        })
    }
}

async fn list_sources(source: &Path) -> io::Result<Vec<PathBuf>> {
    let metadata = fs::metadata(source).await?;
    if metadata.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }

    let mut entries = fs::read_dir(source).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_record_file = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "json" || ext == "jsonl");
        if is_record_file && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Returns the number of records sent, or `None` if the consumer went away.
async fn stream_file(
    path: &Path,
    tx: &mpsc::Sender<Value>,
    cancel: &CancellationToken,
) -> io::Result<Option<usize>> {
    let file = fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0usize;
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: Value = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, file = %path.display(), line = line_number, "Skipping malformed record");
                continue;
            }
        };

        let delivered = tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            sent = tx.send(record) => sent.is_ok(),
        };
        if !delivered {
            return Ok(None);
        }
        count += 1;
    }

    Ok(Some(count))
}
