use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::model::Dataset;

enum SaveRequest {
    Flush { city: String, entries: Dataset },
    Shutdown,
}

/// Per-worker asynchronous persistence. The worker pushes dataset snapshots
/// and keeps scraping; a consumer task folds each snapshot into the worker's
/// partial file. Requests from one worker are applied in the order they were
/// pushed, so the file on disk never goes backwards.
pub struct SavePipeline {
    tx: mpsc::UnboundedSender<SaveRequest>,
    consumer: JoinHandle<()>,
}

impl SavePipeline {
    /// Starts the consumer for one worker. Each worker writes only its own
    /// `{city}_worker_{id}.json` files, so pipelines never contend on a path.
    pub fn spawn(output_dir: PathBuf, worker_id: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    SaveRequest::Flush { city, entries } => {
                        let path = partial_file_path(&output_dir, &city, worker_id);
                        match merge_into_partial(&path, entries) {
                            Ok(total) => {
                                info!(
                                    "worker {worker_id}: saved {total} entries to {}",
                                    path.display()
                                );
                            }
                            Err(e) => {
                                warn!(
                                    "worker {worker_id}: failed to save {}: {e:#}",
                                    path.display()
                                );
                            }
                        }
                    }
                    SaveRequest::Shutdown => break,
                }
            }
        });
        Self { tx, consumer }
    }

    /// Hands a snapshot to the consumer. Never blocks the scraping loop. A
    /// send failure means the consumer is gone; the snapshot is lost and the
    /// run carries on, so it is logged rather than propagated.
    pub fn push(&self, city: &str, entries: Dataset) {
        if entries.is_empty() {
            return;
        }
        let request = SaveRequest::Flush {
            city: city.to_string(),
            entries,
        };
        if self.tx.send(request).is_err() {
            warn!("save pipeline consumer is gone, dropping snapshot for {city}");
        }
    }

    /// Flushes everything still queued and waits for the consumer to finish.
    /// Called once, when the worker has no more tasks.
    pub async fn close(self) {
        let _ = self.tx.send(SaveRequest::Shutdown);
        if let Err(e) = self.consumer.await {
            warn!("save pipeline consumer task failed: {e}");
        }
    }
}

pub fn partial_file_path(output_dir: &Path, city: &str, worker_id: usize) -> PathBuf {
    output_dir.join(format!("{city}_worker_{worker_id}.json"))
}

/// Folds a snapshot into the partial file at `path` and rewrites it. New
/// entry keys are inserted; for keys already on disk, incoming rates replace
/// the stored price per descriptor and the scrape timestamp advances.
/// Returns the entry count after merging.
pub fn merge_into_partial(path: &Path, entries: Dataset) -> Result<usize> {
    let mut on_disk = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<Dataset>(&raw).unwrap_or_else(|e| {
            warn!(
                "existing partial file {} is unreadable ({e}), starting over",
                path.display()
            );
            Dataset::new()
        }),
        Err(_) => Dataset::new(),
    };

    for (key, incoming) in entries {
        match on_disk.get_mut(&key) {
            Some(existing) => {
                existing.scraped_at = incoming.scraped_at;
                for (descriptor, price) in incoming.rates {
                    existing.rates.insert(descriptor, price);
                }
            }
            None => {
                on_disk.insert(key, incoming);
            }
        }
    }

    let json = serde_json::to_string_pretty(&on_disk)
        .context("failed to serialize partial dataset")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write partial file {}", path.display()))?;
    Ok(on_disk.len())
}
