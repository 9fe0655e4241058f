//! Batch driver: converts prefetched papers one at a time and records outcomes.
//!
//! The driver is the only component that writes outputs or checkpoint
//! records. For each paper, in enumeration order:
//!
//! ```text
//! ready ──▶ convert (deadline) ──▶ upload figures ──▶ rewrite refs
//!       ──▶ markdown/<id>.md ──▶ dataset line ──▶ checkpoint record
//! ```
//!
//! Any per-paper error ends that paper in `failed`/`timed_out` and the driver
//! moves on. A checkpoint write error is logged and the run continues; the
//! paper is simply retried next time.

use crate::checkpoint::{CheckpointStore, RecordMetadata};
use crate::config::ProcessorConfig;
use crate::error::{ArxivError, PaperError};
use crate::output::{DatasetRecord, JobStatus, PaperJob, RunStats};
use crate::pipeline::images::{export_images, rewrite_image_refs, ImageExporter};
use crate::pipeline::invoke::PaperConverter;
use crate::pipeline::prefetch::{FailedDownload, PaperStream, Prefetched, ReadyPaper};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use futures::StreamExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// What a succeeded paper produced.
struct Written {
    images: usize,
    duration_ms: u64,
}

/// Drives a [`PaperStream`] to completion.
pub struct BatchDriver<C, E> {
    config: ProcessorConfig,
    converter: C,
    exporter: E,
    checkpoint: CheckpointStore,
    dataset: Option<DatasetWriter>,
    progress: ProgressCallback,
}

impl<C: PaperConverter, E: ImageExporter> BatchDriver<C, E> {
    /// Opens the dataset file (when enabled). Output directories must exist.
    pub fn new(
        config: &ProcessorConfig,
        checkpoint: CheckpointStore,
        converter: C,
        exporter: E,
    ) -> Result<Self, ArxivError> {
        let dataset = if config.write_dataset {
            Some(DatasetWriter::open(config.dataset_path())?)
        } else {
            None
        };
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));

        Ok(Self {
            config: config.clone(),
            converter,
            exporter,
            checkpoint,
            dataset,
            progress,
        })
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn into_checkpoint(self) -> CheckpointStore {
        self.checkpoint
    }

    /// Consume the stream batch by batch. Jobs within a batch run sequentially.
    pub async fn drive(&mut self, stream: PaperStream) -> RunStats {
        let mut stats = RunStats::default();
        let mut batches = stream.chunks(self.config.batch_size.max(1));
        let mut index = 0usize;

        while let Some(batch) = batches.next().await {
            let size = batch.len();
            debug!("Batch {}: {} papers", index, size);
            for item in batch {
                self.process(item, &mut stats).await;
            }
            stats.batches += 1;
            self.progress.on_batch_complete(index, size);
            info!(
                "Batch {} done: {} succeeded, {} failed, {} timed out so far",
                index, stats.succeeded, stats.failed, stats.timed_out
            );
            index += 1;
        }

        stats
    }

    async fn process(&mut self, item: Prefetched, stats: &mut RunStats) {
        match item {
            Err(FailedDownload { job, error }) => {
                stats.download_failed += 1;
                self.finish(job, Err(error), stats).await;
            }
            Ok(mut ready) => {
                ready.job.advance(JobStatus::Converting);
                self.progress.on_paper_start(ready.arxiv_id());
                let outcome = self.convert_and_write(&ready).await;
                let job = ready.job.clone();
                // Work dir (PDF + engine output) goes away here.
                drop(ready);
                self.finish(job, outcome, stats).await;
            }
        }
    }

    async fn convert_and_write(&mut self, ready: &ReadyPaper) -> Result<Written, PaperError> {
        let result = self.converter.convert(ready).await?;
        let urls = export_images(&self.exporter, &result).await?;
        let markdown = rewrite_image_refs(&result.markdown, &urls);

        let path = self.config.markdown_path(&result.arxiv_id);
        write_atomic(&path, &markdown)
            .await
            .map_err(|e| PaperError::OutputWriteFailed {
                arxiv_id: result.arxiv_id.clone(),
                path: path.clone(),
                detail: e.to_string(),
            })?;

        if let Some(dataset) = self.dataset.as_mut() {
            let record = DatasetRecord {
                arxiv_id: result.arxiv_id.clone(),
                markdown,
            };
            if let Err(e) = dataset.append(&record).await {
                // The paper is retried as a whole; no half-written outputs.
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!("Could not remove {}: {}", path.display(), rm);
                }
                return Err(PaperError::OutputWriteFailed {
                    arxiv_id: result.arxiv_id.clone(),
                    path: dataset.path().to_path_buf(),
                    detail: e.to_string(),
                });
            }
        }

        Ok(Written {
            images: urls.len(),
            duration_ms: result.duration_ms,
        })
    }

    async fn finish(
        &mut self,
        mut job: PaperJob,
        outcome: Result<Written, PaperError>,
        stats: &mut RunStats,
    ) {
        let (status, metadata) = match &outcome {
            Ok(w) => (
                JobStatus::Succeeded,
                RecordMetadata {
                    duration_ms: Some(w.duration_ms),
                    images: Some(w.images),
                    ..Default::default()
                },
            ),
            Err(e) => (e.status(), RecordMetadata::error(e.to_string())),
        };
        if job.status != status {
            job.advance(status);
        }

        if let Err(e) = self.checkpoint.record(job.arxiv_id(), status, metadata).await {
            error!("{}", e);
        }
        stats.count(status);

        match outcome {
            Ok(w) => {
                info!(
                    "Processed {} ({} images) in {}ms",
                    job.arxiv_id(),
                    w.images,
                    w.duration_ms
                );
                self.progress.on_paper_complete(job.arxiv_id(), w.images);
            }
            Err(e) => {
                warn!("{} ({})", e, status);
                self.progress.on_paper_error(job.arxiv_id(), status, &e.to_string());
            }
        }
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
pub async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await
}

/// Appends [`DatasetRecord`]s as JSON lines.
pub struct DatasetWriter {
    path: PathBuf,
    file: tokio::fs::File,
}

impl DatasetWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArxivError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |source| ArxivError::OutputDirUnavailable {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;
        Ok(Self {
            path,
            file: tokio::fs::File::from_std(file),
        })
    }

    #[cfg(test)]
    pub(crate) fn unwritable(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        std::fs::write(&path, b"").unwrap();
        let file = std::fs::File::open(&path).unwrap();
        Self {
            path,
            file: tokio::fs::File::from_std(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, record: &DatasetRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await
    }
}
