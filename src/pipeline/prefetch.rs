//! Bounded-lookahead download pipeline feeding the batch driver.
//!
//! A background task walks the enumerated papers and keeps up to
//! `prefetch_factor × batch_size` downloads running while the driver converts
//! the paper in front of it:
//!
//! ```text
//!   papers ──▶ buffered(window) ──▶ mpsc(batch_size) ──▶ PaperStream ──▶ driver
//!              (spawned fetches)     (ready papers)
//! ```
//!
//! Each fetch runs in its own task so it keeps making progress while the
//! producer is parked on a full channel. `buffered` only pulls the next paper
//! once a slot frees up, so at most `window` downloads exist at any time, and
//! it yields results in enumeration order even though fetches finish out of
//! order. When the driver falls behind the channel fills, the producer stops
//! pulling results, slots stop freeing, and no new downloads start.

use crate::config::ProcessorConfig;
use crate::error::PaperError;
use crate::output::{JobStatus, PaperJob, PaperRef};
use crate::pipeline::source::PaperSource;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// A downloaded paper waiting for conversion.
///
/// Owns a private temp directory holding the PDF and the engine's output;
/// everything is removed when the value is dropped.
pub struct ReadyPaper {
    pub job: PaperJob,
    pdf_path: PathBuf,
    work_dir: TempDir,
}

impl ReadyPaper {
    /// Wrap an already-populated work dir. The PDF is expected at
    /// `<work_dir>/<id>.pdf` (see [`pdf_file_name`]).
    pub fn new(mut job: PaperJob, work_dir: TempDir) -> Self {
        if job.status == JobStatus::Pending {
            job.advance(JobStatus::Downloading);
        }
        if job.status == JobStatus::Downloading {
            job.advance(JobStatus::Ready);
        }
        let pdf_path = work_dir.path().join(pdf_file_name(job.arxiv_id()));
        Self {
            job,
            pdf_path,
            work_dir,
        }
    }

    pub fn arxiv_id(&self) -> &str {
        self.job.arxiv_id()
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf_path
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Directory handed to the conversion engine for its output.
    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.path().join("out")
    }
}

/// A paper whose download failed. The job is already in `failed`.
#[derive(Debug)]
pub struct FailedDownload {
    pub job: PaperJob,
    pub error: PaperError,
}

/// What the pipeline yields, in enumeration order.
pub type Prefetched = Result<ReadyPaper, FailedDownload>;

/// A boxed stream of prefetched papers.
pub type PaperStream = Pin<Box<dyn Stream<Item = Prefetched> + Send>>;

/// File name used for a paper's PDF inside its work dir.
pub fn pdf_file_name(arxiv_id: &str) -> String {
    format!("{}.pdf", arxiv_id.replace('/', "_"))
}

/// Counts concurrently running downloads and remembers the peak.
#[derive(Debug, Clone, Default)]
pub struct InFlightGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            current: Arc::clone(&self.current),
        }
    }
}

struct InFlightGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Start downloading `papers` in the background and return the ordered stream
/// of results.
///
/// Must be called inside a tokio runtime. Dropping the stream stops the
/// producer after its current send; downloads already running finish and are
/// discarded.
pub fn spawn_prefetch<S: PaperSource>(
    source: Arc<S>,
    papers: Vec<PaperRef>,
    config: &ProcessorConfig,
    gauge: InFlightGauge,
) -> PaperStream {
    let window = config.prefetch_window().max(1);
    let timeout = config.download_timeout();
    let (tx, rx) = mpsc::channel::<Prefetched>(config.batch_size.max(1));
    let total = papers.len();

    info!(
        "Prefetch started: {} papers, up to {} downloads in flight",
        total, window
    );

    tokio::spawn(async move {
        let mut downloads = stream::iter(papers)
            .map(move |paper| {
                let source = Arc::clone(&source);
                let gauge = gauge.clone();
                let fallback = paper.clone();
                let handle =
                    tokio::spawn(async move { download_one(&*source, paper, &gauge, timeout).await });
                async move {
                    handle.await.unwrap_or_else(|e| {
                        failed(
                            PaperJob::new(fallback),
                            |arxiv_id| PaperError::DownloadFailed {
                                arxiv_id,
                                reason: format!("download task aborted: {e}"),
                            },
                        )
                    })
                }
            })
            .buffered(window);

        let mut sent = 0usize;
        while let Some(item) = downloads.next().await {
            if tx.send(item).await.is_err() {
                debug!("Prefetch consumer went away after {} papers", sent);
                return;
            }
            sent += 1;
        }
        debug!("Prefetch finished: {}/{} papers handed over", sent, total);
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Download one paper into a fresh work dir.
async fn download_one<S: PaperSource>(
    source: &S,
    paper: PaperRef,
    gauge: &InFlightGauge,
    timeout: Duration,
) -> Prefetched {
    let mut job = PaperJob::new(paper);
    job.advance(JobStatus::Downloading);

    let prefix = format!("arxiv2md-{}-", job.arxiv_id().replace('/', "_"));
    let work_dir = match tempfile::Builder::new().prefix(&prefix).tempdir() {
        Ok(d) => d,
        Err(e) => {
            return failed(job, |arxiv_id| PaperError::DownloadFailed {
                arxiv_id,
                reason: format!("temp dir: {e}"),
            })
        }
    };
    let pdf_path = work_dir.path().join(pdf_file_name(job.arxiv_id()));

    let result = {
        let _in_flight = gauge.enter();
        match tokio::time::timeout(timeout, source.fetch(&job.paper, &pdf_path)).await {
            Ok(r) => r,
            Err(_) => Err(PaperError::DownloadFailed {
                arxiv_id: job.arxiv_id().to_string(),
                reason: format!("timed out after {}s", timeout.as_secs()),
            }),
        }
    };

    match result {
        Ok(()) => {
            debug!("Downloaded {}", job.arxiv_id());
            Ok(ReadyPaper::new(job, work_dir))
        }
        Err(error) => {
            warn!("Error downloading {}: {}", job.arxiv_id(), error);
            job.advance(JobStatus::Failed);
            Err(FailedDownload { job, error })
        }
    }
}

fn failed(mut job: PaperJob, error: impl FnOnce(String) -> PaperError) -> Prefetched {
    let error = error(job.arxiv_id().to_string());
    job.advance(JobStatus::Failed);
    Err(FailedDownload { job, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArxivError;
    use std::collections::HashMap;

    /// Serves fake PDFs from memory after a per-id delay.
    struct SlowSource {
        delays_ms: HashMap<String, u64>,
        broken: Vec<String>,
    }

    impl PaperSource for SlowSource {
        async fn list(&self, _yymm: &str) -> Result<Vec<PaperRef>, ArxivError> {
            Ok(Vec::new())
        }

        async fn fetch(&self, paper: &PaperRef, dest: &Path) -> Result<(), PaperError> {
            let delay = self.delays_ms.get(&paper.arxiv_id).copied().unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.broken.contains(&paper.arxiv_id) {
                return Err(PaperError::DownloadFailed {
                    arxiv_id: paper.arxiv_id.clone(),
                    reason: "HTTP 404 Not Found".into(),
                });
            }
            tokio::fs::write(dest, format!("%PDF-1.4 {}", paper.arxiv_id))
                .await
                .map_err(|e| PaperError::DownloadFailed {
                    arxiv_id: paper.arxiv_id.clone(),
                    reason: e.to_string(),
                })
        }
    }

    fn papers(n: usize) -> Vec<PaperRef> {
        (1..=n)
            .map(|i| PaperRef {
                arxiv_id: format!("2101.{i:05}v1"),
                base_id: format!("2101.{i:05}"),
                version: 1,
                source: String::new(),
            })
            .collect()
    }

    fn config(batch: usize, prefetch: usize) -> ProcessorConfig {
        ProcessorConfig::builder(1, 21)
            .batch_size(batch)
            .prefetch_factor(prefetch)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn emits_in_enumeration_order() {
        let list = papers(6);
        // Earlier papers take longer, so completion order is reversed.
        let delays_ms = list
            .iter()
            .enumerate()
            .map(|(i, p)| (p.arxiv_id.clone(), 60 - 10 * i as u64))
            .collect();
        let source = Arc::new(SlowSource {
            delays_ms,
            broken: vec![],
        });

        let stream = spawn_prefetch(source, list.clone(), &config(2, 3), InFlightGauge::new());
        let got: Vec<String> = stream
            .map(|item| item.unwrap().arxiv_id().to_string())
            .collect()
            .await;
        let want: Vec<String> = list.into_iter().map(|p| p.arxiv_id).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_window() {
        let source = Arc::new(SlowSource {
            delays_ms: HashMap::new(),
            broken: vec![],
        });
        let gauge = InFlightGauge::new();
        let cfg = config(2, 2);
        let mut stream = spawn_prefetch(source, papers(20), &cfg, gauge.clone());

        let mut seen = 0;
        while let Some(item) = stream.next().await {
            assert!(item.is_ok());
            assert!(gauge.current() <= cfg.prefetch_window());
            // Slow consumer: conversion takes longer than a download.
            tokio::time::sleep(Duration::from_millis(15)).await;
            seen += 1;
        }
        assert_eq!(seen, 20);
        assert!(gauge.peak() >= 1);
        assert!(
            gauge.peak() <= cfg.prefetch_window(),
            "peak {} > window {}",
            gauge.peak(),
            cfg.prefetch_window()
        );
        assert_eq!(gauge.current(), 0);
    }

    #[tokio::test]
    async fn failed_download_does_not_block_later_jobs() {
        let list = papers(4);
        let broken = list[1].arxiv_id.clone();
        let source = Arc::new(SlowSource {
            delays_ms: HashMap::new(),
            broken: vec![broken.clone()],
        });

        let items: Vec<Prefetched> = spawn_prefetch(source, list, &config(1, 2), InFlightGauge::new())
            .collect()
            .await;
        assert_eq!(items.len(), 4);
        for (i, item) in items.iter().enumerate() {
            match item {
                Ok(ready) => {
                    assert_ne!(i, 1);
                    assert_eq!(ready.job.status, JobStatus::Ready);
                    let bytes = std::fs::read(ready.pdf_path()).unwrap();
                    assert!(bytes.starts_with(b"%PDF"));
                }
                Err(f) => {
                    assert_eq!(i, 1);
                    assert_eq!(f.job.arxiv_id(), broken);
                    assert_eq!(f.job.status, JobStatus::Failed);
                    assert!(matches!(f.error, PaperError::DownloadFailed { .. }));
                }
            }
        }
    }

    #[tokio::test]
    async fn slow_download_hits_download_timeout() {
        let list = papers(1);
        let delays_ms = [(list[0].arxiv_id.clone(), 5_000)].into_iter().collect();
        let source = Arc::new(SlowSource {
            delays_ms,
            broken: vec![],
        });
        let cfg = ProcessorConfig::builder(1, 21)
            .download_timeout_secs(1)
            .build()
            .unwrap();

        let items: Vec<Prefetched> = spawn_prefetch(source, list, &cfg, InFlightGauge::new())
            .collect()
            .await;
        let err = items.into_iter().next().unwrap().err().unwrap();
        assert!(err.error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn work_dir_removed_on_drop() {
        let source = Arc::new(SlowSource {
            delays_ms: HashMap::new(),
            broken: vec![],
        });
        let mut stream = spawn_prefetch(source, papers(1), &config(1, 1), InFlightGauge::new());
        let ready = stream.next().await.unwrap().unwrap();
        let dir = ready.work_dir().to_path_buf();
        assert!(dir.exists());
        drop(ready);
        assert!(!dir.exists());
    }
}
