//! Top-level entry point: one month, end to end.

use crate::checkpoint::CheckpointStore;
use crate::config::ProcessorConfig;
use crate::driver::BatchDriver;
use crate::error::ArxivError;
use crate::output::{PaperRef, RunStats};
use crate::pipeline::images::ImageExporter;
use crate::pipeline::invoke::PaperConverter;
use crate::pipeline::prefetch::{spawn_prefetch, InFlightGauge};
use crate::pipeline::source::{enumerate, PaperSource};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Process every not-yet-succeeded paper of `config`'s month.
///
/// Safe to re-run: papers whose latest checkpoint status is `succeeded` are
/// skipped, everything else (never seen, `failed`, `timed_out`) is attempted.
///
/// # Errors
/// Only setup problems are returned: unusable output directory, unreadable
/// checkpoint, failed listing. Per-paper failures end up in the checkpoint
/// and in the returned [`RunStats`].
pub async fn run<S, C, E>(
    config: &ProcessorConfig,
    source: Arc<S>,
    converter: C,
    exporter: E,
) -> Result<RunStats, ArxivError>
where
    S: PaperSource,
    C: PaperConverter,
    E: ImageExporter,
{
    let started = Instant::now();
    let yymm = config.yymm();
    info!("Processing arXiv month {}", yymm);

    prepare_output_dirs(config)?;
    let checkpoint = CheckpointStore::open(config.checkpoint_path())?;

    let papers = enumerate(&*source, &yymm).await?;
    let listed = papers.len();
    let (todo, skipped) = pending_papers(papers, &checkpoint);
    info!(
        "{} papers to process, {} already done",
        todo.len(),
        skipped
    );

    if let Some(cb) = &config.progress_callback {
        cb.on_run_start(todo.len(), skipped);
    }

    let mut stats = if todo.is_empty() {
        RunStats::default()
    } else {
        let mut driver = BatchDriver::new(config, checkpoint, converter, exporter)?;
        let stream = spawn_prefetch(source, todo, config, InFlightGauge::new());
        driver.drive(stream).await
    };

    stats.listed = listed;
    stats.skipped_done = skipped;
    stats.duration_ms = started.elapsed().as_millis() as u64;

    info!(
        "Month {} finished in {:.1}s: {} succeeded, {} failed ({} at download), {} timed out, {} skipped",
        yymm,
        stats.duration_ms as f64 / 1000.0,
        stats.succeeded,
        stats.failed,
        stats.download_failed,
        stats.timed_out,
        stats.skipped_done
    );

    if let Some(cb) = &config.progress_callback {
        cb.on_run_complete(&stats);
    }
    Ok(stats)
}

/// Split `papers` into those still to attempt and the count already done.
pub fn pending_papers(papers: Vec<PaperRef>, checkpoint: &CheckpointStore) -> (Vec<PaperRef>, usize) {
    let total = papers.len();
    let todo: Vec<PaperRef> = papers
        .into_iter()
        .filter(|p| !checkpoint.is_done(&p.arxiv_id))
        .collect();
    let skipped = total - todo.len();
    (todo, skipped)
}

fn prepare_output_dirs(config: &ProcessorConfig) -> Result<(), ArxivError> {
    let mut dirs = vec![config.output_dir.clone(), config.markdown_dir()];
    if let Some(parent) = config.checkpoint_path().parent() {
        dirs.push(parent.to_path_buf());
    }
    if config.write_dataset {
        if let Some(parent) = config.dataset_path().parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    for dir in dirs {
        create_dir(&dir)?;
    }
    Ok(())
}

fn create_dir(dir: &Path) -> Result<(), ArxivError> {
    std::fs::create_dir_all(dir).map_err(|source| ArxivError::OutputDirUnavailable {
        path: dir.to_path_buf(),
        source,
    })
}
