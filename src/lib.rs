//! # arxiv-markdown
//!
//! Convert a whole month of arXiv PDFs into Markdown, resumably.
//!
//! ## Pipeline Overview
//!
//! ```text
//! month (YYMM)
//!  │
//!  ├─ 1. List      gs://arxiv-dataset/arxiv/arxiv/pdf/<YYMM>/, latest versions only
//!  ├─ 2. Filter    drop papers the checkpoint already marks succeeded
//!  ├─ 3. Prefetch  bounded concurrent downloads, in enumeration order
//!  ├─ 4. Convert   external engine (docling) per paper, killed at the deadline
//!  ├─ 5. Figures   JPEG re-encode, upload to R2, rewrite image refs
//!  └─ 6. Output    markdown/<id>.md + jsonls/arxiv_<YYMM>.jsonl + checkpoint
//! ```
//!
//! Each paper either succeeds or ends in `failed`/`timed_out`; neither stops the
//! run, and both are retried the next time the same month is processed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arxiv_markdown::{run, EngineCommand, GcsSource, ProcessorConfig, R2Exporter, R2Settings,
//!     SubprocessConverter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessorConfig::builder(1, 21).output_dir("./data").build()?;
//!     let source = Arc::new(GcsSource::new(config.download_timeout())?);
//!     let converter = SubprocessConverter::new(EngineCommand::docling(), config.timeout_per_paper());
//!     let exporter = R2Exporter::new(&R2Settings {
//!         bucket: "arxiv-markdown-images".into(),
//!         endpoint: std::env::var("R2_ENDPOINT")?,
//!         access_key: std::env::var("R2_KEY_ID")?,
//!         secret_key: std::env::var("R2_KEY_SECRET")?,
//!         public_base_url: std::env::var("R2_PUBLIC_URL")?,
//!         key_prefix: String::new(),
//!     })?;
//!
//!     let stats = run(&config, source, converter, exporter).await?;
//!     eprintln!("{} succeeded, {} failed", stats.succeeded, stats.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `arxiv2md` binary (clap + anyhow + tracing-subscriber + indicatif + dotenvy) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod run;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{CheckpointRecord, CheckpointStore, RecordMetadata};
pub use config::{ProcessorConfig, ProcessorConfigBuilder};
pub use driver::BatchDriver;
pub use error::{ArxivError, PaperError};
pub use output::{
    ConversionResult, DatasetRecord, ExtractedImage, JobStatus, PaperJob, PaperRef, RunStats,
};
pub use pipeline::images::{ImageExporter, R2Exporter, R2Settings, UploadError};
pub use pipeline::invoke::{EngineCommand, PaperConverter, SubprocessConverter};
pub use pipeline::prefetch::{spawn_prefetch, InFlightGauge, PaperStream, ReadyPaper};
pub use pipeline::source::{GcsSource, LocalDirSource, PaperSource};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use run::run;
