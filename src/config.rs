//! Configuration for one monthly processing run.
//!
//! All run behaviour is controlled through [`ProcessorConfig`], built via its
//! [`ProcessorConfigBuilder`]. The config is passed explicitly into every
//! component (prefetch, invoker, driver) so each one can be exercised in
//! isolation with a synthetic configuration.

use crate::error::ArxivError;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a processing run over one `YYMM` month.
///
/// # Example
/// ```rust
/// use arxiv_markdown::ProcessorConfig;
///
/// let config = ProcessorConfig::builder(1, 21)
///     .output_dir("./data")
///     .batch_size(8)
///     .prefetch_factor(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.yymm(), "2101");
/// assert_eq!(config.prefetch_window(), 16);
/// ```
#[derive(Clone)]
pub struct ProcessorConfig {
    /// Month, 1–12.
    pub month: u8,

    /// Two-digit year, 0–99 (`21` for 2021).
    pub year: u8,

    /// Root of all outputs. Default: `./data`.
    pub output_dir: PathBuf,

    /// Directory for the checkpoint log. Default: `<output_dir>/checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,

    /// Papers per driver batch. Default: 4.
    pub batch_size: usize,

    /// How many batches' worth of downloads may run ahead of conversion. Default: 3.
    ///
    /// The in-flight download window is `prefetch_factor × batch_size`.
    pub prefetch_factor: usize,

    /// Hard wall-clock limit for one engine invocation, in seconds. Default: 240.
    pub timeout_per_paper_secs: u64,

    /// Per-download HTTP timeout, in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Append each succeeded paper to `jsonls/arxiv_<YYMM>.jsonl`. Default: true.
    pub write_dataset: bool,

    /// Optional observer for per-paper events.
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for ProcessorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorConfig")
            .field("month", &self.month)
            .field("year", &self.year)
            .field("output_dir", &self.output_dir)
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("batch_size", &self.batch_size)
            .field("prefetch_factor", &self.prefetch_factor)
            .field("timeout_per_paper_secs", &self.timeout_per_paper_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("write_dataset", &self.write_dataset)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn RunProgressCallback>"),
            )
            .finish()
    }
}

impl ProcessorConfig {
    /// Create a builder for the given month (1–12) and two-digit year.
    pub fn builder(month: u8, year: u8) -> ProcessorConfigBuilder {
        ProcessorConfigBuilder {
            config: Self {
                month,
                year,
                output_dir: PathBuf::from("./data"),
                checkpoint_dir: None,
                batch_size: 4,
                prefetch_factor: 3,
                timeout_per_paper_secs: 240,
                download_timeout_secs: 120,
                write_dataset: true,
                progress_callback: None,
            },
        }
    }

    /// `YYMM`, the arXiv month prefix (e.g. `2101`).
    pub fn yymm(&self) -> String {
        format!("{:02}{:02}", self.year, self.month)
    }

    /// Maximum number of concurrently downloading papers.
    pub fn prefetch_window(&self) -> usize {
        self.prefetch_factor.saturating_mul(self.batch_size)
    }

    pub fn timeout_per_paper(&self) -> Duration {
        Duration::from_secs(self.timeout_per_paper_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// `<checkpoint_dir>/arxiv_<YYMM>.checkpoint`
    pub fn checkpoint_path(&self) -> PathBuf {
        let dir = self
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("checkpoints"));
        dir.join(format!("arxiv_{}.checkpoint", self.yymm()))
    }

    /// `<output_dir>/jsonls/arxiv_<YYMM>.jsonl`
    pub fn dataset_path(&self) -> PathBuf {
        self.output_dir
            .join("jsonls")
            .join(format!("arxiv_{}.jsonl", self.yymm()))
    }

    /// `<output_dir>/markdown`
    pub fn markdown_dir(&self) -> PathBuf {
        self.output_dir.join("markdown")
    }

    /// Path of the Markdown file for one paper.
    pub fn markdown_path(&self, arxiv_id: &str) -> PathBuf {
        self.markdown_dir()
            .join(format!("{}.md", arxiv_id.replace('/', "_")))
    }
}

/// Builder for [`ProcessorConfig`].
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.checkpoint_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.max(1);
        self
    }

    pub fn prefetch_factor(mut self, n: usize) -> Self {
        self.config.prefetch_factor = n.max(1);
        self
    }

    pub fn timeout_per_paper_secs(mut self, secs: u64) -> Self {
        self.config.timeout_per_paper_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn write_dataset(mut self, v: bool) -> Self {
        self.config.write_dataset = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessorConfig, ArxivError> {
        let c = &self.config;
        if !(1..=12).contains(&c.month) {
            return Err(ArxivError::InvalidConfig(format!(
                "Month must be 1–12, got {}",
                c.month
            )));
        }
        if c.year > 99 {
            return Err(ArxivError::InvalidConfig(format!(
                "Year must be two digits (0–99), got {}",
                c.year
            )));
        }
        if c.timeout_per_paper_secs == 0 {
            return Err(ArxivError::InvalidConfig(
                "Timeout per paper must be ≥ 1s".into(),
            ));
        }
        if c.download_timeout_secs == 0 {
            return Err(ArxivError::InvalidConfig(
                "Download timeout must be ≥ 1s".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ProcessorConfig::builder(3, 21).build().unwrap();
        assert_eq!(c.batch_size, 4);
        assert_eq!(c.prefetch_factor, 3);
        assert_eq!(c.timeout_per_paper_secs, 240);
        assert_eq!(c.prefetch_window(), 12);
        assert_eq!(c.yymm(), "2103");
    }

    #[test]
    fn huge_prefetch_window_saturates() {
        let c = ProcessorConfig::builder(3, 21)
            .batch_size(usize::MAX / 2)
            .prefetch_factor(3)
            .build()
            .unwrap();
        assert_eq!(c.prefetch_window(), usize::MAX);
    }

    #[test]
    fn derived_paths() {
        let c = ProcessorConfig::builder(11, 9)
            .output_dir("/tmp/out")
            .build()
            .unwrap();
        assert_eq!(
            c.checkpoint_path(),
            PathBuf::from("/tmp/out/checkpoints/arxiv_0911.checkpoint")
        );
        assert_eq!(
            c.dataset_path(),
            PathBuf::from("/tmp/out/jsonls/arxiv_0911.jsonl")
        );
        assert_eq!(
            c.markdown_path("hep-th/9901001v1"),
            PathBuf::from("/tmp/out/markdown/hep-th_9901001v1.md")
        );
    }

    #[test]
    fn checkpoint_dir_override() {
        let c = ProcessorConfig::builder(1, 21)
            .output_dir("/tmp/out")
            .checkpoint_dir("/var/ckpt")
            .build()
            .unwrap();
        assert_eq!(
            c.checkpoint_path(),
            PathBuf::from("/var/ckpt/arxiv_2101.checkpoint")
        );
    }

    #[test]
    fn rejects_bad_month_and_year() {
        assert!(ProcessorConfig::builder(0, 21).build().is_err());
        assert!(ProcessorConfig::builder(13, 21).build().is_err());
        assert!(ProcessorConfig::builder(1, 100).build().is_err());
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let c = ProcessorConfig::builder(1, 21)
            .batch_size(0)
            .prefetch_factor(0)
            .build()
            .unwrap();
        assert_eq!(c.batch_size, 1);
        assert_eq!(c.prefetch_factor, 1);
    }

    #[test]
    fn zero_timeout_rejected() {
        let r = ProcessorConfig::builder(1, 21)
            .timeout_per_paper_secs(0)
            .build();
        assert!(matches!(r, Err(ArxivError::InvalidConfig(_))));
    }
}
