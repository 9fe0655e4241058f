//! CLI binary for arxiv-markdown.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ProcessorConfig`, wires up the source/engine/exporter and prints a summary.

use anyhow::{Context, Result};
use arxiv_markdown::{
    run, EngineCommand, GcsSource, ImageExporter, JobStatus, LocalDirSource, PaperConverter,
    PaperSource, ProcessorConfig, ProgressCallback, R2Exporter, R2Settings, RunProgressCallback,
    RunStats, SubprocessConverter,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar for the month, one log line per paper.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix("Listing");
        bar.set_message("Enumerating month…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, to_process: usize, skipped: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>5}/{len} papers  \
             ⏱ {elapsed_precise}  ETA {eta_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        self.bar.set_length(to_process as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {} {}",
            bold("◆"),
            bold(&format!("{to_process} papers to convert")),
            dim(&format!("({skipped} already done)"))
        ));
    }

    fn on_paper_start(&self, arxiv_id: &str) {
        self.bar.set_message(arxiv_id.to_string());
    }

    fn on_paper_complete(&self, arxiv_id: &str, images: usize) {
        self.bar.println(format!(
            "  {} {:<20} {}",
            green("✓"),
            arxiv_id,
            dim(&format!("{images} images"))
        ));
        self.bar.inc(1);
    }

    fn on_paper_error(&self, arxiv_id: &str, status: JobStatus, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let mark = if status == JobStatus::TimedOut {
            yellow("⏱")
        } else {
            red("✗")
        };
        self.bar
            .println(format!("  {} {:<20} {}", mark, arxiv_id, dim(error)));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _stats: &RunStats) {
        let errors = self.errors.load(Ordering::SeqCst);
        if errors > 0 {
            self.bar
                .println(format!("{} {errors} papers will be retried next run", yellow("!")));
        }
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert January 2021
  arxiv2md --month 1 --year 21

  # Smaller batches, longer deadline, custom output directory
  arxiv2md --month 3 --year 23 --batch-size 2 --timeout-per-paper 600 --output /data/arxiv

  # Convert PDFs already on disk under ./pdfs/2101/
  arxiv2md --month 1 --year 21 --source-dir ./pdfs

  # Use a different engine (placeholders: {input}, {output_dir}, {id})
  arxiv2md --month 1 --year 21 --engine marker_single \
    --engine-arg '{input}' --engine-arg --output_dir --engine-arg '{output_dir}'

Re-running the same month resumes: papers already recorded as succeeded in
<output>/checkpoints/arxiv_<YYMM>.checkpoint are skipped, failed and timed-out
papers are attempted again.

ENVIRONMENT VARIABLES (also read from .env):
  R2_ENDPOINT     S3 endpoint of the R2 account
  R2_KEY_ID       R2 access key id
  R2_KEY_SECRET   R2 secret access key
  R2_BUCKET       Bucket for figures (default: arxiv-markdown-images)
  R2_PUBLIC_URL   Public base URL the bucket is served under
  RUST_LOG        Overrides the log filter
"#;

/// Convert a month of arXiv PDFs to Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "arxiv2md",
    version,
    about = "Convert a month of arXiv PDFs to Markdown with figures on R2",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Month to process (1–12).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=12))]
    month: u8,

    /// Two-digit year (21 for 2021).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=99))]
    year: u8,

    /// Output root for markdown/, jsonls/ and checkpoints/.
    #[arg(short, long, env = "ARXIV2MD_OUTPUT", default_value = "./data")]
    output: PathBuf,

    /// Papers per batch.
    #[arg(
        long,
        env = "ARXIV2MD_BATCH_SIZE",
        default_value_t = 4,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    batch_size: usize,

    /// Batches' worth of downloads to keep in flight ahead of conversion.
    #[arg(
        long,
        env = "ARXIV2MD_PREFETCH",
        default_value_t = 3,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    prefetch: usize,

    /// Hard deadline for one paper's conversion, in seconds.
    #[arg(
        long,
        env = "ARXIV2MD_TIMEOUT_PER_PAPER",
        default_value_t = 240,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_per_paper: u64,

    /// Per-download timeout in seconds.
    #[arg(
        long,
        env = "ARXIV2MD_DOWNLOAD_TIMEOUT",
        default_value_t = 120,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    download_timeout: u64,

    /// Read PDFs from <DIR>/<YYMM>/*.pdf instead of the public GCS bucket.
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Conversion engine program (default: docling).
    #[arg(long, env = "ARXIV2MD_ENGINE")]
    engine: Option<String>,

    /// Engine argument; repeat for several. Replaces the default arguments.
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Checkpoint directory (default: <output>/checkpoints).
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Do not append to jsonls/arxiv_<YYMM>.jsonl.
    #[arg(long)]
    no_dataset: bool,

    /// R2 S3 endpoint.
    #[arg(long, env = "R2_ENDPOINT")]
    r2_endpoint: Option<String>,

    /// R2 access key id.
    #[arg(long, env = "R2_KEY_ID", hide_env_values = true)]
    r2_key_id: Option<String>,

    /// R2 secret access key.
    #[arg(long, env = "R2_KEY_SECRET", hide_env_values = true)]
    r2_key_secret: Option<String>,

    /// R2 bucket for figures.
    #[arg(long, env = "R2_BUCKET", default_value = "arxiv-markdown-images")]
    r2_bucket: String,

    /// Public base URL the bucket is served under.
    #[arg(long, env = "R2_PUBLIC_URL")]
    r2_public_url: Option<String>,

    /// Key prefix for uploaded figures.
    #[arg(long, env = "R2_KEY_PREFIX", default_value = "")]
    r2_key_prefix: String,

    /// Disable progress bar.
    #[arg(long, env = "ARXIV2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "ARXIV2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "ARXIV2MD_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before parsing so env-backed flags see .env values.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as ProgressCallback)
    } else {
        None
    };

    let config = build_config(&cli, progress)?;
    let converter = SubprocessConverter::new(engine_command(&cli), config.timeout_per_paper());
    let exporter = R2Exporter::new(&r2_settings(&cli)?).context("Failed to set up R2 client")?;

    let stats = match &cli.source_dir {
        Some(dir) => {
            let source = Arc::new(LocalDirSource::new(dir));
            process(&config, source, converter, exporter).await?
        }
        None => {
            let source = Arc::new(
                GcsSource::new(config.download_timeout())
                    .context("Failed to build HTTP client")?,
            );
            process(&config, source, converter, exporter).await?
        }
    };

    if !cli.quiet {
        print_summary(&config, &stats);
    }
    Ok(())
}

async fn process<S, C, E>(
    config: &ProcessorConfig,
    source: Arc<S>,
    converter: C,
    exporter: E,
) -> Result<RunStats>
where
    S: PaperSource,
    C: PaperConverter,
    E: ImageExporter,
{
    run(config, source, converter, exporter)
        .await
        .with_context(|| format!("Processing month {} failed", config.yymm()))
}

fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ProcessorConfig> {
    let mut builder = ProcessorConfig::builder(cli.month, cli.year)
        .output_dir(&cli.output)
        .batch_size(cli.batch_size)
        .prefetch_factor(cli.prefetch)
        .timeout_per_paper_secs(cli.timeout_per_paper)
        .download_timeout_secs(cli.download_timeout)
        .write_dataset(!cli.no_dataset);

    if let Some(dir) = &cli.checkpoint_dir {
        builder = builder.checkpoint_dir(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn engine_command(cli: &Cli) -> EngineCommand {
    let default = EngineCommand::docling();
    let program = cli.engine.clone().unwrap_or(default.program);
    let args = if cli.engine_args.is_empty() {
        default.args
    } else {
        cli.engine_args.clone()
    };
    EngineCommand::new(program, args)
}

fn r2_settings(cli: &Cli) -> Result<R2Settings> {
    fn required(value: &Option<String>, name: &str) -> Result<String> {
        value
            .clone()
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{name} is not set (flag or environment)"))
    }

    Ok(R2Settings {
        bucket: cli.r2_bucket.clone(),
        endpoint: required(&cli.r2_endpoint, "R2_ENDPOINT")?,
        access_key: required(&cli.r2_key_id, "R2_KEY_ID")?,
        secret_key: required(&cli.r2_key_secret, "R2_KEY_SECRET")?,
        public_base_url: required(&cli.r2_public_url, "R2_PUBLIC_URL")?,
        key_prefix: cli.r2_key_prefix.clone(),
    })
}

fn print_summary(config: &ProcessorConfig, stats: &RunStats) {
    let failed = stats.failed + stats.timed_out;
    let headline = if failed == 0 {
        green("✔ Done")
    } else {
        yellow("✔ Done with failures")
    };
    eprintln!(
        "{}  month {}  {} succeeded, {} failed ({} at download), {} timed out, {} skipped  {}",
        headline,
        config.yymm(),
        bold(&stats.succeeded.to_string()),
        red(&stats.failed.to_string()),
        stats.download_failed,
        yellow(&stats.timed_out.to_string()),
        stats.skipped_done,
        dim(&format!("{:.1}s", stats.duration_ms as f64 / 1000.0)),
    );
    if failed > 0 {
        eprintln!(
            "{}",
            dim(&format!(
                "Re-run the same command to retry; see {}",
                config.checkpoint_path().display()
            ))
        );
    }
}
