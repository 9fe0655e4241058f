//! Data types that flow through the pipeline and into the output files.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// One paper as enumerated by a [`crate::pipeline::source::PaperSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRef {
    /// Full identifier including version, e.g. `2101.00001v2`.
    pub arxiv_id: String,
    /// Identifier without the version suffix, e.g. `2101.00001`.
    pub base_id: String,
    /// Version number parsed from the suffix (1 when absent).
    pub version: u32,
    /// Where to fetch the PDF from (URL or local path).
    pub source: String,
}

/// Lifecycle of a [`PaperJob`] within one run.
///
/// ```text
/// pending → downloading → ready → converting → succeeded
///                │                    ├──────→ failed
///                └──→ failed          └──────→ timed_out
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Ready,
    Converting,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    /// Terminal states are absorbing for the rest of the run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Whether a later run should pick the paper up again.
    pub fn is_retry_eligible(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut)
    }

    /// Whether `self → next` is a legal step of the state machine.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed) => true,
            (Pending, Downloading)
            | (Downloading, Ready)
            | (Ready, Converting)
            | (Converting, Succeeded)
            | (Converting, TimedOut) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Ready => "ready",
            JobStatus::Converting => "converting",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work: a paper plus where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperJob {
    pub paper: PaperRef,
    pub status: JobStatus,
}

impl PaperJob {
    pub fn new(paper: PaperRef) -> Self {
        Self {
            paper,
            status: JobStatus::Pending,
        }
    }

    pub fn arxiv_id(&self) -> &str {
        &self.paper.arxiv_id
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` (and leaves the status untouched) for illegal steps,
    /// including any step out of a terminal state.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            warn!(
                "{}: ignoring illegal transition {} → {}",
                self.paper.arxiv_id, self.status, next
            );
            false
        }
    }
}

/// A figure extracted by the conversion engine.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    /// Reference exactly as it appears inside the Markdown (`![..](local_ref)`).
    pub local_ref: String,
    /// Raw file bytes as written by the engine.
    pub data: Vec<u8>,
    /// MIME type guessed from the file extension.
    pub mime_type: String,
}

impl fmt::Debug for ExtractedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractedImage")
            .field("local_ref", &self.local_ref)
            .field("bytes", &self.data.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Output of one successful engine invocation.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub arxiv_id: String,
    /// Markdown with image references still pointing at local files.
    pub markdown: String,
    /// Images in order of first appearance in `markdown`.
    pub images: Vec<ExtractedImage>,
    /// Wall-clock time spent in the engine.
    pub duration_ms: u64,
}

/// One line of `jsonls/arxiv_<YYMM>.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub arxiv_id: String,
    pub markdown: String,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Papers enumerated for the month (latest versions only).
    pub listed: usize,
    /// Papers skipped because the checkpoint already marks them succeeded.
    pub skipped_done: usize,
    /// Papers that reached a terminal status in this run.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Subset of `failed` that never got past the download stage.
    pub download_failed: usize,
    pub batches: usize,
    pub duration_ms: u64,
}

impl RunStats {
    pub(crate) fn count(&mut self, status: JobStatus) {
        self.attempted += 1;
        match status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::TimedOut => self.timed_out += 1,
            _ => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PaperJob {
        PaperJob::new(PaperRef {
            arxiv_id: "2101.00001v2".into(),
            base_id: "2101.00001".into(),
            version: 2,
            source: "gs://arxiv-dataset/arxiv/arxiv/pdf/2101/2101.00001v2.pdf".into(),
        })
    }

    #[test]
    fn happy_path_transitions() {
        let mut j = job();
        for next in [
            JobStatus::Downloading,
            JobStatus::Ready,
            JobStatus::Converting,
            JobStatus::Succeeded,
        ] {
            assert!(j.advance(next), "→ {next}");
        }
        assert_eq!(j.status, JobStatus::Succeeded);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut j = job();
        assert!(j.advance(JobStatus::Downloading));
        assert!(j.advance(JobStatus::Failed));
        assert!(!j.advance(JobStatus::Ready));
        assert!(!j.advance(JobStatus::Failed));
        assert_eq!(j.status, JobStatus::Failed);
    }

    #[test]
    fn cannot_skip_stages() {
        let mut j = job();
        assert!(!j.advance(JobStatus::Converting));
        assert!(!j.advance(JobStatus::TimedOut));
        assert_eq!(j.status, JobStatus::Pending);
    }

    #[test]
    fn status_serialises_snake_case() {
        let s = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(s, "\"timed_out\"");
        assert_eq!(JobStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn retry_eligibility() {
        assert!(JobStatus::Failed.is_retry_eligible());
        assert!(JobStatus::TimedOut.is_retry_eligible());
        assert!(!JobStatus::Succeeded.is_retry_eligible());
    }
}
