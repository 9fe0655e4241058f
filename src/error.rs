//! Error types for the arxiv-markdown library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ArxivError`]: **Fatal**: the run cannot proceed at all (bad
//!   configuration, unwritable output directory, listing failed). Returned as
//!   `Err(ArxivError)` from [`crate::run::run`] and friends.
//!
//! * [`PaperError`]: **Non-fatal**: a single paper failed (download glitch,
//!   engine crash, hung conversion, broken upload) but the rest of the month is
//!   fine. Recorded in the checkpoint log so the next run retries it.
//!
//! [`ArxivError::CheckpointWrite`] sits in between: it is returned by
//! [`crate::checkpoint::CheckpointStore::record`], and the batch driver logs
//! it and keeps going.

use crate::output::JobStatus;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the arxiv-markdown library.
#[derive(Debug, Error)]
pub enum ArxivError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Setup errors ──────────────────────────────────────────────────────
    /// The output directory (or one of its subdirectories) could not be created.
    #[error("Output directory '{path}' is not usable: {source}")]
    OutputDirUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Enumerating the month's papers failed.
    #[error("Failed to list papers under '{prefix}': {reason}")]
    ListingFailed { prefix: String, reason: String },

    /// The checkpoint log exists but could not be opened or read.
    #[error("Failed to open checkpoint '{path}': {source}")]
    CheckpointOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Appending one checkpoint record failed. Fatal for that record only.
    #[error("Failed to write checkpoint record for {arxiv_id} to '{path}': {source}")]
    CheckpointWrite {
        arxiv_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The object-storage client could not be constructed.
    #[error("Storage configuration error: {0}")]
    StorageConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single paper.
///
/// The `Display` text is what lands in the checkpoint record's `error` field.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PaperError {
    /// Network error or missing source object.
    #[error("{arxiv_id}: download failed: {reason}")]
    DownloadFailed { arxiv_id: String, reason: String },

    /// The downloaded file does not start with `%PDF`.
    #[error("{arxiv_id}: source is not a PDF (first bytes: {magic:?})")]
    NotAPdf { arxiv_id: String, magic: Vec<u8> },

    /// The engine did not finish before the deadline and was killed.
    #[error("{arxiv_id}: conversion timed out after {secs}s")]
    Timeout { arxiv_id: String, secs: u64 },

    /// The engine exited with an error or produced unusable output.
    #[error("{arxiv_id}: conversion failed: {detail}")]
    ConversionFailed { arxiv_id: String, detail: String },

    /// An extracted image could not be exported.
    #[error("{arxiv_id}: upload of '{image}' failed: {detail}")]
    UploadFailed {
        arxiv_id: String,
        image: String,
        detail: String,
    },

    /// The Markdown file or dataset line could not be written.
    #[error("{arxiv_id}: failed to write '{path}': {detail}")]
    OutputWriteFailed {
        arxiv_id: String,
        path: PathBuf,
        detail: String,
    },
}

impl PaperError {
    /// Terminal status this error puts the job in.
    pub fn status(&self) -> JobStatus {
        match self {
            PaperError::Timeout { .. } => JobStatus::TimedOut,
            _ => JobStatus::Failed,
        }
    }

    pub fn arxiv_id(&self) -> &str {
        match self {
            PaperError::DownloadFailed { arxiv_id, .. }
            | PaperError::NotAPdf { arxiv_id, .. }
            | PaperError::Timeout { arxiv_id, .. }
            | PaperError::ConversionFailed { arxiv_id, .. }
            | PaperError::UploadFailed { arxiv_id, .. }
            | PaperError::OutputWriteFailed { arxiv_id, .. } => arxiv_id,
        }
    }
}
