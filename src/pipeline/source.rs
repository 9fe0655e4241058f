//! Paper enumeration and PDF retrieval.
//!
//! arXiv mirrors every PDF in the public `arxiv-dataset` Google Cloud Storage
//! bucket under `arxiv/arxiv/pdf/<YYMM>/<id>v<N>.pdf`. [`GcsSource`] lists a
//! month through the GCS JSON API and downloads objects over plain HTTPS, so
//! no `gsutil` or credentials are needed. [`LocalDirSource`] reads the same
//! layout from a local mirror.
//!
//! Every version of a paper is stored; [`enumerate`] keeps only the highest
//! version of each base id.

use crate::error::{ArxivError, PaperError};
use crate::output::PaperRef;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Base URL of the GCS JSON API listing endpoint for the arXiv bucket.
pub const GCS_LIST_URL: &str = "https://storage.googleapis.com/storage/v1/b/arxiv-dataset/o";

/// Base URL for downloading objects from the arXiv bucket.
pub const GCS_DOWNLOAD_URL: &str = "https://storage.googleapis.com/arxiv-dataset";

/// Object-name prefix holding the PDFs of one month.
pub fn month_prefix(yymm: &str) -> String {
    format!("arxiv/arxiv/pdf/{yymm}/")
}

/// Where papers come from.
///
/// Implementations must be cheap to share: the prefetch pipeline holds one in
/// an `Arc` and calls [`fetch`](Self::fetch) from many concurrent downloads.
pub trait PaperSource: Send + Sync + 'static {
    /// Every PDF for the month (all versions; grouping happens in [`enumerate`]).
    fn list(&self, yymm: &str) -> impl Future<Output = Result<Vec<PaperRef>, ArxivError>> + Send;

    /// Retrieve `paper` into the file at `dest`.
    fn fetch(
        &self,
        paper: &PaperRef,
        dest: &Path,
    ) -> impl Future<Output = Result<(), PaperError>> + Send;
}

/// List the month and keep only the latest version of each paper, sorted by id.
pub async fn enumerate<S: PaperSource>(
    source: &S,
    yymm: &str,
) -> Result<Vec<PaperRef>, ArxivError> {
    let all = source.list(yymm).await?;
    let total = all.len();
    let latest = latest_versions(all);
    info!(
        "Found {} PDF files for {}, {} unique papers after grouping versions",
        total,
        yymm,
        latest.len()
    );
    Ok(latest)
}

/// Collapse versions: one [`PaperRef`] per base id, the highest version wins.
pub fn latest_versions(papers: Vec<PaperRef>) -> Vec<PaperRef> {
    let mut by_base: HashMap<String, PaperRef> = HashMap::new();
    for paper in papers {
        match by_base.get(&paper.base_id) {
            Some(existing) if existing.version >= paper.version => {}
            _ => {
                by_base.insert(paper.base_id.clone(), paper);
            }
        }
    }
    let mut out: Vec<PaperRef> = by_base.into_values().collect();
    out.sort_by(|a, b| a.base_id.cmp(&b.base_id));
    out
}

/// `2101.00001` or `hep-th/9901001`-style base identifiers (slash already
/// folded away in object names, as in `hep-th9901001`).
static RE_BASE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d{4}\.\d{4,5}|[a-z][a-z-]*(?:\.[A-Z]{2})?/?\d{7})$").unwrap()
});

/// Split `2101.00001v2` into (`2101.00001`, 2).
///
/// A missing suffix counts as version 1 and the whole stem is the base id. A
/// garbled suffix after a recognisable id (`2101.00001vx`) is dropped with a
/// warning and also counts as version 1.
pub fn parse_arxiv_id(stem: &str) -> (String, u32) {
    let Some((base, ver)) = stem.rsplit_once('v') else {
        return (stem.to_string(), 1);
    };
    if base.is_empty() || ver.is_empty() {
        return (stem.to_string(), 1);
    }
    if ver.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = ver.parse::<u32>() {
            return (base.to_string(), n);
        }
    } else if !RE_BASE_ID.is_match(base) {
        // The 'v' belongs to the id itself, e.g. `solv-int9901001`.
        return (stem.to_string(), 1);
    }
    warn!("Invalid version suffix in {}, treating as {}v1", stem, base);
    (base.to_string(), 1)
}

/// Build a [`PaperRef`] from an object name or file path ending in `.pdf`.
pub fn paper_ref_from_name(name: &str, source: String) -> Option<PaperRef> {
    let file = name.rsplit('/').next()?;
    let stem = file.strip_suffix(".pdf")?;
    if stem.is_empty() {
        return None;
    }
    let (base_id, version) = parse_arxiv_id(stem);
    Some(PaperRef {
        arxiv_id: stem.to_string(),
        base_id,
        version,
        source,
    })
}

// ── GCS ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

/// The public arXiv bucket on Google Cloud Storage.
#[derive(Debug, Clone)]
pub struct GcsSource {
    client: reqwest::Client,
    list_url: String,
    download_url: String,
    timeout: Duration,
}

impl GcsSource {
    /// `timeout` bounds each listing page and each PDF download.
    pub fn new(timeout: Duration) -> Result<Self, ArxivError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArxivError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            list_url: GCS_LIST_URL.to_string(),
            download_url: GCS_DOWNLOAD_URL.to_string(),
            timeout,
        })
    }

    /// Point at a different endpoint (a GCS emulator or mirror).
    pub fn with_endpoints(mut self, list_url: impl Into<String>, download_url: impl Into<String>) -> Self {
        self.list_url = list_url.into();
        self.download_url = download_url.into();
        self
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<&str>,
    ) -> Result<ListResponse, ArxivError> {
        let failed = |reason: String| ArxivError::ListingFailed {
            prefix: prefix.to_string(),
            reason,
        };

        let mut query = vec![
            ("prefix", prefix),
            ("fields", "items(name),nextPageToken"),
            ("maxResults", "1000"),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let response = self
            .client
            .get(&self.list_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        response
            .json::<ListResponse>()
            .await
            .map_err(|e| failed(format!("bad listing response: {e}")))
    }
}

impl PaperSource for GcsSource {
    async fn list(&self, yymm: &str) -> Result<Vec<PaperRef>, ArxivError> {
        let prefix = month_prefix(yymm);
        let mut papers = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.list_page(&prefix, token.as_deref()).await?;
            debug!("Listing page: {} objects", page.items.len());
            papers.extend(page.items.into_iter().filter_map(|item| {
                let url = format!("{}/{}", self.download_url, item.name);
                paper_ref_from_name(&item.name, url)
            }));
            match page.next_page_token {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => break,
            }
        }

        Ok(papers)
    }

    async fn fetch(&self, paper: &PaperRef, dest: &Path) -> Result<(), PaperError> {
        let failed = |reason: String| PaperError::DownloadFailed {
            arxiv_id: paper.arxiv_id.clone(),
            reason,
        };

        let response = self.client.get(&paper.source).send().await.map_err(|e| {
            if e.is_timeout() {
                failed(format!("timed out after {}s", self.timeout.as_secs()))
            } else {
                failed(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| failed(format!("create {}: {e}", dest.display())))?;

        let mut magic: Vec<u8> = Vec::with_capacity(4);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    failed(format!("timed out after {}s", self.timeout.as_secs()))
                } else {
                    failed(e.to_string())
                }
            })?;
            if magic.len() < 4 {
                let take = (4 - magic.len()).min(chunk.len());
                magic.extend_from_slice(&chunk[..take]);
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| failed(format!("write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| failed(format!("flush {}: {e}", dest.display())))?;

        check_magic(&paper.arxiv_id, &magic)
    }
}

// ── Local mirror ─────────────────────────────────────────────────────────

/// A local directory laid out like the bucket: `<root>/<YYMM>/<id>.pdf`.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PaperSource for LocalDirSource {
    async fn list(&self, yymm: &str) -> Result<Vec<PaperRef>, ArxivError> {
        let dir = self.root.join(yymm);
        let failed = |reason: String| ArxivError::ListingFailed {
            prefix: dir.display().to_string(),
            reason,
        };

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut papers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| failed(e.to_string()))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(paper) = paper_ref_from_name(name, path.display().to_string()) {
                papers.push(paper);
            }
        }
        Ok(papers)
    }

    async fn fetch(&self, paper: &PaperRef, dest: &Path) -> Result<(), PaperError> {
        tokio::fs::copy(&paper.source, dest)
            .await
            .map_err(|e| PaperError::DownloadFailed {
                arxiv_id: paper.arxiv_id.clone(),
                reason: format!("copy {}: {e}", paper.source),
            })?;

        let mut magic = [0u8; 4];
        let n = {
            use tokio::io::AsyncReadExt;
            let mut f = tokio::fs::File::open(dest)
                .await
                .map_err(|e| PaperError::DownloadFailed {
                    arxiv_id: paper.arxiv_id.clone(),
                    reason: e.to_string(),
                })?;
            f.read(&mut magic).await.unwrap_or(0)
        };
        check_magic(&paper.arxiv_id, &magic[..n])
    }
}

/// Reject anything that does not start with `%PDF`.
fn check_magic(arxiv_id: &str, magic: &[u8]) -> Result<(), PaperError> {
    if magic == b"%PDF" {
        Ok(())
    } else {
        Err(PaperError::NotAPdf {
            arxiv_id: arxiv_id.to_string(),
            magic: magic.to_vec(),
        })
    }
}
