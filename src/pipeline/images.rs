//! Figure export: re-encode, upload, and point the Markdown at the uploads.
//!
//! The engine writes figures next to its Markdown and references them with
//! relative paths (`![Image](paper_artifacts/image_000001.png)`). Those paths
//! are meaningless once the work dir is gone, so every local reference is
//! replaced by the public URL returned from an [`ImageExporter`]. A local
//! reference whose file the engine never wrote is turned into its alt text in
//! italics; the output never keeps a dangling local link.

use crate::error::{ArxivError, PaperError};
use crate::output::{ConversionResult, ExtractedImage};
use image::codecs::jpeg::JpegEncoder;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use tracing::{debug, warn};

/// JPEG quality used when re-encoding figures.
pub const JPEG_QUALITY: u8 = 95;

// ── Markdown references ──────────────────────────────────────────────────

/// `![alt](target)` or `![alt](target "title")`, target optionally in `<…>`.
static RE_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[([^\]]*)\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#).unwrap()
});

/// True for targets that already point somewhere public.
pub fn is_remote(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("data:")
        || target.starts_with("//")
}

/// Distinct local image targets in order of first appearance.
pub fn local_image_refs(markdown: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in RE_IMAGE.captures_iter(markdown) {
        let target = &caps[2];
        if !is_remote(target) && !seen.iter().any(|s: &String| s == target) {
            seen.push(target.to_string());
        }
    }
    seen
}

/// Replace local image targets with the URLs in `urls`.
///
/// Remote targets are left alone; local targets missing from `urls` become
/// `*alt*` (or vanish when the alt text is empty).
pub fn rewrite_image_refs(markdown: &str, urls: &HashMap<String, String>) -> String {
    RE_IMAGE
        .replace_all(markdown, |caps: &Captures<'_>| {
            let alt = &caps[1];
            let target = &caps[2];
            if is_remote(target) {
                return caps[0].to_string();
            }
            match urls.get(target) {
                Some(url) => format!("![{alt}]({url})"),
                None if alt.trim().is_empty() => String::new(),
                None => format!("*{}*", alt.trim()),
            }
        })
        .into_owned()
}

// ── Encoding ─────────────────────────────────────────────────────────────

/// Re-encode any decodable image as an RGB JPEG.
pub fn encode_jpeg(data: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(data)?;
    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(
        &mut Cursor::new(&mut buf),
        JPEG_QUALITY,
    ))?;
    Ok(buf)
}

/// Deterministic upload name, so a retried paper overwrites its own figures.
pub fn figure_name(arxiv_id: &str, index: usize, ext: &str) -> String {
    format!("{}-figure-{:03}.{}", arxiv_id.replace('/', "_"), index, ext)
}

/// An image ready for upload.
#[derive(Debug)]
pub struct PreparedImage {
    pub name: String,
    pub data: Vec<u8>,
    pub content_type: String,
}

/// JPEG-encode one figure, falling back to the original bytes when they do
/// not decode (SVG, exotic formats).
pub fn prepare_image(arxiv_id: &str, index: usize, image: &ExtractedImage) -> PreparedImage {
    match encode_jpeg(&image.data) {
        Ok(data) => PreparedImage {
            name: figure_name(arxiv_id, index, "jpg"),
            data,
            content_type: "image/jpeg".to_string(),
        },
        Err(e) => {
            debug!(
                "{}: keeping '{}' as-is ({}): {}",
                arxiv_id, image.local_ref, image.mime_type, e
            );
            let ext = image
                .local_ref
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .unwrap_or_else(|| "bin".to_string());
            PreparedImage {
                name: figure_name(arxiv_id, index, &ext),
                data: image.data.clone(),
                content_type: image.mime_type.clone(),
            }
        }
    }
}

// ── Exporter ─────────────────────────────────────────────────────────────

/// Errors from an [`ImageExporter`].
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage returned HTTP {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

/// Receives extracted images and returns the public URL of each.
///
/// Uploading the same name twice must be harmless; a paper whose upload failed
/// is retried wholesale in a later run.
pub trait ImageExporter: Send + Sync {
    fn upload(
        &self,
        data: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> impl Future<Output = Result<String, UploadError>> + Send;
}

/// Upload every image of `result` and return `local_ref → public URL`.
///
/// Stops at the first failure; nothing is written for the paper in that case.
pub async fn export_images<E: ImageExporter>(
    exporter: &E,
    result: &ConversionResult,
) -> Result<HashMap<String, String>, PaperError> {
    let mut urls = HashMap::with_capacity(result.images.len());

    for (index, image) in result.images.iter().enumerate() {
        let arxiv_id = result.arxiv_id.clone();
        let source = image.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare_image(&arxiv_id, index, &source))
            .await
            .map_err(|e| PaperError::UploadFailed {
                arxiv_id: result.arxiv_id.clone(),
                image: image.local_ref.clone(),
                detail: format!("encode task panicked: {e}"),
            })?;

        let name = prepared.name.clone();
        let url = exporter
            .upload(prepared.data, &prepared.name, &prepared.content_type)
            .await
            .map_err(|e| PaperError::UploadFailed {
                arxiv_id: result.arxiv_id.clone(),
                image: name.clone(),
                detail: e.to_string(),
            })?;

        debug!("Uploaded image {} to {}", name, url);
        urls.insert(image.local_ref.clone(), url);
    }

    Ok(urls)
}

/// Connection settings for [`R2Exporter`].
#[derive(Clone)]
pub struct R2Settings {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Public base under which uploaded keys are served, e.g.
    /// `https://images.example.org/arxiv-markdown-images`.
    pub public_base_url: String,
    /// Optional key prefix (`figures/`).
    pub key_prefix: String,
}

impl std::fmt::Debug for R2Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R2Settings")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("public_base_url", &self.public_base_url)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

/// Cloudflare R2 (S3-compatible) image exporter.
pub struct R2Exporter {
    bucket: Box<Bucket>,
    public_base_url: String,
    key_prefix: String,
}

impl R2Exporter {
    pub fn new(settings: &R2Settings) -> Result<Self, ArxivError> {
        if settings.public_base_url.is_empty() {
            return Err(ArxivError::StorageConfig(
                "public base URL is required".into(),
            ));
        }

        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: settings.endpoint.clone(),
        };

        let credentials = Credentials::new(
            Some(&settings.access_key),
            Some(&settings.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| ArxivError::StorageConfig(e.to_string()))?;

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| ArxivError::StorageConfig(e.to_string()))?;

        Ok(Self {
            bucket,
            public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
            key_prefix: settings.key_prefix.clone(),
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

impl ImageExporter for R2Exporter {
    async fn upload(
        &self,
        data: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> Result<String, UploadError> {
        let key = format!("{}{}", self.key_prefix, name);
        let response = self
            .bucket
            .put_object_with_content_type(&key, &data, content_type)
            .await?;

        let code = response.status_code();
        if !(200..300).contains(&code) {
            warn!("R2 rejected {}: HTTP {}", key, code);
            return Err(UploadError::Status(code));
        }
        Ok(self.public_url(&key))
    }
}
