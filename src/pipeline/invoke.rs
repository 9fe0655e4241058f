//! Running the external PDF→Markdown engine under a hard deadline.
//!
//! The engine is an ordinary program (docling by default) started once per
//! paper in its own process. A paper that exceeds the deadline is killed and
//! reaped before [`SubprocessConverter::convert`] returns, so a hung
//! conversion never outlives its job or holds up the next one.

use crate::error::PaperError;
use crate::output::{ConversionResult, ExtractedImage};
use crate::pipeline::images::local_image_refs;
use crate::pipeline::prefetch::ReadyPaper;
use std::fs::File;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Bytes of engine log kept in a `ConversionFailed` detail.
const LOG_TAIL_BYTES: u64 = 2_000;

/// Turns one downloaded paper into Markdown plus its local figures.
pub trait PaperConverter: Send + Sync {
    fn convert(
        &self,
        paper: &ReadyPaper,
    ) -> impl Future<Output = Result<ConversionResult, PaperError>> + Send;
}

/// Program plus argument template for the engine.
///
/// Arguments may contain `{input}` (PDF path), `{output_dir}` (directory the
/// engine must write into) and `{id}` (arXiv identifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// docling CLI with code and formula enrichment, figures exported as files.
    pub fn docling() -> Self {
        Self::new(
            "docling",
            [
                "--to",
                "md",
                "--image-export-mode",
                "referenced",
                "--enrich-code",
                "--enrich-formula",
                "--output",
                "{output_dir}",
                "{input}",
            ],
        )
    }

    /// Arguments with placeholders substituted.
    pub fn render_args(&self, input: &Path, output_dir: &Path, arxiv_id: &str) -> Vec<String> {
        let input = input.to_string_lossy();
        let output_dir = output_dir.to_string_lossy();
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", &input)
                    .replace("{output_dir}", &output_dir)
                    .replace("{id}", arxiv_id)
            })
            .collect()
    }
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self::docling()
    }
}

/// [`PaperConverter`] that shells out to an [`EngineCommand`].
#[derive(Debug, Clone)]
pub struct SubprocessConverter {
    engine: EngineCommand,
    timeout: Duration,
}

impl SubprocessConverter {
    pub fn new(engine: EngineCommand, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl PaperConverter for SubprocessConverter {
    async fn convert(&self, paper: &ReadyPaper) -> Result<ConversionResult, PaperError> {
        let arxiv_id = paper.arxiv_id().to_string();
        let fail = |detail: String| PaperError::ConversionFailed {
            arxiv_id: arxiv_id.clone(),
            detail,
        };

        let out_dir = paper.output_dir();
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| fail(format!("cannot create '{}': {e}", out_dir.display())))?;

        let log_path = paper.work_dir().join("engine.log");
        let log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| fail(format!("engine log: {e}")))?
            .into_std()
            .await;

        let args = self.engine.render_args(paper.pdf_path(), &out_dir, &arxiv_id);
        debug!("{}: running {} {:?}", arxiv_id, self.engine.program, args);

        let mut command = Command::new(&self.engine.program);
        command
            .args(&args)
            .current_dir(paper.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        // Own process group, so wrappers and worker processes die with the engine.
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| fail(format!("failed to start '{}': {e}", self.engine.program)))?;
        let pgid = child.id();

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        if let Some(pgid) = pgid {
            // Also clears anything the engine left behind after a normal exit.
            kill_process_group(pgid);
        }

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(fail(format!("waiting for engine: {e}"))),
            Err(_) => {
                // kill() signals the leader and waits, so it is reaped here.
                if let Err(e) = child.kill().await {
                    warn!("{}: failed to kill engine after timeout: {}", arxiv_id, e);
                }
                warn!(
                    "{}: engine exceeded {}s, killed",
                    arxiv_id,
                    self.timeout.as_secs()
                );
                return Err(PaperError::Timeout {
                    arxiv_id: arxiv_id.clone(),
                    secs: self.timeout.as_secs(),
                });
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if !status.success() {
            let tail = log_tail(log_path).await;
            return Err(fail(if tail.is_empty() {
                format!("engine exited with {status}")
            } else {
                format!("engine exited with {status}: {tail}")
            }));
        }

        let stem = paper
            .pdf_path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| arxiv_id.clone());
        let md_path = {
            let dir = out_dir.clone();
            tokio::task::spawn_blocking(move || find_markdown(&dir, &stem))
                .await
                .map_err(|e| fail(format!("output scan panicked: {e}")))?
                .map_err(fail)?
        };
        let raw = tokio::fs::read(&md_path)
            .await
            .map_err(|e| fail(format!("reading '{}': {e}", md_path.display())))?;
        let markdown = String::from_utf8(raw)
            .map_err(|e| fail(format!("'{}' is not UTF-8: {e}", md_path.display())))?;

        let base = md_path.parent().unwrap_or(out_dir.as_path()).to_path_buf();
        let mut images = Vec::new();
        for local_ref in local_image_refs(&markdown) {
            let path = base.join(&local_ref);
            match tokio::fs::read(&path).await {
                Ok(data) => images.push(ExtractedImage {
                    mime_type: mime_for(&path).to_string(),
                    local_ref,
                    data,
                }),
                Err(e) => debug!("{}: image '{}' not readable: {}", arxiv_id, local_ref, e),
            }
        }

        debug!(
            "{}: converted in {}ms ({} images)",
            arxiv_id,
            duration_ms,
            images.len()
        );

        Ok(ConversionResult {
            arxiv_id,
            markdown,
            images,
            duration_ms,
        })
    }
}

/// SIGKILL every process in the group led by the engine.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        // ESRCH: the group is already empty.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill engine process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// `<out_dir>/<stem>.md`, else the only `.md` file anywhere under `out_dir`.
fn find_markdown(out_dir: &Path, stem: &str) -> Result<PathBuf, String> {
    let expected = out_dir.join(format!("{stem}.md"));
    if expected.is_file() {
        return Ok(expected);
    }

    let mut found = Vec::new();
    collect_markdown(out_dir, &mut found);
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err("engine produced no Markdown".into()),
        n => Err(format!(
            "engine produced {n} Markdown files and none named '{stem}.md'"
        )),
    }
}

fn collect_markdown(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_markdown(&path, found);
        } else if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("md")) {
            found.push(path);
        }
    }
}

/// Last few lines of the engine's stderr.
async fn log_tail(path: PathBuf) -> String {
    tokio::task::spawn_blocking(move || read_tail(&path))
        .await
        .unwrap_or_default()
}

fn read_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > LOG_TAIL_BYTES && file.seek(SeekFrom::Start(len - LOG_TAIL_BYTES)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{PaperJob, PaperRef};
    use crate::pipeline::prefetch::pdf_file_name;

    fn ready(id: &str) -> ReadyPaper {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(pdf_file_name(id)), b"%PDF-1.4\n").unwrap();
        let paper = PaperRef {
            arxiv_id: id.to_string(),
            base_id: id.trim_end_matches(char::is_numeric).trim_end_matches('v').to_string(),
            version: 1,
            source: String::new(),
        };
        ReadyPaper::new(PaperJob::new(paper), dir)
    }

    /// `sh -c <script>` with `$1`=input, `$2`=output dir, `$3`=id.
    fn sh(script: &str) -> EngineCommand {
        EngineCommand::new("sh", ["-c", script, "sh", "{input}", "{output_dir}", "{id}"])
    }

    #[test]
    fn placeholders_are_substituted() {
        let cmd = EngineCommand::new("engine", ["--in={input}", "{output_dir}", "{id}.md"]);
        let args = cmd.render_args(Path::new("/w/a.pdf"), Path::new("/w/out"), "2101.00001v1");
        assert_eq!(args, vec!["--in=/w/a.pdf", "/w/out", "2101.00001v1.md"]);
    }

    #[test]
    fn default_engine_is_docling() {
        let cmd = EngineCommand::default();
        assert_eq!(cmd.program, "docling");
        assert!(cmd.args.iter().any(|a| a == "--enrich-formula"));
        assert!(cmd.args.iter().any(|a| a == "{input}"));
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(mime_for(Path::new("a/b.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("x.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_markdown_and_existing_images() {
        let paper = ready("2101.00001v1");
        let script = r#"mkdir -p "$2/fig" && printf 'PNGDATA' > "$2/fig/a.png" &&
            printf '# Title\n\n![Image](fig/a.png)\n\n![Lost](fig/b.png)\n' > "$2/$3.md""#;
        let conv = SubprocessConverter::new(sh(script), Duration::from_secs(10));

        let result = conv.convert(&paper).await.unwrap();
        assert_eq!(result.arxiv_id, "2101.00001v1");
        assert!(result.markdown.starts_with("# Title"));
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].local_ref, "fig/a.png");
        assert_eq!(result.images[0].data, b"PNGDATA");
        assert_eq!(result.images[0].mime_type, "image/png");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_markdown_found_in_subdirectory() {
        let paper = ready("2101.00002v1");
        let script = r#"mkdir -p "$2/nested" && printf 'body' > "$2/nested/whatever.md""#;
        let conv = SubprocessConverter::new(sh(script), Duration::from_secs(10));
        let result = conv.convert(&paper).await.unwrap();
        assert_eq!(result.markdown, "body");
        assert!(result.images.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_log_tail() {
        let paper = ready("2101.00003v1");
        let conv = SubprocessConverter::new(
            sh("echo 'layout model crashed' >&2; exit 3"),
            Duration::from_secs(10),
        );
        let err = conv.convert(&paper).await.unwrap_err();
        match &err {
            PaperError::ConversionFailed { detail, .. } => {
                assert!(detail.contains("layout model crashed"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.status(), crate::output::JobStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_output_is_a_failure() {
        let paper = ready("2101.00004v1");
        let conv = SubprocessConverter::new(sh("true"), Duration::from_secs(10));
        let err = conv.convert(&paper).await.unwrap_err();
        assert!(err.to_string().contains("no Markdown"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_a_failure() {
        let paper = ready("2101.00005v1");
        let conv = SubprocessConverter::new(
            EngineCommand::new("definitely-not-an-engine-binary", ["{input}"]),
            Duration::from_secs(10),
        );
        let err = conv.convert(&paper).await.unwrap_err();
        assert!(matches!(err, PaperError::ConversionFailed { .. }), "{err}");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn hung_engine_is_killed_and_reaped() {
        let paper = ready("2101.00006v1");
        let pid_file = paper.work_dir().join("engine.pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let conv = SubprocessConverter::new(sh(&script), Duration::from_secs(1));

        let started = Instant::now();
        let err = conv.convert(&paper).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "returned after {elapsed:?}");
        assert_eq!(
            err,
            PaperError::Timeout {
                arxiv_id: "2101.00006v1".into(),
                secs: 1
            }
        );

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let proc_dir = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_dir.exists(), "engine process {} still present", pid.trim());
    }

    /// A `/proc` entry is gone, or left as a zombie nobody has reaped yet.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timed_out_engine_takes_its_children_along() {
        let paper = ready("2101.00007v1");
        let pid_file = paper.work_dir().join("worker.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());
        let conv = SubprocessConverter::new(sh(&script), Duration::from_secs(1));

        let started = Instant::now();
        let err = conv.convert(&paper).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, PaperError::Timeout { secs: 1, .. }));
        assert!(elapsed >= Duration::from_secs(1), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "returned after {elapsed:?}");

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !is_dead(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(is_dead(pid), "background worker {pid} outlived the engine");
    }
}
