#![forbid(unsafe_code)]

//! The extraction tool seen as an opaque capability with two operations:
//! read metadata, and fetch-and-write media.

use async_trait::async_trait;
use std::{
    ffi::OsString,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::Command,
};

use crate::error::{DownloadError, ErrorKind};
use crate::metadata::VideoDetails;
use crate::progress::{PROGRESS_TEMPLATE, ProgressEvent};

pub const DEFAULT_FORMAT: &str = "bestvideo+bestaudio/best";
pub const DEFAULT_MERGE_FORMAT: &str = "mp4";

/// Extensions the tool leaves behind that are never the finished media.
const NON_MEDIA_EXTENSIONS: [&str; 8] =
    ["part", "ytdl", "json", "txt", "tmp", "temp", "aria2", "description"];

/// Format selection handed to the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatPreference {
    pub selector: String,
    /// Container used when separate video and audio streams get merged.
    pub merge_format: String,
}

impl Default for FormatPreference {
    fn default() -> Self {
        Self {
            selector: DEFAULT_FORMAT.to_string(),
            merge_format: DEFAULT_MERGE_FORMAT.to_string(),
        }
    }
}

/// Everything one fetch-and-write call needs.
#[derive(Debug, Clone, Copy)]
pub struct FetchJob<'a> {
    pub url: &'a str,
    pub format: &'a FormatPreference,
    pub output_dir: &'a Path,
    pub output_template: &'a str,
    pub cookies: Option<&'a Path>,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(ProgressEvent) + Send + Sync);

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves the URL without downloading anything.
    async fn fetch_metadata(
        &self,
        url: &str,
        cookies: Option<&Path>,
    ) -> Result<VideoDetails, DownloadError>;

    /// Downloads (and merges) the media, reporting progress through
    /// `on_progress`. Returns the path of the finished file.
    async fn download(
        &self,
        job: FetchJob<'_>,
        on_progress: ProgressCallback<'_>,
    ) -> Result<PathBuf, DownloadError>;
}

/// Drives the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    /// Runs `--version` so a missing tool is reported at startup instead of
    /// on the first request.
    pub async fn ensure_available(&self) -> anyhow::Result<String> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .map_err(|err| {
                anyhow::anyhow!(
                    "{} is not installed or not in PATH: {err}",
                    self.program.display()
                )
            })?;
        if !output.status.success() {
            anyhow::bail!(
                "{} is installed but returned {}",
                self.program.display(),
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn metadata_args(url: &str, cookies: Option<&Path>) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--dump-single-json",
            "--skip-download",
            "--no-warnings",
            "--no-playlist",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        if let Some(cookies) = cookies {
            args.push("--cookies".into());
            args.push(cookies.into());
        }
        args.push("--".into());
        args.push(url.into());
        args
    }

    fn download_args(job: &FetchJob<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--format".into(),
            job.format.selector.as_str().into(),
            "--merge-output-format".into(),
            job.format.merge_format.as_str().into(),
            "--no-playlist".into(),
            "--newline".into(),
            "--progress".into(),
            "--progress-template".into(),
            PROGRESS_TEMPLATE.into(),
            // The printed path is the only reliable way to learn the final
            // extension after merging.
            "--print".into(),
            "after_move:filepath".into(),
            "--no-simulate".into(),
            "--output".into(),
            job.output_template.into(),
        ];
        if let Some(cookies) = job.cookies {
            args.push("--cookies".into());
            args.push(cookies.into());
        }
        args.push("--".into());
        args.push(job.url.into());
        args
    }

    fn spawn_error(&self, kind: ErrorKind, err: std::io::Error) -> DownloadError {
        let message = if err.kind() == IoErrorKind::NotFound {
            format!("{} is not installed or not in PATH", self.program.display())
        } else {
            format!("could not run {}: {err}", self.program.display())
        };
        DownloadError::new(kind, message).with_diagnostics(format!("{err:?}"))
    }
}

#[async_trait]
impl Extractor for YtDlp {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        cookies: Option<&Path>,
    ) -> Result<VideoDetails, DownloadError> {
        let output = self
            .command()
            .args(Self::metadata_args(url, cookies))
            .output()
            .await
            .map_err(|err| self.spawn_error(ErrorKind::Extraction, err))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(DownloadError::from_tool_output(
                ErrorKind::Extraction,
                &output.status.to_string(),
                &stderr,
            ));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        VideoDetails::from_info_json(&raw).map_err(|err| {
            DownloadError::internal(ErrorKind::Extraction, &err)
                .with_diagnostics(format!("{err:?}\n{stderr}"))
        })
    }

    async fn download(
        &self,
        job: FetchJob<'_>,
        on_progress: ProgressCallback<'_>,
    ) -> Result<PathBuf, DownloadError> {
        let mut child = self
            .command()
            .args(Self::download_args(&job))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| self.spawn_error(ErrorKind::Download, err))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::new(ErrorKind::Download, "tool stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::new(ErrorKind::Download, "tool stderr unavailable"))?;

        // Progress may land on either stream depending on the tool's quiet
        // handling, so both are scanned for marker lines.
        let read_stdout = async {
            let mut printed: Option<String> = None;
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            while let Some(line) = read_lossy_line(&mut reader, &mut buf).await {
                if let Some(event) = ProgressEvent::parse_line(&line) {
                    tracing::debug!(?event, "progress");
                    on_progress(event);
                    continue;
                }
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    printed = Some(trimmed.to_string());
                }
            }
            printed
        };
        let read_stderr = async {
            let mut collected = String::new();
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while let Some(line) = read_lossy_line(&mut reader, &mut buf).await {
                if let Some(event) = ProgressEvent::parse_line(&line) {
                    on_progress(event);
                    continue;
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        };
        let (printed, stderr_text) = tokio::join!(read_stdout, read_stderr);

        let status = child.wait().await.map_err(|err| {
            DownloadError::new(ErrorKind::Download, format!("waiting for tool: {err}"))
        })?;
        if !status.success() {
            return Err(DownloadError::from_tool_output(
                ErrorKind::Download,
                &status.to_string(),
                &stderr_text,
            ));
        }

        resolve_output_file(job.output_dir, printed.as_deref())
            .await
            .map_err(|err| err.with_diagnostics(stderr_text))
    }
}

/// Reads one line, replacing invalid UTF-8 so the pipe keeps draining until
/// the tool exits. `None` at end of stream or on a read error.
async fn read_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => Some(
            String::from_utf8_lossy(buf)
                .trim_end_matches(['\n', '\r'])
                .to_string(),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "reading tool output failed");
            None
        }
    }
}

/// Finds the finished media file inside `output_dir`. The path the tool
/// printed wins when it points inside the directory; otherwise the largest
/// media-looking file there is used.
pub async fn resolve_output_file(
    output_dir: &Path,
    printed: Option<&str>,
) -> Result<PathBuf, DownloadError> {
    let io_error = |context: &str, err: std::io::Error| {
        DownloadError::new(ErrorKind::Download, format!("{context}: {err}"))
    };
    let canonical_dir = tokio::fs::canonicalize(output_dir)
        .await
        .map_err(|err| io_error("resolving output directory", err))?;

    if let Some(printed) = printed {
        let candidate = PathBuf::from(printed);
        let candidate = if candidate.is_absolute() {
            candidate
        } else {
            output_dir.join(candidate)
        };
        if let Some(found) = contained_file(&canonical_dir, &candidate).await {
            return Ok(found);
        }
        tracing::warn!(printed, "printed path is not a file inside the scratch dir");
    }

    let mut best: Option<(u64, PathBuf)> = None;
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|err| io_error("listing output directory", err))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| io_error("listing output directory", err))?
    {
        let path = entry.path();
        if !looks_like_media(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(size, _)| meta.len() > *size) {
            best = Some((meta.len(), path));
        }
    }

    best.map(|(_, path)| path).ok_or_else(|| {
        DownloadError::new(
            ErrorKind::Download,
            "the extraction tool finished without producing a media file",
        )
    })
}

async fn contained_file(canonical_dir: &Path, candidate: &Path) -> Option<PathBuf> {
    let canonical = tokio::fs::canonicalize(candidate).await.ok()?;
    let meta = tokio::fs::metadata(&canonical).await.ok()?;
    (meta.is_file() && canonical.starts_with(canonical_dir)).then_some(canonical)
}

fn looks_like_media(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy()) else {
        return false;
    };
    if name == "cookies.txt" || name.starts_with('.') {
        return false;
    }
    match path.extension().map(|ext| ext.to_string_lossy().to_ascii_lowercase()) {
        Some(ext) => !NON_MEDIA_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}
