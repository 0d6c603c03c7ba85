#![forbid(unsafe_code)]

//! Download orchestration for a single request: metadata first, then the
//! download itself, then handing the file back. Every temporary file lives
//! in a per-request [`Scratch`] that is removed on every exit path,
//! including errors, timeouts and a dropped future.

use anyhow::Context;
use mime_guess::MimeGuess;
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{io::AsyncWriteExt, sync::watch};

use crate::config::Settings;
use crate::error::{DownloadError, ErrorKind};
use crate::extractor::{Extractor, FetchJob, FormatPreference};
use crate::metadata::VideoDetails;
use crate::progress::{Progress, ProgressEvent, Stage};
use crate::sanitize::artifact_filename;
use crate::scratch::Scratch;
use crate::security::check_cookie_jar;

const DEFAULT_MIME: &str = "video/mp4";

/// Where the finished file goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Read the bytes back so the caller can stream them to a client.
    Stream,
    /// Save into this directory, created if missing.
    SaveTo(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: FormatPreference,
    /// Raw Netscape cookie jar as uploaded.
    pub cookies: Option<Vec<u8>>,
    pub delivery: Delivery,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: FormatPreference::default(),
            cookies: None,
            delivery: Delivery::Stream,
        }
    }

    pub fn with_cookies(mut self, cookies: Vec<u8>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn saving_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.delivery = Delivery::SaveTo(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Saved(PathBuf),
}

/// The finished download.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Suggested name, derived from the sanitized title.
    pub filename: String,
    pub mime: String,
    pub details: VideoDetails,
    pub payload: Payload,
}

#[derive(Clone)]
pub struct Orchestrator {
    extractor: Arc<dyn Extractor>,
    scratch_root: PathBuf,
    network_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        scratch_root: impl Into<PathBuf>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            extractor,
            scratch_root: scratch_root.into(),
            network_timeout,
        }
    }

    pub fn from_settings(settings: &Settings, extractor: Arc<dyn Extractor>) -> Self {
        Self::new(
            extractor,
            settings.scratch_root.clone(),
            settings.network_timeout,
        )
    }

    /// Metadata only, for showing details before the user commits.
    pub async fn preview(
        &self,
        url: &str,
        cookies: Option<&[u8]>,
    ) -> Result<VideoDetails, DownloadError> {
        let url = validate_url(url)?;
        let mut scratch = self.open_scratch()?;
        let result = async {
            if let Some(raw) = cookies {
                stage_cookies(&mut scratch, raw)?;
            }
            self.bounded(
                "metadata lookup",
                self.extractor.fetch_metadata(url, scratch.cookies()),
            )
            .await
        }
        .await;
        scratch.close();
        result
    }

    /// Runs one request to completion. The latest state is published on
    /// `progress`; the caller owns the receiving side.
    pub async fn run(
        &self,
        request: DownloadRequest,
        progress: &watch::Sender<Progress>,
    ) -> Result<Artifact, DownloadError> {
        let result = self.run_inner(&request, progress).await;
        match &result {
            Ok(artifact) => {
                progress.send_replace(Progress::at(Stage::Complete, 100));
                tracing::info!(
                    url = %request.url,
                    filename = %artifact.filename,
                    extractor = self.extractor.name(),
                    "download complete"
                );
            }
            Err(err) => {
                progress.send_modify(|current| current.stage = Stage::Failed);
                tracing::error!(
                    url = %request.url,
                    kind = err.kind.as_str(),
                    message = %err.message,
                    diagnostics = %err.diagnostics,
                    "download failed"
                );
            }
        }
        result
    }

    async fn run_inner(
        &self,
        request: &DownloadRequest,
        progress: &watch::Sender<Progress>,
    ) -> Result<Artifact, DownloadError> {
        let url = validate_url(&request.url)?;
        progress.send_replace(Progress::at(Stage::FetchingMetadata, 0));

        let mut scratch = self.open_scratch()?;
        let result = self.fetch_into(&mut scratch, url, request, progress).await;
        scratch.close();
        result
    }

    async fn fetch_into(
        &self,
        scratch: &mut Scratch,
        url: &str,
        request: &DownloadRequest,
        progress: &watch::Sender<Progress>,
    ) -> Result<Artifact, DownloadError> {
        if let Some(raw) = &request.cookies {
            stage_cookies(scratch, raw)?;
        }

        let details = self
            .bounded(
                "metadata lookup",
                self.extractor.fetch_metadata(url, scratch.cookies()),
            )
            .await?;
        tracing::info!(
            title = %details.title,
            uploader = %details.uploader,
            views = ?details.view_count,
            duration = ?details.duration_secs,
            "metadata fetched"
        );

        progress.send_replace(Progress::at(Stage::Downloading, 0));
        let on_progress = |event: ProgressEvent| {
            progress.send_replace(Progress::at(Stage::Downloading, event.percentage()));
        };
        let output_template = scratch.output_template();
        let job = FetchJob {
            url,
            format: &request.format,
            output_dir: scratch.path(),
            output_template: &output_template,
            cookies: scratch.cookies(),
        };
        let media = self
            .bounded("download", self.extractor.download(job, &on_progress))
            .await?;

        progress.send_replace(Progress::at(Stage::Finalizing, 100));
        let ext = media
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned());
        let filename = artifact_filename(&details.title, ext.as_deref());
        let mime = ext
            .as_deref()
            .and_then(|ext| MimeGuess::from_ext(ext).first())
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| DEFAULT_MIME.to_string());

        let payload = match &request.delivery {
            Delivery::Stream => {
                let bytes = tokio::fs::read(&media)
                    .await
                    .with_context(|| format!("reading {}", media.display()))
                    .map_err(|err| DownloadError::internal(ErrorKind::Download, &err))?;
                Payload::Bytes(bytes)
            }
            Delivery::SaveTo(dir) => Payload::Saved(
                save_into(&media, dir, &filename)
                    .await
                    .map_err(|err| DownloadError::internal(ErrorKind::Download, &err))?,
            ),
        };

        Ok(Artifact {
            filename,
            mime,
            details,
            payload,
        })
    }

    fn open_scratch(&self) -> Result<Scratch, DownloadError> {
        Scratch::create(&self.scratch_root)
            .map_err(|err| DownloadError::internal(ErrorKind::Download, &err))
    }

    async fn bounded<T>(
        &self,
        phase: &str,
        future: impl Future<Output = Result<T, DownloadError>>,
    ) -> Result<T, DownloadError> {
        tokio::time::timeout(self.network_timeout, future)
            .await
            .map_err(|_| {
                DownloadError::new(
                    ErrorKind::Timeout,
                    format!(
                        "{phase} took longer than {} seconds",
                        self.network_timeout.as_secs_f32()
                    ),
                )
            })?
    }
}

fn validate_url(raw: &str) -> Result<&str, DownloadError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(DownloadError::invalid_input("enter a video URL"));
    }
    let lower = url.to_ascii_lowercase();
    let Some(rest) = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
    else {
        return Err(DownloadError::invalid_input(format!(
            "not an http(s) URL: {url}"
        )));
    };
    if rest.is_empty() || rest.starts_with('/') || url.chars().any(char::is_whitespace) {
        return Err(DownloadError::invalid_input(format!("malformed URL: {url}")));
    }
    Ok(url)
}

fn stage_cookies(scratch: &mut Scratch, raw: &[u8]) -> Result<(), DownloadError> {
    check_cookie_jar(raw).map_err(|err| DownloadError::invalid_input(err.to_string()))?;
    scratch
        .write_cookies(raw)
        .map_err(|err| DownloadError::internal(ErrorKind::Download, &err))?;
    Ok(())
}

/// Copies the finished file into `dir` without clobbering anything already
/// there: `name.mp4`, then `name_1.mp4`, `name_2.mp4`, ...
async fn save_into(media: &Path, dir: &Path, filename: &str) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let (stem, ext) = filename.rsplit_once('.').unwrap_or((filename, ""));

    for attempt in 0u32..1000 {
        let name = match (attempt, ext.is_empty()) {
            (0, _) => filename.to_string(),
            (n, true) => format!("{stem}_{n}"),
            (n, false) => format!("{stem}_{n}.{ext}"),
        };
        let target = dir.join(name);
        let mut out = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("creating {}", target.display()));
            }
        };
        let mut source = tokio::fs::File::open(media)
            .await
            .with_context(|| format!("opening {}", media.display()))?;
        let copied = tokio::io::copy(&mut source, &mut out).await;
        if let Err(err) = copied {
            drop(out);
            let _ = tokio::fs::remove_file(&target).await;
            return Err(err).with_context(|| format!("writing {}", target.display()));
        }
        out.flush()
            .await
            .with_context(|| format!("flushing {}", target.display()))?;
        return Ok(target);
    }
    anyhow::bail!("no free file name for {filename} in {}", dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use crate::extractor::ProgressCallback;

    fn jar(value: &str) -> Vec<u8> {
        format!("# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tSID\t{value}\n")
            .into_bytes()
    }

    /// In-process stand-in for the extraction tool.
    #[derive(Default)]
    struct FakeExtractor {
        title: Option<String>,
        ext: Option<&'static str>,
        metadata_error: Option<DownloadError>,
        download_error: Option<DownloadError>,
        download_delay: Option<Duration>,
        downloads: AtomicUsize,
        cookie_paths: Mutex<Vec<PathBuf>>,
    }

    fn cookie_value(path: &Path) -> String {
        let text = fs::read_to_string(path).unwrap();
        text.lines()
            .last()
            .and_then(|line| line.split('\t').nth(6))
            .unwrap_or_default()
            .to_string()
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_metadata(
            &self,
            _url: &str,
            cookies: Option<&Path>,
        ) -> Result<VideoDetails, DownloadError> {
            if let Some(err) = &self.metadata_error {
                return Err(err.clone());
            }
            // With cookies, the "title" echoes the cookie so tests can see
            // which jar a request actually used.
            let title = match cookies {
                Some(path) => {
                    self.cookie_paths.lock().push(path.to_path_buf());
                    cookie_value(path)
                }
                None => self.title.clone().unwrap_or_else(|| "My Video?!".into()),
            };
            Ok(VideoDetails {
                title,
                uploader: "Uploader".into(),
                view_count: Some(7),
                duration_secs: Some(30),
                webpage_url: None,
                ext: None,
            })
        }

        async fn download(
            &self,
            job: FetchJob<'_>,
            on_progress: ProgressCallback<'_>,
        ) -> Result<PathBuf, DownloadError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(cookies) = job.cookies {
                assert!(cookies.starts_with(job.output_dir));
            }
            on_progress(ProgressEvent::downloading(0, Some(200)));
            on_progress(ProgressEvent::downloading(100, Some(200)));
            if let Some(delay) = self.download_delay {
                tokio::time::sleep(delay).await;
            }
            let target = PathBuf::from(
                job.output_template
                    .replace("%(ext)s", self.ext.unwrap_or("mp4")),
            );
            fs::write(&target, b"video+audio").unwrap();
            if let Some(err) = &self.download_error {
                return Err(err.clone());
            }
            on_progress(ProgressEvent::downloading(200, Some(200)));
            Ok(target)
        }
    }

    fn orchestrator(fake: FakeExtractor, root: &Path) -> (Orchestrator, Arc<FakeExtractor>) {
        let fake = Arc::new(fake);
        let orchestrator = Orchestrator::new(fake.clone(), root, Duration::from_secs(5));
        (orchestrator, fake)
    }

    fn leftovers(root: &Path) -> usize {
        fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
    }

    const URL: &str = "https://www.youtube.com/watch?v=example";

    #[tokio::test]
    async fn streams_bytes_with_sanitized_name() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(FakeExtractor::default(), root.path());
        let (tx, rx) = watch::channel(Progress::IDLE);

        let artifact = orchestrator.run(DownloadRequest::new(URL), &tx).await.unwrap();

        assert_eq!(artifact.filename, "My_Video__.mp4");
        assert_eq!(artifact.mime, "video/mp4");
        assert_eq!(artifact.details.uploader, "Uploader");
        match artifact.payload {
            Payload::Bytes(bytes) => assert_eq!(bytes, b"video+audio"),
            Payload::Saved(_) => panic!("expected bytes"),
        }
        assert_eq!(*rx.borrow(), Progress::at(Stage::Complete, 100));
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn progress_tracks_latest_event() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeExtractor {
            download_error: Some(DownloadError::new(ErrorKind::Download, "merge failed")),
            ..FakeExtractor::default()
        };
        let (orchestrator, _) = orchestrator(fake, root.path());
        let (tx, rx) = watch::channel(Progress::IDLE);

        orchestrator.run(DownloadRequest::new(URL), &tx).await.unwrap_err();

        // Last event was 100/200 before the failure.
        assert_eq!(*rx.borrow(), Progress::at(Stage::Failed, 50));
    }

    #[tokio::test]
    async fn metadata_failure_skips_download_and_cleans_cookies() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeExtractor {
            metadata_error: Some(DownloadError::new(ErrorKind::Extraction, "Video unavailable")),
            ..FakeExtractor::default()
        };
        let (orchestrator, fake) = orchestrator(fake, root.path());
        let (tx, rx) = watch::channel(Progress::IDLE);

        let err = orchestrator
            .run(DownloadRequest::new(URL).with_cookies(jar("abc")), &tx)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Extraction);
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(rx.borrow().stage, Stage::Failed);
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn download_failure_still_removes_cookie_and_media() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeExtractor {
            download_error: Some(DownloadError::new(ErrorKind::Download, "network down")),
            ..FakeExtractor::default()
        };
        let (orchestrator, fake) = orchestrator(fake, root.path());
        let (tx, _rx) = watch::channel(Progress::IDLE);

        let err = orchestrator
            .run(DownloadRequest::new(URL).with_cookies(jar("abc")), &tx)
            .await
            .unwrap_err();

        assert_eq!(err.message, "network down");
        let cookie = fake.cookie_paths.lock()[0].clone();
        assert!(!cookie.exists());
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn rejects_bad_urls_before_touching_disk() {
        let root = tempfile::tempdir().unwrap();
        let scratch_root = root.path().join("scratch");
        let (orchestrator, fake) = orchestrator(FakeExtractor::default(), &scratch_root);
        let (tx, _rx) = watch::channel(Progress::IDLE);

        for url in ["", "   ", "ftp://example.com/v", "https://", "https://exa mple.com", "example.com"] {
            let err = orchestrator
                .run(DownloadRequest::new(url), &tx)
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput, "{url:?}");
        }
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 0);
        assert!(!scratch_root.exists());
    }

    #[tokio::test]
    async fn rejects_non_netscape_cookies() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, fake) = orchestrator(FakeExtractor::default(), root.path());
        let (tx, _rx) = watch::channel(Progress::IDLE);

        let err = orchestrator
            .run(
                DownloadRequest::new(URL).with_cookies(br#"{"SID": "abc"}"#.to_vec()),
                &tx,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_keep_their_own_cookies() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, fake) = orchestrator(FakeExtractor::default(), root.path());
        let (tx_a, _rx_a) = watch::channel(Progress::IDLE);
        let (tx_b, _rx_b) = watch::channel(Progress::IDLE);

        let (a, b) = tokio::join!(
            orchestrator.run(DownloadRequest::new(URL).with_cookies(jar("one")), &tx_a),
            orchestrator.run(DownloadRequest::new(URL).with_cookies(jar("two")), &tx_b),
        );

        assert_eq!(a.unwrap().filename, "one.mp4");
        assert_eq!(b.unwrap().filename, "two.mp4");
        let paths = fake.cookie_paths.lock().clone();
        assert_eq!(paths.len(), 2);
        assert_ne!(paths[0], paths[1]);
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn saves_to_directory_without_overwriting() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let target_dir = dest.path().join("Downloads");
        let (orchestrator, _) = orchestrator(FakeExtractor::default(), root.path());
        let (tx, _rx) = watch::channel(Progress::IDLE);

        let first = orchestrator
            .run(DownloadRequest::new(URL).saving_to(&target_dir), &tx)
            .await
            .unwrap();
        let second = orchestrator
            .run(DownloadRequest::new(URL).saving_to(&target_dir), &tx)
            .await
            .unwrap();

        let Payload::Saved(first_path) = first.payload else {
            panic!("expected a saved file");
        };
        let Payload::Saved(second_path) = second.payload else {
            panic!("expected a saved file");
        };
        assert_eq!(first_path, target_dir.join("My_Video__.mp4"));
        assert_eq!(second_path, target_dir.join("My_Video___1.mp4"));
        assert_eq!(fs::read(&first_path).unwrap(), b"video+audio");
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn uses_the_extension_actually_written() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeExtractor {
            ext: Some("webm"),
            title: Some("clip".into()),
            ..FakeExtractor::default()
        };
        let (orchestrator, _) = orchestrator(fake, root.path());
        let (tx, _rx) = watch::channel(Progress::IDLE);

        let artifact = orchestrator.run(DownloadRequest::new(URL), &tx).await.unwrap();
        assert_eq!(artifact.filename, "clip.webm");
        assert_eq!(artifact.mime, "video/webm");
    }

    #[tokio::test]
    async fn slow_downloads_time_out_and_clean_up() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExtractor {
            download_delay: Some(Duration::from_secs(30)),
            ..FakeExtractor::default()
        });
        let orchestrator = Orchestrator::new(fake, root.path(), Duration::from_millis(50));
        let (tx, _rx) = watch::channel(Progress::IDLE);

        let err = orchestrator
            .run(DownloadRequest::new(URL).with_cookies(jar("abc")), &tx)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn aborted_requests_clean_up() {
        let root = tempfile::tempdir().unwrap();
        let fake = FakeExtractor {
            download_delay: Some(Duration::from_secs(30)),
            ..FakeExtractor::default()
        };
        let (orchestrator, fake) = orchestrator(fake, root.path());
        let (tx, mut rx) = watch::channel(Progress::IDLE);

        let handle = tokio::spawn(async move {
            orchestrator
                .run(DownloadRequest::new(URL).with_cookies(jar("abc")), &tx)
                .await
        });
        rx.wait_for(|progress| progress.stage == Stage::Downloading && progress.percent == 50)
            .await
            .unwrap();
        assert_eq!(leftovers(root.path()), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(leftovers(root.path()), 0);
    }

    #[tokio::test]
    async fn preview_returns_details_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let (orchestrator, fake) = orchestrator(FakeExtractor::default(), root.path());

        let details = orchestrator.preview(URL, Some(&jar("secret"))).await.unwrap();
        assert_eq!(details.title, "secret");
        assert_eq!(fake.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(leftovers(root.path()), 0);

        let err = orchestrator.preview("nope", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
