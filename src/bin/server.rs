#![forbid(unsafe_code)]

//! Web front end for tubegrab: one HTML page plus a small JSON API.
//!
//! Every download runs as its own task owned by the [`JobManager`]. The page
//! starts a job, polls its status, and then pulls the finished file exactly
//! once. Files nobody claims are dropped after the configured TTL.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Multipart, Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use tokio::{fs::File, signal, sync::watch, task::JoinHandle};
use tokio_util::io::ReaderStream;
use tubegrab::config::{SettingsOverrides, resolve_settings};
use tubegrab::error::{DownloadError, ErrorKind};
use tubegrab::extractor::YtDlp;
use tubegrab::metadata::VideoDetails;
use tubegrab::orchestrator::{Artifact, Delivery, DownloadRequest, Orchestrator, Payload};
use tubegrab::progress::{Progress, Stage};
use tubegrab::security::ensure_not_root;

const INDEX_HTML: &str = include_str!("../../assets/index.html");

// How often finished-but-unclaimed jobs are checked against the TTL.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
struct ServerArgs {
    host: Option<String>,
    port: Option<u16>,
    ytdlp: Option<PathBuf>,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(parse_host_arg(value)?.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--ytdlp=") {
                parsed.ytdlp = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(parse_host_arg(&value)?.to_string());
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--ytdlp" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--ytdlp requires a value"))?;
                    parsed.ytdlp = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEGRAB_HOST")
}

/// Job table plus the tasks driving each entry.
#[derive(Clone)]
struct JobManager {
    inner: Arc<JobManagerInner>,
}

struct JobManagerInner {
    jobs: Mutex<HashMap<String, Job>>,
    orchestrator: Orchestrator,
    artifact_ttl: Duration,
}

struct Job {
    id: String,
    url: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    progress: watch::Receiver<Progress>,
    outcome: JobOutcome,
    task: Option<JoinHandle<()>>,
}

enum JobOutcome {
    Running,
    Ready(Artifact),
    /// The file went out; only what the status page still shows is kept.
    Claimed {
        filename: String,
        details: VideoDetails,
        saved_to: Option<PathBuf>,
    },
    Failed(DownloadError),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobCreated {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobError {
    message: String,
    kind: ErrorKind,
    diagnostics: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    id: String,
    status: &'static str,
    stage: Stage,
    progress: u8,
    message: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<VideoInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_to: Option<String>,
    file_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
}

impl JobManager {
    fn new(orchestrator: Orchestrator, artifact_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(JobManagerInner {
                jobs: Mutex::new(HashMap::new()),
                orchestrator,
                artifact_ttl,
            }),
        }
    }

    fn start(&self, request: DownloadRequest) -> String {
        let job_id = self.next_job_id();
        let (tx, rx) = watch::channel(Progress::IDLE);
        tracing::info!(job = %job_id, url = %request.url, "download queued");

        // The lock is held across the spawn so the task cannot finish before
        // its entry exists.
        let mut jobs = self.inner.jobs.lock();
        let manager = self.clone();
        let task_id = job_id.clone();
        let url = request.url.clone();
        let task = tokio::spawn(async move {
            let result = manager.inner.orchestrator.run(request, &tx).await;
            manager.finish(&task_id, result);
        });
        jobs.insert(
            job_id.clone(),
            Job {
                id: job_id.clone(),
                url,
                created_at: Utc::now(),
                finished_at: None,
                progress: rx,
                outcome: JobOutcome::Running,
                task: Some(task),
            },
        );
        job_id
    }

    fn finish(&self, job_id: &str, result: Result<Artifact, DownloadError>) {
        let mut jobs = self.inner.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        if !matches!(job.outcome, JobOutcome::Running) {
            return;
        }
        job.outcome = match result {
            Ok(artifact) => JobOutcome::Ready(artifact),
            Err(err) => JobOutcome::Failed(err),
        };
        job.finished_at = Some(Utc::now());
        job.task = None;
    }

    fn get_status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.inner.jobs.lock();
        let job = jobs.get(job_id)?;
        let progress = *job.progress.borrow();

        let mut status = JobStatus {
            id: job.id.clone(),
            status: "running",
            stage: progress.stage,
            progress: progress.percent,
            message: stage_message(progress),
            created_at: job.created_at,
            filename: None,
            details: None,
            saved_to: None,
            file_available: false,
            error: None,
        };
        match &job.outcome {
            JobOutcome::Running if progress.stage == Stage::Idle => status.status = "queued",
            JobOutcome::Running => {}
            JobOutcome::Ready(artifact) => {
                status.status = "completed";
                status.stage = Stage::Complete;
                status.progress = 100;
                status.file_available = true;
                status.filename = Some(artifact.filename.clone());
                status.details = Some(VideoInfo::from(artifact.details.clone()));
                status.message = "Ready to save".to_string();
                if let Payload::Saved(path) = &artifact.payload {
                    status.saved_to = Some(path.display().to_string());
                    status.message = format!("Saved to {}", path.display());
                }
            }
            JobOutcome::Claimed {
                filename,
                details,
                saved_to,
            } => {
                status.status = "completed";
                status.stage = Stage::Complete;
                status.progress = 100;
                status.filename = Some(filename.clone());
                status.details = Some(VideoInfo::from(details.clone()));
                status.saved_to = saved_to.as_ref().map(|path| path.display().to_string());
                status.message = "File delivered".to_string();
            }
            JobOutcome::Failed(err) => {
                status.status = if err.kind == ErrorKind::Cancelled {
                    "cancelled"
                } else {
                    "failed"
                };
                status.stage = Stage::Failed;
                status.message = err.to_string();
                status.error = Some(JobError {
                    message: err.to_string(),
                    kind: err.kind,
                    diagnostics: err.diagnostics.clone(),
                });
            }
        }
        Some(status)
    }

    /// Hands out the finished file once. Later calls see `410 Gone`.
    fn take_artifact(&self, job_id: &str) -> ApiResult<Artifact> {
        let mut jobs = self.inner.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ApiError::not_found("download not found"))?;
        let artifact = match std::mem::replace(&mut job.outcome, JobOutcome::Running) {
            JobOutcome::Ready(artifact) => artifact,
            other => {
                let err = match &other {
                    JobOutcome::Claimed { .. } => ApiError::gone("file was already delivered"),
                    JobOutcome::Failed(err) => ApiError::from(err.clone()),
                    _ => ApiError::conflict("download is still running"),
                };
                job.outcome = other;
                return Err(err);
            }
        };
        job.outcome = JobOutcome::Claimed {
            filename: artifact.filename.clone(),
            details: artifact.details.clone(),
            saved_to: match &artifact.payload {
                Payload::Saved(path) => Some(path.clone()),
                Payload::Bytes(_) => None,
            },
        };
        tracing::info!(job = %job.id, filename = %artifact.filename, "file claimed");
        Ok(artifact)
    }

    /// Cancels a running job, or forgets a finished one. Returns false for
    /// unknown ids.
    fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.inner.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };
        if matches!(job.outcome, JobOutcome::Running) {
            // Dropping the orchestrator future removes the scratch directory
            // and kills the tool.
            if let Some(task) = job.task.take() {
                task.abort();
            }
            job.outcome = JobOutcome::Failed(DownloadError::new(
                ErrorKind::Cancelled,
                "download cancelled",
            ));
            job.finished_at = Some(Utc::now());
            tracing::info!(job = %job.id, url = %job.url, "download cancelled");
        } else {
            jobs.remove(job_id);
            tracing::info!(job = %job_id, "download discarded");
        }
        true
    }

    /// Drops finished jobs older than the artifact TTL. Returns how many went.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = TimeDelta::from_std(self.inner.artifact_ttl).unwrap_or(TimeDelta::MAX);
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at {
            Some(finished_at) => now.signed_duration_since(finished_at) < ttl,
            None => true,
        });
        let purged = before - jobs.len();
        if purged > 0 {
            tracing::info!(purged, "expired downloads purged");
        }
        purged
    }

    /// Aborts everything still running, used on shutdown.
    fn abort_all(&self) -> usize {
        let mut jobs = self.inner.jobs.lock();
        let mut aborted = 0;
        for job in jobs.values_mut() {
            if let Some(task) = job.task.take() {
                task.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Ids double as the only credential for a job, so they are 128 random
    /// bits rather than a sequence.
    fn next_job_id(&self) -> String {
        let mut token = [0u8; 16];
        OsRng.fill_bytes(&mut token);
        let hex: String = token.iter().map(|byte| format!("{byte:02x}")).collect();
        format!("download-{hex}")
    }
}

fn stage_message(progress: Progress) -> String {
    match progress.stage {
        Stage::Idle => "Queued".to_string(),
        Stage::FetchingMetadata => "Fetching video information".to_string(),
        Stage::Downloading => format!("Downloading ({}%)", progress.percent),
        Stage::Finalizing => "Preparing file".to_string(),
        Stage::Complete => "Done".to_string(),
        Stage::Failed => "Failed".to_string(),
    }
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    jobs: JobManager,
    orchestrator: Orchestrator,
    tool_version: Arc<str>,
    /// Server-side saves must land somewhere below this directory.
    download_dir: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<ErrorKind>,
    diagnostics: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
            diagnostics: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    fn gone(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match err.kind {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::FORBIDDEN,
            ErrorKind::Extraction => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Download => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: err.to_string(),
            kind: Some(err.kind),
            diagnostics: Some(err.diagnostics).filter(|text| !text.is_empty()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(kind) = self.kind {
            body["kind"] = serde_json::json!(kind);
        }
        if let Some(diagnostics) = self.diagnostics {
            body["diagnostics"] = serde_json::json!(diagnostics);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tubegrab::init_logging();
    let ServerArgs { host, port, ytdlp } = ServerArgs::parse()?;

    ensure_not_root("server")?;

    let settings = resolve_settings(SettingsOverrides {
        host,
        port,
        ytdlp_program: ytdlp,
        ..SettingsOverrides::default()
    })?;
    let listen_host = parse_host_arg(&settings.host)?;

    let ytdlp = YtDlp::new(&settings.ytdlp_program);
    let tool_version = ytdlp.ensure_available().await?;
    tracing::info!(
        tool = %ytdlp.program().display(),
        version = %tool_version,
        "extraction tool ready"
    );

    let orchestrator = Orchestrator::from_settings(&settings, Arc::new(ytdlp));
    let jobs = JobManager::new(orchestrator.clone(), settings.artifact_ttl);
    let state = AppState {
        jobs: jobs.clone(),
        orchestrator,
        tool_version: Arc::from(tool_version),
        download_dir: Arc::new(settings.download_dir.clone()),
    };

    let purger = {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                jobs.purge_expired(Utc::now());
            }
        })
    };

    let app = build_router(state);
    let addr = SocketAddr::new(listen_host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, "listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running web server")?;

    purger.abort();
    let aborted = jobs.abort_all();
    tracing::info!(aborted, "server stopped");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/info", post(video_info))
        .route("/api/downloads", post(start_download))
        .route(
            "/api/downloads/{id}",
            get(get_download_status).delete(cancel_download),
        )
        .route("/api/downloads/{id}/file", get(download_file))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "toolVersion": &*state.tool_version,
    }))
}

/// Fields accepted by both form endpoints.
#[derive(Debug, Default)]
struct DownloadForm {
    url: String,
    cookies: Option<Vec<u8>>,
    destination: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> ApiResult<DownloadForm> {
    let mut form = DownloadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid form data: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "url" => {
                form.url = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid url field: {err}")))?;
            }
            "cookies" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid cookies upload: {err}")))?;
                if !bytes.is_empty() {
                    form.cookies = Some(bytes.to_vec());
                }
            }
            "destination" => {
                let text = field.text().await.map_err(|err| {
                    ApiError::bad_request(format!("invalid destination field: {err}"))
                })?;
                let text = text.trim();
                if !text.is_empty() {
                    form.destination = Some(text.to_string());
                }
            }
            _ => tracing::debug!(field = %name, "ignoring unknown form field"),
        }
    }
    if form.url.trim().is_empty() {
        return Err(ApiError::bad_request("enter a video URL"));
    }
    Ok(form)
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Resolves a requested save directory below `root`. Relative requests are
/// taken as subfolders of `root`; absolute ones must already point inside it.
fn resolve_destination(root: &Path, requested: &str) -> ApiResult<PathBuf> {
    let expanded = expand_home(requested);
    let relative = if expanded.is_absolute() {
        expanded.strip_prefix(root).map_err(|_| {
            ApiError::bad_request(format!(
                "destination must be inside {}",
                root.display()
            ))
        })?
    } else {
        expanded.as_path()
    };
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ApiError::bad_request(format!(
                    "destination must be inside {}",
                    root.display()
                )));
            }
        }
    }
    Ok(resolved)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInfo {
    #[serde(flatten)]
    details: VideoDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    views_text: Option<String>,
}

impl From<VideoDetails> for VideoInfo {
    fn from(details: VideoDetails) -> Self {
        Self {
            duration_text: details.duration_text(),
            views_text: details.views_text(),
            details,
        }
    }
}

async fn video_info(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<VideoInfo>> {
    let form = read_form(multipart).await?;
    let details = state
        .orchestrator
        .preview(&form.url, form.cookies.as_deref())
        .await
        .inspect_err(|err| {
            tracing::warn!(
                url = %form.url,
                kind = err.kind.as_str(),
                message = %err.message,
                "metadata preview failed"
            );
        })?;
    Ok(Json(VideoInfo::from(details)))
}

async fn start_download(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<JobCreated>> {
    let form = read_form(multipart).await?;
    let mut request = DownloadRequest::new(form.url);
    request.cookies = form.cookies;
    if let Some(destination) = form.destination {
        let destination = resolve_destination(&state.download_dir, &destination)?;
        request.delivery = Delivery::SaveTo(destination);
    }
    let id = state.jobs.start(request);
    Ok(Json(JobCreated { id }))
}

async fn get_download_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobStatus>> {
    let status = state
        .jobs
        .get_status(&id)
        .ok_or_else(|| ApiError::not_found("download not found"))?;
    Ok(Json(status))
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    if state.jobs.cancel(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("download not found"))
    }
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let artifact = state.jobs.take_artifact(&id)?;
    let mut response = match artifact.payload {
        Payload::Bytes(bytes) => Body::from(bytes).into_response(),
        Payload::Saved(path) => {
            let file = File::open(&path)
                .await
                .map_err(|_| ApiError::not_found("saved file is no longer on disk"))?;
            Body::from_stream(ReaderStream::new(file)).into_response()
        }
    };

    let headers: &mut HeaderMap = response.headers_mut();
    let content_type = HeaderValue::from_str(&artifact.mime)
        .map_err(|err| ApiError::internal(format!("invalid content type: {err}")))?;
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&artifact.filename)?,
    );
    Ok(response)
}

/// `attachment` header with an ASCII fallback and the exact UTF-8 name.
fn content_disposition(filename: &str) -> ApiResult<HeaderValue> {
    let fallback: String = filename
        .chars()
        .map(|ch| if ch.is_ascii() && ch != '"' && ch != '\\' { ch } else { '_' })
        .collect();
    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .map_err(|err| ApiError::internal(format!("invalid file name: {err}")))
}
