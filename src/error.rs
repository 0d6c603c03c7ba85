#![forbid(unsafe_code)]

//! Error taxonomy for a single download request.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed URL, unusable cookie upload.
    InvalidInput,
    /// The tool could not resolve the URL (removed, private, geo-blocked).
    Extraction,
    /// Bot checks, sign-in walls, expired cookies.
    Authentication,
    /// I/O, disk, or merge failures while producing the file.
    Download,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Extraction => "extraction",
            Self::Authentication => "authentication",
            Self::Download => "download",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::InvalidInput => "Invalid input",
            Self::Extraction => "Could not read video information",
            Self::Authentication => "Authentication required",
            Self::Download => "Download failed",
            Self::Timeout => "Timed out",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// A reported failure: one human-readable message plus the full trace used
/// for diagnosis.
#[derive(Debug, Clone)]
pub struct DownloadError {
    pub kind: ErrorKind,
    pub message: String,
    pub diagnostics: String,
}

impl DownloadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: String::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = diagnostics.into();
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Wraps an internal error, keeping its whole context chain as the trace.
    pub fn internal(kind: ErrorKind, err: &anyhow::Error) -> Self {
        Self::new(kind, err.to_string()).with_diagnostics(format!("{err:?}"))
    }

    /// Builds an error from a failed tool run. `fallback` is the kind used
    /// when stderr does not point at something more specific.
    pub fn from_tool_output(fallback: ErrorKind, status: &str, stderr: &str) -> Self {
        let kind = classify_stderr(stderr).unwrap_or(fallback);
        let message = last_error_line(stderr)
            .map(str::to_string)
            .unwrap_or_else(|| format!("extraction tool exited with {status}"));
        Self::new(kind, message).with_diagnostics(tail(stderr, 64))
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for DownloadError {}

/// Maps well-known tool complaints onto the taxonomy.
pub fn classify_stderr(stderr: &str) -> Option<ErrorKind> {
    let lower = stderr.to_ascii_lowercase();
    let auth_markers = [
        "confirm you're not a bot",
        "confirm you’re not a bot",
        "sign in to confirm",
        "login required",
        "private video",
        "members-only",
        "cookies are no longer valid",
        "use --cookies",
        "http error 403",
    ];
    if auth_markers.iter().any(|marker| lower.contains(marker)) {
        return Some(ErrorKind::Authentication);
    }
    let input_markers = ["unsupported url", "is not a valid url", "invalid url"];
    if input_markers.iter().any(|marker| lower.contains(marker)) {
        return Some(ErrorKind::InvalidInput);
    }
    let download_markers = [
        "ffmpeg not found",
        "ffmpeg is not installed",
        "postprocessing",
        "no space left on device",
        "unable to write",
        "permission denied",
    ];
    if download_markers.iter().any(|marker| lower.contains(marker)) {
        return Some(ErrorKind::Download);
    }
    None
}

fn last_error_line(stderr: &str) -> Option<&str> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR:"))
        .map(|line| line.trim_start_matches("ERROR:").trim())
        .filter(|line| !line.is_empty())
}

fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
