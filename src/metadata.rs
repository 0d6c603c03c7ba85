#![forbid(unsafe_code)]

//! Video details shown to the user before the download starts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_UPLOADER: &str = "Unknown Uploader";

/// Subset of the tool's `--dump-single-json` payload. Everything is optional
/// because extractors differ wildly in what they fill in.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    fulltitle: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    ext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub title: String,
    pub uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpage_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
}

impl VideoDetails {
    pub fn from_info_json(raw: &str) -> Result<Self> {
        let info: InfoJson = serde_json::from_str(raw).context("deserializing metadata JSON")?;
        Ok(Self::from(info))
    }

    /// `H:MM:SS` for long videos, `M:SS` otherwise.
    pub fn duration_text(&self) -> Option<String> {
        self.duration_secs.map(format_duration)
    }

    pub fn views_text(&self) -> Option<String> {
        self.view_count.map(group_thousands)
    }
}

impl From<InfoJson> for VideoDetails {
    fn from(info: InfoJson) -> Self {
        let title = non_blank(info.title)
            .or_else(|| non_blank(info.fulltitle))
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());
        let uploader = non_blank(info.uploader)
            .or_else(|| non_blank(info.channel))
            .unwrap_or_else(|| UNKNOWN_UPLOADER.to_string());
        let duration_secs = info
            .duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.round() as u64);
        Self {
            title,
            uploader,
            view_count: info.view_count,
            duration_secs,
            webpage_url: non_blank(info.webpage_url),
            ext: non_blank(info.ext),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn format_duration(duration: u64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
