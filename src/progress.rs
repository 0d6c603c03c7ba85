#![forbid(unsafe_code)]

//! Progress events coming out of the extraction tool and the per-request
//! indicator they drive.

use serde::{Deserialize, Serialize};

/// Prefix of the machine-readable lines produced by [`PROGRESS_TEMPLATE`].
pub const PROGRESS_MARKER: &str = "[tubegrab-progress]";

/// Passed to the tool as `--progress-template`. Absent values print as `NA`.
pub const PROGRESS_TEMPLATE: &str = "download:[tubegrab-progress] %(progress.status)s %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Downloading,
    Finished,
    Error,
    Other,
}

impl EventStatus {
    fn parse(value: &str) -> Self {
        match value {
            "downloading" => Self::Downloading,
            "finished" => Self::Finished,
            "error" => Self::Error,
            _ => Self::Other,
        }
    }
}

/// One transient event emitted while the tool writes media.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub status: EventStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
}

impl ProgressEvent {
    pub fn downloading(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status: EventStatus::Downloading,
            downloaded_bytes,
            total_bytes,
            total_bytes_estimate: None,
        }
    }

    /// Percentage for the visible indicator. Unknown or zero totals report
    /// 0 instead of dividing.
    pub fn percentage(&self) -> u8 {
        match self.status {
            EventStatus::Finished => 100,
            EventStatus::Downloading => {
                let total = self
                    .total_bytes
                    .filter(|total| *total > 0)
                    .or(self.total_bytes_estimate.filter(|total| *total > 0));
                match total {
                    Some(total) => {
                        let ratio = self.downloaded_bytes as f64 / total as f64 * 100.0;
                        ratio.round().clamp(0.0, 100.0) as u8
                    }
                    None => 0,
                }
            }
            EventStatus::Error | EventStatus::Other => 0,
        }
    }

    /// Parses a line printed through [`PROGRESS_TEMPLATE`]. Returns `None`
    /// for any other output.
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(PROGRESS_MARKER)?;
        let mut fields = rest.split_whitespace();
        let status = EventStatus::parse(fields.next()?);
        let downloaded_bytes = fields.next().and_then(parse_bytes).unwrap_or(0);
        let total_bytes = fields.next().and_then(parse_bytes);
        let total_bytes_estimate = fields.next().and_then(parse_bytes);
        Some(Self {
            status,
            downloaded_bytes,
            total_bytes,
            total_bytes_estimate,
        })
    }
}

fn parse_bytes(value: &str) -> Option<u64> {
    if value == "NA" {
        return None;
    }
    if let Ok(value) = value.parse::<u64>() {
        return Some(value);
    }
    // Estimates come through as floats.
    value
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map(|value| value as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    FetchingMetadata,
    Downloading,
    Finalizing,
    Complete,
    Failed,
}

/// Latest state of one request, as shown to whoever observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    pub percent: u8,
}

impl Progress {
    pub const IDLE: Self = Self {
        stage: Stage::Idle,
        percent: 0,
    };

    pub fn at(stage: Stage, percent: u8) -> Self {
        Self {
            stage,
            percent: percent.min(100),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_uses_known_total() {
        assert_eq!(ProgressEvent::downloading(50, Some(200)).percentage(), 25);
        assert_eq!(ProgressEvent::downloading(1, Some(3)).percentage(), 33);
        assert_eq!(ProgressEvent::downloading(2, Some(3)).percentage(), 67);
    }

    #[test]
    fn percentage_falls_back_to_estimate() {
        let event = ProgressEvent {
            total_bytes_estimate: Some(1000),
            ..ProgressEvent::downloading(250, None)
        };
        assert_eq!(event.percentage(), 25);
    }

    #[test]
    fn percentage_without_total_is_zero() {
        assert_eq!(ProgressEvent::downloading(500, None).percentage(), 0);
        assert_eq!(ProgressEvent::downloading(500, Some(0)).percentage(), 0);
    }

    #[test]
    fn percentage_is_clamped() {
        assert_eq!(ProgressEvent::downloading(300, Some(200)).percentage(), 100);
        for downloaded in [0u64, 1, 99, 100, 101, 10_000] {
            let pct = ProgressEvent::downloading(downloaded, Some(100)).percentage();
            assert!(pct <= 100);
        }
    }

    #[test]
    fn finished_reports_full() {
        let event = ProgressEvent {
            status: EventStatus::Finished,
            ..ProgressEvent::downloading(0, None)
        };
        assert_eq!(event.percentage(), 100);
    }

    #[test]
    fn parse_line_reads_template_output() {
        let event =
            ProgressEvent::parse_line("[tubegrab-progress] downloading 1024 4096 NA").unwrap();
        assert_eq!(event.status, EventStatus::Downloading);
        assert_eq!(event.downloaded_bytes, 1024);
        assert_eq!(event.total_bytes, Some(4096));
        assert_eq!(event.total_bytes_estimate, None);
        assert_eq!(event.percentage(), 25);
    }

    #[test]
    fn parse_line_handles_float_estimates() {
        let event =
            ProgressEvent::parse_line("[tubegrab-progress] downloading 500 NA 2000.7").unwrap();
        assert_eq!(event.total_bytes, None);
        assert_eq!(event.total_bytes_estimate, Some(2000));
    }

    #[test]
    fn parse_line_ignores_other_output() {
        assert!(ProgressEvent::parse_line("[youtube] abc: Downloading webpage").is_none());
        assert!(ProgressEvent::parse_line("/tmp/x/media.mp4").is_none());
        assert!(ProgressEvent::parse_line("[tubegrab-progress]").is_none());
    }

    #[test]
    fn progress_at_caps_percent() {
        assert_eq!(Progress::at(Stage::Downloading, 150).percent, 100);
    }
}
