#![forbid(unsafe_code)]

//! Command-line companion to the web server: download one video straight
//! into a directory, with a progress bar on stderr.

use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{signal, sync::watch};
use tubegrab::config::{SettingsOverrides, resolve_settings};
use tubegrab::error::{DownloadError, ErrorKind};
use tubegrab::extractor::{DEFAULT_FORMAT, DEFAULT_MERGE_FORMAT, FormatPreference, YtDlp};
use tubegrab::orchestrator::{Artifact, DownloadRequest, Orchestrator, Payload};
use tubegrab::progress::{Progress, Stage};
use tubegrab::security::ensure_not_root;

#[derive(Debug, Parser)]
#[command(version, about = "Download a video as a single file", long_about = None)]
struct Args {
    #[arg(help = "Video URL")]
    url: String,

    #[arg(long, short = 'c', help = "Netscape cookies.txt sent along with every request")]
    cookies: Option<PathBuf>,

    #[arg(
        long,
        short = 'd',
        help = "Directory to save into (defaults to TUBEGRAB_DOWNLOAD_DIR or your Downloads folder)"
    )]
    dest: Option<PathBuf>,

    #[arg(long, short = 'f', default_value = DEFAULT_FORMAT, help = "Format selector")]
    format: String,

    #[arg(long = "merge-format", default_value = DEFAULT_MERGE_FORMAT, help = "Container for merged streams")]
    merge_format: String,

    #[arg(long, help = "Seconds allowed for each network phase")]
    timeout: Option<u64>,

    #[arg(long, help = "Path to the yt-dlp executable")]
    ytdlp: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tubegrab::init_logging();
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<DownloadError>() {
                Some(download) => {
                    eprintln!("Error: {download}");
                    if !download.diagnostics.is_empty() {
                        eprintln!("\nDiagnostics:\n{}", download.diagnostics);
                    }
                }
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    ensure_not_root("grab")?;

    let settings = resolve_settings(SettingsOverrides {
        ytdlp_program: args.ytdlp.clone(),
        download_dir: args.dest.clone(),
        network_timeout_secs: args.timeout,
        ..SettingsOverrides::default()
    })?;
    let cookies = args
        .cookies
        .as_ref()
        .map(|path| fs::read(path).with_context(|| format!("reading {}", path.display())))
        .transpose()?;

    let ytdlp = YtDlp::new(&settings.ytdlp_program);
    let version = ytdlp.ensure_available().await?;
    tracing::debug!(version = %version, "extraction tool ready");

    let orchestrator = Orchestrator::from_settings(&settings, Arc::new(ytdlp));
    let request = build_request(args, settings.download_dir.clone(), cookies);

    let (tx, rx) = watch::channel(Progress::IDLE);
    let renderer = tokio::spawn(render_progress(rx));
    let result = tokio::select! {
        result = orchestrator.run(request, &tx) => result,
        _ = signal::ctrl_c() => Err(DownloadError::new(ErrorKind::Cancelled, "interrupted")),
    };
    drop(tx);
    let _ = renderer.await;

    let artifact = result?;
    print_summary(&artifact);
    Ok(())
}

fn build_request(args: Args, download_dir: PathBuf, cookies: Option<Vec<u8>>) -> DownloadRequest {
    let mut request = DownloadRequest::new(args.url).saving_to(download_dir);
    request.format = FormatPreference {
        selector: args.format,
        merge_format: args.merge_format,
    };
    request.cookies = cookies;
    request
}

async fn render_progress(mut rx: watch::Receiver<Progress>) {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg:<28} [{bar:40.green/blue}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(style);
    while rx.changed().await.is_ok() {
        let progress = *rx.borrow_and_update();
        bar.set_message(stage_label(progress.stage));
        bar.set_position(u64::from(progress.percent));
    }
    bar.finish_and_clear();
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Idle => "Waiting",
        Stage::FetchingMetadata => "Fetching video information",
        Stage::Downloading => "Downloading",
        Stage::Finalizing => "Saving",
        Stage::Complete => "Done",
        Stage::Failed => "Failed",
    }
}

fn print_summary(artifact: &Artifact) {
    let details = &artifact.details;
    println!("Title:    {}", details.title);
    println!("Uploader: {}", details.uploader);
    if let Some(views) = details.views_text() {
        println!("Views:    {views}");
    }
    if let Some(length) = details.duration_text() {
        println!("Length:   {length}");
    }
    match &artifact.payload {
        Payload::Saved(path) => println!("Saved to {}", path.display()),
        Payload::Bytes(bytes) => println!("Downloaded {} bytes", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubegrab::orchestrator::Delivery;

    #[test]
    fn defaults_match_best_quality_mp4() {
        let args = Args::try_parse_from(["grab", "https://youtu.be/example"]).unwrap();
        assert_eq!(args.format, "bestvideo+bestaudio/best");
        assert_eq!(args.merge_format, "mp4");
        assert!(args.cookies.is_none());
        assert!(args.dest.is_none());
        assert!(args.timeout.is_none());
    }

    #[test]
    fn parses_all_flags() {
        let args = Args::try_parse_from([
            "grab",
            "--cookies",
            "jar.txt",
            "-d",
            "/srv/videos",
            "--format",
            "best",
            "--merge-format",
            "mkv",
            "--timeout",
            "60",
            "https://youtu.be/example",
        ])
        .unwrap();
        assert_eq!(args.cookies, Some(PathBuf::from("jar.txt")));
        assert_eq!(args.dest, Some(PathBuf::from("/srv/videos")));
        assert_eq!(args.timeout, Some(60));

        let request = build_request(args, PathBuf::from("/srv/videos"), Some(b"jar".to_vec()));
        assert_eq!(request.url, "https://youtu.be/example");
        assert_eq!(request.format.selector, "best");
        assert_eq!(request.format.merge_format, "mkv");
        assert_eq!(request.cookies.as_deref(), Some(&b"jar"[..]));
        assert_eq!(request.delivery, Delivery::SaveTo(PathBuf::from("/srv/videos")));
    }

    #[test]
    fn url_is_required() {
        assert!(Args::try_parse_from(["grab"]).is_err());
        assert!(Args::try_parse_from(["grab", "--timeout", "soon", "https://x.test"]).is_err());
    }

    #[test]
    fn every_stage_has_a_label() {
        for stage in [
            Stage::Idle,
            Stage::FetchingMetadata,
            Stage::Downloading,
            Stage::Finalizing,
            Stage::Complete,
            Stage::Failed,
        ] {
            assert!(!stage_label(stage).is_empty());
        }
    }
}
