#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use bulktube_tools::config::{Settings, SettingsOverrides, resolve_settings};
use bulktube_tools::interrupt::{Interrupt, install_signal_handlers};
use bulktube_tools::logging::init_logging;
use bulktube_tools::orchestrator::{BatchReport, run};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Downloads the videos (or playlists) listed in a text file and keeps their
/// metadata in sync.
#[derive(Debug, Parser)]
#[command(name = "download_videos", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Root directory for downloads.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Target video height such as `720p`, or `best`.
    #[arg(long, value_name = "QUALITY")]
    quality: Option<String>,
    /// Number of concurrent downloads.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    /// Treat the list file as playlist URLs.
    #[arg(long, conflicts_with = "videos")]
    playlists: bool,
    /// Treat the list file as video URLs.
    #[arg(long)]
    videos: bool,
    /// List file to read instead of the configured one.
    #[arg(long, value_name = "FILE")]
    urls: Option<PathBuf>,
}

impl Args {
    fn into_overrides(self) -> SettingsOverrides {
        let use_playlists = match (self.playlists, self.videos) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        SettingsOverrides {
            config_path: self.config,
            output_dir: self.output_dir,
            video_quality: self.quality,
            num_workers: self.workers,
            use_playlists,
            list_file: self.urls,
        }
    }
}

async fn download(settings: &Settings) -> Result<BatchReport> {
    tracing::info!(
        workers = settings.num_workers,
        list = %settings.list_file.display(),
        "starting downloader"
    );
    settings.toolchain().ensure_available()?;

    let interrupt = Interrupt::new();
    install_signal_handlers(interrupt.clone()).context("installing signal handlers")?;

    let report = run(settings, &interrupt).await?;
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        not_started = report.not_started,
        "processed {} of {} items",
        report.succeeded,
        report.total
    );
    if !report.index_updated {
        tracing::error!("the metadata index was not fully updated");
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match resolve_settings(Args::parse().into_overrides()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let _logging = match init_logging(&settings.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match download(&settings).await {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
