#![forbid(unsafe_code)]

//! Runs the per-item pipeline across a fixed pool of workers.
//!
//! Items flow `resolving -> skip-check -> [extracting] -> reconciling ->
//! persisted`, or end in `failed` at any step. Workers share one read-only
//! [`AssetIndex`] snapshot; the CSV index is written once, after every worker
//! has stopped.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::{Quality, Settings};
use crate::error::{ItemError, Stage};
use crate::identity::{ItemRef, read_url_list, resolve_playlist, resolve_video};
use crate::index::AssetIndex;
use crate::interrupt::Interrupt;
use crate::metadata::{CanonicalMetadataRecord, reconcile};
use crate::playlist::playlist_video_urls;
use crate::probe::{ProbedFileMetadata, probe_file};
use crate::sink;
use crate::supervisor::{Toolchain, run_extraction};

pub const INDIVIDUAL_VIDEOS_DIR: &str = "individual_videos";

/// What to do with an item before any extraction happens.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The existing file already satisfies the request; only refresh metadata.
    /// Carries the probe result so the file is not probed twice.
    SkipReconcileOnly {
        path: PathBuf,
        probed: ProbedFileMetadata,
    },
    Download,
}

/// Decides between reusing an existing file and (re-)downloading. An
/// existing file whose height cannot be probed is downloaded again.
pub async fn decide(
    ffprobe: &Path,
    item: &ItemRef,
    quality: Quality,
    index: &AssetIndex,
) -> Decision {
    let Some(existing) = index.find(item.stable_id()) else {
        tracing::info!("no local file yet, downloading");
        return Decision::Download;
    };

    let probed = match probe_file(ffprobe, existing).await {
        Ok(probed) => probed,
        Err(err) => {
            tracing::warn!(
                file = %existing.display(),
                "could not probe existing file, downloading again: {err:#}"
            );
            return Decision::Download;
        }
    };

    let skip = |probed| Decision::SkipReconcileOnly {
        path: existing.to_path_buf(),
        probed,
    };
    match (quality.target_height(), probed.height) {
        (None, _) => {
            tracing::info!(file = %existing.display(), "file already present, refreshing metadata");
            skip(probed)
        }
        (Some(target), Some(height)) if height == target => {
            tracing::info!(
                file = %existing.display(),
                "file already present at {target}p, refreshing metadata"
            );
            skip(probed)
        }
        (Some(target), Some(height)) => {
            tracing::info!(
                file = %existing.display(),
                "existing file is {height}p, downloading {target}p"
            );
            Decision::Download
        }
        (Some(target), None) => {
            tracing::info!(
                file = %existing.display(),
                "existing file height unknown, downloading {target}p"
            );
            Decision::Download
        }
    }
}

/// Result of one item pipeline.
#[derive(Debug)]
pub struct ItemOutcome {
    pub source_url: String,
    pub stage: Stage,
    pub result: Result<CanonicalMetadataRecord, ItemError>,
}

/// Aggregate of one or more batches.
#[derive(Debug)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_started: usize,
    pub interrupted: bool,
    pub index_updated: bool,
    pub records: Vec<CanonicalMetadataRecord>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            not_started: 0,
            interrupted: false,
            index_updated: true,
            records: Vec::new(),
        }
    }

    pub fn absorb(&mut self, other: BatchReport) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.not_started += other.not_started;
        self.interrupted |= other.interrupted;
        self.index_updated &= other.index_updated;
        self.records.extend(other.records);
    }

    /// `0` on full success or cancellation, `2` when items failed or the
    /// index could not be written.
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            0
        } else if self.failed > 0 || self.not_started > 0 || !self.index_updated {
            2
        } else {
            0
        }
    }
}

impl Default for BatchReport {
    fn default() -> Self {
        Self::new()
    }
}

struct BatchContext {
    directory: PathBuf,
    index: Arc<AssetIndex>,
    quality: Quality,
    toolchain: Arc<Toolchain>,
    interrupt: Interrupt,
}

fn advance(stage: &mut Stage, next: Stage) {
    tracing::debug!(from = %stage, to = %next, "stage");
    *stage = next;
}

async fn process_item(ctx: &BatchContext, source_url: String) -> ItemOutcome {
    let mut stage = Stage::Pending;
    let result = run_pipeline(ctx, &source_url, &mut stage).await;
    match &result {
        Ok(_) => advance(&mut stage, Stage::Persisted),
        Err(err) if err.is_interrupt() => {
            tracing::info!(stage = %stage, "item interrupted");
            advance(&mut stage, Stage::Failed);
        }
        Err(err @ ItemError::InvalidUrl(_)) => {
            tracing::warn!("{err}, skipping");
            advance(&mut stage, Stage::Failed);
        }
        Err(err) => {
            tracing::error!(stage = %stage, "item failed: {err}");
            advance(&mut stage, Stage::Failed);
        }
    }
    ItemOutcome {
        source_url,
        stage,
        result,
    }
}

async fn run_pipeline(
    ctx: &BatchContext,
    source_url: &str,
    stage: &mut Stage,
) -> Result<CanonicalMetadataRecord, ItemError> {
    advance(stage, Stage::Resolving);
    let item =
        resolve_video(source_url).ok_or_else(|| ItemError::InvalidUrl(source_url.to_string()))?;
    let span = tracing::Span::current();
    span.record("id", item.stable_id());
    span.record("platform", item.platform().as_str());
    tracing::info!("processing {} video {}", item.platform(), item.stable_id());

    if ctx.interrupt.is_set() {
        return Err(ItemError::Interrupted);
    }
    advance(stage, Stage::SkipCheck);
    let (path, probed) = match decide(&ctx.toolchain.ffprobe, &item, ctx.quality, &ctx.index).await
    {
        Decision::SkipReconcileOnly { path, probed } => (path, Some(probed)),
        Decision::Download => {
            advance(stage, Stage::Extracting);
            let path =
                run_extraction(&ctx.toolchain, &item, &ctx.index, ctx.quality, &ctx.interrupt)
                    .await?;
            (path, None)
        }
    };

    advance(stage, Stage::Reconciling);
    reconcile(&ctx.toolchain, &item, &path, probed, &ctx.directory, &ctx.interrupt).await
}

async fn worker_loop(
    worker: usize,
    ctx: Arc<BatchContext>,
    queue: Arc<Mutex<VecDeque<String>>>,
    outcomes: mpsc::UnboundedSender<ItemOutcome>,
) {
    loop {
        if ctx.interrupt.is_set() {
            tracing::debug!(worker, "interrupt set, worker stopping");
            break;
        }
        let next = queue.lock().pop_front();
        let Some(source_url) = next else {
            break;
        };
        let span = tracing::info_span!(
            "item",
            worker,
            url = %source_url,
            id = tracing::field::Empty,
            platform = tracing::field::Empty,
        );
        let outcome = process_item(&ctx, source_url).instrument(span).await;
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}

/// Processes `urls` into `directory` with `worker_count` concurrent workers.
/// Only an unreadable `directory` is an error; item failures are counted in
/// the report.
pub async fn run_batch(
    urls: Vec<String>,
    directory: &Path,
    worker_count: usize,
    quality: Quality,
    toolchain: Arc<Toolchain>,
    interrupt: &Interrupt,
) -> Result<BatchReport> {
    let index = AssetIndex::build(directory)?;
    tracing::info!(
        directory = %directory.display(),
        existing = index.len(),
        "indexed existing files"
    );

    let total = urls.len();
    let ctx = Arc::new(BatchContext {
        directory: directory.to_path_buf(),
        index: Arc::new(index),
        quality,
        toolchain,
        interrupt: interrupt.clone(),
    });
    let queue = Arc::new(Mutex::new(VecDeque::from(urls)));
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let mut workers = JoinSet::new();
    for worker in 1..=worker_count.clamp(1, total.max(1)) {
        workers.spawn(worker_loop(
            worker,
            Arc::clone(&ctx),
            Arc::clone(&queue),
            sender.clone(),
        ));
    }
    drop(sender);

    let mut report = BatchReport::new();
    report.total = total;
    let mut finished = 0;
    while let Some(outcome) = receiver.recv().await {
        finished += 1;
        debug_assert!(outcome.stage.is_terminal(), "item left in {}", outcome.stage);
        match outcome.result {
            Ok(record) => {
                report.succeeded += 1;
                report.records.push(record);
            }
            Err(_) => report.failed += 1,
        }
        tracing::debug!(
            finished,
            total,
            stage = %outcome.stage,
            url = %outcome.source_url,
            "item finished"
        );
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            tracing::error!("worker task failed: {err}");
        }
    }
    report.not_started = total - finished;
    report.interrupted = interrupt.is_set();
    if report.interrupted {
        tracing::info!(
            not_started = report.not_started,
            "interrupted, stopped dispatching new items"
        );
    }
    tracing::info!("processed {} of {} videos", report.succeeded, total);

    match sink::update_index(directory, &report.records) {
        Ok(path) => tracing::info!(file = %path.display(), "metadata written"),
        Err(err) => {
            tracing::error!("could not update the metadata index: {err:#}");
            report.index_updated = false;
        }
    }
    sink::cleanup_sidecars(directory);
    Ok(report)
}

/// Processes every playlist in `urls`, each into its own directory under
/// `output_dir`. Playlists that cannot be resolved or listed are skipped.
pub async fn run_playlists(
    urls: Vec<String>,
    output_dir: &Path,
    worker_count: usize,
    quality: Quality,
    toolchain: Arc<Toolchain>,
    interrupt: &Interrupt,
) -> Result<BatchReport> {
    let mut report = BatchReport::new();
    for url in urls {
        if interrupt.is_set() {
            report.interrupted = true;
            break;
        }
        let Some(playlist) = resolve_playlist(&url) else {
            tracing::warn!(url, "unrecognized playlist url, skipping");
            continue;
        };
        let directory = output_dir.join(&playlist.playlist_id);
        fs::create_dir_all(&directory)
            .with_context(|| format!("creating {}", directory.display()))?;

        tracing::info!(url, directory = %directory.display(), "processing playlist");
        let video_urls = match playlist_video_urls(&toolchain, &playlist, interrupt).await {
            Ok(video_urls) if video_urls.is_empty() => {
                tracing::error!(url, "playlist has no videos");
                continue;
            }
            Ok(video_urls) => video_urls,
            Err(_) if interrupt.is_set() => continue,
            Err(err) => {
                tracing::error!(url, "could not list playlist: {err:#}");
                continue;
            }
        };

        let batch = run_batch(
            video_urls,
            &directory,
            worker_count,
            quality,
            Arc::clone(&toolchain),
            interrupt,
        )
        .await?;
        report.absorb(batch);
    }
    Ok(report)
}

/// Entry point for one invocation. Setup failures are returned as errors
/// before any item is dispatched.
pub async fn run(settings: &Settings, interrupt: &Interrupt) -> Result<BatchReport> {
    fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("creating output directory {}", settings.output_dir.display()))?;
    tracing::info!(output_dir = %settings.output_dir.display(), "output directory ready");
    match settings.quality {
        Quality::Best => tracing::info!("no video quality set, using the best available"),
        quality => tracing::info!("target video quality: {quality}"),
    }

    let urls = read_url_list(&settings.list_file)?;
    let toolchain = Arc::new(settings.toolchain());

    let report = if settings.use_playlists {
        run_playlists(
            urls,
            &settings.output_dir,
            settings.num_workers,
            settings.quality,
            toolchain,
            interrupt,
        )
        .await?
    } else {
        let directory = settings.output_dir.join(INDIVIDUAL_VIDEOS_DIR);
        fs::create_dir_all(&directory)
            .with_context(|| format!("creating {}", directory.display()))?;
        run_batch(
            urls,
            &directory,
            settings.num_workers,
            settings.quality,
            toolchain,
            interrupt,
        )
        .await?
    };

    if report.interrupted {
        tracing::info!("download interrupted by user");
    } else {
        tracing::info!("download finished");
    }
    Ok(report)
}
