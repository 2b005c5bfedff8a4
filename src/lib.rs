#![forbid(unsafe_code)]

//! Bulk youtube/rutube downloader: drives yt-dlp once per video, skips files
//! that already match the requested quality, and keeps a JSON record per
//! video plus a shared `video_metadata.csv` in sync across runs.

pub mod config;
pub mod error;
pub mod identity;
pub mod index;
pub mod interrupt;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod playlist;
pub mod probe;
pub mod sink;
pub mod supervisor;
