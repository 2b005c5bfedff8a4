#![forbid(unsafe_code)]

//! Reads container attributes of a local media file through `ffprobe`.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Stream-level attributes of one file. Every field may be unknown; files
/// without a video or audio stream simply leave those fields empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbedFileMetadata {
    pub duration: Option<f64>,
    pub fps: Option<f64>,
    pub sample_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ProbedFileMetadata {
    pub fn is_empty(&self) -> bool {
        self.duration.is_none()
            && self.fps.is_none()
            && self.sample_rate.is_none()
            && self.audio_channels.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }
}

/// Subset of `ffprobe -print_format json -show_streams`.
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    time_base: Option<String>,
    nb_frames: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

impl ProbeStream {
    fn is(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }

    fn direct_duration(&self) -> Option<f64> {
        self.duration
            .as_deref()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0)
    }

    /// `time_base × nb_frames` when the stream carries no duration.
    fn derived_duration(&self) -> Option<f64> {
        let time_base = parse_ratio(self.time_base.as_deref()?)?;
        let frames: u64 = self.nb_frames.as_deref()?.trim().parse().ok()?;
        Some(time_base * frames as f64)
    }

    fn frame_rate(&self) -> Option<f64> {
        self.avg_frame_rate
            .as_deref()
            .and_then(parse_ratio)
            .or_else(|| self.r_frame_rate.as_deref().and_then(parse_ratio))
    }
}

/// Parses `30000/1001`, `1/90000` or a bare number. Zero denominators and
/// non-positive results are unknown.
fn parse_ratio(value: &str) -> Option<f64> {
    let value = value.trim();
    let ratio = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.parse().ok()?,
    };
    (ratio.is_finite() && ratio > 0.0).then_some(ratio)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn parse_probe_output(raw: &str) -> Result<ProbedFileMetadata> {
    let output: ProbeOutput = serde_json::from_str(raw).context("deserializing ffprobe JSON")?;
    let video = output.streams.iter().find(|stream| stream.is("video"));
    let audio = output.streams.iter().find(|stream| stream.is("audio"));

    let duration = video
        .and_then(|stream| stream.direct_duration().or_else(|| stream.derived_duration()))
        .or_else(|| audio.and_then(ProbeStream::direct_duration))
        .map(|value| round_to(value, 3));

    Ok(ProbedFileMetadata {
        duration,
        fps: video
            .and_then(ProbeStream::frame_rate)
            .map(|value| round_to(value, 2)),
        sample_rate: audio
            .and_then(|stream| stream.sample_rate.as_deref())
            .and_then(|value| value.trim().parse().ok()),
        audio_channels: audio.and_then(|stream| stream.channels),
        width: video.and_then(|stream| stream.width),
        height: video.and_then(|stream| stream.height),
    })
}

/// Invokes the probe tool once for `path`. Tool failures and unparseable
/// output are errors; callers decide whether that is fatal.
pub async fn probe_file(ffprobe: &Path, path: &Path) -> Result<ProbedFileMetadata> {
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("running {} on {}", ffprobe.display(), path.display()))?;

    if !output.status.success() {
        bail!(
            "probe failed for {} (status {}): {}",
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let raw = String::from_utf8(output.stdout).context("parsing ffprobe output as UTF-8")?;
    parse_probe_output(&raw).with_context(|| format!("reading probe output for {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::test_support::install_stub;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn reads_video_and_audio_streams() -> Result<()> {
        let raw = r#"{
            "streams": [
                {"codec_type": "video", "width": 1280, "height": 720,
                 "avg_frame_rate": "30000/1001", "r_frame_rate": "30/1",
                 "duration": "212.045000", "time_base": "1/30000", "nb_frames": "6355"},
                {"codec_type": "audio", "sample_rate": "44100", "channels": 2,
                 "duration": "212.100000"}
            ]
        }"#;
        let meta = parse_probe_output(raw)?;
        assert_eq!(meta.width, Some(1280));
        assert_eq!(meta.height, Some(720));
        assert_eq!(meta.fps, Some(29.97));
        assert_eq!(meta.duration, Some(212.045));
        assert_eq!(meta.sample_rate, Some(44100));
        assert_eq!(meta.audio_channels, Some(2));
        Ok(())
    }

    #[test]
    fn derives_duration_from_time_base_and_frames() -> Result<()> {
        let raw = r#"{"streams": [
            {"codec_type": "video", "width": 640, "height": 360,
             "avg_frame_rate": "0/0", "r_frame_rate": "25/1",
             "time_base": "1/25", "nb_frames": "250"}
        ]}"#;
        let meta = parse_probe_output(raw)?;
        assert_eq!(meta.duration, Some(10.0));
        assert_eq!(meta.fps, Some(25.0));
        assert!(meta.sample_rate.is_none());
        assert!(meta.audio_channels.is_none());
        Ok(())
    }

    #[test]
    fn duration_unknown_without_frames() -> Result<()> {
        let raw = r#"{"streams": [{"codec_type": "video", "time_base": "1/25"}]}"#;
        let meta = parse_probe_output(raw)?;
        assert!(meta.duration.is_none());
        Ok(())
    }

    #[test]
    fn audio_only_files_are_tolerated() -> Result<()> {
        let raw = r#"{"streams": [
            {"codec_type": "audio", "sample_rate": "48000", "channels": 1, "duration": "3.5"}
        ]}"#;
        let meta = parse_probe_output(raw)?;
        assert!(meta.height.is_none());
        assert!(meta.fps.is_none());
        assert_eq!(meta.duration, Some(3.5));
        assert_eq!(meta.sample_rate, Some(48000));
        assert!(!meta.is_empty());
        Ok(())
    }

    #[test]
    fn no_streams_is_empty() -> Result<()> {
        assert!(parse_probe_output("{}")?.is_empty());
        assert!(parse_probe_output("not json").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn probe_file_runs_tool() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "ffprobe", "for last; do :; done\ncat \"$last\"\n");
        let media = dir.path().join("clip.mp4");
        fs::write(
            &media,
            r#"{"streams": [{"codec_type": "video", "width": 1920, "height": 1080}]}"#,
        )?;
        let meta = probe_file(&stub, &media).await?;
        assert_eq!(meta.height, Some(1080));

        let failing = install_stub(dir.path(), "ffprobe-broken", "echo 'moov atom not found' >&2\nexit 1\n");
        let err = probe_file(&failing, &media).await.unwrap_err();
        assert!(err.to_string().contains("probe failed"));
        Ok(())
    }
}
