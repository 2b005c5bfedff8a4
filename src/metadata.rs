#![forbid(unsafe_code)]

//! Canonical per-item metadata and the reconciliation pass that produces it.
//!
//! A record is rebuilt from scratch on every pass: probed file attributes,
//! the platform title and the file itself. The previously persisted record is
//! only read to report drift.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use tokio::process::Command;

use crate::error::ItemError;
use crate::identity::{ItemRef, Platform};
use crate::interrupt::Interrupt;
use crate::probe::{ProbedFileMetadata, probe_file};
use crate::sink;
use crate::supervisor::{OutputStream, Toolchain, keep_tool_line, run_supervised, tool_label};

/// Serialized form of a value that could not be determined.
pub const UNAVAILABLE: &str = "N/A";

/// Column order of the shared tabular index.
pub const INDEX_COLUMNS: [&str; 12] = [
    "id",
    "file_name",
    "height",
    "width",
    "fps",
    "duration",
    "sample_rate",
    "audio_channels",
    "file_size",
    "video_url",
    "title",
    "platform",
];

/// One flattened record, cells in [`INDEX_COLUMNS`] order.
pub type IndexRow = [String; 12];

/// The authoritative record of one item. Unknown attributes are `None` here
/// and `"N/A"` once serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetadataRecord {
    pub id: String,
    pub file_name: String,
    #[serde(with = "na")]
    pub height: Option<u32>,
    #[serde(with = "na")]
    pub width: Option<u32>,
    #[serde(with = "na")]
    pub fps: Option<f64>,
    #[serde(with = "na")]
    pub duration: Option<f64>,
    #[serde(with = "na")]
    pub sample_rate: Option<u32>,
    #[serde(with = "na")]
    pub audio_channels: Option<u32>,
    pub file_size: u64,
    pub video_url: String,
    pub title: String,
    pub platform: Platform,
}

impl CanonicalMetadataRecord {
    pub fn assemble(
        item: &ItemRef,
        file_path: &Path,
        file_size: u64,
        probed: &ProbedFileMetadata,
        title: String,
    ) -> Self {
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: item.stable_id().to_string(),
            file_name,
            height: probed.height,
            width: probed.width,
            fps: probed.fps,
            duration: probed.duration,
            sample_rate: probed.sample_rate,
            audio_channels: probed.audio_channels,
            file_size,
            video_url: item.source_url().to_string(),
            title,
            platform: item.platform(),
        }
    }

    /// True when no field had to fall back to the unavailable marker.
    pub fn is_complete(&self) -> bool {
        self.height.is_some()
            && self.width.is_some()
            && self.fps.is_some()
            && self.duration.is_some()
            && self.sample_rate.is_some()
            && self.audio_channels.is_some()
    }

    pub fn to_row(&self) -> IndexRow {
        [
            self.id.clone(),
            self.file_name.clone(),
            cell(self.height),
            cell(self.width),
            cell(self.fps),
            cell(self.duration),
            cell(self.sample_rate),
            cell(self.audio_channels),
            self.file_size.to_string(),
            self.video_url.clone(),
            self.title.clone(),
            self.platform.as_str().to_string(),
        ]
    }

    pub fn to_json_map(&self) -> anyhow::Result<Map<String, Value>> {
        match serde_json::to_value(self).context("serializing metadata record")? {
            Value::Object(map) => Ok(map),
            other => Err(anyhow!("metadata record serialized as {other}")),
        }
    }
}

fn cell<T: fmt::Display>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| UNAVAILABLE.to_string())
}

/// `Option<T>` as either the plain value or `"N/A"`. Reading also accepts
/// numeric strings, which is what a CSV round trip produces.
pub(crate) mod na {
    use super::UNAVAILABLE;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_str(UNAVAILABLE),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Value(T),
        Text(String),
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: Deserialize<'de> + FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        match Raw::<T>::deserialize(deserializer)? {
            Raw::Value(value) => Ok(Some(value)),
            Raw::Text(text) => {
                let text = text.trim();
                if text.is_empty() || text == UNAVAILABLE {
                    Ok(None)
                } else {
                    text.parse().map(Some).map_err(de::Error::custom)
                }
            }
        }
    }
}

/// Field-level difference between a cached record and a fresh one.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Added { field: String, value: Value },
    Removed { field: String, value: Value },
    Changed { field: String, old: Value, new: Value },
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added { field, value } => write!(f, "+{field}={value}"),
            Self::Removed { field, value } => write!(f, "-{field}={value}"),
            Self::Changed { field, old, new } => write!(f, "{field}: {old} -> {new}"),
        }
    }
}

pub fn diff_records(cached: &Map<String, Value>, fresh: &Map<String, Value>) -> Vec<FieldChange> {
    let fields: BTreeSet<&String> = cached.keys().chain(fresh.keys()).collect();
    fields
        .into_iter()
        .filter_map(|field| match (cached.get(field), fresh.get(field)) {
            (None, Some(value)) => Some(FieldChange::Added {
                field: field.clone(),
                value: value.clone(),
            }),
            (Some(value), None) => Some(FieldChange::Removed {
                field: field.clone(),
                value: value.clone(),
            }),
            (Some(old), Some(new)) if old != new => Some(FieldChange::Changed {
                field: field.clone(),
                old: old.clone(),
                new: new.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Last persisted record for `stable_id`, if one exists and parses.
pub fn load_cached_record(directory: &Path, stable_id: &str) -> Option<Map<String, Value>> {
    let path = sink::record_path(directory, stable_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::error!(file = %path.display(), "could not read cached metadata: {err}");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            tracing::error!(file = %path.display(), "cached metadata is not a JSON object");
            None
        }
        Err(err) => {
            tracing::error!(file = %path.display(), "could not parse cached metadata: {err}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlatformInfo {
    title: Option<String>,
}

/// Fetches the item's title from the platform without downloading media.
pub async fn fetch_platform_title(
    toolchain: &Toolchain,
    item: &ItemRef,
    interrupt: &Interrupt,
) -> Result<String, ItemError> {
    let tool = tool_label(&toolchain.yt_dlp);
    let mut command = Command::new(&toolchain.yt_dlp);
    command
        .arg("--dump-single-json")
        .arg("--skip-download")
        .arg("--no-playlist")
        .arg("--no-warnings")
        .arg(item.source_url());

    let mut payload = String::new();
    run_supervised(
        command,
        &tool,
        interrupt,
        toolchain.grace_period,
        toolchain.extraction_timeout,
        |stream, line| match stream {
            OutputStream::Stdout => {
                payload.push_str(line);
                payload.push('\n');
            }
            OutputStream::Stderr => {
                if keep_tool_line(line) {
                    tracing::warn!("{tool} stderr: {line}");
                }
            }
        },
    )
    .await
    .map_err(|err| match ItemError::from(err) {
        ItemError::Extraction(err) => ItemError::PlatformMetadata(anyhow!(err)),
        other => other,
    })?;

    let info: PlatformInfo = serde_json::from_str(payload.trim())
        .context("parsing platform metadata JSON")
        .map_err(ItemError::PlatformMetadata)?;
    info.title
        .filter(|title| !title.trim().is_empty())
        .ok_or_else(|| ItemError::PlatformMetadata(anyhow!("platform metadata has no title")))
}

/// Builds the canonical record for `file_path` and persists it as the item's
/// JSON record. `probed` is reused when the caller already probed the file.
/// Probe failures degrade to unavailable fields; a missing title fails the
/// item.
pub async fn reconcile(
    toolchain: &Toolchain,
    item: &ItemRef,
    file_path: &Path,
    probed: Option<ProbedFileMetadata>,
    directory: &Path,
    interrupt: &Interrupt,
) -> Result<CanonicalMetadataRecord, ItemError> {
    let cached = load_cached_record(directory, item.stable_id());

    let probed = match probed {
        Some(probed) => probed,
        None => match probe_file(&toolchain.ffprobe, file_path).await {
            Ok(probed) => probed,
            Err(err) => {
                tracing::error!(file = %file_path.display(), "probe failed: {err:#}");
                ProbedFileMetadata::default()
            }
        },
    };
    tracing::debug!(?probed, "probed file attributes");
    if probed.is_empty() {
        tracing::warn!(
            file = %file_path.display(),
            "every probed attribute is unavailable; the probe tool may be misbehaving"
        );
    }

    let file_size = fs::metadata(file_path)
        .map_err(|source| ItemError::Inspect {
            path: file_path.to_path_buf(),
            source,
        })?
        .len();

    if interrupt.is_set() {
        return Err(ItemError::Interrupted);
    }
    let title = fetch_platform_title(toolchain, item, interrupt).await?;
    let record = CanonicalMetadataRecord::assemble(item, file_path, file_size, &probed, title);

    if let Some(cached) = &cached {
        let fresh = record.to_json_map().map_err(ItemError::Persist)?;
        let changes = diff_records(cached, &fresh);
        if changes.is_empty() {
            tracing::info!("metadata unchanged");
        } else {
            let summary = changes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            tracing::info!(changes = changes.len(), "metadata drift: {summary}");
        }
    }

    if interrupt.is_set() {
        return Err(ItemError::Interrupted);
    }
    sink::persist_record(directory, &record).map_err(ItemError::Persist)?;

    if record.is_complete() {
        tracing::info!("metadata extracted");
    } else {
        tracing::warn!("some metadata fields are unavailable");
    }
    Ok(record)
}
