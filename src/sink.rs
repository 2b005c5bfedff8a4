#![forbid(unsafe_code)]

//! Durable outputs: the per-item `{id}_metadata.json` record and the shared
//! `video_metadata.csv` index.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::metadata::{CanonicalMetadataRecord, INDEX_COLUMNS, IndexRow, UNAVAILABLE};

pub const INDEX_FILE_NAME: &str = "video_metadata.csv";
pub const SIDECAR_SUFFIX: &str = ".info.json";
const UTF8_BOM: &str = "\u{feff}";

pub fn record_path(directory: &Path, stable_id: &str) -> PathBuf {
    directory.join(format!("{stable_id}_metadata.json"))
}

pub fn index_path(directory: &Path) -> PathBuf {
    directory.join(INDEX_FILE_NAME)
}

/// Writes `record` into the item's JSON file. Keys already in the file that
/// the record does not carry are kept; every record field overwrites.
pub fn persist_record(directory: &Path, record: &CanonicalMetadataRecord) -> Result<PathBuf> {
    let path = record_path(directory, &record.id);
    let mut merged = match fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(existing)) => existing,
            _ => {
                tracing::warn!(file = %path.display(), "replacing unreadable metadata file");
                Map::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(err) => {
            tracing::warn!(file = %path.display(), "replacing unreadable metadata file: {err}");
            Map::new()
        }
    };
    merged.extend(record.to_json_map()?);

    let payload = to_pretty_json(&Value::Object(merged))?;
    let mut tmp = NamedTempFile::new_in(directory)
        .with_context(|| format!("creating temporary file in {}", directory.display()))?;
    tmp.write_all(&payload)
        .with_context(|| format!("writing {}", path.display()))?;
    tmp.persist(&path)
        .with_context(|| format!("finalizing {}", path.display()))?;
    Ok(path)
}

fn to_pretty_json(value: &Value) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut payload, PrettyFormatter::with_indent(b"    "));
    value
        .serialize(&mut serializer)
        .context("serializing metadata JSON")?;
    payload.push(b'\n');
    Ok(payload)
}

/// In-memory copy of the tabular index, one row per id.
#[derive(Debug, Default)]
struct IndexTable {
    rows: Vec<IndexRow>,
    positions: HashMap<String, usize>,
}

impl IndexTable {
    fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let content = raw.strip_prefix(UTF8_BOM).unwrap_or(&raw);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .clone();
        let columns: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(position, name)| (name.trim(), position))
            .collect();
        if !columns.contains_key("id") {
            bail!("{} has no id column", path.display());
        }

        let mut table = Self::default();
        for (line, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
            let row: IndexRow = INDEX_COLUMNS.map(|column| {
                columns
                    .get(column)
                    .and_then(|&position| record.get(position))
                    .unwrap_or(UNAVAILABLE)
                    .to_string()
            });
            if row[0].trim().is_empty() {
                tracing::warn!(file = %path.display(), row = line + 1, "dropping index row without id");
                continue;
            }
            table.upsert(row);
        }
        Ok(table)
    }

    fn upsert(&mut self, row: IndexRow) {
        match self.positions.get(&row[0]) {
            Some(&position) => self.rows[position] = row,
            None => {
                self.positions.insert(row[0].clone(), self.rows.len());
                self.rows.push(row);
            }
        }
    }

    /// Rewrites `path` through a temporary file in the same directory.
    fn write(&self, path: &Path) -> Result<()> {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(directory)
            .with_context(|| format!("creating temporary file in {}", directory.display()))?;
        tmp.write_all(UTF8_BOM.as_bytes())
            .context("writing index header")?;
        {
            let mut writer = csv::Writer::from_writer(&mut tmp);
            writer
                .write_record(INDEX_COLUMNS)
                .context("writing index header")?;
            for row in &self.rows {
                writer.write_record(row).context("writing index row")?;
            }
            writer.flush().context("flushing index")?;
        }
        tmp.persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

/// Replaces the row of every record by id, appending unknown ids, and
/// rewrites the index. Must only be called by one writer at a time.
pub fn update_index(directory: &Path, records: &[CanonicalMetadataRecord]) -> Result<PathBuf> {
    let path = index_path(directory);
    let mut table = IndexTable::load(&path)?;
    for record in records {
        table.upsert(record.to_row());
    }
    table.write(&path)?;
    tracing::info!(
        file = %path.display(),
        rows = table.rows.len(),
        updated = records.len(),
        "metadata index updated"
    );
    Ok(path)
}

pub fn append_or_update_index(
    directory: &Path,
    record: &CanonicalMetadataRecord,
) -> Result<PathBuf> {
    update_index(directory, std::slice::from_ref(record))
}

/// Rows of the index in file order, normalized to [`INDEX_COLUMNS`].
pub fn read_index(directory: &Path) -> Result<Vec<IndexRow>> {
    Ok(IndexTable::load(&index_path(directory))?.rows)
}

/// Deletes the extraction tool's `*.info.json` sidecars. Returns how many
/// were removed; failures are logged and skipped.
pub fn cleanup_sidecars(directory: &Path) -> usize {
    let listing = match fs::read_dir(directory) {
        Ok(listing) => listing,
        Err(err) => {
            tracing::error!(directory = %directory.display(), "could not list sidecars: {err}");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in listing.flatten() {
        let path = entry.path();
        let is_sidecar = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(SIDECAR_SUFFIX));
        if !is_sidecar || !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(file = %path.display(), "removed sidecar");
                removed += 1;
            }
            Err(err) => tracing::error!(file = %path.display(), "could not remove sidecar: {err}"),
        }
    }
    removed
}
