#![forbid(unsafe_code)]

//! Snapshot of the media files already present in an output directory.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Immutable listing of one directory keyed by filename stem. A snapshot is
/// never updated in place; callers `rebuild` and swap when they need fresh
/// state. `generation` grows by one per rebuild so logs can tell snapshots
/// apart.
#[derive(Debug, Clone)]
pub struct AssetIndex {
    directory: PathBuf,
    generation: u64,
    entries: BTreeMap<String, PathBuf>,
}

impl AssetIndex {
    /// Lists the immediate files of `directory` (no recursion). An unreadable
    /// directory is an error. When several files share a stem the most
    /// recently modified one wins.
    pub fn build(directory: &Path) -> Result<Self> {
        Self::scan(directory, 0)
    }

    pub fn rebuild(&self) -> Result<Self> {
        Self::scan(&self.directory, self.generation + 1)
    }

    fn scan(directory: &Path, generation: u64) -> Result<Self> {
        let listing = fs::read_dir(directory)
            .with_context(|| format!("listing {}", directory.display()))?;
        let mut newest: BTreeMap<String, (SystemTime, PathBuf)> = BTreeMap::new();

        for entry in listing {
            let entry =
                entry.with_context(|| format!("reading entry of {}", directory.display()))?;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            match newest.get(&stem) {
                Some((seen, _)) if *seen >= modified => {}
                _ => {
                    newest.insert(stem, (modified, path));
                }
            }
        }

        let entries = newest
            .into_iter()
            .map(|(stem, (_, path))| (stem, path))
            .collect();
        tracing::debug!(
            directory = %directory.display(),
            generation,
            "built asset index"
        );
        Ok(Self {
            directory: directory.to_path_buf(),
            generation,
            entries,
        })
    }

    /// Existing file for `stable_id`, provided it is still on disk.
    pub fn find(&self, stable_id: &str) -> Option<&Path> {
        self.entries
            .get(stable_id)
            .map(PathBuf::as_path)
            .filter(|path| path.exists())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn indexes_immediate_files_by_stem() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("abc.mp4"), "video")?;
        fs::write(dir.path().join("abc_metadata.json"), "{}")?;
        fs::write(dir.path().join("def.info.json"), "{}")?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("nested").join("ghi.mp4"), "video")?;

        let index = AssetIndex::build(dir.path())?;
        assert_eq!(index.find("abc"), Some(dir.path().join("abc.mp4").as_path()));
        assert!(index.find("abc_metadata").is_some());
        assert!(index.find("def").is_none());
        assert!(index.find("ghi").is_none());
        assert!(index.find("nested").is_none());
        assert_eq!(index.generation(), 0);
        Ok(())
    }

    #[test]
    fn rebuild_sees_new_files_without_touching_old_snapshot() -> Result<()> {
        let dir = tempdir()?;
        let first = AssetIndex::build(dir.path())?;
        assert!(first.is_empty());

        fs::write(dir.path().join("fresh.mp4"), "video")?;
        let second = first.rebuild()?;
        assert!(first.find("fresh").is_none());
        assert!(second.find("fresh").is_some());
        assert_eq!(second.generation(), 1);
        assert_eq!(second.directory(), dir.path());
        Ok(())
    }

    #[test]
    fn deleted_files_are_not_reported() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.webm");
        fs::write(&path, "video")?;
        let index = AssetIndex::build(dir.path())?;
        fs::remove_file(&path)?;
        assert!(index.find("gone").is_none());
        assert_eq!(index.len(), 1);
        Ok(())
    }

    #[test]
    fn unreadable_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(AssetIndex::build(&dir.path().join("missing")).is_err());
    }
}
