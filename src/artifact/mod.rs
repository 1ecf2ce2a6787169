//! Artifact storage layout
//!
//! The artifact directory is the single source of truth for completion: a
//! universe is complete exactly when `data/<identity>.csv` exists. There is
//! no other ledger.
//!
//! ## Layout
//!
//! ```text
//! <output_dir>/
//! ├── data/
//! │   ├── <identity>.csv          artifact (presence == completed)
//! │   └── <identity>.meta.json    ArtifactRecord sidecar
//! ├── logs/<identity>.log         executor stdout + stderr
//! ├── .work/                      per-universe private temp dirs
//! ├── multiverse_grid.json
//! └── aggregated_outputs.csv
//! ```
//!
//! ## Publication
//!
//! Artifacts are staged inside the universe's private work dir and moved into
//! `data/` with a rename once complete. The sidecar is published first, so a
//! visible artifact always has its metadata and no reader (aggregator, a
//! restarted scheduler) ever sees a half-written file.

mod record;

pub use record::{content_hash, ArtifactRecord};

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::universe::UniverseId;
use crate::{Error, Result};

const DATA_DIR: &str = "data";
const LOGS_DIR: &str = "logs";
const WORK_DIR: &str = ".work";
const ARTIFACT_SUFFIX: &str = ".csv";
const METADATA_SUFFIX: &str = ".meta.json";

/// Paths of one artifact found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Identity parsed from the file name
    pub id: UniverseId,
    /// `data/<identity>.csv`
    pub artifact_path: PathBuf,
    /// `data/<identity>.meta.json`
    pub metadata_path: PathBuf,
}

/// Artifact directory rooted at a run's output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Store rooted at `root`. Nothing is created until [`Self::ensure`].
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory layout if missing.
    ///
    /// # Errors
    ///
    /// Returns error if a directory cannot be created
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.logs_dir())?;
        fs::create_dir_all(self.work_dir())?;
        Ok(())
    }

    /// Output directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/data`
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    /// `<root>/logs`
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// `<root>/.work`
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(WORK_DIR)
    }

    /// Final artifact path of `id`.
    #[must_use]
    pub fn artifact_path(&self, id: &UniverseId) -> PathBuf {
        self.data_dir().join(format!("{id}{ARTIFACT_SUFFIX}"))
    }

    /// Metadata sidecar path of `id`.
    #[must_use]
    pub fn metadata_path(&self, id: &UniverseId) -> PathBuf {
        self.data_dir().join(format!("{id}{METADATA_SUFFIX}"))
    }

    /// Executor log path of `id`.
    #[must_use]
    pub fn log_path(&self, id: &UniverseId) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    /// Whether a completed artifact for `id` is visible. An artifact whose
    /// sidecar is gone cannot be aggregated and does not count.
    #[must_use]
    pub fn has_artifact(&self, id: &UniverseId) -> bool {
        self.artifact_path(id).is_file() && self.metadata_path(id).is_file()
    }

    /// Publish a staged artifact: sidecar first, then the artifact itself,
    /// both by rename. Overwrites an existing artifact of the same identity.
    ///
    /// # Errors
    ///
    /// Returns error if the sidecar cannot be written or the rename fails
    pub fn publish(&self, record: &ArtifactRecord, staged: &Path) -> Result<PathBuf> {
        let id = record.universe_id();
        let metadata = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.metadata_path(id), &metadata)?;

        let target = self.artifact_path(id);
        fs::rename(staged, &target)?;
        debug!(universe = %id.short(), path = %target.display(), "artifact published");
        Ok(target)
    }

    /// Read the sidecar of `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the sidecar is missing or malformed
    pub fn load_record(&self, id: &UniverseId) -> Result<ArtifactRecord> {
        let bytes = fs::read(self.metadata_path(id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All visible artifacts, sorted by identity. Files in `data/` whose name
    /// is not `<identity>.csv` (temp files, foreign files) are ignored.
    /// A missing `data/` directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn list(&self) -> Result<Vec<StoredArtifact>> {
        let data_dir = self.data_dir();
        if !data_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(ARTIFACT_SUFFIX) else {
                continue;
            };
            if !entry.file_type()?.is_file() {
                continue;
            }
            match UniverseId::parse(stem) {
                Ok(id) => found.push(StoredArtifact {
                    artifact_path: entry.path(),
                    metadata_path: self.metadata_path(&id),
                    id,
                }),
                Err(_) => debug!(file = %name, "ignoring file not named by universe identity"),
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    /// Identities of all visible artifacts.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn identities(&self) -> Result<BTreeSet<UniverseId>> {
        Ok(self.list()?.into_iter().map(|a| a.id).collect())
    }
}

/// Write `bytes` to `path` through a uniquely named temp file in the same
/// directory followed by a rename.
///
/// # Errors
///
/// Returns error if the parent directory is missing or not writable
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Other(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionSet;
    use crate::universe::{Universe, UniverseGrid};

    fn universes() -> Vec<Universe> {
        let dims = DimensionSet::builder()
            .dimension("x", ["A", "B", "C"])
            .build()
            .unwrap();
        UniverseGrid::enumerate(&dims).universes().to_vec()
    }

    fn stage(dir: &Path, content: &str) -> PathBuf {
        let staged = dir.join("staged.csv");
        fs::write(&staged, content).unwrap();
        staged
    }

    #[test]
    fn test_layout_paths() {
        let store = ArtifactStore::new("/out");
        let u = &universes()[0];
        assert_eq!(
            store.artifact_path(u.id()),
            PathBuf::from(format!("/out/data/{}.csv", u.id()))
        );
        assert_eq!(
            store.metadata_path(u.id()),
            PathBuf::from(format!("/out/data/{}.meta.json", u.id()))
        );
        assert_eq!(
            store.log_path(u.id()),
            PathBuf::from(format!("/out/logs/{}.log", u.id()))
        );
    }

    #[test]
    fn test_publish_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure().unwrap();

        let us = universes();
        for u in us.iter().take(2) {
            let staged = stage(&store.work_dir(), "value\n1\n");
            let record = ArtifactRecord::new(u, b"value\n1\n", 0.1);
            store.publish(&record, &staged).unwrap();
            assert!(store.has_artifact(u.id()));
            assert!(!staged.exists());
        }

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].id < listed[1].id);
        assert!(!store.has_artifact(us[2].id()));

        let record = store.load_record(us[0].id()).unwrap();
        assert_eq!(record.universe_id(), us[0].id());
    }

    #[test]
    fn test_artifact_without_sidecar_is_not_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure().unwrap();
        let u = &universes()[0];

        let staged = stage(&store.work_dir(), "value\n1\n");
        store
            .publish(&ArtifactRecord::new(u, b"value\n1\n", 0.0), &staged)
            .unwrap();
        fs::remove_file(store.metadata_path(u.id())).unwrap();

        assert!(store.artifact_path(u.id()).is_file());
        assert!(!store.has_artifact(u.id()));
    }

    #[test]
    fn test_publish_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure().unwrap();
        let u = &universes()[0];

        for content in ["v\n1\n", "v\n2\n"] {
            let staged = stage(&store.work_dir(), content);
            store
                .publish(&ArtifactRecord::new(u, content.as_bytes(), 0.0), &staged)
                .unwrap();
        }
        assert_eq!(fs::read_to_string(store.artifact_path(u.id())).unwrap(), "v\n2\n");
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure().unwrap();
        fs::write(store.data_dir().join("notes.csv"), "a\n").unwrap();
        fs::write(store.data_dir().join(".tmpXYZ"), "partial").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("never-created"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grid.json");
        write_atomic(&path, b"[]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[]");
        // no temp files left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
