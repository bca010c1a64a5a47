//! Recorded pipeline state: `trellis.lock`.
//!
//! After each verified stage the runner records what the execution
//! actually saw: the exact command, dep digests, resolved parameter
//! values and output digests. The file is YAML, keyed by stage name in
//! sorted order, so it diffs cleanly in review. It is written after
//! every stage, not once at the end, so an interrupted run keeps the
//! stages that finished.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, TrellisError};
use crate::params::SectionValues;

/// File name of the lock file at the workspace root.
pub const LOCK_FILE: &str = "trellis.lock";

const LOCK_SCHEMA: &str = "1.0";

/// Digest of one dep or output path as seen by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRecord {
    pub path: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dir: bool,
}

/// Everything that went into one successful stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<PathRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: SectionValues,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outs: Vec<PathRecord>,
}

/// The lock file: last verified execution per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    pub schema: String,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

impl Default for LockFile {
    fn default() -> Self {
        Self {
            schema: LOCK_SCHEMA.to_string(),
            stages: BTreeMap::new(),
        }
    }
}

impl LockFile {
    /// Load the lock file. A missing file is an empty lock, not an error:
    /// the first run of a pipeline has nothing recorded yet.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Write atomically: temp file next to the target, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).ok_or_else(|| {
            TrellisError::Io(std::io::Error::other("lock path has no parent directory"))
        })?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.get(name)
    }

    pub fn record(&mut self, name: &str, record: StageRecord) {
        self.stages.insert(name.to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> StageRecord {
        let mut params = SectionValues::new();
        params.insert(
            "train".to_string(),
            BTreeMap::from([("epochs".to_string(), json!(10))]),
        );
        StageRecord {
            cmd: "python train.py".to_string(),
            deps: vec![PathRecord {
                path: "data/prepared".to_string(),
                digest: "ab".repeat(32),
                is_dir: true,
            }],
            params,
            outs: vec![PathRecord {
                path: "model.bin".to_string(),
                digest: "cd".repeat(32),
                is_dir: false,
            }],
        }
    }

    #[test]
    fn missing_lock_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::load(&dir.path().join(LOCK_FILE)).unwrap();
        assert!(lock.stages.is_empty());
        assert_eq!(lock.schema, LOCK_SCHEMA);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let mut lock = LockFile::default();
        lock.record("train", sample_record());
        lock.save(&path).unwrap();

        let loaded = LockFile::load(&path).unwrap();
        assert_eq!(loaded, lock);
    }

    #[test]
    fn is_dir_false_is_omitted_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let mut lock = LockFile::default();
        lock.record("train", sample_record());
        lock.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        // The directory dep carries the flag, the file output does not.
        assert_eq!(text.matches("is_dir: true").count(), 1);
        assert!(!text.contains("is_dir: false"));
    }

    #[test]
    fn corrupt_lock_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        std::fs::write(&path, "stages: [not, a, mapping]\n").unwrap();
        assert!(LockFile::load(&path).is_err());
    }

    #[test]
    fn stages_serialize_in_sorted_order() {
        let mut lock = LockFile::default();
        lock.record("zeta", sample_record());
        lock.record("alpha", sample_record());

        let text = serde_yaml::to_string(&lock).unwrap();
        let alpha = text.find("alpha").unwrap();
        let zeta = text.find("zeta").unwrap();
        assert!(alpha < zeta);
    }
}
