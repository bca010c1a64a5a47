use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CacheError, CacheStore, Digest, Result};

/// Filesystem object store under `.trellis/cache`, sharded git-style.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining 62 hex chars>`.
/// Writes go through a temp file in the shard directory and are renamed
/// into place, so a crashed run never leaves a torn object behind.
pub struct FsCacheStore {
    objects_dir: PathBuf,
}

impl FsCacheStore {
    /// Open (or create) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    /// Where the object for `digest` lives on disk.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

impl CacheStore for FsCacheStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.object_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        let shard_dir = path.parent().ok_or_else(|| {
            CacheError::Io(std::io::Error::other("object path has no parent"))
        })?;
        fs::create_dir_all(shard_dir)?;

        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.object_path(digest)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound(*digest)
            } else {
                CacheError::Io(e)
            }
        })
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.object_path(digest).exists())
    }
}
