//! Local directory remote, for shared filesystems and tests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use trellis_core::Digest;

use crate::error::{RemoteError, Result};
use crate::Remote;

/// Remote backed by a directory, usually on a network mount.
///
/// Uses the same `objects/<2 hex>/<62 hex>` layout as the workspace
/// cache, with temp-file-then-rename writes so concurrent pushes from
/// two machines never leave a torn object.
pub struct LocalDirRemote {
    root: PathBuf,
    objects_dir: PathBuf,
}

impl LocalDirRemote {
    /// Open (or create) a remote rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let objects_dir = root.join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { root, objects_dir })
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

#[async_trait]
impl Remote for LocalDirRemote {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.object_path(digest).exists())
    }

    async fn push(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.object_path(digest);
        if path.exists() {
            return Ok(());
        }

        let shard_dir = path
            .parent()
            .ok_or_else(|| RemoteError::Io(std::io::Error::other("object path has no parent")))?;
        fs::create_dir_all(shard_dir)?;

        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(())
    }

    async fn pull(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.object_path(digest)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RemoteError::ObjectMissing(digest.to_hex())
            } else {
                RemoteError::Io(e)
            }
        })
    }
}
