//! Content fingerprinting for dependencies and outputs.
//!
//! These helpers hash workspace paths without writing to the cache, so
//! staleness checks (`trellis status`) stay read-only. The digests they
//! produce are identical to what [`crate::cache::store_path`] records,
//! because both build the same tree manifest for directories.

use std::path::Path;

use crate::cache::{walk_files, Digest, PathDigest, TreeEntry, TreeManifest};
use crate::error::Result;

/// Digest of a single file's bytes.
pub fn hash_file(path: &Path) -> Result<Digest> {
    Ok(Digest::compute(&std::fs::read(path)?))
}

/// Build the tree manifest for a directory without caching anything.
pub fn hash_tree(path: &Path) -> Result<TreeManifest> {
    let mut entries = Vec::new();
    for (rel, abs) in walk_files(path)? {
        entries.push(TreeEntry {
            path: rel,
            digest: hash_file(&abs)?.to_hex(),
        });
    }
    Ok(TreeManifest { entries })
}

/// Digest of a workspace path, or `None` if it does not exist.
///
/// Files hash as their bytes; directories hash as their tree manifest.
pub fn hash_path(path: &Path) -> Result<Option<PathDigest>> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        let manifest = hash_tree(path)?;
        let digest = Digest::compute(&manifest.to_bytes()?);
        Ok(Some(PathDigest {
            digest,
            is_dir: true,
        }))
    } else {
        Ok(Some(PathDigest {
            digest: hash_file(path)?,
            is_dir: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fs::FsCacheStore;
    use crate::cache::store_path;

    #[test]
    fn file_digest_tracks_content_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "id,label\n1,Water\n").unwrap();
        std::fs::write(&b, "id,label\n1,Water\n").unwrap();

        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());

        std::fs::write(&b, "id,label\n1,Dragon\n").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn missing_path_hashes_to_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_path(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn directory_digest_changes_with_member_rename() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("train.csv"), "rows").unwrap();

        let before = hash_path(&root).unwrap().unwrap();
        std::fs::rename(root.join("train.csv"), root.join("test.csv")).unwrap();
        let after = hash_path(&root).unwrap().unwrap();

        assert!(before.is_dir && after.is_dir);
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn pure_hash_matches_cached_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache")).unwrap();

        let root = dir.path().join("features");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("one.npy"), [0u8; 16]).unwrap();
        std::fs::write(root.join("sub/two.npy"), [7u8; 16]).unwrap();

        let pure = hash_path(&root).unwrap().unwrap();
        let cached = store_path(&store, &root).unwrap();
        assert_eq!(pure.digest, cached.digest);
        assert_eq!(pure.is_dir, cached.is_dir);

        let file = dir.path().join("single.txt");
        std::fs::write(&file, "just one file").unwrap();
        let pure = hash_path(&file).unwrap().unwrap();
        let cached = store_path(&store, &file).unwrap();
        assert_eq!(pure.digest, cached.digest);
        assert!(!pure.is_dir);
    }
}
