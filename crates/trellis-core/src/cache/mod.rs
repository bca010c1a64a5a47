//! Content-addressed artifact cache.
//!
//! Every tracked artifact lives in the cache under its SHA-256 digest.
//! Files are stored as raw blobs. Directories are stored as a JSON tree
//! manifest (sorted file entries, each pointing at a blob), so a directory
//! output can be restored object by object and shares storage with any
//! other snapshot that contains the same files.

pub mod fs;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// SHA-256 digest used as a content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Hex-encoded string, as recorded in lock files and run records.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex().chars().take(12).collect::<String>())
    }
}

impl FromStr for Digest {
    type Err = CacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidDigest(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CacheError::InvalidDigest(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object not found in cache: {0}")]
    NotFound(Digest),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("invalid tree manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Object store interface. Implementations deduplicate by digest.
pub trait CacheStore: Send + Sync {
    /// Store `data` and return its digest.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Retrieve the object for `digest`.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Check whether `digest` exists without reading the object.
    fn exists(&self, digest: &Digest) -> Result<bool>;
}

/// One file inside a cached directory tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    /// Hex digest of the file's blob.
    pub digest: String,
}

/// Manifest describing a cached directory: its sorted file entries.
///
/// The manifest's own digest is the directory's fingerprint, so two
/// directories with identical contents always share one manifest object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeManifest {
    pub entries: Vec<TreeEntry>,
}

impl TreeManifest {
    /// Canonical byte form stored in the cache. Entries are kept sorted by
    /// path, so equal trees serialize identically.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Digest of a workspace path plus the file/directory distinction needed
/// to restore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathDigest {
    pub digest: Digest,
    pub is_dir: bool,
}

/// Enumerate all files under `root`, as `(relative path, absolute path)`
/// pairs in a deterministic order (entries sorted per directory).
pub fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    fn visit(dir: &Path, prefix: &str, acc: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
        let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                visit(&entry.path(), &rel, acc)?;
            } else {
                acc.push((rel, entry.path()));
            }
        }
        Ok(())
    }

    let mut acc = Vec::new();
    visit(root, "", &mut acc)?;
    Ok(acc)
}

/// Store the file or directory at `path` in the cache and return its digest.
///
/// Directories are walked deterministically; each file becomes a blob and
/// the resulting manifest becomes the directory's object.
pub fn store_path(store: &dyn CacheStore, path: &Path) -> Result<PathDigest> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        let mut entries = Vec::new();
        for (rel, abs) in walk_files(path)? {
            let digest = store.put(&std::fs::read(&abs)?)?;
            entries.push(TreeEntry {
                path: rel,
                digest: digest.to_hex(),
            });
        }
        let manifest = TreeManifest { entries };
        let digest = store.put(&manifest.to_bytes()?)?;
        Ok(PathDigest {
            digest,
            is_dir: true,
        })
    } else {
        let digest = store.put(&std::fs::read(path)?)?;
        Ok(PathDigest {
            digest,
            is_dir: false,
        })
    }
}

/// Materialize a cached object at `dest`, replacing whatever is there.
pub fn checkout_path(
    store: &dyn CacheStore,
    digest: &Digest,
    is_dir: bool,
    dest: &Path,
) -> Result<()> {
    if dest.exists() {
        if dest.is_dir() {
            std::fs::remove_dir_all(dest)?;
        } else {
            std::fs::remove_file(dest)?;
        }
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if is_dir {
        let manifest = TreeManifest::from_bytes(&store.get(digest)?)?;
        std::fs::create_dir_all(dest)?;
        for entry in &manifest.entries {
            let blob = store.get(&entry.digest.parse()?)?;
            let file_dest = dest.join(&entry.path);
            if let Some(parent) = file_dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(file_dest, blob)?;
        }
    } else {
        std::fs::write(dest, store.get(digest)?)?;
    }
    Ok(())
}
