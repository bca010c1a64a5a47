//! Trellis Remote: artifact synchronization for Trellis workspaces
//!
//! Moves cache objects between a workspace and a shared artifact store.
//! Two backends ship here: a local directory (`file://` or a bare path)
//! and an HTTP object store. Both speak the same [`Remote`] trait and
//! mirror the sharded `objects/` layout of the workspace cache, so a
//! pulled object lands in the local cache byte for byte.

pub mod config;
pub mod error;
pub mod fs;
pub mod http;
pub mod sync;

pub use config::{open_remote, RemoteConfig, REMOTE_ENV, TOKEN_ENV};
pub use error::{RemoteError, Result};
pub use fs::LocalDirRemote;
pub use http::HttpRemote;
pub use sync::{pull, push, SyncFailure, SyncReport};

use async_trait::async_trait;
use trellis_core::Digest;

/// A content-addressed artifact store reachable from the workspace.
///
/// Objects are immutable and keyed by their sha256 digest, so pushes
/// are idempotent and every pull can be verified against its key.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Human-readable location for log lines and CLI output.
    fn location(&self) -> String;

    /// Whether the object is already present on the remote.
    async fn exists(&self, digest: &Digest) -> Result<bool>;

    /// Uploads one object. Pushing an object that already exists is a no-op.
    async fn push(&self, digest: &Digest, data: &[u8]) -> Result<()>;

    /// Downloads one object's bytes.
    async fn pull(&self, digest: &Digest) -> Result<Vec<u8>>;
}
