//! Push and pull: moving recorded artifacts between cache and remote.
//!
//! The object set is planned from what the workspace records: every
//! output digest in `trellis.lock` plus every output digest in saved
//! experiment records. Directory outputs expand to their tree manifest
//! and member blobs. Transfers run a few objects at a time; one failed
//! object is reported, not fatal, so a flaky connection can be retried
//! with a second push.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, StreamExt};
use trellis_core::obs;
use trellis_core::{
    checkout_path, CacheStore, Digest, ExperimentTracker, FsCacheStore, LockFile, PathRecord,
    StageRecord, TreeManifest, Workspace,
};

use crate::error::{RemoteError, Result};
use crate::Remote;

/// How many objects are in flight at once.
const CONCURRENCY: usize = 4;

/// Tally of one push or pull.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub transferred: usize,
    pub already_present: usize,
    pub failed: Vec<SyncFailure>,
}

/// One object that could not be moved.
#[derive(Debug)]
pub struct SyncFailure {
    pub digest: String,
    pub error: String,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, hex: &str, outcome: Result<Transfer>) {
        match outcome {
            Ok(Transfer::Transferred) => self.transferred += 1,
            Ok(Transfer::AlreadyPresent) => self.already_present += 1,
            Err(e) => {
                obs::emit_sync_object_failed(hex, &e);
                self.failed.push(SyncFailure {
                    digest: hex.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

enum Transfer {
    Transferred,
    AlreadyPresent,
}

/// Output digest recorded somewhere in the workspace.
#[derive(Debug, Clone, Copy)]
struct WantedObject {
    digest: Digest,
    is_dir: bool,
}

/// Upload every recorded output object the remote is missing.
pub async fn push(ws: &Workspace, remote: &dyn Remote) -> Result<SyncReport> {
    let cache = ws.cache()?;
    let wanted = workspace_objects(ws)?;

    let mut report = SyncReport::default();

    // Expand directory outputs into manifest plus member blobs. A
    // manifest missing from the local cache is a per-object failure.
    let mut objects: BTreeSet<String> = BTreeSet::new();
    for object in &wanted {
        objects.insert(object.digest.to_hex());
        if object.is_dir {
            match tree_members(&cache, &object.digest) {
                Ok(members) => objects.extend(members),
                Err(e) => report.record(&object.digest.to_hex(), Err(e)),
            }
        }
    }

    obs::emit_sync_started("push", &remote.location(), objects.len());

    let results = stream::iter(objects)
        .map(|hex| {
            let cache = &cache;
            async move {
                let outcome = push_object(cache, remote, &hex).await;
                (hex, outcome)
            }
        })
        .buffer_unordered(CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    for (hex, outcome) in results {
        report.record(&hex, outcome);
    }

    obs::emit_sync_finished("push", report.transferred, report.already_present);
    Ok(report)
}

/// Download every recorded output object the cache is missing, then
/// materialize the outputs named by `trellis.lock` into the workspace.
pub async fn pull(ws: &Workspace, remote: &dyn Remote) -> Result<SyncReport> {
    let cache = ws.cache()?;
    let wanted = workspace_objects(ws)?;

    obs::emit_sync_started("pull", &remote.location(), wanted.len());

    let mut report = SyncReport::default();

    // Top-level objects first: file blobs and tree manifests.
    let results = stream::iter(wanted.iter().copied())
        .map(|object| {
            let cache = &cache;
            async move {
                let outcome = ensure_local(cache, remote, &object.digest).await;
                (object, outcome)
            }
        })
        .buffer_unordered(CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    // Manifests are local now; their members come in a second wave.
    let top: BTreeSet<String> = wanted.iter().map(|w| w.digest.to_hex()).collect();
    let mut members: BTreeSet<String> = BTreeSet::new();
    for (object, outcome) in results {
        let fetched = outcome.is_ok();
        report.record(&object.digest.to_hex(), outcome);
        if fetched && object.is_dir {
            match tree_members(&cache, &object.digest) {
                Ok(list) => members.extend(list),
                Err(e) => report.record(&object.digest.to_hex(), Err(e)),
            }
        }
    }
    members.retain(|hex| !top.contains(hex));

    let results = stream::iter(members)
        .map(|hex| {
            let cache = &cache;
            async move {
                let outcome = match hex.parse::<Digest>() {
                    Ok(digest) => ensure_local(cache, remote, &digest).await,
                    Err(e) => Err(e.into()),
                };
                (hex, outcome)
            }
        })
        .buffer_unordered(CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    for (hex, outcome) in results {
        report.record(&hex, outcome);
    }

    // Restore the workspace files the lock records.
    let lock = LockFile::load(&ws.lock_path())?;
    for record in lock.stages.values() {
        for out in &record.outs {
            if let Err(e) = checkout_out(ws, &cache, out) {
                report.failed.push(SyncFailure {
                    digest: out.digest.clone(),
                    error: format!("checkout {}: {e}", out.path),
                });
            }
        }
    }

    obs::emit_sync_finished("pull", report.transferred, report.already_present);
    Ok(report)
}

async fn push_object(cache: &FsCacheStore, remote: &dyn Remote, hex: &str) -> Result<Transfer> {
    let digest: Digest = hex.parse()?;
    if remote.exists(&digest).await? {
        return Ok(Transfer::AlreadyPresent);
    }
    let data = cache.get(&digest)?;
    remote.push(&digest, &data).await?;
    Ok(Transfer::Transferred)
}

/// Fetch one object into the local cache unless it is already there.
/// Pulled bytes are verified against their digest before being stored.
async fn ensure_local(
    cache: &FsCacheStore,
    remote: &dyn Remote,
    digest: &Digest,
) -> Result<Transfer> {
    if cache.exists(digest)? {
        return Ok(Transfer::AlreadyPresent);
    }

    let data = remote.pull(digest).await?;
    let actual = Digest::compute(&data);
    if actual != *digest {
        return Err(RemoteError::DigestMismatch {
            expected: digest.to_hex(),
            actual: actual.to_hex(),
        });
    }

    cache.put(&data)?;
    Ok(Transfer::Transferred)
}

/// Every output digest the workspace records, deduplicated across the
/// lock file and all experiment records.
fn workspace_objects(ws: &Workspace) -> Result<Vec<WantedObject>> {
    let mut seen: BTreeMap<String, bool> = BTreeMap::new();

    let lock = LockFile::load(&ws.lock_path())?;
    for record in lock.stages.values() {
        collect_outs(record, &mut seen);
    }
    for exp in ExperimentTracker::new(ws).list()? {
        for record in exp.stages.values() {
            collect_outs(record, &mut seen);
        }
    }

    let mut wanted = Vec::with_capacity(seen.len());
    for (hex, is_dir) in seen {
        wanted.push(WantedObject {
            digest: hex.parse()?,
            is_dir,
        });
    }
    Ok(wanted)
}

fn collect_outs(record: &StageRecord, seen: &mut BTreeMap<String, bool>) {
    for out in &record.outs {
        seen.insert(out.digest.clone(), out.is_dir);
    }
}

fn tree_members(cache: &FsCacheStore, digest: &Digest) -> Result<Vec<String>> {
    let manifest = TreeManifest::from_bytes(&cache.get(digest)?)?;
    Ok(manifest.entries.into_iter().map(|e| e.digest).collect())
}

fn checkout_out(ws: &Workspace, cache: &FsCacheStore, out: &PathRecord) -> Result<()> {
    let digest: Digest = out.digest.parse()?;
    checkout_path(cache, &digest, out.is_dir, &ws.root().join(&out.path))?;
    Ok(())
}
