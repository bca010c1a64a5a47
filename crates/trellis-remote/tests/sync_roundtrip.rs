//! Full sync cycle against a directory remote: repro, push, clone, pull.
//!
//! The pipeline writes a directory output and a file output, so pushes
//! have to expand tree manifests and pulls have to reassemble them on a
//! machine that has never run the pipeline.

use std::path::Path;

use trellis_core::{Digest, ExperimentTracker, LockFile, ReproOptions, Runner, Workspace};
use trellis_remote::{pull, push, LocalDirRemote, Remote, RemoteConfig};

const PIPELINE: &str = r#"stages:
  gen:
    cmd: mkdir -p bundle && echo alpha > bundle/a.txt && echo beta > bundle/b.txt && echo scalar > single.txt
    outs: [bundle, single.txt]
"#;

const PARAMS: &str = "base:\n  seed: 1\n";

fn setup(dir: &Path) -> Workspace {
    let ws = Workspace::init(dir).unwrap();
    std::fs::write(ws.pipeline_path(), PIPELINE).unwrap();
    std::fs::write(ws.params_path(), PARAMS).unwrap();
    ws
}

async fn repro(ws: &Workspace) {
    Runner::load(ws)
        .unwrap()
        .repro(&ReproOptions::default())
        .await
        .unwrap();
}

/// A second machine: same project files, empty cache, no outputs yet.
fn clone_workspace(src: &Workspace, dir: &Path) -> Workspace {
    let ws = Workspace::init(dir).unwrap();
    for file in ["trellis.yaml", "params.yaml", "trellis.lock"] {
        std::fs::copy(src.root().join(file), dir.join(file)).unwrap();
    }
    ws
}

#[tokio::test]
async fn repro_push_clone_pull_restores_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let ws = setup(dir.path());
    repro(&ws).await;

    let remote_dir = tempfile::tempdir().unwrap();
    let remote = LocalDirRemote::new(remote_dir.path()).unwrap();

    // bundle manifest, its two members, and single.txt.
    let report = push(&ws, &remote).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.transferred, 4);

    let dir2 = tempfile::tempdir().unwrap();
    let ws2 = clone_workspace(&ws, dir2.path());
    let report = pull(&ws2, &remote).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.transferred, 4);

    for file in ["bundle/a.txt", "bundle/b.txt", "single.txt"] {
        assert_eq!(
            std::fs::read(dir.path().join(file)).unwrap(),
            std::fs::read(dir2.path().join(file)).unwrap(),
            "{file} must match after pull"
        );
    }

    // The clone's fingerprints now agree with its lock.
    let statuses = Runner::load(&ws2).unwrap().status(None).unwrap();
    assert!(statuses.iter().all(|s| s.is_fresh()));
}

#[tokio::test]
async fn repeated_syncs_transfer_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ws = setup(dir.path());
    repro(&ws).await;

    let remote_dir = tempfile::tempdir().unwrap();
    let remote = LocalDirRemote::new(remote_dir.path()).unwrap();
    push(&ws, &remote).await.unwrap();

    let again = push(&ws, &remote).await.unwrap();
    assert_eq!(again.transferred, 0);
    assert_eq!(again.already_present, 4);

    let dir2 = tempfile::tempdir().unwrap();
    let ws2 = clone_workspace(&ws, dir2.path());
    pull(&ws2, &remote).await.unwrap();

    let again = pull(&ws2, &remote).await.unwrap();
    assert_eq!(again.transferred, 0);
    assert_eq!(again.already_present, 4);
    assert_eq!(
        std::fs::read_to_string(dir2.path().join("single.txt")).unwrap(),
        "scalar\n"
    );
}

#[tokio::test]
async fn workspace_config_supplies_the_remote() {
    let dir = tempfile::tempdir().unwrap();
    let ws = setup(dir.path());
    repro(&ws).await;

    let remote_dir = tempfile::tempdir().unwrap();
    let mut config = ws.config().unwrap();
    config.remote = Some(trellis_core::RemoteSettings {
        url: remote_dir.path().display().to_string(),
    });
    ws.save_config(&config).unwrap();

    let resolved = RemoteConfig::resolve(None, &ws).unwrap();
    assert_eq!(resolved.url, remote_dir.path().display().to_string());

    let remote = resolved.open().unwrap();
    let report = push(&ws, remote.as_ref()).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.transferred, 4);
    assert!(remote_dir.path().join("objects").is_dir());
}

#[tokio::test]
async fn experiment_artifacts_are_pushed_too() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::init(dir.path()).unwrap();
    std::fs::write(
        ws.pipeline_path(),
        "stages:\n  gen:\n    cmd: mkdir -p bundle && grep seed params.yaml > bundle/a.txt && echo beta > bundle/b.txt && echo scalar > single.txt\n    outs: [bundle, single.txt]\n",
    )
    .unwrap();
    std::fs::write(ws.params_path(), PARAMS).unwrap();
    repro(&ws).await;

    // The seed flows into bundle/a.txt, so this run records a bundle
    // manifest and member the lock has never seen.
    let record = ExperimentTracker::new(&ws)
        .run(
            &["base.seed=2".to_string()],
            Some("seed2".to_string()),
            &ReproOptions::default(),
        )
        .await
        .unwrap();

    let remote_dir = tempfile::tempdir().unwrap();
    let remote = LocalDirRemote::new(remote_dir.path()).unwrap();
    let report = push(&ws, &remote).await.unwrap();
    assert!(report.is_clean());
    // Four lock objects plus the experiment's manifest and changed member.
    assert_eq!(report.transferred, 6);

    let bundle = record.stages["gen"]
        .outs
        .iter()
        .find(|o| o.path == "bundle")
        .unwrap();
    let digest: Digest = bundle.digest.parse().unwrap();
    assert!(remote.exists(&digest).await.unwrap());
}

#[tokio::test]
async fn push_heals_a_partially_lost_remote() {
    let dir = tempfile::tempdir().unwrap();
    let ws = setup(dir.path());
    repro(&ws).await;

    let remote_dir = tempfile::tempdir().unwrap();
    let remote = LocalDirRemote::new(remote_dir.path()).unwrap();
    push(&ws, &remote).await.unwrap();

    let lock = LockFile::load(&ws.lock_path()).unwrap();
    let hex = lock.stages["gen"]
        .outs
        .iter()
        .find(|o| o.path == "single.txt")
        .unwrap()
        .digest
        .clone();
    std::fs::remove_file(
        remote_dir
            .path()
            .join("objects")
            .join(&hex[..2])
            .join(&hex[2..]),
    )
    .unwrap();

    let report = push(&ws, &remote).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.transferred, 1);
    assert_eq!(report.already_present, 3);
}
