//! Trellis Core Library
//!
//! Reproducible pipelines for ML projects: a declarative stage graph,
//! content-addressed artifact caching, fingerprint-driven re-execution,
//! and experiment tracking. This crate holds all domain logic; the
//! `trellis` binary and the remote sync layer build on it.

pub mod cache;
pub mod error;
pub mod experiment;
pub mod fingerprint;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod params;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod state;
pub mod telemetry;
pub mod workspace;

pub use cache::fs::FsCacheStore;
pub use cache::{
    checkout_path, store_path, CacheError, CacheStore, Digest, PathDigest, TreeEntry, TreeManifest,
};

pub use error::{Result, TrellisError};

pub use experiment::{render_comparison, ExperimentTracker, RunRecord};

pub use fingerprint::{hash_file, hash_path, hash_tree};

pub use graph::StageGraph;

pub use metrics::{
    collect as collect_metrics, diff as diff_metrics, load_metrics_file, MetricDelta, MetricValues,
};

pub use params::{ParamOverride, ParamStore, SectionValues, BASE_SECTION};

pub use pipeline::{PipelineDef, Stage, PIPELINE_FILE};

pub use report::RunReport;

pub use runner::{
    ReproOptions, RunSummary, Runner, StageOutcome, StageReport, StageStatus, StaleReason,
};

pub use state::{LockFile, PathRecord, StageRecord, LOCK_FILE};

pub use telemetry::init_tracing;

pub use workspace::{RemoteSettings, RunGuard, Workspace, WorkspaceConfig, PARAMS_FILE};

/// Trellis version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
