//! Error taxonomy for Trellis operations.
//!
//! Configuration problems (bad pipeline, bad params, cycles) are reported
//! before any stage executes. Stage and artifact failures identify the
//! stage and path involved so the caller can print something actionable.

/// Trellis domain errors.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    #[error("workspace already initialized at {0}")]
    AlreadyInitialized(String),

    #[error("no trellis workspace found (searched upward from {0})")]
    WorkspaceNotFound(String),

    #[error("another trellis run is in progress (lock file {0} exists)")]
    WorkspaceLocked(String),

    #[error("pipeline file not found: {0}")]
    PipelineNotFound(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("pipeline contains a cycle: {0}")]
    CyclicPipeline(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("params file not found: {0}")]
    ParamsNotFound(String),

    #[error("invalid params file: {0}")]
    InvalidParams(String),

    #[error("unknown param section: {0}")]
    UnknownSection(String),

    #[error("missing param {section}.{key}")]
    MissingParam { section: String, key: String },

    #[error("invalid param override {0:?} (expected section.key=value)")]
    InvalidOverride(String),

    #[error("stage {stage} failed with exit code {code}")]
    StageFailed { stage: String, code: i32 },

    #[error("stage {stage} depends on missing path: {path}")]
    MissingDependency { stage: String, path: String },

    #[error("stage {stage} did not produce declared output: {path}")]
    MissingOutput { stage: String, path: String },

    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("experiment id {id} is ambiguous: {matches} records match")]
    AmbiguousExperiment { id: String, matches: usize },

    #[error("experiment name already in use: {0}")]
    ExperimentNameTaken(String),

    #[error("metrics file not found: {0} (has the pipeline been run?)")]
    MetricsNotFound(String),

    #[error("invalid metrics file {path}: {reason}")]
    InvalidMetrics { path: String, reason: String },

    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;
