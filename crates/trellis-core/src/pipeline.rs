//! Pipeline definition: the declarative stage graph in `trellis.yaml`.
//!
//! A stage names a shell command, the paths it reads (`deps`), the paths it
//! writes (`outs` and `metrics`), and the parameter sections it consumes.
//! Wiring is inferred: a stage whose dep matches another stage's output
//! runs after it. Nothing here executes anything.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, TrellisError};
use crate::params::ParamStore;

/// File name of the pipeline definition at the workspace root.
pub const PIPELINE_FILE: &str = "trellis.yaml";

/// One declared stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    /// Shell command, run from the workspace root.
    pub cmd: String,
    /// Paths the command reads (files or directories).
    pub deps: Vec<String>,
    /// Paths the command writes, tracked in the cache.
    pub outs: Vec<String>,
    /// Scalar metrics files the command writes (JSON).
    pub metrics: Vec<String>,
    /// Parameter sections the command consumes, on top of `base`.
    pub params: Vec<String>,
}

impl Stage {
    /// Everything the stage is expected to produce: outs plus metrics.
    pub fn tracked_outputs(&self) -> impl Iterator<Item = &str> {
        self.outs.iter().chain(self.metrics.iter()).map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    cmd: String,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    outs: Vec<String>,
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    params: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    stages: serde_yaml::Mapping,
}

/// Parsed pipeline, stages kept in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineDef {
    stages: Vec<Stage>,
}

impl PipelineDef {
    /// Load and parse `trellis.yaml`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrellisError::PipelineNotFound(path.display().to_string())
            } else {
                TrellisError::Io(e)
            }
        })?;
        Self::parse(&text)
    }

    /// Parse a pipeline from YAML text.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawPipeline =
            serde_yaml::from_str(text).map_err(|e| TrellisError::InvalidPipeline(e.to_string()))?;

        let mut stages: Vec<Stage> = Vec::with_capacity(raw.stages.len());
        for (key, body) in raw.stages {
            let name = match key {
                serde_yaml::Value::String(s) => s,
                other => {
                    return Err(TrellisError::InvalidPipeline(format!(
                        "stage names must be strings, found {other:?}"
                    )))
                }
            };
            if stages.iter().any(|s| s.name == name) {
                return Err(TrellisError::InvalidPipeline(format!(
                    "duplicate stage name: {name}"
                )));
            }

            let raw_stage: RawStage = serde_yaml::from_value(body)
                .map_err(|e| TrellisError::InvalidPipeline(format!("stage {name}: {e}")))?;

            stages.push(Stage {
                name,
                cmd: raw_stage.cmd,
                deps: normalize_paths(raw_stage.deps)?,
                outs: normalize_paths(raw_stage.outs)?,
                metrics: normalize_paths(raw_stage.metrics)?,
                params: raw_stage.params,
            });
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn require_stage(&self, name: &str) -> Result<&Stage> {
        self.stage(name)
            .ok_or_else(|| TrellisError::UnknownStage(name.to_string()))
    }

    /// All declared metrics files, in stage order.
    pub fn metrics_files(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.metrics.iter().map(String::as_str))
            .collect()
    }

    /// Static checks that do not need the workspace: commands are
    /// non-empty, no output is claimed twice, declared param sections
    /// exist. Cycle detection lives in [`crate::graph`].
    pub fn validate(&self, params: &ParamStore) -> Result<()> {
        let mut seen_outputs: Vec<(&str, &str)> = Vec::new();

        for stage in &self.stages {
            if stage.cmd.trim().is_empty() {
                return Err(TrellisError::InvalidPipeline(format!(
                    "stage {} has an empty cmd",
                    stage.name
                )));
            }

            for out in stage.tracked_outputs() {
                if let Some((other, _)) = seen_outputs.iter().find(|(_, o)| *o == out) {
                    return Err(TrellisError::InvalidPipeline(format!(
                        "output {out} is declared by both {other} and {}",
                        stage.name
                    )));
                }
                seen_outputs.push((&stage.name, out));
            }

            for section in &stage.params {
                if !params.has_section(section) {
                    return Err(TrellisError::InvalidPipeline(format!(
                        "stage {} references unknown param section {section}",
                        stage.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Normalize declared paths: strip `./` prefixes and trailing slashes so
/// the same path always compares equal.
fn normalize_paths(paths: Vec<String>) -> Result<Vec<String>> {
    paths.into_iter().map(|p| normalize_path(&p)).collect()
}

pub(crate) fn normalize_path(path: &str) -> Result<String> {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p.is_empty() || p == "." {
        return Err(TrellisError::InvalidPipeline(format!(
            "invalid path in pipeline: {path:?}"
        )));
    }
    Ok(p.to_string())
}
