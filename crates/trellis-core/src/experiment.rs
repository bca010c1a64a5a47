//! Experiment tracking: isolated runs with overridden parameters.
//!
//! `exp run` executes the pipeline with `section.key=value` overrides and
//! captures a run record (params, stage fingerprints, metrics) under
//! `.trellis/exps/`. The overridden params are materialized to `params.yaml`
//! for the duration of the run, since stage commands read that file
//! themselves. The workspace is snapshotted first and restored byte for
//! byte afterwards: outputs, the lock file, and `params.yaml` end up
//! exactly as they were, whether the run succeeded or failed. Only an
//! explicit `exp apply` promotes a record's results into the workspace.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::cache::{checkout_path, store_path};
use crate::error::{Result, TrellisError};
use crate::metrics::{self, MetricValues};
use crate::obs;
use crate::params::{ParamOverride, ParamStore, SectionValues};
use crate::pipeline::PipelineDef;
use crate::runner::{ReproOptions, Runner, RunSummary};
use crate::state::{LockFile, PathRecord, StageRecord};
use crate::workspace::Workspace;

/// A captured experiment: the full context and results of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Raw `section.key=value` overrides as given on the command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<String>,
    /// Fully resolved parameter sections the run used.
    pub params: SectionValues,
    /// Stage records as the run left them in the lock.
    pub stages: BTreeMap<String, StageRecord>,
    /// Flattened metrics collected after the run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: MetricValues,
    pub executed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

impl RunRecord {
    /// First eight hex chars of the id, enough to address a record.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Name when given, short id otherwise.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.short_id())
    }
}

/// What the workspace looked like before an experiment ran.
struct Snapshot {
    /// Tracked output path -> prior content (`None` = did not exist).
    entries: Vec<(String, Option<PathRecord>)>,
    /// Raw lock file text, restored verbatim.
    lock_text: Option<String>,
    /// Raw `params.yaml` text, restored verbatim.
    params_text: Option<String>,
}

/// Manages run records under `.trellis/exps/`.
pub struct ExperimentTracker<'a> {
    ws: &'a Workspace,
}

impl<'a> ExperimentTracker<'a> {
    pub fn new(ws: &'a Workspace) -> Self {
        Self { ws }
    }

    /// Run the pipeline with `overrides` applied on top of `params.yaml`,
    /// capture a record, and restore the workspace. A failed run restores
    /// the workspace too and leaves no record behind.
    pub async fn run(
        &self,
        overrides: &[String],
        name: Option<String>,
        opts: &ReproOptions,
    ) -> Result<RunRecord> {
        let parsed: Vec<ParamOverride> = overrides
            .iter()
            .map(|spec| ParamOverride::parse(spec))
            .collect::<Result<_>>()?;

        if let Some(name) = &name {
            if self.list()?.iter().any(|r| r.name.as_deref() == Some(name)) {
                return Err(TrellisError::ExperimentNameTaken(name.clone()));
            }
        }

        let pipeline = PipelineDef::load(&self.ws.pipeline_path())?;
        let params = ParamStore::load(&self.ws.params_path())?.with_overrides(&parsed)?;
        let runner = Runner::with_params(self.ws, pipeline, params)?;

        let _guard = self.ws.lock_run()?;
        let snapshot = self.snapshot(runner.pipeline())?;

        // Stage commands load params.yaml themselves, so the overridden
        // values have to be on disk while they run.
        let outcome = match self.write_params(runner.params()) {
            Ok(()) => runner.repro_locked(opts).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(summary) => {
                let capture = self.capture(&runner, overrides, name, &summary);
                self.restore(&snapshot)?;
                let record = capture?;
                self.save_record(&record)?;
                obs::emit_experiment_captured(&record.short_id(), record.executed);
                Ok(record)
            }
            Err(run_err) => {
                if let Err(restore_err) = self.restore(&snapshot) {
                    warn!(error = %restore_err, "workspace restore failed after experiment error");
                }
                Err(run_err)
            }
        }
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        let dir = self.ws.exps_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            records.push(serde_json::from_str(&text)?);
        }
        records.sort_by_key(|r: &RunRecord| r.created_at);
        Ok(records)
    }

    /// Resolve an id prefix or name to exactly one record.
    pub fn find(&self, query: &str) -> Result<RunRecord> {
        let mut matches: Vec<RunRecord> = self
            .list()?
            .into_iter()
            .filter(|r| {
                r.id.simple().to_string().starts_with(query)
                    || r.id.to_string().starts_with(query)
                    || r.name.as_deref() == Some(query)
            })
            .collect();

        match matches.len() {
            0 => Err(TrellisError::ExperimentNotFound(query.to_string())),
            1 => Ok(matches.remove(0)),
            n => Err(TrellisError::AmbiguousExperiment {
                id: query.to_string(),
                matches: n,
            }),
        }
    }

    /// Promote a record into the workspace: check its outputs out of the
    /// cache, write its stage records to the lock, and set `params.yaml`
    /// to the values the run used, so the workspace reports fresh.
    pub fn apply(&self, query: &str) -> Result<RunRecord> {
        let record = self.find(query)?;
        let _guard = self.ws.lock_run()?;
        let cache = self.ws.cache()?;

        let mut outputs = 0usize;
        for stage in record.stages.values() {
            for out in &stage.outs {
                checkout_path(
                    &cache,
                    &out.digest.parse()?,
                    out.is_dir,
                    &self.ws.root().join(&out.path),
                )?;
                outputs += 1;
            }
        }

        let lock = LockFile {
            stages: record.stages.clone(),
            ..Default::default()
        };
        lock.save(&self.ws.lock_path())?;

        let params_text = serde_yaml::to_string(&record.params)?;
        std::fs::write(self.ws.params_path(), params_text)?;

        obs::emit_experiment_applied(&record.short_id(), outputs);
        Ok(record)
    }

    /// Delete a record. The cache keeps its objects; `remove` only forgets
    /// the experiment.
    pub fn remove(&self, query: &str) -> Result<RunRecord> {
        let record = self.find(query)?;
        std::fs::remove_file(self.record_path(&record.id))?;
        Ok(record)
    }

    fn snapshot(&self, pipeline: &PipelineDef) -> Result<Snapshot> {
        let cache = self.ws.cache()?;
        let mut entries = Vec::new();
        for stage in pipeline.stages() {
            for out in stage.tracked_outputs() {
                let path = self.ws.root().join(out);
                let prior = if path.exists() {
                    let pd = store_path(&cache, &path)?;
                    Some(PathRecord {
                        path: out.to_string(),
                        digest: pd.digest.to_hex(),
                        is_dir: pd.is_dir,
                    })
                } else {
                    None
                };
                entries.push((out.to_string(), prior));
            }
        }

        let lock_text = read_optional(&self.ws.lock_path())?;
        let params_text = read_optional(&self.ws.params_path())?;

        Ok(Snapshot {
            entries,
            lock_text,
            params_text,
        })
    }

    fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let cache = self.ws.cache()?;
        for (out, prior) in &snapshot.entries {
            let dest = self.ws.root().join(out);
            match prior {
                Some(rec) => {
                    checkout_path(&cache, &rec.digest.parse()?, rec.is_dir, &dest)?;
                }
                None => {
                    if dest.is_dir() {
                        std::fs::remove_dir_all(&dest)?;
                    } else if dest.exists() {
                        std::fs::remove_file(&dest)?;
                    }
                }
            }
        }

        restore_optional(&self.ws.lock_path(), snapshot.lock_text.as_deref())?;
        restore_optional(&self.ws.params_path(), snapshot.params_text.as_deref())?;
        Ok(())
    }

    fn write_params(&self, params: &ParamStore) -> Result<()> {
        let text = serde_yaml::to_string(params.all())?;
        std::fs::write(self.ws.params_path(), text)?;
        Ok(())
    }

    fn capture(
        &self,
        runner: &Runner,
        overrides: &[String],
        name: Option<String>,
        summary: &RunSummary,
    ) -> Result<RunRecord> {
        let lock = LockFile::load(&self.ws.lock_path())?;
        let metrics = metrics::collect_existing(self.ws.root(), runner.pipeline())?;

        Ok(RunRecord {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
            overrides: overrides.to_vec(),
            params: runner.params().all().clone(),
            stages: lock.stages,
            metrics,
            executed: summary.executed_count(),
            skipped: summary.skipped_count(),
            duration_ms: summary.duration_ms,
        })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.ws.exps_dir().join(format!("{}.json", id.simple()))
    }

    fn save_record(&self, record: &RunRecord) -> Result<()> {
        std::fs::create_dir_all(self.ws.exps_dir())?;
        let text = serde_json::to_string_pretty(record)?;
        std::fs::write(self.record_path(&record.id), text)?;
        Ok(())
    }
}

fn read_optional(path: &std::path::Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn restore_optional(path: &std::path::Path, prior: Option<&str>) -> Result<()> {
    match prior {
        Some(text) => std::fs::write(path, text)?,
        None => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}

/// Side-by-side table over records: one row per experiment, columns for
/// every overridden param and every metric seen across the set.
pub fn render_comparison(records: &[RunRecord]) -> String {
    let mut param_cols: Vec<(String, String)> = Vec::new();
    for record in records {
        for spec in &record.overrides {
            if let Some((target, _)) = spec.split_once('=') {
                if let Some((section, key)) = target.split_once('.') {
                    let col = (section.to_string(), key.to_string());
                    if !param_cols.contains(&col) {
                        param_cols.push(col);
                    }
                }
            }
        }
    }
    param_cols.sort();

    let metric_cols: Vec<String> = records
        .iter()
        .flat_map(|r| r.metrics.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut out = String::from("experiment\tcreated");
    for (section, key) in &param_cols {
        out.push_str(&format!("\t{section}.{key}"));
    }
    for metric in &metric_cols {
        out.push_str(&format!("\t{metric}"));
    }
    out.push('\n');

    for record in records {
        out.push_str(&record.label());
        out.push_str(&format!(
            "\t{}",
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        ));
        for (section, key) in &param_cols {
            let value = record
                .params
                .get(section)
                .and_then(|s| s.get(key))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("\t{value}"));
        }
        for metric in &metric_cols {
            let value = record
                .metrics
                .get(metric)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("\t{value}"));
        }
        out.push('\n');
    }
    out
}
