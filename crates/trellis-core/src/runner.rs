//! The pipeline runner: staleness decisions and stage execution.
//!
//! `repro` walks the graph in topological order. A stage is skipped only
//! when its recorded fingerprints all still hold and none of its upstream
//! stages re-executed in this invocation. Everything else re-runs. The
//! first failing stage halts the run; stages that completed before it
//! keep their lock records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use tokio::process::Command;
use uuid::Uuid;

use crate::cache::fs::FsCacheStore;
use crate::cache::store_path;
use crate::error::{Result, TrellisError};
use crate::fingerprint::hash_path;
use crate::graph::StageGraph;
use crate::obs;
use crate::params::{ParamStore, SectionValues};
use crate::pipeline::{PipelineDef, Stage};
use crate::state::{LockFile, PathRecord, StageRecord};
use crate::workspace::Workspace;

/// Why a stage cannot be skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum StaleReason {
    /// No record for this stage in the lock file.
    NeverRun,
    /// The recorded command differs from the definition.
    CmdChanged,
    /// A declared dep changed, appeared or disappeared since the record.
    DepChanged(String),
    /// A referenced param value changed since the record.
    ParamChanged { section: String, key: String },
    /// A declared output is missing from the workspace.
    OutputMissing(String),
    /// The declared output list no longer matches the record.
    OutsChanged(String),
    /// An upstream stage is stale (or just re-ran), so this one must too.
    UpstreamStale(String),
    /// `--force` was given.
    Forced,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NeverRun => write!(f, "never run"),
            StaleReason::CmdChanged => write!(f, "cmd changed"),
            StaleReason::DepChanged(path) => write!(f, "dep {path} changed"),
            StaleReason::ParamChanged { section, key } => {
                write!(f, "param {section}.{key} changed")
            }
            StaleReason::OutputMissing(path) => write!(f, "output {path} missing"),
            StaleReason::OutsChanged(path) => write!(f, "declared outs changed: {path}"),
            StaleReason::UpstreamStale(stage) => write!(f, "upstream {stage} stale"),
            StaleReason::Forced => write!(f, "forced"),
        }
    }
}

/// Freshness of one stage as reported by `status`.
#[derive(Debug, Clone)]
pub struct StageStatus {
    pub stage: String,
    pub reasons: Vec<StaleReason>,
}

impl StageStatus {
    pub fn is_fresh(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// What happened to one stage during a repro.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Skipped,
    Executed { duration_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StageOutcome,
    pub reasons: Vec<StaleReason>,
}

/// Result of a complete repro invocation.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub reports: Vec<StageReport>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn executed_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Executed { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.reports.len() - self.executed_count()
    }
}

/// Options for one repro invocation.
#[derive(Debug, Clone, Default)]
pub struct ReproOptions {
    /// Run only this stage and its ancestors.
    pub target: Option<String>,
    /// Treat every selected stage as stale.
    pub force: bool,
}

/// A validated pipeline bound to a workspace and a parameter store.
#[derive(Debug)]
pub struct Runner<'a> {
    ws: &'a Workspace,
    pipeline: PipelineDef,
    graph: StageGraph,
    params: ParamStore,
}

impl<'a> Runner<'a> {
    /// Load `trellis.yaml` and `params.yaml` from the workspace and
    /// validate them. Configuration errors surface here, before any
    /// stage has run.
    pub fn load(ws: &'a Workspace) -> Result<Self> {
        let pipeline = PipelineDef::load(&ws.pipeline_path())?;
        let params = ParamStore::load(&ws.params_path())?;
        Self::with_params(ws, pipeline, params)
    }

    /// Bind an explicit parameter store. Experiments use this to run with
    /// overridden values without touching `params.yaml`.
    pub fn with_params(ws: &'a Workspace, pipeline: PipelineDef, params: ParamStore) -> Result<Self> {
        pipeline.validate(&params)?;
        let graph = StageGraph::build(&pipeline)?;
        Ok(Self {
            ws,
            pipeline,
            graph,
            params,
        })
    }

    pub fn pipeline(&self) -> &PipelineDef {
        &self.pipeline
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Execute stale stages in topological order. Takes the workspace run
    /// lock for the duration.
    pub async fn repro(&self, opts: &ReproOptions) -> Result<RunSummary> {
        let _guard = self.ws.lock_run()?;
        self.repro_locked(opts).await
    }

    /// Same as [`Runner::repro`], for callers that already hold the run
    /// lock (experiments hold it across snapshot, run and restore).
    pub(crate) async fn repro_locked(&self, opts: &ReproOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let _span = obs::RunSpan::enter(&run_id);
        let start = Instant::now();

        let order = self.selected_order(opts.target.as_deref())?;
        let mut lock = LockFile::load(&self.ws.lock_path())?;
        let cache = self.ws.cache()?;
        obs::emit_run_started(&run_id, order.len());

        let mut reports: Vec<StageReport> = Vec::with_capacity(order.len());
        let mut reran: BTreeSet<String> = BTreeSet::new();

        for name in &order {
            let stage = self.pipeline.require_stage(name)?;

            let mut reasons = if opts.force {
                vec![StaleReason::Forced]
            } else {
                self.stale_reasons(stage, &lock)?
            };
            if !opts.force {
                for up in self.graph.direct_upstream(name) {
                    if reran.contains(up) {
                        reasons.push(StaleReason::UpstreamStale(up.to_string()));
                    }
                }
            }

            if reasons.is_empty() {
                obs::emit_stage_skipped(name);
                reports.push(StageReport {
                    stage: name.clone(),
                    outcome: StageOutcome::Skipped,
                    reasons,
                });
                continue;
            }

            // Deps must exist by the time the stage runs; upstream stages
            // have already produced theirs at this point.
            for dep in &stage.deps {
                if !self.ws.root().join(dep).exists() {
                    return Err(TrellisError::MissingDependency {
                        stage: name.clone(),
                        path: dep.clone(),
                    });
                }
            }

            let reason_text = reasons
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            obs::emit_stage_started(name, &reason_text);

            let stage_start = Instant::now();
            let status = Command::new("sh")
                .arg("-c")
                .arg(&stage.cmd)
                .current_dir(self.ws.root())
                .status()
                .await?;
            let duration_ms = stage_start.elapsed().as_millis() as u64;

            if !status.success() {
                let code = status.code().unwrap_or(-1);
                obs::emit_stage_failed(name, code);
                return Err(TrellisError::StageFailed {
                    stage: name.clone(),
                    code,
                });
            }

            let record = self.capture_record(stage, &cache)?;
            lock.record(name, record);
            lock.save(&self.ws.lock_path())?;

            obs::emit_stage_completed(name, duration_ms);
            reran.insert(name.clone());
            reports.push(StageReport {
                stage: name.clone(),
                outcome: StageOutcome::Executed { duration_ms },
                reasons,
            });
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = RunSummary {
            run_id: run_id.clone(),
            reports,
            duration_ms,
        };
        obs::emit_run_finished(
            &run_id,
            summary.executed_count(),
            summary.skipped_count(),
            duration_ms,
        );
        Ok(summary)
    }

    /// Dry evaluation of the repro decisions: which stages would run and
    /// why. Reads the workspace, writes nothing.
    pub fn status(&self, target: Option<&str>) -> Result<Vec<StageStatus>> {
        let lock = LockFile::load(&self.ws.lock_path())?;
        let order = self.selected_order(target)?;

        let mut stale: BTreeSet<String> = BTreeSet::new();
        let mut statuses = Vec::with_capacity(order.len());
        for name in &order {
            let stage = self.pipeline.require_stage(name)?;
            let mut reasons = self.stale_reasons(stage, &lock)?;
            for up in self.graph.direct_upstream(name) {
                if stale.contains(up) {
                    reasons.push(StaleReason::UpstreamStale(up.to_string()));
                }
            }
            if !reasons.is_empty() {
                stale.insert(name.clone());
            }
            statuses.push(StageStatus {
                stage: name.clone(),
                reasons,
            });
        }
        Ok(statuses)
    }

    fn selected_order(&self, target: Option<&str>) -> Result<Vec<String>> {
        match target {
            Some(name) => {
                self.pipeline.require_stage(name)?;
                Ok(self.graph.order_for_target(name))
            }
            None => Ok(self.graph.order().to_vec()),
        }
    }

    /// Compare a stage against its lock record. Empty result = skippable.
    fn stale_reasons(&self, stage: &Stage, lock: &LockFile) -> Result<Vec<StaleReason>> {
        let record = match lock.stage(&stage.name) {
            Some(record) => record,
            None => return Ok(vec![StaleReason::NeverRun]),
        };

        let mut reasons = Vec::new();

        if record.cmd != stage.cmd {
            reasons.push(StaleReason::CmdChanged);
        }

        let current = self.params.stage_view(&stage.params)?;
        param_diffs(&record.params, &current, &mut reasons);

        for dep in &stage.deps {
            let now = hash_path(&self.ws.root().join(dep))?;
            let recorded = record.deps.iter().find(|r| r.path == *dep);
            match (now, recorded) {
                (Some(pd), Some(rec)) if pd.digest.to_hex() == rec.digest => {}
                _ => reasons.push(StaleReason::DepChanged(dep.clone())),
            }
        }
        for rec in &record.deps {
            if !stage.deps.contains(&rec.path) {
                reasons.push(StaleReason::DepChanged(rec.path.clone()));
            }
        }

        let declared: BTreeSet<&str> = stage.tracked_outputs().collect();
        for out in &declared {
            if !self.ws.root().join(out).exists() {
                reasons.push(StaleReason::OutputMissing(out.to_string()));
            }
            if !record.outs.iter().any(|r| r.path == *out) {
                reasons.push(StaleReason::OutsChanged(out.to_string()));
            }
        }
        for rec in &record.outs {
            if !declared.contains(rec.path.as_str()) {
                reasons.push(StaleReason::OutsChanged(rec.path.clone()));
            }
        }

        Ok(reasons)
    }

    /// After a successful execution: verify declared outputs exist, store
    /// them in the cache, and build the lock record from what was seen.
    fn capture_record(&self, stage: &Stage, cache: &FsCacheStore) -> Result<StageRecord> {
        let mut outs = Vec::new();
        for out in stage.tracked_outputs() {
            let path = self.ws.root().join(out);
            if !path.exists() {
                return Err(TrellisError::MissingOutput {
                    stage: stage.name.clone(),
                    path: out.to_string(),
                });
            }
            let pd = store_path(cache, &path)?;
            outs.push(PathRecord {
                path: out.to_string(),
                digest: pd.digest.to_hex(),
                is_dir: pd.is_dir,
            });
        }

        let mut deps = Vec::new();
        for dep in &stage.deps {
            let pd = hash_path(&self.ws.root().join(dep))?.ok_or_else(|| {
                TrellisError::MissingDependency {
                    stage: stage.name.clone(),
                    path: dep.clone(),
                }
            })?;
            deps.push(PathRecord {
                path: dep.clone(),
                digest: pd.digest.to_hex(),
                is_dir: pd.is_dir,
            });
        }

        Ok(StageRecord {
            cmd: stage.cmd.clone(),
            deps,
            params: self.params.stage_view(&stage.params)?,
            outs,
        })
    }
}

/// Collect per-key differences between recorded and current param values.
fn param_diffs(recorded: &SectionValues, current: &SectionValues, reasons: &mut Vec<StaleReason>) {
    let empty = BTreeMap::new();
    let sections: BTreeSet<&String> = recorded.keys().chain(current.keys()).collect();
    for section in sections {
        let rec = recorded.get(section).unwrap_or(&empty);
        let cur = current.get(section).unwrap_or(&empty);
        let keys: BTreeSet<&String> = rec.keys().chain(cur.keys()).collect();
        for key in keys {
            if rec.get(key) != cur.get(key) {
                reasons.push(StaleReason::ParamChanged {
                    section: section.clone(),
                    key: key.clone(),
                });
            }
        }
    }
}
