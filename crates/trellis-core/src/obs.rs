//! Structured lifecycle events for runs, stages and transfers.
//!
//! Every event carries an `event` field with a stable dotted name, so log
//! pipelines can filter on `stage.failed` or `sync.object_failed` without
//! parsing message text. Events emit at `info!`, failures at `warn!`.

use tracing::{info, warn};

/// RAII guard tagging everything inside one run with its `run_id`.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("trellis.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_run_started(run_id: &str, stage_count: usize) {
    info!(event = "run.started", run_id = %run_id, stage_count = stage_count);
}

pub fn emit_run_finished(run_id: &str, executed: usize, skipped: usize, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        executed = executed,
        skipped = skipped,
        duration_ms = duration_ms,
    );
}

pub fn emit_stage_started(stage: &str, reasons: &str) {
    info!(event = "stage.started", stage = %stage, reasons = %reasons);
}

pub fn emit_stage_skipped(stage: &str) {
    info!(event = "stage.skipped", stage = %stage);
}

pub fn emit_stage_completed(stage: &str, duration_ms: u64) {
    info!(event = "stage.completed", stage = %stage, duration_ms = duration_ms);
}

pub fn emit_stage_failed(stage: &str, exit_code: i32) {
    warn!(event = "stage.failed", stage = %stage, exit_code = exit_code);
}

pub fn emit_experiment_captured(exp_id: &str, executed: usize) {
    info!(event = "experiment.captured", exp_id = %exp_id, executed = executed);
}

pub fn emit_experiment_applied(exp_id: &str, outputs: usize) {
    info!(event = "experiment.applied", exp_id = %exp_id, outputs = outputs);
}

pub fn emit_sync_started(direction: &str, remote: &str, objects: usize) {
    info!(event = "sync.started", direction = %direction, remote = %remote, objects = objects);
}

pub fn emit_sync_finished(direction: &str, transferred: usize, already_present: usize) {
    info!(
        event = "sync.finished",
        direction = %direction,
        transferred = transferred,
        already_present = already_present,
    );
}

pub fn emit_sync_object_failed(digest: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sync.object_failed", digest = %digest, error = %error);
}
