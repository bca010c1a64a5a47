//! Markdown run reports.
//!
//! `trellis report` renders the current workspace state (stage freshness,
//! parameters, metrics) as a single Markdown document, suitable for a CI
//! job to post as a PR comment or attach as an artifact.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::metrics::{self, MetricValues};
use crate::params::SectionValues;
use crate::runner::{Runner, StageStatus};
use crate::workspace::Workspace;

/// Snapshot of everything the report renders.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub stages: Vec<StageStatus>,
    pub params: SectionValues,
    pub metrics: MetricValues,
}

impl RunReport {
    /// Gather the report inputs from the workspace. Metrics files that do
    /// not exist yet are simply absent, so a partially-run pipeline still
    /// reports.
    pub fn collect(ws: &Workspace, runner: &Runner) -> crate::error::Result<Self> {
        Ok(Self {
            generated_at: Utc::now(),
            stages: runner.status(None)?,
            params: runner.params().all().clone(),
            metrics: metrics::collect_existing(ws.root(), runner.pipeline())?,
        })
    }

    /// Render the report as Markdown.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Trellis Run Report\n\n");
        out.push_str(&format!(
            "_generated {}_\n\n",
            self.generated_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));

        out.push_str("## Stages\n\n| stage | state |\n|---|---|\n");
        for status in &self.stages {
            let state = if status.is_fresh() {
                "fresh".to_string()
            } else {
                let reasons: Vec<String> =
                    status.reasons.iter().map(ToString::to_string).collect();
                format!("stale ({})", reasons.join("; "))
            };
            out.push_str(&format!("| {} | {} |\n", status.stage, state));
        }
        out.push('\n');

        out.push_str("## Parameters\n\n| param | value |\n|---|---|\n");
        for (section, values) in &self.params {
            for (key, value) in values {
                out.push_str(&format!("| {section}.{key} | `{value}` |\n"));
            }
        }
        out.push('\n');

        out.push_str("## Metrics\n\n");
        if self.metrics.is_empty() {
            out.push_str("_no metrics recorded_\n");
        } else {
            out.push_str("| metric | value |\n|---|---|\n");
            for (name, value) in &self.metrics {
                out.push_str(&format!("| {name} | {value} |\n"));
            }
        }
        out
    }

    /// Write the Markdown report to `path`.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.render_markdown())
            .with_context(|| format!("write {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StaleReason;
    use std::collections::BTreeMap;

    #[test]
    fn markdown_render_is_stable() {
        let mut params = SectionValues::new();
        params.insert(
            "train".to_string(),
            BTreeMap::from([("epochs".to_string(), serde_json::json!(10))]),
        );

        let report = RunReport {
            generated_at: DateTime::parse_from_rfc3339("2026-02-01T12:00:00Z")
                .expect("parse RFC3339")
                .with_timezone(&Utc),
            stages: vec![
                StageStatus {
                    stage: "prepare".to_string(),
                    reasons: vec![],
                },
                StageStatus {
                    stage: "train".to_string(),
                    reasons: vec![StaleReason::ParamChanged {
                        section: "train".to_string(),
                        key: "epochs".to_string(),
                    }],
                },
            ],
            params,
            metrics: MetricValues::from([("accuracy".to_string(), 0.91)]),
        };

        let actual = report.render_markdown();
        let expected = "# Trellis Run Report\n\n_generated 2026-02-01T12:00:00Z_\n\n## Stages\n\n| stage | state |\n|---|---|\n| prepare | fresh |\n| train | stale (param train.epochs changed) |\n\n## Parameters\n\n| param | value |\n|---|---|\n| train.epochs | `10` |\n\n## Metrics\n\n| metric | value |\n|---|---|\n| accuracy | 0.91 |\n";
        assert_eq!(actual, expected);
    }

    #[test]
    fn empty_metrics_render_placeholder() {
        let report = RunReport {
            generated_at: Utc::now(),
            stages: vec![],
            params: SectionValues::new(),
            metrics: MetricValues::new(),
        };
        assert!(report.render_markdown().contains("_no metrics recorded_"));
    }
}
