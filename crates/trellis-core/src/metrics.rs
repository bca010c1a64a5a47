//! Scalar metrics artifacts.
//!
//! Stages declare JSON metrics files; nested objects flatten to dotted
//! keys (`eval.accuracy`) and only numeric leaves are collected. Strings
//! and other non-scalar values are ignored rather than rejected, so a
//! metrics file can carry extra context without breaking comparisons.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, TrellisError};
use crate::pipeline::PipelineDef;

/// Flattened metric name -> value.
pub type MetricValues = BTreeMap<String, f64>;

/// Load one metrics file and flatten it.
pub fn load_metrics_file(path: &Path) -> Result<MetricValues> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TrellisError::MetricsNotFound(path.display().to_string())
        } else {
            TrellisError::Io(e)
        }
    })?;

    let doc: Value = serde_json::from_str(&text).map_err(|e| TrellisError::InvalidMetrics {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if !doc.is_object() {
        return Err(TrellisError::InvalidMetrics {
            path: path.display().to_string(),
            reason: "top level must be a JSON object".to_string(),
        });
    }

    let mut values = MetricValues::new();
    flatten("", &doc, &mut values);
    Ok(values)
}

/// Collect metrics from every file the pipeline declares, in stage order.
/// A missing file is an error: the pipeline has to run first.
pub fn collect(root: &Path, pipeline: &PipelineDef) -> Result<MetricValues> {
    let mut values = MetricValues::new();
    for file in pipeline.metrics_files() {
        values.extend(load_metrics_file(&root.join(file))?);
    }
    Ok(values)
}

/// Like [`collect`], but silently skips files that do not exist yet.
/// Reports use this so they can render a partially-run workspace.
pub fn collect_existing(root: &Path, pipeline: &PipelineDef) -> Result<MetricValues> {
    let mut values = MetricValues::new();
    for file in pipeline.metrics_files() {
        match load_metrics_file(&root.join(file)) {
            Ok(found) => values.extend(found),
            Err(TrellisError::MetricsNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(values)
}

fn flatten(prefix: &str, value: &Value, out: &mut MetricValues) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&name, inner, out);
            }
        }
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.insert(prefix.to_string(), f);
            }
        }
        _ => {}
    }
}

/// One metric compared across two runs.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDelta {
    pub name: String,
    pub old: Option<f64>,
    pub new: Option<f64>,
}

impl MetricDelta {
    pub fn delta(&self) -> Option<f64> {
        match (self.old, self.new) {
            (Some(old), Some(new)) => Some(new - old),
            _ => None,
        }
    }
}

/// Compare two metric sets over the union of their names.
pub fn diff(old: &MetricValues, new: &MetricValues) -> Vec<MetricDelta> {
    let names: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    names
        .into_iter()
        .map(|name| MetricDelta {
            name: name.clone(),
            old: old.get(name).copied(),
            new: new.get(name).copied(),
        })
        .collect()
}

/// Plain-text table of metric values.
pub fn render_table(values: &MetricValues) -> String {
    if values.is_empty() {
        return "no metrics recorded\n".to_string();
    }
    let width = values.keys().map(String::len).max().unwrap_or(0);
    let mut out = String::new();
    for (name, value) in values {
        out.push_str(&format!("{name:<width$}  {value}\n"));
    }
    out
}

/// Plain-text table of metric deltas. Absent values render as `-`.
pub fn render_diff_table(deltas: &[MetricDelta]) -> String {
    let mut out = String::from("metric\told\tnew\tdelta\n");
    for d in deltas {
        let fmt = |v: Option<f64>| v.map_or("-".to_string(), |f| f.to_string());
        let delta = d
            .delta()
            .map_or("-".to_string(), |f| format!("{f:+}"));
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            d.name,
            fmt(d.old),
            fmt(d.new),
            delta
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_objects_to_dotted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(
            &path,
            r#"{"accuracy": 0.91, "loss": {"train": 0.2, "val": 0.35}, "model": "mlp"}"#,
        )
        .unwrap();

        let values = load_metrics_file(&path).unwrap();
        assert_eq!(values.get("accuracy"), Some(&0.91));
        assert_eq!(values.get("loss.train"), Some(&0.2));
        assert_eq!(values.get("loss.val"), Some(&0.35));
        // Non-numeric leaves are skipped, not errors.
        assert!(!values.contains_key("model"));
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_metrics_file(&dir.path().join("eval/metrics.json")).unwrap_err();
        assert!(matches!(err, TrellisError::MetricsNotFound(_)));
        assert!(err.to_string().contains("metrics.json"));
    }

    #[test]
    fn malformed_json_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{accuracy: oops").unwrap();
        assert!(matches!(
            load_metrics_file(&path),
            Err(TrellisError::InvalidMetrics { .. })
        ));

        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let err = load_metrics_file(&path).unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn diff_covers_added_removed_changed() {
        let old = MetricValues::from([
            ("accuracy".to_string(), 0.90),
            ("loss".to_string(), 0.30),
        ]);
        let new = MetricValues::from([
            ("accuracy".to_string(), 0.93),
            ("f1".to_string(), 0.88),
        ]);

        let deltas = diff(&old, &new);
        let by_name: BTreeMap<&str, &MetricDelta> =
            deltas.iter().map(|d| (d.name.as_str(), d)).collect();

        let acc = by_name["accuracy"];
        assert!((acc.delta().unwrap() - 0.03).abs() < 1e-9);
        assert_eq!(by_name["loss"].new, None);
        assert_eq!(by_name["f1"].old, None);
        assert_eq!(by_name["f1"].delta(), None);
    }

    #[test]
    fn diff_table_marks_absent_values() {
        let deltas = vec![MetricDelta {
            name: "accuracy".to_string(),
            old: None,
            new: Some(0.9),
        }];
        let table = render_diff_table(&deltas);
        assert!(table.contains("accuracy\t-\t0.9\t-"));
    }
}
