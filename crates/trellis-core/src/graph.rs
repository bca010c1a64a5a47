//! Stage dependency graph, inferred from declared paths.
//!
//! An edge exists from producer to consumer when a consumer dep names a
//! producer output, or a path inside one (directory outputs are matched
//! by prefix). The graph yields a deterministic topological order and the
//! ancestor/descendant closures the runner needs.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, TrellisError};
use crate::pipeline::PipelineDef;

/// Dependency graph over stage names.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stage -> stages whose outputs it consumes.
    upstream: BTreeMap<String, BTreeSet<String>>,
    /// Stage -> stages consuming its outputs.
    downstream: BTreeMap<String, BTreeSet<String>>,
    /// All stages in execution order.
    order: Vec<String>,
}

impl StageGraph {
    /// Build the graph and fail on cycles. A cycle is a configuration
    /// error: the message names the stages along it.
    pub fn build(def: &PipelineDef) -> Result<Self> {
        let mut upstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut downstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for stage in def.stages() {
            upstream.insert(stage.name.clone(), BTreeSet::new());
            downstream.insert(stage.name.clone(), BTreeSet::new());
        }

        for consumer in def.stages() {
            for dep in &consumer.deps {
                for producer in def.stages() {
                    if producer.tracked_outputs().any(|out| paths_overlap(out, dep)) {
                        if let Some(set) = upstream.get_mut(&consumer.name) {
                            set.insert(producer.name.clone());
                        }
                        if let Some(set) = downstream.get_mut(&producer.name) {
                            set.insert(consumer.name.clone());
                        }
                    }
                }
            }
        }

        let order = topological_order(def, &upstream)?;
        Ok(Self {
            upstream,
            downstream,
            order,
        })
    }

    /// Stage names in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Direct producers feeding `stage`.
    pub fn direct_upstream(&self, stage: &str) -> impl Iterator<Item = &str> {
        self.upstream.get(stage).into_iter().flatten().map(String::as_str)
    }

    /// All transitive producers of `stage`.
    pub fn ancestors(&self, stage: &str) -> BTreeSet<String> {
        self.closure(stage, &self.upstream)
    }

    /// All transitive consumers of `stage`.
    pub fn descendants(&self, stage: &str) -> BTreeSet<String> {
        self.closure(stage, &self.downstream)
    }

    /// Execution order restricted to `target` and its ancestors.
    pub fn order_for_target(&self, target: &str) -> Vec<String> {
        let mut wanted = self.ancestors(target);
        wanted.insert(target.to_string());
        self.order
            .iter()
            .filter(|name| wanted.contains(*name))
            .cloned()
            .collect()
    }

    fn closure(&self, start: &str, edges: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut frontier = vec![start.to_string()];
        while let Some(name) = frontier.pop() {
            for next in edges.get(&name).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    frontier.push(next.clone());
                }
            }
        }
        seen
    }
}

/// Depth-first topological sort. Stages are visited in file order, so
/// independent stages keep their declared order.
fn topological_order(
    def: &PipelineDef,
    upstream: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    fn visit(
        name: &str,
        upstream: &BTreeMap<String, BTreeSet<String>>,
        visited: &mut BTreeSet<String>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|s| s == name) {
            let mut cycle: Vec<&str> = stack[pos..].iter().map(String::as_str).collect();
            cycle.push(name);
            return Err(TrellisError::CyclicPipeline(cycle.join(" -> ")));
        }

        stack.push(name.to_string());
        for producer in upstream.get(name).into_iter().flatten() {
            visit(producer, upstream, visited, stack, order)?;
        }
        stack.pop();

        visited.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    let mut visited = BTreeSet::new();
    let mut order = Vec::with_capacity(def.stages().len());
    for stage in def.stages() {
        visit(&stage.name, upstream, &mut visited, &mut Vec::new(), &mut order)?;
    }
    Ok(order)
}

/// Whether two normalized paths refer to overlapping filesystem trees.
fn paths_overlap(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('/'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(yaml: &str) -> PipelineDef {
        PipelineDef::parse(yaml).unwrap()
    }

    const DIAMOND: &str = r#"
stages:
  ingest:
    cmd: fetch
    outs: [data/raw]
  featurize:
    cmd: feat
    deps: [data/raw]
    outs: [data/features.npy]
  split:
    cmd: split
    deps: [data/raw]
    outs: [data/split.json]
  train:
    cmd: train
    deps: [data/features.npy, data/split.json]
    outs: [model.bin]
"#;

    #[test]
    fn linear_chain_orders_upstream_first() {
        let def = pipeline(
            "stages:\n  b:\n    cmd: x\n    deps: [a.out]\n    outs: [b.out]\n  a:\n    cmd: x\n    outs: [a.out]\n",
        );
        let graph = StageGraph::build(&def).unwrap();
        assert_eq!(graph.order(), ["a", "b"]);
    }

    #[test]
    fn diamond_order_is_deterministic() {
        let graph = StageGraph::build(&pipeline(DIAMOND)).unwrap();
        assert_eq!(graph.order(), ["ingest", "featurize", "split", "train"]);
    }

    #[test]
    fn dep_inside_directory_output_creates_edge() {
        let def = pipeline(
            "stages:\n  prep:\n    cmd: x\n    outs: [data/prepared]\n  train:\n    cmd: x\n    deps: [data/prepared/train.csv]\n",
        );
        let graph = StageGraph::build(&def).unwrap();
        assert_eq!(graph.order(), ["prep", "train"]);
        assert_eq!(graph.ancestors("train"), BTreeSet::from(["prep".to_string()]));
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let def = pipeline(
            "stages:\n  a:\n    cmd: x\n    deps: [b.out]\n    outs: [a.out]\n  b:\n    cmd: x\n    deps: [a.out]\n    outs: [b.out]\n",
        );
        let err = StageGraph::build(&def).unwrap_err();
        match err {
            TrellisError::CyclicPipeline(path) => {
                assert!(path.contains(" -> "), "path was {path}");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn stage_consuming_its_own_output_is_a_cycle() {
        let def = pipeline("stages:\n  s:\n    cmd: x\n    deps: [out.bin]\n    outs: [out.bin]\n");
        assert!(matches!(
            StageGraph::build(&def),
            Err(TrellisError::CyclicPipeline(_))
        ));
    }

    #[test]
    fn closures_cover_transitive_stages() {
        let graph = StageGraph::build(&pipeline(DIAMOND)).unwrap();
        let ancestors = graph.ancestors("train");
        assert_eq!(
            ancestors,
            ["ingest", "featurize", "split"]
                .map(String::from)
                .into_iter()
                .collect()
        );
        let descendants = graph.descendants("ingest");
        assert_eq!(
            descendants,
            ["featurize", "split", "train"]
                .map(String::from)
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn order_for_target_excludes_unrelated_stages() {
        let graph = StageGraph::build(&pipeline(DIAMOND)).unwrap();
        assert_eq!(graph.order_for_target("featurize"), ["ingest", "featurize"]);
        assert_eq!(
            graph.order_for_target("train"),
            ["ingest", "featurize", "split", "train"]
        );
    }
}
