use std::{error::Error, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod error;
pub mod ir;
pub mod lowering;
pub mod oracle;
pub mod source;
pub mod subcommands;
pub mod tensor;
pub mod utils;

use error::Result;
use ir::{export::IrDump, TargetGraph};
use lowering::{LoweredModule, ModelParameters};
use oracle::RecordedMetadata;
use source::{NodeKind, TracedGraph};
use tensor::Tensor;

#[derive(Debug, Clone, Default)]
pub struct LowerConfig {
  /// Subgraph index every created node and edge is tagged with
  pub subgraph: usize,
  /// Directory to save the IR, Graphviz and GraphML renderings into
  pub artifacts: Option<PathBuf>,
  /// Seed for sample activations of bundles that carry none
  pub seed: u64,
}

/// A captured trace, as handed over by the tracing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceBundle {
  pub graph: TracedGraph,
  #[serde(default)]
  pub parameters: ModelParameters,
  /// Sample inputs in activation placeholder order
  #[serde(default)]
  pub activations: Option<Vec<Tensor>>,
}

impl TraceBundle {
  /// Random activations shaped like the activation placeholders.
  pub fn sample_activations(&self, seed: u64) -> Result<Vec<Tensor>> {
    self
      .graph
      .nodes()
      .iter()
      .filter(|n| n.kind == NodeKind::Placeholder)
      .skip(self.parameters.named.len())
      .enumerate()
      .map(|(i, n)| {
        let meta = n.primary_meta()?;
        let shape = meta.concrete_shape(&n.name)?;
        Ok(Tensor::random(shape, meta.dtype, seed.wrapping_add(i as u64)))
      })
      .collect()
  }
}

#[derive(Debug, Clone)]
pub struct Compiled {
  pub graph: TargetGraph,
  pub module: LoweredModule,
}

impl Compiled {
  pub fn dump(&self) -> IrDump {
    IrDump::new(&self.graph)
  }

  pub fn save_artifacts(&self, dir: &std::path::Path) -> std::result::Result<(), Box<dyn Error>> {
    std::fs::create_dir_all(dir)?;
    utils::serialize_to_file(&dir.join("ir.json"), &self.dump())?;
    ir::export::save_graphviz(&dir.join("graph.dot"), &self.graph)?;
    ir::export::save_graphml(&dir.join("graph.graphml"), &self.graph)?;
    info!("artifacts saved to {}", dir.display());
    Ok(())
  }
}

/// Lowers one trace bundle into a fresh target graph.
#[tracing::instrument(level = "info", skip_all, fields(subgraph = config.subgraph))]
pub fn compile(bundle: TraceBundle, config: &LowerConfig) -> Result<Compiled> {
  let activations = match &bundle.activations {
    Some(xs) => xs.clone(),
    None => bundle.sample_activations(config.seed)?,
  };
  let TraceBundle {
    mut graph,
    parameters,
    ..
  } = bundle;
  let mut target = TargetGraph::new();
  let module = lowering::lower_module(
    &mut target,
    &mut graph,
    &parameters,
    &activations,
    &RecordedMetadata,
    config.subgraph,
  )?;
  info!(
    "{} nodes, {} edges",
    target.node_count(),
    target.edge_count()
  );
  Ok(Compiled {
    graph: target,
    module,
  })
}

/// Compiles and saves the artifacts if configured to.
pub fn compile_and_save(
  bundle: TraceBundle,
  config: &LowerConfig,
) -> std::result::Result<Compiled, Box<dyn Error>> {
  let compiled = compile(bundle, config)?;
  if let Some(dir) = &config.artifacts {
    compiled.save_artifacts(dir)?;
  }
  Ok(compiled)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    lowering::Parameter,
    source::{Operand, TensorMeta},
    tensor::DType,
  };

  fn bundle() -> TraceBundle {
    let mut g = TracedGraph::new();
    let w = g.placeholder("p_w", TensorMeta::f32(&[4, 4]));
    let x = g.placeholder("x", TensorMeta::f32(&[1, 4]));
    let y = g.call("mm", "aten.mm.default", vec![x, w], TensorMeta::f32(&[1, 4]));
    let z = g.call("relu", "aten.relu.default", vec![y], TensorMeta::f32(&[1, 4]));
    g.output(vec![z]);
    TraceBundle {
      graph: g,
      parameters: ModelParameters::new(vec![Parameter {
        name: "w".to_string(),
        tensor: Tensor::ones(vec![4, 4], DType::Float32),
        requires_grad: false,
      }]),
      activations: None,
    }
  }

  #[test]
  fn test_compile_with_random_activations() {
    let b = bundle();
    let acts = b.sample_activations(3).unwrap();
    assert_eq!(acts.len(), 1);
    assert_eq!(acts[0].shape, vec![1, 4]);

    let config = LowerConfig {
      seed: 3,
      ..Default::default()
    };
    let c = compile(b, &config).unwrap();
    assert_eq!(c.module.inputs.len(), 1);
    assert_eq!(c.module.eval_cache.get(&c.module.inputs[0]), Some(&acts[0]));
    assert_eq!(c.dump().nodes.len(), 5);
  }

  #[test]
  fn test_bundle_json() {
    let b = bundle();
    let s = serde_json::to_string(&b).unwrap();
    let back: TraceBundle = serde_json::from_str(&s).unwrap();
    assert_eq!(back, b);
    assert_eq!(back.graph.node("mm").unwrap().args[0], Operand::node("x"));
  }

  #[test]
  fn test_artifacts() {
    let dir = std::env::temp_dir().join(format!("tracelower-artifacts-{}", std::process::id()));
    let config = LowerConfig {
      artifacts: Some(dir.clone()),
      ..Default::default()
    };
    compile_and_save(bundle(), &config).unwrap();
    for f in ["ir.json", "graph.dot", "graph.graphml"] {
      assert!(dir.join(f).exists(), "{}", f);
    }
    std::fs::remove_dir_all(dir).unwrap();
  }
}
