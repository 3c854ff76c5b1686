use itertools::Itertools;
use tracing::{debug, instrument};

use crate::{
  error::{LowerError, Result},
  source::{NodeKind, NodeValue, TracedGraph},
  tensor::Tensor,
};

/// Static shape propagation over a trace.
///
/// After `propagate` every placeholder and call node carries shape, dtype and
/// requires-grad metadata; nodes whose value the oracle could compute also carry it.
/// Lowering calls this exactly once, before the first node is visited.
pub trait ShapeOracle {
  /// `sample_inputs` are given in placeholder order, parameters first.
  fn propagate(&self, graph: &mut TracedGraph, sample_inputs: &[Tensor]) -> Result<()>;
}

/// Oracle for traces whose metadata was recorded when they were captured.
///
/// It does not derive anything, it checks that the recorded metadata is present and agrees
/// with the sample inputs, and attaches the sample inputs as placeholder values.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordedMetadata;

impl ShapeOracle for RecordedMetadata {
  #[instrument(level = "debug", name = "propagate", skip_all, fields(nodes = graph.len()))]
  fn propagate(&self, graph: &mut TracedGraph, sample_inputs: &[Tensor]) -> Result<()> {
    for node in graph.nodes() {
      if matches!(node.kind, NodeKind::Placeholder | NodeKind::CallFunction) {
        node.primary_meta()?;
      }
    }

    let placeholders = graph
      .nodes_mut()
      .iter_mut()
      .filter(|n| n.kind == NodeKind::Placeholder)
      .collect_vec();
    for (node, sample) in placeholders.into_iter().zip(sample_inputs) {
      let meta = node.primary_meta()?;
      if meta.concrete_shape(&node.name)? != sample.shape {
        return Err(LowerError::invalid(
          &node.name,
          "placeholder",
          format!(
            "traced shape {:?} differs from sample input shape {:?}",
            meta.shape, sample.shape
          ),
        ));
      }
      if node.value.is_none() {
        debug!("{}: attaching sample input", node.name);
        node.value = Some(NodeValue::Tensor(sample.clone()));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    source::{SourceNode, TensorMeta},
    tensor::DType,
  };

  #[test]
  fn test_attaches_sample_values() {
    let mut g = TracedGraph::new();
    g.placeholder("w", TensorMeta::f32(&[2]));
    g.placeholder("x", TensorMeta::f32(&[3]));
    let samples = vec![
      Tensor::ones(vec![2], DType::Float32),
      Tensor::zeros(vec![3], DType::Float32),
    ];
    RecordedMetadata.propagate(&mut g, &samples).unwrap();
    assert_eq!(
      g.node("x").unwrap().value,
      Some(NodeValue::Tensor(Tensor::zeros(vec![3], DType::Float32)))
    );
  }

  #[test]
  fn test_missing_call_metadata() {
    let mut g = TracedGraph::new();
    let x = g.placeholder("x", TensorMeta::f32(&[3]));
    let mut n = SourceNode::new("t", NodeKind::CallFunction);
    n.target = Some("tanh".to_string());
    n.args = vec![x];
    g.push(n);
    assert_eq!(
      RecordedMetadata.propagate(&mut g, &[]),
      Err(LowerError::MissingMetadata {
        node: "t".to_string()
      })
    );
  }

  #[test]
  fn test_sample_shape_mismatch() {
    let mut g = TracedGraph::new();
    g.placeholder("x", TensorMeta::f32(&[3]));
    let samples = vec![Tensor::ones(vec![4], DType::Float32)];
    let r = RecordedMetadata.propagate(&mut g, &samples);
    assert!(matches!(r, Err(LowerError::InvalidArguments { .. })));
  }
}
