//!
//! Literal operands and constant-construction calls.
//!
//! Neither produces operator nodes: literals become single element constants, and
//! `ones`/`zeros`/`full`/`arange` are evaluated on the spot and interned as the resulting
//! tensor. Interning dedups by value, so repeated literals share one node.
//!
use tracing::debug;

use super::{LoweringContext, OpKind};
use crate::{
  error::{LowerError, Result},
  ir::{NodeId, TargetGraph},
  source::{Operand, SourceNode},
  tensor::{DType, Tensor},
};

/// Constant node of a literal number operand. None for anything that is not a number.
pub fn intern_literal(
  cx: &mut LoweringContext,
  graph: &mut TargetGraph,
  literal: &Operand,
) -> Option<NodeId> {
  let (name, value) = match literal {
    Operand::Int(x) => (x.to_string(), *x as f64),
    Operand::Float(x) => (format!("{:?}", x), *x),
    _ => return None,
  };
  Some(cx.intern_constant(graph, &name, Tensor::scalar(value)))
}

/// Evaluates a constant construction from its literal operands.
pub fn construct(node: &SourceNode, kind: OpKind) -> Result<Tensor> {
  let op = kind.name();
  let invalid = |reason: String| LowerError::invalid(&node.name, op, reason);
  let dtype = node
    .primary_meta()
    .map(|m| m.dtype)
    .unwrap_or(DType::Float32);

  let size = |from: usize| -> Result<Vec<usize>> {
    let dims = match node.args.get(from..).unwrap_or_default() {
      [] => node.kwargs.get("size").and_then(Operand::as_int_list),
      [single @ Operand::List(_)] => single.as_int_list(),
      rest => rest.iter().map(Operand::as_int).collect(),
    }
    .ok_or_else(|| invalid("size is not a list of ints".to_string()))?;
    dims
      .iter()
      .map(|d| usize::try_from(*d).ok())
      .collect::<Option<Vec<_>>>()
      .ok_or_else(|| invalid(format!("negative size {:?}", dims)))
  };

  let tensor = match kind {
    OpKind::Ones => Tensor::ones(size(0)?, dtype),
    OpKind::Zeros => Tensor::zeros(size(0)?, dtype),
    OpKind::Full => {
      let fill = node
        .arg_or_kwarg(1, "fill_value")
        .and_then(Operand::as_float)
        .ok_or_else(|| invalid("fill value is not a number".to_string()))?;
      let shape = match node.args.first() {
        Some(dims) => dims.as_int_list(),
        None => node.kwargs.get("size").and_then(Operand::as_int_list),
      }
      .ok_or_else(|| invalid("size is not a list of ints".to_string()))?
      .into_iter()
      .map(|d| usize::try_from(d).ok())
      .collect::<Option<Vec<_>>>()
      .ok_or_else(|| invalid("negative size".to_string()))?;
      Tensor::full(shape, fill, dtype)
    }
    OpKind::Arange => {
      let number = |i: usize, name: &str| node.arg_or_kwarg(i, name).and_then(Operand::as_float);
      let (start, end, step) = match node.args.len() {
        0 => (
          node.kwargs.get("start").and_then(Operand::as_float).unwrap_or(0.0),
          node.kwargs.get("end").and_then(Operand::as_float),
          node.kwargs.get("step").and_then(Operand::as_float).unwrap_or(1.0),
        ),
        1 => (0.0, number(0, "end"), number(1, "step").unwrap_or(1.0)),
        _ => (
          number(0, "start").unwrap_or(0.0),
          number(1, "end"),
          number(2, "step").unwrap_or(1.0),
        ),
      };
      let end = end.ok_or_else(|| invalid("arange needs a numeric end".to_string()))?;
      Tensor::arange(start, end, step, dtype)
        .ok_or_else(|| invalid(format!("arange step {} is not usable", step)))?
    }
    _ => return Err(invalid(format!("`{}` does not construct a constant", op))),
  };
  debug!("{}: evaluated {} into {:?}", node.name, op, tensor.shape);
  Ok(tensor.promote_scalar().to_float())
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::source::{NodeKind, TensorMeta, TracedGraph};

  fn call(target: &str, args: Vec<Operand>, meta: TensorMeta) -> SourceNode {
    let mut g = TracedGraph::new();
    g.call("c", target, args, meta);
    g.nodes()[0].clone()
  }

  #[test]
  fn test_literals_share_a_constant() {
    let mut g = TargetGraph::new();
    let mut cx = LoweringContext::new(0);
    let a = intern_literal(&mut cx, &mut g, &Operand::Float(1.0)).unwrap();
    let b = intern_literal(&mut cx, &mut g, &Operand::Float(1.0)).unwrap();
    let c = intern_literal(&mut cx, &mut g, &Operand::Int(1)).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(g.node(a).unwrap().name, "1.0_0");
    assert_eq!(g.node(a).unwrap().shape, vec![1]);
    assert_eq!(intern_literal(&mut cx, &mut g, &Operand::node("x")), None);
    assert_eq!(g.node_count(), 1);
  }

  #[test]
  fn test_ones_and_zeros() {
    let n = call("aten.ones.default", vec![Operand::ints(&[2, 3])], TensorMeta::f32(&[2, 3]));
    let t = construct(&n, OpKind::Ones).unwrap();
    assert_eq!(t.shape, vec![2, 3]);
    assert!(t.data.iter().all(|x| *x == 1.0));

    let n = call("aten.zeros.default", vec![Operand::ints(&[])], TensorMeta::f32(&[]));
    assert_eq!(construct(&n, OpKind::Zeros).unwrap().shape, vec![1]);
  }

  #[test]
  fn test_arange_is_float() {
    let n = call(
      "aten.arange.start",
      vec![Operand::Int(2), Operand::Int(5)],
      TensorMeta::new(&[3], DType::Int64),
    );
    let t = construct(&n, OpKind::Arange).unwrap();
    assert_eq!(t.data, vec![2.0, 3.0, 4.0]);
    assert_eq!(t.dtype, DType::Float32);

    let mut n = SourceNode::new("c", NodeKind::CallFunction);
    n.kwargs = BTreeMap::from([("end".to_string(), Operand::Int(4))]);
    assert_eq!(construct(&n, OpKind::Arange).unwrap().numel(), 4);
  }

  #[test]
  fn test_full() {
    let n = call(
      "aten.full.default",
      vec![Operand::ints(&[2]), Operand::Float(0.5)],
      TensorMeta::f32(&[2]),
    );
    assert_eq!(construct(&n, OpKind::Full).unwrap().data, vec![0.5, 0.5]);
  }

  #[test]
  fn test_bad_construction() {
    let n = call("aten.ones.default", vec![Operand::ints(&[-2])], TensorMeta::f32(&[2]));
    assert!(matches!(
      construct(&n, OpKind::Ones),
      Err(LowerError::InvalidArguments { .. })
    ));
    let n = call("aten.tanh.default", vec![], TensorMeta::f32(&[2]));
    assert!(construct(&n, OpKind::Tanh).is_err());
  }
}
