use std::collections::HashMap;

use tracing::debug;

use crate::{
  error::{LowerError, Result},
  ir::{NodeId, OutputRef, TargetGraph},
  tensor::{ConstKey, Tensor},
};

/// Concrete values of target nodes, where known.
pub type EvalCache = HashMap<NodeId, Tensor>;

/// What a source node turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lowered {
  Single(OutputRef),
  /// Tuple producing node; elements are picked by a later getitem.
  Multi(Vec<OutputRef>),
}

impl Lowered {
  /// The tensor behind a non-tuple value. `user` is the node consuming it.
  pub fn single(&self, user: &str, operand: &str) -> Result<OutputRef> {
    match self {
      Lowered::Single(r) => Ok(*r),
      Lowered::Multi(_) => Err(LowerError::invalid(
        user,
        "operand",
        format!("`{}` is a tuple and has to be indexed first", operand),
      )),
    }
  }

  pub fn element(&self, user: &str, index: i64) -> Result<OutputRef> {
    match self {
      Lowered::Multi(rs) => usize::try_from(index)
        .ok()
        .and_then(|i| rs.get(i))
        .copied()
        .ok_or_else(|| LowerError::TupleIndex {
          node: user.to_string(),
          index,
          len: rs.len(),
        }),
      Lowered::Single(_) => Err(LowerError::TupleIndex {
        node: user.to_string(),
        index,
        len: 1,
      }),
    }
  }
}

/// Identity and interning tables of one compilation.
///
/// Created fresh for every lowering invocation and dropped with it, so nothing leaks between
/// independent compilations.
#[derive(Debug, Default)]
pub struct LoweringContext {
  subgraph: usize,
  node_to_id: HashMap<String, Lowered>,
  param_to_id: HashMap<String, NodeId>,
  const_to_id: HashMap<ConstKey, NodeId>,
  id_to_intermed: EvalCache,
}

impl LoweringContext {
  pub fn new(subgraph: usize) -> Self {
    LoweringContext {
      subgraph,
      ..Default::default()
    }
  }

  /// Records what `node` lowered to. A node that is already bound keeps its first binding,
  /// which is returned.
  pub fn bind(&mut self, node: &str, lowered: Lowered) -> Lowered {
    self
      .node_to_id
      .entry(node.to_string())
      .or_insert(lowered)
      .clone()
  }

  pub fn is_lowered(&self, node: &str) -> bool {
    self.node_to_id.contains_key(node)
  }

  /// Looks up an operand of `user`. Fails if the operand was not lowered yet, which means the
  /// trace is not in dependency order.
  pub fn resolve(&self, operand: &str, user: &str) -> Result<&Lowered> {
    self
      .node_to_id
      .get(operand)
      .ok_or_else(|| LowerError::UnresolvedOperand {
        node: user.to_string(),
        operand: operand.to_string(),
      })
  }

  pub fn lowered_count(&self) -> usize {
    self.node_to_id.len()
  }

  /// Constant node holding `value`, created on first sight of the value.
  pub fn intern_constant(&mut self, graph: &mut TargetGraph, name: &str, value: Tensor) -> NodeId {
    let key = value.key();
    if let Some(id) = self.const_to_id.get(&key) {
      return *id;
    }
    let id = graph.create_constant_input(
      &format!("{}_{}", name, self.subgraph),
      value.clone(),
      self.subgraph,
    );
    debug!("{}: new constant {:?}", name, id);
    self.const_to_id.insert(key, id);
    self.id_to_intermed.insert(id, value);
    id
  }

  /// Parameter node called `name`, created on first sight of the name.
  pub fn intern_parameter(
    &mut self,
    graph: &mut TargetGraph,
    name: &str,
    tensor: &Tensor,
    requires_grad: bool,
  ) -> NodeId {
    if let Some(id) = self.param_to_id.get(name) {
      return *id;
    }
    let id = graph.create_parameter_input(
      name,
      tensor.shape.clone(),
      requires_grad,
      tensor.dtype.data_format(),
      self.subgraph,
    );
    self.param_to_id.insert(name.to_string(), id);
    self.id_to_intermed.insert(id, tensor.clone());
    id
  }

  pub fn constant_count(&self) -> usize {
    self.const_to_id.len()
  }

  pub fn parameter_count(&self) -> usize {
    self.param_to_id.len()
  }

  /// Keeps the first value recorded for a node.
  pub fn record_value(&mut self, id: NodeId, value: Tensor) {
    self.id_to_intermed.entry(id).or_insert(value);
  }

  pub fn value(&self, id: NodeId) -> Option<&Tensor> {
    self.id_to_intermed.get(&id)
  }

  pub fn into_eval_cache(self) -> EvalCache {
    self.id_to_intermed
  }
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::tensor::{DType, DataFormat};

  #[test]
  fn test_parameters_dedup_by_name() {
    let mut g = TargetGraph::new();
    let mut cx = LoweringContext::new(0);
    let w = Tensor::ones(vec![4, 2], DType::Float32);
    let a = cx.intern_parameter(&mut g, "fc.weight", &w, true);
    let b = cx.intern_parameter(&mut g, "fc.weight", &Tensor::zeros(vec![1], DType::Float32), false);
    assert_eq!(a, b);
    assert_eq!(g.node_count(), 1);
    assert_eq!(g.node(a).unwrap().shape, vec![4, 2]);
    assert_eq!(cx.value(a), Some(&w));
    let c = cx.intern_parameter(&mut g, "fc.bias", &Tensor::zeros(vec![2], DType::Float32), true);
    assert_ne!(a, c);
    assert_eq!(cx.parameter_count(), 2);
  }

  #[test]
  fn test_resolve_before_lowering() {
    let cx = LoweringContext::new(0);
    assert_eq!(
      cx.resolve("x", "add"),
      Err(LowerError::UnresolvedOperand {
        node: "add".to_string(),
        operand: "x".to_string()
      })
    );
  }

  #[test]
  fn test_bind_keeps_first() {
    let mut g = TargetGraph::new();
    let a = g.create_activation_input("a_0", vec![1], false, DataFormat::Float32, 0);
    let b = g.create_activation_input("b_0", vec![1], false, DataFormat::Float32, 0);
    let mut cx = LoweringContext::new(0);
    cx.bind("x", Lowered::Single(a.into()));
    assert_eq!(cx.bind("x", Lowered::Single(b.into())), Lowered::Single(a.into()));
    assert_eq!(cx.lowered_count(), 1);
  }

  #[test]
  fn test_tuple_elements() {
    let mut g = TargetGraph::new();
    let a = g.create_activation_input("a_0", vec![1], false, DataFormat::Float32, 0);
    let multi = Lowered::Multi(vec![a.into()]);
    assert_eq!(multi.element("gi", 0), Ok(a.into()));
    assert_eq!(
      multi.element("gi", 1),
      Err(LowerError::TupleIndex {
        node: "gi".to_string(),
        index: 1,
        len: 1
      })
    );
    assert!(multi.single("user", "ln").is_err());
  }

  proptest! {
    #[test]
    fn test_constants_dedup_by_value(xs in proptest::collection::vec(-4i32..4, 1..32)) {
      let mut g = TargetGraph::new();
      let mut cx = LoweringContext::new(3);
      let mut ids = HashMap::new();
      for x in xs.iter() {
        let id = cx.intern_constant(&mut g, "c", Tensor::scalar(*x as f64));
        let first = *ids.entry(*x).or_insert(id);
        prop_assert_eq!(first, id);
      }
      prop_assert_eq!(g.node_count(), ids.len());
      prop_assert!(g.node_ids().all(|id| g.node(id).unwrap().subgraph == 3));
    }
  }
}
