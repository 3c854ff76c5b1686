use std::{
  collections::{BTreeMap, HashSet},
  fmt,
};

use itertools::Itertools;
use petgraph::{
  stable_graph::{EdgeIndex, NodeIndex, StableGraph},
  visit::EdgeRef,
  Direction::{Incoming, Outgoing},
};
use tracing::trace;

use super::OpType;
use crate::{
  error::{LowerError, Result},
  tensor::{DataFormat, Tensor},
};

pub type NodeId = NodeIndex;

/// One output of a target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputRef {
  pub node: NodeId,
  pub slot: usize,
}

impl From<NodeId> for OutputRef {
  fn from(node: NodeId) -> Self {
    OutputRef { node, slot: 0 }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetNodeKind {
  ParameterInput { requires_grad: bool },
  ActivationInput { requires_grad: bool },
  ConstantInput { value: Tensor },
  Operator(OpType),
  Output { is_loss: bool },
}

impl TargetNodeKind {
  pub fn tag(&self) -> &'static str {
    match self {
      TargetNodeKind::ParameterInput { .. } => "parameter",
      TargetNodeKind::ActivationInput { .. } => "activation",
      TargetNodeKind::ConstantInput { .. } => "constant",
      TargetNodeKind::Operator(_) => "op",
      TargetNodeKind::Output { .. } => "output",
    }
  }

  pub fn op(&self) -> Option<&OpType> {
    match self {
      TargetNodeKind::Operator(op) => Some(op),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetNode {
  pub name: String,
  pub kind: TargetNodeKind,
  pub shape: Vec<usize>,
  pub format: DataFormat,
  /// Compilation unit the node was created in
  pub subgraph: usize,
}

impl fmt::Display for TargetNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let what = match &self.kind {
      TargetNodeKind::Operator(op) => op.to_string(),
      k => k.tag().to_string(),
    };
    write!(
      f,
      "{} = {} {:?} {} #{}",
      self.name, what, self.shape, self.format, self.subgraph
    )
  }
}

/// Data dependency: output `output_slot` of the source feeds operand `input_slot` of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEdge {
  pub output_slot: usize,
  pub input_slot: usize,
  pub subgraph: usize,
}

impl fmt::Display for DataEdge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} -> {}", self.output_slot, self.input_slot)
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleOutputs {
  pub ids: Vec<NodeId>,
  pub requires_grad: Vec<bool>,
}

/// Nodes of a graph at one point in time, see [`TargetGraph::rollback`].
#[derive(Debug, Clone)]
pub struct Checkpoint(HashSet<NodeId>);

/// The operator graph handed to the downstream compiler.
///
/// Several lowering invocations may add to one graph, each under its own subgraph index.
/// Module inputs and outputs are registered once per subgraph.
#[derive(Debug, Clone, Default)]
pub struct TargetGraph {
  pub graph: StableGraph<TargetNode, DataEdge>,
  module_inputs: BTreeMap<usize, Vec<NodeId>>,
  module_outputs: BTreeMap<usize, ModuleOutputs>,
}

impl TargetGraph {
  pub fn new() -> Self {
    Self::default()
  }

  fn add_node(
    &mut self,
    name: String,
    kind: TargetNodeKind,
    shape: Vec<usize>,
    format: DataFormat,
    subgraph: usize,
  ) -> NodeId {
    let id = self.graph.add_node(TargetNode {
      name,
      kind,
      shape,
      format,
      subgraph,
    });
    trace!("{:?}: {}", id, self.graph[id]);
    id
  }

  pub fn create_parameter_input(
    &mut self,
    name: &str,
    shape: Vec<usize>,
    requires_grad: bool,
    format: DataFormat,
    subgraph: usize,
  ) -> NodeId {
    self.add_node(
      name.to_string(),
      TargetNodeKind::ParameterInput { requires_grad },
      shape,
      format,
      subgraph,
    )
  }

  pub fn create_activation_input(
    &mut self,
    name: &str,
    shape: Vec<usize>,
    requires_grad: bool,
    format: DataFormat,
    subgraph: usize,
  ) -> NodeId {
    self.add_node(
      name.to_string(),
      TargetNodeKind::ActivationInput { requires_grad },
      shape,
      format,
      subgraph,
    )
  }

  pub fn create_constant_input(&mut self, name: &str, value: Tensor, subgraph: usize) -> NodeId {
    let shape = value.shape.clone();
    let format = value.dtype.data_format();
    self.add_node(
      name.to_string(),
      TargetNodeKind::ConstantInput { value },
      shape,
      format,
      subgraph,
    )
  }

  pub fn create_op_node(
    &mut self,
    name: &str,
    op: OpType,
    shape: Vec<usize>,
    format: DataFormat,
    subgraph: usize,
  ) -> NodeId {
    self.add_node(
      name.to_string(),
      TargetNodeKind::Operator(op),
      shape,
      format,
      subgraph,
    )
  }

  pub fn create_output(
    &mut self,
    name: &str,
    shape: Vec<usize>,
    format: DataFormat,
    is_loss: bool,
    subgraph: usize,
  ) -> NodeId {
    self.add_node(
      name.to_string(),
      TargetNodeKind::Output { is_loss },
      shape,
      format,
      subgraph,
    )
  }

  pub fn create_data_edge(
    &mut self,
    producer: OutputRef,
    consumer: NodeId,
    input_slot: usize,
    subgraph: usize,
  ) -> EdgeIndex {
    self.graph.add_edge(
      producer.node,
      consumer,
      DataEdge {
        output_slot: producer.slot,
        input_slot,
        subgraph,
      },
    )
  }

  /// Creates an operator node and wires `operands[i]` into its input slot `i`.
  pub fn add_operator(
    &mut self,
    name: &str,
    op: OpType,
    operands: &[OutputRef],
    shape: Vec<usize>,
    format: DataFormat,
    subgraph: usize,
  ) -> NodeId {
    let id = self.create_op_node(name, op, shape, format, subgraph);
    for (i, operand) in operands.iter().enumerate() {
      self.create_data_edge(*operand, id, i, subgraph);
    }
    id
  }

  /// Fails if module inputs or outputs of `subgraph` are registered already.
  pub fn ensure_unregistered(&self, subgraph: usize) -> Result<()> {
    let what = if self.module_inputs.contains_key(&subgraph) {
      "inputs"
    } else if self.module_outputs.contains_key(&subgraph) {
      "outputs"
    } else {
      return Ok(());
    };
    Err(LowerError::AlreadyRegistered { subgraph, what })
  }

  pub fn checkpoint(&self) -> Checkpoint {
    Checkpoint(self.graph.node_indices().collect())
  }

  /// Removes every node created since `checkpoint`, edges included. Returns how many nodes
  /// were removed.
  pub fn rollback(&mut self, checkpoint: &Checkpoint) -> usize {
    let before = self.graph.node_count();
    self.graph.retain_nodes(|_, id| checkpoint.0.contains(&id));
    before - self.graph.node_count()
  }

  pub fn register_module_inputs(&mut self, subgraph: usize, ids: Vec<NodeId>) -> Result<()> {
    if self.module_inputs.contains_key(&subgraph) {
      return Err(LowerError::AlreadyRegistered {
        subgraph,
        what: "inputs",
      });
    }
    self.module_inputs.insert(subgraph, ids);
    Ok(())
  }

  pub fn register_module_outputs(
    &mut self,
    subgraph: usize,
    ids: Vec<NodeId>,
    requires_grad: Vec<bool>,
  ) -> Result<()> {
    if self.module_outputs.contains_key(&subgraph) {
      return Err(LowerError::AlreadyRegistered {
        subgraph,
        what: "outputs",
      });
    }
    self
      .module_outputs
      .insert(subgraph, ModuleOutputs { ids, requires_grad });
    Ok(())
  }

  pub fn module_inputs(&self, subgraph: usize) -> &[NodeId] {
    self
      .module_inputs
      .get(&subgraph)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn module_outputs(&self, subgraph: usize) -> Option<&ModuleOutputs> {
    self.module_outputs.get(&subgraph)
  }

  pub fn subgraphs(&self) -> Vec<usize> {
    self
      .module_inputs
      .keys()
      .chain(self.module_outputs.keys())
      .copied()
      .sorted()
      .dedup()
      .collect()
  }

  pub fn node(&self, id: NodeId) -> Option<&TargetNode> {
    self.graph.node_weight(id)
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn edge_count(&self) -> usize {
    self.graph.edge_count()
  }

  pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
    self.graph.node_indices()
  }

  /// Nodes matching `pred`, in creation order.
  pub fn nodes_where(&self, pred: impl Fn(&TargetNode) -> bool) -> Vec<NodeId> {
    self
      .graph
      .node_indices()
      .filter(|id| pred(&self.graph[*id]))
      .collect()
  }

  /// Operator nodes with the given op name.
  pub fn ops_named(&self, name: &str) -> Vec<NodeId> {
    self.nodes_where(|n| n.kind.op().map(|op| op.name() == name).unwrap_or(false))
  }

  /// Producers feeding `id`, ordered by input slot.
  pub fn operands(&self, id: NodeId) -> Vec<OutputRef> {
    self
      .graph
      .edges_directed(id, Incoming)
      .map(|e| (e.weight().input_slot, e.source(), e.weight().output_slot))
      .sorted_by_key(|(input_slot, _, _)| *input_slot)
      .map(|(_, node, slot)| OutputRef { node, slot })
      .collect()
  }

  pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
    self
      .graph
      .edges_directed(id, Outgoing)
      .map(|e| e.target())
      .sorted()
      .dedup()
      .collect()
  }

  /// Nodes in dependency order. Edges only ever point at newer nodes, so this always succeeds
  /// on graphs built through the methods above.
  pub fn topo_order(&self) -> Option<Vec<NodeId>> {
    petgraph::algo::toposort(&self.graph, None).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::DType;

  #[test]
  fn test_operator_edges_follow_operand_order() {
    let mut g = TargetGraph::new();
    let a = g.create_activation_input("a_0", vec![2], false, DataFormat::Float32, 0);
    let b = g.create_constant_input("1.0_0", Tensor::scalar(1.0), 0);
    let c = g.add_operator(
      "sub_0",
      OpType::plain("subtract"),
      &[b.into(), a.into()],
      vec![2],
      DataFormat::Float32,
      0,
    );
    assert_eq!(g.operands(c), vec![b.into(), a.into()]);
    assert_eq!(g.consumers(a), vec![c]);
    assert_eq!(g.edge_count(), 2);
    assert!(g.graph.edge_indices().all(|e| g.graph[e].subgraph == 0));
    assert_eq!(g.topo_order().unwrap().last(), Some(&c));
  }

  #[test]
  fn test_register_once_per_subgraph() {
    let mut g = TargetGraph::new();
    let a = g.create_activation_input("a_0", vec![2], false, DataFormat::Float32, 0);
    g.register_module_inputs(0, vec![a]).unwrap();
    assert_eq!(
      g.register_module_inputs(0, vec![a]),
      Err(LowerError::AlreadyRegistered {
        subgraph: 0,
        what: "inputs"
      })
    );
    g.register_module_inputs(1, vec![]).unwrap();
    g.register_module_outputs(1, vec![], vec![]).unwrap();
    assert_eq!(g.subgraphs(), vec![0, 1]);
    assert_eq!(g.module_inputs(0), &[a]);
    assert!(g.module_outputs(0).is_none());
  }

  #[test]
  fn test_rollback_keeps_older_nodes() {
    let mut g = TargetGraph::new();
    let a = g.create_activation_input("a_0", vec![2], false, DataFormat::Float32, 0);
    let checkpoint = g.checkpoint();
    let b = g.create_activation_input("b_1", vec![2], false, DataFormat::Float32, 1);
    g.add_operator(
      "add_1",
      OpType::plain("add"),
      &[a.into(), b.into()],
      vec![2],
      DataFormat::Float32,
      1,
    );
    assert_eq!(g.rollback(&checkpoint), 2);
    assert_eq!(g.node_ids().collect::<Vec<_>>(), vec![a]);
    assert_eq!(g.edge_count(), 0);

    g.register_module_outputs(0, vec![], vec![]).unwrap();
    assert!(g.ensure_unregistered(1).is_ok());
    assert_eq!(
      g.ensure_unregistered(0),
      Err(LowerError::AlreadyRegistered {
        subgraph: 0,
        what: "outputs"
      })
    );
  }

  #[test]
  fn test_constant_takes_shape_from_value() {
    let mut g = TargetGraph::new();
    let c = g.create_constant_input("ones_0", Tensor::ones(vec![2, 2], DType::Int64), 0);
    let n = g.node(c).unwrap();
    assert_eq!(n.shape, vec![2, 2]);
    assert_eq!(n.format, DataFormat::Int32);
  }
}
