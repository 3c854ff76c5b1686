//!
//! The traced dataflow graph, as captured from a model run.
//!
//! Nodes are stored in program order and refer to each other by name. The shape oracle
//! attaches `meta` (and possibly concrete `value`s) before anything is lowered.
//!
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
  error::{LowerError, Result},
  tensor::{DType, Tensor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
  /// Parameter or activation input
  Placeholder,
  /// Reference to a module attribute
  GetAttr,
  CallFunction,
  Output,
}

impl NodeKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      NodeKind::Placeholder => "placeholder",
      NodeKind::GetAttr => "get_attr",
      NodeKind::CallFunction => "call_function",
      NodeKind::Output => "output",
    }
  }
}

/// One argument of a traced call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
  /// Value produced by an earlier node
  Node(String),
  Int(i64),
  Float(f64),
  Bool(bool),
  Str(String),
  None,
  List(Vec<Operand>),
  Slice {
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
  },
}

impl Operand {
  pub fn node(name: &str) -> Self {
    Operand::Node(name.to_string())
  }

  pub fn ints(xs: &[i64]) -> Self {
    Operand::List(xs.iter().map(|x| Operand::Int(*x)).collect())
  }

  pub fn as_node(&self) -> Option<&str> {
    match self {
      Operand::Node(n) => Some(n),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Operand::Int(x) => Some(*x),
      _ => None,
    }
  }

  /// Ints are accepted wherever a float is.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      Operand::Int(x) => Some(*x as f64),
      Operand::Float(x) => Some(*x),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Operand]> {
    match self {
      Operand::List(xs) => Some(xs),
      _ => None,
    }
  }

  /// A list of ints, or a single int taken as a one element list.
  pub fn as_int_list(&self) -> Option<Vec<i64>> {
    match self {
      Operand::Int(x) => Some(vec![*x]),
      Operand::List(xs) => xs.iter().map(Operand::as_int).collect(),
      _ => None,
    }
  }
}

/// Static tensor metadata, as reported by the oracle. Dimensions may be negative when the
/// tracer could not pin them down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
  pub shape: Vec<i64>,
  pub dtype: DType,
  #[serde(default)]
  pub requires_grad: bool,
}

impl TensorMeta {
  pub fn new(shape: &[i64], dtype: DType) -> Self {
    TensorMeta {
      shape: shape.to_vec(),
      dtype,
      requires_grad: false,
    }
  }

  pub fn f32(shape: &[i64]) -> Self {
    Self::new(shape, DType::Float32)
  }

  pub fn with_grad(mut self) -> Self {
    self.requires_grad = true;
    self
  }

  pub fn rank(&self) -> i64 {
    self.shape.len() as i64
  }

  pub fn concrete_shape(&self, node: &str) -> Result<Vec<usize>> {
    self
      .shape
      .iter()
      .map(|d| usize::try_from(*d).ok())
      .collect::<Option<Vec<_>>>()
      .ok_or_else(|| LowerError::SymbolicShape {
        node: node.to_string(),
        shape: self.shape.clone(),
      })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeMeta {
  Tensor(TensorMeta),
  Tuple(Vec<TensorMeta>),
}

impl NodeMeta {
  /// Metadata of the first (or only) produced tensor.
  pub fn primary(&self) -> Option<&TensorMeta> {
    match self {
      NodeMeta::Tensor(m) => Some(m),
      NodeMeta::Tuple(ms) => ms.first(),
    }
  }
}

impl From<TensorMeta> for NodeMeta {
  fn from(m: TensorMeta) -> Self {
    NodeMeta::Tensor(m)
  }
}

impl From<Vec<TensorMeta>> for NodeMeta {
  fn from(ms: Vec<TensorMeta>) -> Self {
    NodeMeta::Tuple(ms)
  }
}

/// Concrete value computed by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
  Tensor(Tensor),
  Tuple(Vec<Tensor>),
}

impl NodeValue {
  pub fn primary(&self) -> Option<&Tensor> {
    match self {
      NodeValue::Tensor(t) => Some(t),
      NodeValue::Tuple(ts) => ts.first(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
  pub name: String,
  pub kind: NodeKind,
  /// Operator identifier of a call, e.g. `aten.addmm.default`
  #[serde(default)]
  pub target: Option<String>,
  #[serde(default)]
  pub args: Vec<Operand>,
  #[serde(default)]
  pub kwargs: BTreeMap<String, Operand>,
  #[serde(default)]
  pub meta: Option<NodeMeta>,
  #[serde(default)]
  pub value: Option<NodeValue>,
}

impl SourceNode {
  pub fn new(name: &str, kind: NodeKind) -> Self {
    SourceNode {
      name: name.to_string(),
      kind,
      target: None,
      args: vec![],
      kwargs: BTreeMap::new(),
      meta: None,
      value: None,
    }
  }

  pub fn primary_meta(&self) -> Result<&TensorMeta> {
    self
      .meta
      .as_ref()
      .and_then(NodeMeta::primary)
      .ok_or_else(|| LowerError::MissingMetadata {
        node: self.name.clone(),
      })
  }

  pub fn arg(&self, i: usize, op: &str) -> Result<&Operand> {
    self
      .args
      .get(i)
      .ok_or_else(|| LowerError::invalid(&self.name, op, format!("missing operand {}", i)))
  }

  pub fn int_arg(&self, i: usize, op: &str) -> Result<i64> {
    self
      .arg(i, op)?
      .as_int()
      .ok_or_else(|| LowerError::invalid(&self.name, op, format!("operand {} is not an int", i)))
  }

  /// Positional argument `i`, falling back to the keyword `name`.
  pub fn arg_or_kwarg(&self, i: usize, name: &str) -> Option<&Operand> {
    self.args.get(i).or_else(|| self.kwargs.get(name))
  }
}

/// The whole trace, in program order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<SourceNode>", into = "Vec<SourceNode>")]
pub struct TracedGraph {
  nodes: Vec<SourceNode>,
  by_name: HashMap<String, usize>,
}

impl From<Vec<SourceNode>> for TracedGraph {
  fn from(nodes: Vec<SourceNode>) -> Self {
    let mut g = TracedGraph::default();
    for n in nodes {
      g.push(n);
    }
    g
  }
}

impl From<TracedGraph> for Vec<SourceNode> {
  fn from(g: TracedGraph) -> Self {
    g.nodes
  }
}

impl TracedGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn nodes(&self) -> &[SourceNode] {
    &self.nodes
  }

  pub fn nodes_mut(&mut self) -> &mut [SourceNode] {
    &mut self.nodes
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// First node with the given name.
  pub fn node(&self, name: &str) -> Option<&SourceNode> {
    self.by_name.get(name).map(|i| &self.nodes[*i])
  }

  pub fn push(&mut self, node: SourceNode) {
    self.by_name.entry(node.name.clone()).or_insert(self.nodes.len());
    self.nodes.push(node);
  }

  pub fn placeholder(&mut self, name: &str, meta: TensorMeta) -> Operand {
    let mut n = SourceNode::new(name, NodeKind::Placeholder);
    n.meta = Some(meta.into());
    self.push(n);
    Operand::node(name)
  }

  pub fn call(
    &mut self,
    name: &str,
    target: &str,
    args: Vec<Operand>,
    meta: impl Into<NodeMeta>,
  ) -> Operand {
    self.call_with_kwargs(name, target, args, BTreeMap::new(), meta)
  }

  pub fn call_with_kwargs(
    &mut self,
    name: &str,
    target: &str,
    args: Vec<Operand>,
    kwargs: BTreeMap<String, Operand>,
    meta: impl Into<NodeMeta>,
  ) -> Operand {
    let mut n = SourceNode::new(name, NodeKind::CallFunction);
    n.target = Some(target.to_string());
    n.args = args;
    n.kwargs = kwargs;
    n.meta = Some(meta.into());
    self.push(n);
    Operand::node(name)
  }

  /// Terminal node returning `values` in order.
  pub fn output(&mut self, values: Vec<Operand>) {
    let mut n = SourceNode::new("output", NodeKind::Output);
    n.args = vec![Operand::List(values)];
    self.push(n);
  }

  /// Attach a concrete value to an already pushed node.
  pub fn set_value(&mut self, name: &str, value: NodeValue) {
    if let Some(i) = self.by_name.get(name) {
      self.nodes[*i].value = Some(value);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_trace_roundtrips_through_json() {
    let mut g = TracedGraph::new();
    let x = g.placeholder("x", TensorMeta::f32(&[2, 3]));
    let y = g.call(
      "add",
      "aten.add.Tensor",
      vec![x, Operand::Float(1.0)],
      TensorMeta::f32(&[2, 3]),
    );
    g.output(vec![y]);

    let s = serde_json::to_string(&g).unwrap();
    let back: TracedGraph = serde_json::from_str(&s).unwrap();
    assert_eq!(back.len(), 3);
    assert_eq!(back.node("add").unwrap().args[1], Operand::Float(1.0));
    assert_eq!(back.node("x").unwrap().primary_meta().unwrap().shape, vec![2, 3]);
  }

  #[test]
  fn test_operand_json_shape() {
    let op: Operand =
      serde_json::from_str(r#"{"slice": {"start": null, "stop": 4, "step": null}}"#).unwrap();
    assert_eq!(
      op,
      Operand::Slice {
        start: None,
        stop: Some(4),
        step: None
      }
    );
    let op: Operand = serde_json::from_str(r#""none""#).unwrap();
    assert_eq!(op, Operand::None);
  }

  #[test]
  fn test_symbolic_shape_is_rejected() {
    let m = TensorMeta::f32(&[-1, 4]);
    assert!(matches!(
      m.concrete_shape("n"),
      Err(LowerError::SymbolicShape { .. })
    ));
    assert_eq!(TensorMeta::f32(&[3, 4]).concrete_shape("n").unwrap(), vec![3, 4]);
  }

  #[test]
  fn test_tuple_meta_primary() {
    let m: NodeMeta = vec![TensorMeta::f32(&[2, 8]), TensorMeta::f32(&[2, 1])].into();
    assert_eq!(m.primary().unwrap().shape, vec![2, 8]);
  }
}
