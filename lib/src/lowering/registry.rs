use std::{collections::HashMap, fmt};

use tracing::{instrument, trace};

use super::ops;
use crate::{
  error::{LowerError, Result},
  ir::OpType,
  source::{Operand, SourceNode, TensorMeta, TracedGraph},
};

/// Source operators the lowering knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
  Add,
  IAdd,
  Sub,
  Mul,
  Div,
  TrueDiv,
  Matmul,
  Mm,
  Bmm,
  Addmm,
  Embedding,
  Gelu,
  Tanh,
  Relu,
  Sigmoid,
  Exp,
  Log,
  Sqrt,
  Reciprocal,
  Abs,
  Neg,
  Where,
  Softmax,
  SafeSoftmax,
  Cat,
  Permute,
  Transpose,
  Select,
  Slice,
  GetItem,
  Unsqueeze,
  View,
  Reshape,
  Flatten,
  Expand,
  Clone,
  Contiguous,
  To,
  ToCopy,
  NativeLayerNorm,
  Pow,
  Ones,
  Zeros,
  Full,
  Arange,
}

/// Leading path segments of operator identifiers that carry no meaning for dispatch.
const NAMESPACES: [&str; 8] = [
  "torch",
  "ops",
  "aten",
  "prims",
  "operator",
  "_operator",
  "nn",
  "functional",
];

impl OpKind {
  pub const ALL: [OpKind; 45] = {
    use OpKind::*;
    [
      Add, IAdd, Sub, Mul, Div, TrueDiv, Matmul, Mm, Bmm, Addmm, Embedding, Gelu, Tanh, Relu,
      Sigmoid, Exp, Log, Sqrt, Reciprocal, Abs, Neg, Where, Softmax, SafeSoftmax, Cat, Permute,
      Transpose, Select, Slice, GetItem, Unsqueeze, View, Reshape, Flatten, Expand, Clone,
      Contiguous, To, ToCopy, NativeLayerNorm, Pow, Ones, Zeros, Full, Arange,
    ]
  };

  pub fn name(self) -> &'static str {
    use OpKind::*;
    match self {
      Add => "add",
      IAdd => "iadd",
      Sub => "sub",
      Mul => "mul",
      Div => "div",
      TrueDiv => "truediv",
      Matmul => "matmul",
      Mm => "mm",
      Bmm => "bmm",
      Addmm => "addmm",
      Embedding => "embedding",
      Gelu => "gelu",
      Tanh => "tanh",
      Relu => "relu",
      Sigmoid => "sigmoid",
      Exp => "exp",
      Log => "log",
      Sqrt => "sqrt",
      Reciprocal => "reciprocal",
      Abs => "abs",
      Neg => "neg",
      Where => "where",
      Softmax => "softmax",
      SafeSoftmax => "_softmax",
      Cat => "cat",
      Permute => "permute",
      Transpose => "transpose",
      Select => "select",
      Slice => "slice",
      GetItem => "getitem",
      Unsqueeze => "unsqueeze",
      View => "view",
      Reshape => "reshape",
      Flatten => "flatten",
      Expand => "expand",
      Clone => "clone",
      Contiguous => "contiguous",
      To => "to",
      ToCopy => "_to_copy",
      NativeLayerNorm => "native_layer_norm",
      Pow => "pow",
      Ones => "ones",
      Zeros => "zeros",
      Full => "full",
      Arange => "arange",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.iter().copied().find(|k| k.name() == name)
  }

  /// Parses an operator identifier such as `aten.addmm.default`, `aten::add.Tensor` or
  /// `operator.getitem`.
  pub fn from_target(target: &str) -> Option<Self> {
    Self::from_name(canonical_name(target))
  }

  /// Calls evaluated at lowering time into constants.
  pub fn is_constant_construction(self) -> bool {
    matches!(self, OpKind::Ones | OpKind::Zeros | OpKind::Full | OpKind::Arange)
  }
}

impl fmt::Display for OpKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

/// Operator name of an identifier with namespaces and overload suffix stripped.
pub fn canonical_name(target: &str) -> &str {
  target
    .split(|c| c == '.' || c == ':')
    .filter(|s| !s.is_empty())
    .find(|s| !NAMESPACES.contains(s))
    .unwrap_or(target)
}

/// Result of translating one source call.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
  pub op: OpType,
  /// Canonical operand order. Literal numbers become constants.
  pub operands: Vec<Operand>,
  /// Metadata to build the node with instead of the node's own primary metadata
  pub meta: Option<TensorMeta>,
  /// The source node yields a tuple that later getitems pick from
  pub multi_output: bool,
}

impl Translation {
  pub fn new(op: OpType, operands: Vec<Operand>) -> Self {
    Translation {
      op,
      operands,
      meta: None,
      multi_output: false,
    }
  }

  pub fn nop(input: Operand) -> Self {
    Self::new(OpType::nop(), vec![input])
  }
}

/// Turns one source call into a target operator.
pub trait Translator: Send + Sync {
  fn translate(&self, node: &SourceNode, graph: &TracedGraph) -> Result<Translation>;
}

impl<F> Translator for F
where
  F: Fn(&SourceNode, &TracedGraph) -> Result<Translation> + Send + Sync,
{
  fn translate(&self, node: &SourceNode, graph: &TracedGraph) -> Result<Translation> {
    self(node, graph)
  }
}

/// A source call together with what it is being lowered to.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
  pub node: &'a SourceNode,
  pub graph: &'a TracedGraph,
  pub kind: OpKind,
  /// Canonical target operator name
  pub target: &'static str,
}

struct Builtin {
  kind: OpKind,
  target: &'static str,
  f: fn(&Call) -> Result<Translation>,
}

impl Translator for Builtin {
  fn translate(&self, node: &SourceNode, graph: &TracedGraph) -> Result<Translation> {
    (self.f)(&Call {
      node,
      graph,
      kind: self.kind,
      target: self.target,
    })
  }
}

/// Operator translation table.
pub struct Registry {
  translators: HashMap<OpKind, Box<dyn Translator>>,
}

impl fmt::Debug for Registry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut kinds: Vec<_> = self.translators.keys().map(|k| k.name()).collect();
    kinds.sort_unstable();
    f.debug_struct("Registry").field("kinds", &kinds).finish()
  }
}

impl Registry {
  pub fn empty() -> Self {
    Registry {
      translators: HashMap::new(),
    }
  }

  /// Sets the translator of `kind`, returning the one it replaces.
  pub fn register(
    &mut self,
    kind: OpKind,
    translator: impl Translator + 'static,
  ) -> Option<Box<dyn Translator>> {
    self.translators.insert(kind, Box::new(translator))
  }

  fn builtin(&mut self, kind: OpKind, target: &'static str, f: fn(&Call) -> Result<Translation>) {
    self.register(kind, Builtin { kind, target, f });
  }

  pub fn supports(&self, target: &str) -> bool {
    OpKind::from_target(target)
      .map(|k| self.translators.contains_key(&k))
      .unwrap_or(false)
  }

  pub fn len(&self) -> usize {
    self.translators.len()
  }

  pub fn is_empty(&self) -> bool {
    self.translators.is_empty()
  }

  #[instrument(level = "trace", skip_all, fields(node = %node.name))]
  pub fn translate(&self, node: &SourceNode, graph: &TracedGraph) -> Result<Translation> {
    let target = node.target.as_deref().unwrap_or_default();
    let unsupported = || LowerError::UnsupportedOperator {
      node: node.name.clone(),
      op: target.to_string(),
    };
    let kind = OpKind::from_target(target).ok_or_else(unsupported)?;
    let translator = self.translators.get(&kind).ok_or_else(unsupported)?;
    let t = translator.translate(node, graph)?;
    trace!("{} -> {} {:?}", target, t.op, t.operands);
    Ok(t)
  }
}

impl Default for Registry {
  fn default() -> Self {
    use OpKind::*;
    let mut r = Registry::empty();
    r.builtin(Add, "add", ops::binary);
    r.builtin(IAdd, "add", ops::binary);
    r.builtin(Sub, "subtract", ops::binary);
    r.builtin(Mul, "multiply", ops::binary);
    r.builtin(Div, "divide", ops::binary);
    r.builtin(TrueDiv, "divide", ops::binary);
    r.builtin(Matmul, "matmul", ops::binary);
    r.builtin(Mm, "matmul", ops::binary);
    r.builtin(Bmm, "matmul", ops::binary);
    r.builtin(Addmm, "matmul", ops::addmm);
    r.builtin(Embedding, "embedding", ops::embedding);
    r.builtin(Gelu, "gelu", ops::gelu);
    r.builtin(Tanh, "tanh", ops::unary);
    r.builtin(Relu, "relu", ops::unary);
    r.builtin(Sigmoid, "sigmoid", ops::unary);
    r.builtin(Exp, "exp", ops::unary);
    r.builtin(Log, "log", ops::unary);
    r.builtin(Sqrt, "sqrt", ops::unary);
    r.builtin(Reciprocal, "reciprocal", ops::unary);
    r.builtin(Abs, "abs", ops::unary);
    r.builtin(Neg, "multiply", ops::neg);
    r.builtin(Where, "where", ops::ternary);
    r.builtin(Softmax, "softmax", ops::softmax);
    r.builtin(SafeSoftmax, "softmax", ops::softmax);
    r.builtin(Cat, "concatenate", ops::cat);
    r.builtin(Permute, "transpose", ops::permute);
    r.builtin(Transpose, "transpose", ops::transpose);
    r.builtin(Select, "index", ops::select);
    r.builtin(Slice, "index", ops::slice);
    r.builtin(GetItem, "index", ops::getitem);
    r.builtin(Unsqueeze, "unsqueeze", ops::unsqueeze);
    r.builtin(View, "reshape", ops::reshape);
    r.builtin(Reshape, "reshape", ops::reshape);
    r.builtin(Flatten, "reshape", ops::flatten);
    r.builtin(Expand, "broadcast", ops::expand);
    r.builtin(Clone, "nop", ops::identity);
    r.builtin(Contiguous, "nop", ops::identity);
    r.builtin(To, "cast", ops::cast);
    r.builtin(ToCopy, "cast", ops::cast);
    r.builtin(NativeLayerNorm, "layernorm", ops::layernorm);
    r.builtin(Pow, "pow", ops::pow);
    r
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::{NodeKind, TensorMeta};

  #[test]
  fn test_canonical_names() {
    assert_eq!(canonical_name("aten.addmm.default"), "addmm");
    assert_eq!(canonical_name("torch.ops.aten.add.Tensor"), "add");
    assert_eq!(canonical_name("aten::_softmax"), "_softmax");
    assert_eq!(canonical_name("_operator.getitem"), "getitem");
    assert_eq!(canonical_name("torch.nn.functional.gelu"), "gelu");
    assert_eq!(canonical_name("view"), "view");
    assert_eq!(OpKind::from_target("aten.native_layer_norm.default"), Some(OpKind::NativeLayerNorm));
    assert_eq!(OpKind::from_target("aten.lstm.input"), None);
  }

  #[test]
  fn test_names_are_unique() {
    for k in OpKind::ALL {
      assert_eq!(OpKind::from_name(k.name()), Some(k));
    }
  }

  #[test]
  fn test_constant_constructions_are_not_translated() {
    let r = Registry::default();
    for k in OpKind::ALL {
      assert_eq!(r.supports(k.name()), !k.is_constant_construction(), "{}", k);
    }
  }

  #[test]
  fn test_unsupported_operator() {
    let mut g = TracedGraph::new();
    let x = g.placeholder("x", TensorMeta::f32(&[2]));
    g.call("l", "aten.lstm.input", vec![x], TensorMeta::f32(&[2]));
    let r = Registry::default();
    assert_eq!(
      r.translate(g.node("l").unwrap(), &g),
      Err(LowerError::UnsupportedOperator {
        node: "l".to_string(),
        op: "aten.lstm.input".to_string()
      })
    );
  }

  #[test]
  fn test_register_closure() {
    let mut r = Registry::empty();
    assert!(!r.supports("aten.tanh.default"));
    r.register(OpKind::Tanh, |node: &SourceNode, _: &TracedGraph| -> Result<Translation> {
      Ok(Translation::new(OpType::plain("my_tanh"), node.args.clone()))
    });
    let mut n = SourceNode::new("t", NodeKind::CallFunction);
    n.target = Some("aten.tanh.default".to_string());
    n.args = vec![Operand::node("x")];
    let t = r.translate(&n, &TracedGraph::new()).unwrap();
    assert_eq!(t.op.name(), "my_tanh");
    assert_eq!(r.len(), 1);
  }
}
