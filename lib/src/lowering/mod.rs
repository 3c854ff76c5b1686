//!
//! Lowering of a traced graph into the target operator graph.
//!
//! One call to [`lower_module`] walks the trace once, in program order:
//! parameter placeholders, then activation placeholders, then operator calls, then the
//! output node. Every source node is lowered at most once and only after all of its
//! operands, so operands are always found in the identity tables.
//!
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
  error::{LowerError, Result},
  ir::{NodeId, OutputRef, TargetGraph},
  oracle::ShapeOracle,
  source::{NodeKind, Operand, SourceNode, TracedGraph},
  tensor::Tensor,
};

mod constants;
mod context;
mod ops;
mod registry;

pub use constants::{construct, intern_literal};
pub use context::{EvalCache, Lowered, LoweringContext};
pub use ops::{normalize_axis, resolve_wildcard};
pub use registry::{canonical_name, Call, OpKind, Registry, Translation, Translator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
  pub name: String,
  pub tensor: Tensor,
  #[serde(default)]
  pub requires_grad: bool,
}

/// Parameters and buffers of the traced module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
  /// Named parameters followed by buffers, in the order their placeholders appear.
  pub named: Vec<Parameter>,
  /// Count reported independently by flattening the module's parameter tree.
  pub flattened: usize,
}

impl ModelParameters {
  pub fn new(named: Vec<Parameter>) -> Self {
    let flattened = named.len();
    ModelParameters { named, flattened }
  }
}

/// Everything one lowering invocation produced besides the nodes themselves.
#[derive(Debug, Clone)]
pub struct LoweredModule {
  pub subgraph: usize,
  /// Activation inputs, in placeholder order
  pub inputs: Vec<NodeId>,
  pub outputs: Vec<NodeId>,
  pub output_requires_grad: Vec<bool>,
  pub eval_cache: EvalCache,
  /// Values of the outputs, where the oracle supplied them
  pub output_tensors: Vec<Option<Tensor>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
  Params,
  Placeholders,
  Operators,
  Done,
}

struct ModuleLowering<'a> {
  graph: &'a mut TargetGraph,
  trace: &'a TracedGraph,
  registry: &'a Registry,
  subgraph: usize,
  cx: LoweringContext,
  stage: Stage,
  inputs: Vec<NodeId>,
  outputs: Vec<NodeId>,
  output_requires_grad: Vec<bool>,
  output_tensors: Vec<Option<Tensor>>,
}

/// Lowers `trace` into `graph` under index `subgraph` with the default operator table.
pub fn lower_module(
  graph: &mut TargetGraph,
  trace: &mut TracedGraph,
  params: &ModelParameters,
  activations: &[Tensor],
  oracle: &dyn ShapeOracle,
  subgraph: usize,
) -> Result<LoweredModule> {
  lower_module_with(
    &Registry::default(),
    graph,
    trace,
    params,
    activations,
    oracle,
    subgraph,
  )
}

#[instrument(level = "debug", skip_all, fields(subgraph = subgraph, nodes = trace.len()))]
pub fn lower_module_with(
  registry: &Registry,
  graph: &mut TargetGraph,
  trace: &mut TracedGraph,
  params: &ModelParameters,
  activations: &[Tensor],
  oracle: &dyn ShapeOracle,
  subgraph: usize,
) -> Result<LoweredModule> {
  graph.ensure_unregistered(subgraph)?;
  if params.named.len() != params.flattened {
    return Err(LowerError::ParameterCountMismatch {
      named: params.named.len(),
      flattened: params.flattened,
    });
  }

  let samples: Vec<Tensor> = params
    .named
    .iter()
    .map(|p| p.tensor.clone())
    .chain(activations.iter().cloned())
    .collect();
  oracle.propagate(trace, &samples)?;

  // A failed lowering leaves the graph as it found it.
  let checkpoint = graph.checkpoint();
  let lowered = lower_nodes(registry, graph, trace, params, subgraph);
  if let Err(e) = &lowered {
    let dropped = graph.rollback(&checkpoint);
    warn!(
      "lowering subgraph {} failed with {}, dropped {} nodes",
      subgraph,
      e.kind(),
      dropped
    );
  }
  lowered
}

fn lower_nodes(
  registry: &Registry,
  graph: &mut TargetGraph,
  trace: &TracedGraph,
  params: &ModelParameters,
  subgraph: usize,
) -> Result<LoweredModule> {
  let mut lowering = ModuleLowering {
    graph,
    trace,
    registry,
    subgraph,
    cx: LoweringContext::new(subgraph),
    stage: Stage::Params,
    inputs: vec![],
    outputs: vec![],
    output_requires_grad: vec![],
    output_tensors: vec![],
  };
  let mut params = params.named.iter();
  for node in trace.nodes() {
    if lowering.cx.is_lowered(&node.name) {
      return Err(LowerError::DuplicateNode {
        node: node.name.clone(),
      });
    }
    if lowering.stage == Stage::Params {
      match params.next() {
        Some(p) => {
          lowering.parameter(node, p)?;
          continue;
        }
        None => lowering.stage = Stage::Placeholders,
      }
    }
    lowering.step(node)?;
  }
  if let Some(p) = params.next() {
    return Err(LowerError::invalid(
      &p.name,
      "placeholder",
      "trace ends before all parameters got a placeholder",
    ));
  }
  lowering.finish()
}

impl<'a> ModuleLowering<'a> {
  fn parameter(&mut self, node: &SourceNode, p: &Parameter) -> Result<()> {
    if node.kind != NodeKind::Placeholder {
      return Err(LowerError::invalid(
        &node.name,
        node.kind.as_str(),
        format!("expected the placeholder of parameter `{}`", p.name),
      ));
    }
    let id = self
      .cx
      .intern_parameter(self.graph, &p.name, &p.tensor, p.requires_grad);
    debug!("{}: parameter {} {:?}", node.name, p.name, id);
    self.cx.bind(&node.name, Lowered::Single(id.into()));
    Ok(())
  }

  fn step(&mut self, node: &SourceNode) -> Result<()> {
    match (self.stage, node.kind) {
      (Stage::Done, _) => Err(LowerError::invalid(
        &node.name,
        node.kind.as_str(),
        "node follows the output",
      )),
      (_, NodeKind::GetAttr) => Err(LowerError::UnimplementedNodeKind {
        node: node.name.clone(),
        kind: node.kind.as_str().to_string(),
      }),
      (Stage::Placeholders, NodeKind::Placeholder) => self.activation(node),
      (_, NodeKind::Placeholder) => Err(LowerError::invalid(
        &node.name,
        "placeholder",
        "placeholder follows operator calls",
      )),
      (_, NodeKind::CallFunction) => {
        self.stage = Stage::Operators;
        self.call(node)
      }
      (_, NodeKind::Output) => {
        self.output(node)?;
        self.stage = Stage::Done;
        Ok(())
      }
    }
  }

  fn activation(&mut self, node: &SourceNode) -> Result<()> {
    let meta = node.primary_meta()?;
    let id = self.graph.create_activation_input(
      &format!("{}_{}", node.name, self.subgraph),
      meta.concrete_shape(&node.name)?,
      meta.requires_grad,
      meta.dtype.data_format(),
      self.subgraph,
    );
    if let Some(v) = node.value.as_ref().and_then(|v| v.primary()) {
      self.cx.record_value(id, v.clone());
    }
    debug!("{}: activation {:?}", node.name, id);
    self.inputs.push(id);
    self.cx.bind(&node.name, Lowered::Single(id.into()));
    Ok(())
  }

  fn call(&mut self, node: &SourceNode) -> Result<()> {
    let target = node.target.as_deref().ok_or_else(|| {
      LowerError::invalid(&node.name, "call_function", "call without an operator")
    })?;
    let kind = OpKind::from_target(target);

    if let Some(kind) = kind.filter(|k| k.is_constant_construction()) {
      let value = constants::construct(node, kind)?;
      let id = self.cx.intern_constant(self.graph, &node.name, value);
      self.cx.bind(&node.name, Lowered::Single(id.into()));
      return Ok(());
    }

    if kind == Some(OpKind::GetItem) {
      if let Some(Operand::Node(of)) = node.args.first() {
        let is_tuple = matches!(self.cx.resolve(of, &node.name)?, Lowered::Multi(_));
        if is_tuple {
          return self.tuple_element(node, of);
        }
      }
    }

    let t = self.registry.translate(node, self.trace)?;
    self.assemble(node, t)
  }

  /// `getitem` on a tuple producing node picks the element, no node is created.
  fn tuple_element(&mut self, node: &SourceNode, of: &str) -> Result<()> {
    let index = node.int_arg(1, "getitem")?;
    let element = self.cx.resolve(of, &node.name)?.element(&node.name, index)?;
    debug!("{}: element {} of {}", node.name, index, of);
    if let Some(v) = node.value.as_ref().and_then(|v| v.primary()) {
      self.cx.record_value(element.node, v.clone());
    }
    self.cx.bind(&node.name, Lowered::Single(element));
    Ok(())
  }

  fn operand(&mut self, node: &SourceNode, operand: &Operand) -> Result<OutputRef> {
    if let Some(id) = constants::intern_literal(&mut self.cx, self.graph, operand) {
      return Ok(id.into());
    }
    match operand {
      Operand::Node(name) => self.cx.resolve(name, &node.name)?.single(&node.name, name),
      other => Err(LowerError::invalid(
        &node.name,
        node.target.as_deref().unwrap_or_default(),
        format!("operand {:?} is neither a tensor nor a number", other),
      )),
    }
  }

  #[instrument(level = "trace", skip_all, fields(node = %node.name))]
  fn assemble(&mut self, node: &SourceNode, t: Translation) -> Result<()> {
    let meta = match t.meta {
      Some(m) => m,
      None => node.primary_meta()?.clone(),
    };
    let shape = meta.concrete_shape(&node.name)?;

    // Literal operands become constants before the consumer exists.
    let operands = t
      .operands
      .iter()
      .map(|o| self.operand(node, o))
      .collect::<Result<Vec<_>>>()?;

    let id = self.graph.add_operator(
      &format!("{}_{}", node.name, self.subgraph),
      t.op,
      &operands,
      shape,
      meta.dtype.data_format(),
      self.subgraph,
    );
    if let Some(v) = node.value.as_ref().and_then(|v| v.primary()) {
      self.cx.record_value(id, v.clone());
    }
    let lowered = if t.multi_output {
      Lowered::Multi(vec![id.into()])
    } else {
      Lowered::Single(id.into())
    };
    self.cx.bind(&node.name, lowered);
    Ok(())
  }

  fn output(&mut self, node: &SourceNode) -> Result<()> {
    let values = match node.args.first() {
      Some(Operand::List(xs)) => xs.clone(),
      Some(single) => vec![single.clone()],
      None => vec![],
    };
    for value in values.iter() {
      let name = value.as_node().ok_or_else(|| {
        LowerError::invalid(&node.name, "output", format!("{:?} is not a tensor", value))
      })?;
      let producer = self.cx.resolve(name, &node.name)?.single(&node.name, name)?;
      let source = self
        .trace
        .node(name)
        .ok_or_else(|| LowerError::UnresolvedOperand {
          node: node.name.clone(),
          operand: name.to_string(),
        })?;
      let meta = source.primary_meta()?;
      let id = self.graph.create_output(
        &format!("{}_{}_{}", node.name, name, self.subgraph),
        meta.concrete_shape(name)?,
        meta.dtype.data_format(),
        false,
        self.subgraph,
      );
      self.finish_output(id, producer, meta.requires_grad);
    }
    Ok(())
  }

  fn finish_output(&mut self, id: NodeId, producer: OutputRef, requires_grad: bool) {
    self.graph.create_data_edge(producer, id, 0, self.subgraph);
    self.outputs.push(id);
    self.output_requires_grad.push(requires_grad);
    self.output_tensors.push(self.cx.value(producer.node).cloned());
  }

  fn finish(self) -> Result<LoweredModule> {
    let subgraph = self.subgraph;
    if self.stage != Stage::Done {
      warn!("trace of subgraph {} has no output node", subgraph);
      return Err(LowerError::invalid(
        "output",
        "output",
        "trace has no output node",
      ));
    }
    self.graph.register_module_inputs(subgraph, self.inputs.clone())?;
    self.graph.register_module_outputs(
      subgraph,
      self.outputs.clone(),
      self.output_requires_grad.clone(),
    )?;
    info!(
      "lowered subgraph {}: {} inputs, {} outputs, {} constants, {} parameters",
      subgraph,
      self.inputs.len(),
      self.outputs.len(),
      self.cx.constant_count(),
      self.cx.parameter_count(),
    );
    Ok(LoweredModule {
      subgraph,
      inputs: self.inputs,
      outputs: self.outputs,
      output_requires_grad: self.output_requires_grad,
      eval_cache: self.cx.into_eval_cache(),
      output_tensors: self.output_tensors,
    })
  }
}
