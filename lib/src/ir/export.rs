use std::{error::Error, fs::File, io::Write, path::Path};

use petgraph::{
  dot::Dot,
  visit::{EdgeRef, IntoEdgeReferences},
};
use petgraph_graphml::GraphMl;
use serde::Serialize;

use super::{Attrs, TargetGraph, TargetNodeKind};
use crate::tensor::{DataFormat, Tensor};

pub fn save_graphviz(path: &Path, graph: &TargetGraph) -> Result<(), Box<dyn Error>> {
  let dot = Dot::with_config(&graph.graph, &[]);
  let mut file = File::create(path)?;
  write!(file, "{}", dot)?;
  Ok(())
}

pub fn to_graphml(graph: &TargetGraph) -> Result<String, Box<dyn Error>> {
  let ml = GraphMl::new(&graph.graph)
    .pretty_print(true)
    .export_node_weights_display()
    .export_edge_weights_display();
  let mut buf: Vec<u8> = vec![];
  ml.to_writer(&mut buf)?;
  Ok(String::from_utf8(buf)?)
}

pub fn save_graphml(path: &Path, graph: &TargetGraph) -> Result<(), Box<dyn Error>> {
  std::fs::write(path, to_graphml(graph)?)?;
  Ok(())
}

/// Serializable snapshot of a target graph. Node ids are the graph's node indices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrDump {
  pub nodes: Vec<NodeDump>,
  pub edges: Vec<EdgeDump>,
  pub modules: Vec<ModuleDump>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDump {
  pub id: usize,
  pub name: String,
  pub kind: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub op: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub attrs: Option<Attrs>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub value: Option<Tensor>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub requires_grad: Option<bool>,
  pub shape: Vec<usize>,
  pub format: DataFormat,
  pub subgraph: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeDump {
  pub producer: usize,
  pub output_slot: usize,
  pub consumer: usize,
  pub input_slot: usize,
  pub subgraph: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleDump {
  pub subgraph: usize,
  pub inputs: Vec<usize>,
  pub outputs: Vec<usize>,
  pub output_requires_grad: Vec<bool>,
}

impl IrDump {
  pub fn new(graph: &TargetGraph) -> Self {
    let nodes = graph
      .node_ids()
      .map(|id| {
        let n = &graph.graph[id];
        let (op, attrs, value, requires_grad) = match &n.kind {
          TargetNodeKind::Operator(op) => (
            Some(op.name().to_string()),
            Some(op.attrs().clone()),
            None,
            None,
          ),
          TargetNodeKind::ConstantInput { value } => (None, None, Some(value.clone()), None),
          TargetNodeKind::ParameterInput { requires_grad }
          | TargetNodeKind::ActivationInput { requires_grad } => {
            (None, None, None, Some(*requires_grad))
          }
          TargetNodeKind::Output { .. } => (None, None, None, None),
        };
        NodeDump {
          id: id.index(),
          name: n.name.clone(),
          kind: n.kind.tag(),
          op,
          attrs,
          value,
          requires_grad,
          shape: n.shape.clone(),
          format: n.format,
          subgraph: n.subgraph,
        }
      })
      .collect();

    let edges = graph
      .graph
      .edge_references()
      .map(|e| EdgeDump {
        producer: e.source().index(),
        output_slot: e.weight().output_slot,
        consumer: e.target().index(),
        input_slot: e.weight().input_slot,
        subgraph: e.weight().subgraph,
      })
      .collect();

    let modules = graph
      .subgraphs()
      .into_iter()
      .map(|subgraph| {
        let outputs = graph.module_outputs(subgraph);
        ModuleDump {
          subgraph,
          inputs: graph
            .module_inputs(subgraph)
            .iter()
            .map(|id| id.index())
            .collect(),
          outputs: outputs
            .map(|o| o.ids.iter().map(|id| id.index()).collect())
            .unwrap_or_default(),
          output_requires_grad: outputs.map(|o| o.requires_grad.clone()).unwrap_or_default(),
        }
      })
      .collect();

    IrDump {
      nodes,
      edges,
      modules,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::OpType;

  fn small_graph() -> TargetGraph {
    let mut g = TargetGraph::new();
    let a = g.create_activation_input("a_0", vec![2], true, DataFormat::Float32, 0);
    let t = g.add_operator(
      "t_0",
      OpType::plain("tanh"),
      &[a.into()],
      vec![2],
      DataFormat::Float32,
      0,
    );
    let o = g.create_output("output_t_0", vec![2], DataFormat::Float32, false, 0);
    g.create_data_edge(t.into(), o, 0, 0);
    g.register_module_inputs(0, vec![a]).unwrap();
    g.register_module_outputs(0, vec![o], vec![true]).unwrap();
    g
  }

  #[test]
  fn test_dump() {
    let dump = IrDump::new(&small_graph());
    assert_eq!(dump.nodes.len(), 3);
    assert_eq!(dump.nodes[1].op.as_deref(), Some("tanh"));
    assert_eq!(dump.nodes[0].requires_grad, Some(true));
    assert_eq!(dump.edges.len(), 2);
    assert_eq!(dump.modules.len(), 1);
    assert_eq!(dump.modules[0].inputs, vec![0]);
    assert_eq!(dump.modules[0].outputs, vec![2]);

    let json = serde_json::to_value(&dump).unwrap();
    assert_eq!(json["nodes"][1]["attrs"], serde_json::json!({ "positional": [] }));
  }

  #[test]
  fn test_graphml_mentions_ops() {
    let s = to_graphml(&small_graph()).unwrap();
    assert!(s.contains("tanh"));
    assert!(s.contains("output_t_0"));
  }
}
