use tracelower::{
  compile,
  lowering::{ModelParameters, Parameter},
  source::{Operand, TensorMeta, TracedGraph},
  tensor::{DType, Tensor},
  utils, LowerConfig, TraceBundle,
};

// Two layer perceptron as it comes out of the tracer: x @ w1 + b1 -> gelu -> x @ w2 + b2.
pub fn main() -> Result<(), Box<dyn std::error::Error>> {
  utils::init_logging()?;

  let mut g = TracedGraph::new();
  let w1 = g.placeholder("p_fc1_weight", TensorMeta::f32(&[8, 16]).with_grad());
  let b1 = g.placeholder("p_fc1_bias", TensorMeta::f32(&[16]).with_grad());
  let w2 = g.placeholder("p_fc2_weight", TensorMeta::f32(&[16, 4]).with_grad());
  let b2 = g.placeholder("p_fc2_bias", TensorMeta::f32(&[4]).with_grad());
  let x = g.placeholder("x", TensorMeta::f32(&[2, 8]));
  let h = g.call(
    "addmm",
    "aten.addmm.default",
    vec![b1, x, w1],
    TensorMeta::f32(&[2, 16]).with_grad(),
  );
  let h = g.call(
    "gelu",
    "aten.gelu.default",
    vec![h],
    TensorMeta::f32(&[2, 16]).with_grad(),
  );
  let y = g.call(
    "addmm_1",
    "aten.addmm.default",
    vec![b2, h, w2],
    TensorMeta::f32(&[2, 4]).with_grad(),
  );
  let y = g.call(
    "mul",
    "aten.mul.Tensor",
    vec![y, Operand::Float(0.5)],
    TensorMeta::f32(&[2, 4]).with_grad(),
  );
  g.output(vec![y]);

  let param = |name: &str, shape: Vec<usize>, seed| Parameter {
    name: name.to_string(),
    tensor: Tensor::random(shape, DType::Float32, seed),
    requires_grad: true,
  };
  let bundle = TraceBundle {
    graph: g,
    parameters: ModelParameters::new(vec![
      param("fc1.weight", vec![8, 16], 1),
      param("fc1.bias", vec![16], 2),
      param("fc2.weight", vec![16, 4], 3),
      param("fc2.bias", vec![4], 4),
    ]),
    activations: None,
  };

  let compiled = compile(bundle, &LowerConfig::default())?;
  for id in compiled.graph.topo_order().unwrap_or_default() {
    if let Some(n) = compiled.graph.node(id) {
      println!("{:?}: {}", id, n);
    }
  }
  println!("outputs require grad: {:?}", compiled.module.output_requires_grad);
  Ok(())
}
