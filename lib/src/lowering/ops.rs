//!
//! Per-operator translators and the canonicalizations they share.
//!
use std::ops::RangeInclusive;

use tracing::debug;

use super::registry::{Call, Translation};
use crate::{
  error::{LowerError, Result},
  ir::{Attr, OpType},
  source::{NodeMeta, Operand, TensorMeta},
};

/// Relative distance from an integer under which a float exponent counts as that integer.
const INTEGRAL_TOLERANCE: f64 = 1e-9;

/// Target axes are counted from the back: a non-negative axis `a` of a rank `r` tensor
/// becomes `a - r`.
pub fn normalize_axis(axis: i64, rank: i64) -> i64 {
  if axis >= 0 {
    axis - rank
  } else {
    axis
  }
}

/// Replaces the single `-1` in `dims` by whatever makes the dims hold `volume` elements.
/// Without a wildcard the dims have to hold exactly `volume` elements already.
pub fn resolve_wildcard(volume: usize, dims: &[i64]) -> std::result::Result<Vec<i64>, String> {
  let wildcards = dims.iter().filter(|d| **d == -1).count();
  if wildcards > 1 {
    return Err(format!("more than one wildcard in {:?}", dims));
  }
  if let Some(d) = dims.iter().find(|d| **d < -1) {
    return Err(format!("negative dimension {} in {:?}", d, dims));
  }
  let known: usize = dims.iter().filter(|d| **d != -1).map(|d| *d as usize).product();
  if wildcards == 0 {
    return if known == volume {
      Ok(dims.to_vec())
    } else {
      Err(format!("{:?} does not hold {} elements", dims, volume))
    };
  }
  if known == 0 || volume % known != 0 {
    return Err(format!("cannot fit {} elements into {:?}", volume, dims));
  }
  let fill = (volume / known) as i64;
  Ok(dims.iter().map(|d| if *d == -1 { fill } else { *d }).collect())
}

fn ints(xs: impl IntoIterator<Item = i64>) -> Vec<Attr> {
  xs.into_iter().map(Attr::Int).collect()
}

impl<'a> Call<'a> {
  fn invalid(&self, reason: impl Into<String>) -> LowerError {
    LowerError::invalid(&self.node.name, self.kind.name(), reason)
  }

  fn arity(&self, allowed: RangeInclusive<usize>) -> Result<()> {
    let n = self.node.args.len();
    if allowed.contains(&n) {
      Ok(())
    } else {
      Err(self.invalid(format!("expected {:?} operands, got {}", allowed, n)))
    }
  }

  fn arg(&self, i: usize) -> Result<&'a Operand> {
    self.node.arg(i, self.kind.name())
  }

  fn int(&self, i: usize) -> Result<i64> {
    self.node.int_arg(i, self.kind.name())
  }

  /// Int argument given positionally or by keyword, `default` when absent or none.
  fn opt_int(&self, i: usize, name: &str, default: i64) -> Result<i64> {
    match self.node.arg_or_kwarg(i, name) {
      None | Some(Operand::None) => Ok(default),
      Some(Operand::Int(x)) => Ok(*x),
      Some(other) => Err(self.invalid(format!("`{}` is not an int: {:?}", name, other))),
    }
  }

  /// Tensor operand `i` as a node reference.
  fn tensor(&self, i: usize) -> Result<Operand> {
    let arg = self.arg(i)?;
    match arg {
      Operand::Node(_) => Ok(arg.clone()),
      _ => Err(self.invalid(format!("operand {} is not a tensor", i))),
    }
  }

  fn input_meta(&self, i: usize) -> Result<&'a TensorMeta> {
    let name = self
      .arg(i)?
      .as_node()
      .ok_or_else(|| self.invalid(format!("operand {} is not a tensor", i)))?;
    self
      .graph
      .node(name)
      .ok_or_else(|| LowerError::UnresolvedOperand {
        node: self.node.name.clone(),
        operand: name.to_string(),
      })?
      .primary_meta()
  }

  fn input_shape(&self, i: usize) -> Result<Vec<usize>> {
    self.input_meta(i)?.concrete_shape(&self.node.name)
  }

  fn output_meta(&self) -> Result<&'a TensorMeta> {
    self.node.primary_meta()
  }

  /// Normalized axis, checked against `rank`.
  fn axis(&self, axis: i64, rank: i64) -> Result<i64> {
    if axis < -rank || axis >= rank {
      return Err(self.invalid(format!("axis {} out of range for rank {}", axis, rank)));
    }
    Ok(normalize_axis(axis, rank))
  }

  /// Int list starting at argument `from`: either one list operand or trailing ints.
  fn int_list(&self, from: usize) -> Result<Vec<i64>> {
    let rest = self.node.args.get(from..).unwrap_or_default();
    let xs = match rest {
      [single @ Operand::List(_)] => single.as_int_list(),
      _ => rest.iter().map(Operand::as_int).collect(),
    };
    xs.ok_or_else(|| self.invalid(format!("operands from {} are not a list of ints", from)))
  }

  fn plain(&self, operands: Vec<Operand>) -> Translation {
    Translation::new(OpType::plain(self.target), operands)
  }

  fn with_attrs(&self, attrs: Vec<Attr>, operands: Vec<Operand>) -> Translation {
    Translation::new(OpType::new(self.target, attrs), operands)
  }
}

pub(super) fn unary(c: &Call) -> Result<Translation> {
  c.arity(1..=1)?;
  Ok(c.plain(c.node.args.clone()))
}

/// `alpha` scaling and rounding division have no target counterpart and are refused.
pub(super) fn binary(c: &Call) -> Result<Translation> {
  c.arity(2..=2)?;
  match c.node.kwargs.get("alpha") {
    None => {}
    Some(alpha) if alpha.as_float() == Some(1.0) => {}
    Some(alpha) => return Err(c.invalid(format!("alpha {:?} is not supported", alpha))),
  }
  match c.node.kwargs.get("rounding_mode") {
    None | Some(Operand::None) => {}
    Some(mode) => return Err(c.invalid(format!("rounding mode {:?} is not supported", mode))),
  }
  Ok(c.plain(c.node.args.clone()))
}

pub(super) fn ternary(c: &Call) -> Result<Translation> {
  c.arity(3..=3)?;
  Ok(c.plain(c.node.args.clone()))
}

pub(super) fn neg(c: &Call) -> Result<Translation> {
  c.arity(1..=1)?;
  Ok(c.plain(vec![c.tensor(0)?, Operand::Float(-1.0)]))
}

/// `addmm(bias, left, right)` is `matmul(left, right, bias)` on the target.
pub(super) fn addmm(c: &Call) -> Result<Translation> {
  c.arity(3..=3)?;
  let args = &c.node.args;
  Ok(c.plain(vec![args[1].clone(), args[2].clone(), args[0].clone()]))
}

/// Padding index and the sparse flags have no target counterpart.
pub(super) fn embedding(c: &Call) -> Result<Translation> {
  c.arity(2..=5)?;
  Ok(c.plain(vec![c.tensor(0)?, c.tensor(1)?]))
}

pub(super) fn gelu(c: &Call) -> Result<Translation> {
  c.arity(1..=2)?;
  let approximate = match c.node.arg_or_kwarg(1, "approximate") {
    None | Some(Operand::None) => "none".to_string(),
    Some(Operand::Str(s)) => s.clone(),
    Some(other) => return Err(c.invalid(format!("bad approximation {:?}", other))),
  };
  Ok(c.with_attrs(vec![Attr::Str(approximate)], vec![c.tensor(0)?]))
}

pub(super) fn softmax(c: &Call) -> Result<Translation> {
  c.arity(1..=3)?;
  let dim = match c.node.arg_or_kwarg(1, "dim") {
    Some(Operand::Int(d)) => *d,
    _ => return Err(c.invalid("softmax needs an int `dim`")),
  };
  let dim = c.axis(dim, c.input_meta(0)?.rank())?;
  Ok(c.with_attrs(ints([dim, 1]), vec![c.tensor(0)?]))
}

/// Operands are the tensors of the list argument. The axis is taken against the output.
pub(super) fn cat(c: &Call) -> Result<Translation> {
  c.arity(1..=2)?;
  let tensors = c
    .arg(0)?
    .as_list()
    .ok_or_else(|| c.invalid("first operand is not a list of tensors"))?;
  if tensors.is_empty() || tensors.iter().any(|t| t.as_node().is_none()) {
    return Err(c.invalid("first operand is not a list of tensors"));
  }
  let dim = c.opt_int(1, "dim", 0)?;
  let dim = c.axis(dim, c.output_meta()?.rank())?;
  Ok(c.with_attrs(ints([dim]), tensors.to_vec()))
}

fn swap(c: &Call, dim0: i64, dim1: i64) -> Translation {
  let (dim0, dim1) = (dim0.min(dim1), dim0.max(dim1));
  Translation::new(
    OpType::named(
      c.target,
      [
        ("dim0", Attr::Int(dim0)),
        ("dim1", Attr::Int(dim1)),
        ("z_dim_slice", Attr::Int(-1)),
      ],
    ),
    vec![c.node.args[0].clone()],
  )
}

pub(super) fn transpose(c: &Call) -> Result<Translation> {
  c.arity(3..=3)?;
  let input = c.tensor(0)?;
  let rank = c.input_meta(0)?.rank();
  let dim0 = c.axis(c.int(1)?, rank)?;
  let dim1 = c.axis(c.int(2)?, rank)?;
  if dim0 == dim1 {
    return Ok(Translation::nop(input));
  }
  Ok(swap(c, dim0, dim1))
}

/// Only permutations swapping a single pair of axes have a target counterpart.
pub(super) fn permute(c: &Call) -> Result<Translation> {
  c.arity(2..=usize::MAX)?;
  let input = c.tensor(0)?;
  let rank = c.input_meta(0)?.rank();
  let perm = c.int_list(1)?;
  if perm.len() as i64 != rank {
    return Err(c.invalid(format!("permutation {:?} for rank {}", perm, rank)));
  }
  let axes: Vec<i64> = perm
    .iter()
    .map(|p| if *p < 0 { p + rank } else { *p })
    .collect();
  if !(0..rank).all(|a| axes.contains(&a)) {
    return Err(c.invalid(format!("{:?} is not a permutation of rank {}", perm, rank)));
  }
  let moved: Vec<i64> = axes
    .iter()
    .copied()
    .enumerate()
    .filter(|(i, p)| *i as i64 != *p)
    .map(|(i, _)| i as i64)
    .collect();
  match moved[..] {
    [] => Ok(Translation::nop(input)),
    [a, b] => Ok(swap(c, normalize_axis(a, rank), normalize_axis(b, rank))),
    _ => Err(LowerError::AmbiguousAxisPermutation {
      node: c.node.name.clone(),
      permutation: perm,
    }),
  }
}

/// `index` op over one axis: `(axis, start, stop, stride)`.
fn index(c: &Call, axis: i64, start: i64, stop: i64, stride: i64) -> Translation {
  c.with_attrs(ints([axis, start, stop, stride]), vec![c.node.args[0].clone()])
}

/// Position `i` of an axis of size `size`, counting negative positions from the back and
/// clamping into `[0, size]`.
fn clamp_position(i: i64, size: i64) -> i64 {
  let i = if i < 0 { i.saturating_add(size) } else { i };
  i.clamp(0, size)
}

fn axis_size(shape: &[usize], axis: i64) -> i64 {
  let rank = shape.len() as i64;
  shape[(axis + rank) as usize] as i64
}

pub(super) fn select(c: &Call) -> Result<Translation> {
  c.arity(3..=3)?;
  c.tensor(0)?;
  let shape = c.input_shape(0)?;
  let axis = c.axis(c.int(1)?, shape.len() as i64)?;
  let size = axis_size(&shape, axis);
  let i = c.int(2)?;
  let i = if i < 0 { i + size } else { i };
  if !(0..size).contains(&i) {
    return Err(c.invalid(format!("index {} out of range for size {}", c.int(2)?, size)));
  }
  Ok(index(c, axis, i, i + 1, 1))
}

pub(super) fn slice(c: &Call) -> Result<Translation> {
  c.arity(1..=5)?;
  let input = c.tensor(0)?;
  let dim = c.opt_int(1, "dim", 0)?;
  let start = c.opt_int(2, "start", 0)?;
  let end = c.opt_int(3, "end", i64::MAX)?;
  let step = c.opt_int(4, "step", 1)?;
  if step <= 0 {
    return Err(c.invalid(format!("step {} is not positive", step)));
  }
  if start == 0 && end == i64::MAX && step == 1 {
    debug!("{}: full slice elided", c.node.name);
    return Ok(Translation::nop(input));
  }
  let shape = c.input_shape(0)?;
  let axis = c.axis(dim, shape.len() as i64)?;
  let size = axis_size(&shape, axis);
  let (start, end) = (clamp_position(start, size), clamp_position(end, size));
  if start == 0 && end == size && step == 1 {
    return Ok(Translation::nop(input));
  }
  Ok(index(c, axis, start, end, step))
}

/// Indexing with one entry per leading axis. Exactly one entry may be non-trivial.
/// `None` entries insert an axis in the output and take none of the input.
pub(super) fn getitem(c: &Call) -> Result<Translation> {
  c.arity(2..=2)?;
  let input = c.tensor(0)?;
  let entries = match c.arg(1)? {
    Operand::List(xs) => xs.clone(),
    other => vec![other.clone()],
  };
  let non_trivial: Vec<(usize, &Operand)> = entries
    .iter()
    .enumerate()
    .filter(|(_, e)| match e {
      Operand::Slice { start, stop, step } => {
        start.is_some() || stop.is_some() || step.is_some()
      }
      Operand::None => false,
      _ => true,
    })
    .collect();
  let (position, entry) = match non_trivial[..] {
    [] => return Ok(Translation::nop(input)),
    [one] => one,
    _ => {
      return Err(LowerError::UnsupportedIndexing {
        node: c.node.name.clone(),
        axes: non_trivial.len(),
      })
    }
  };

  let shape = c.input_shape(0)?;
  let consumed = entries[..position]
    .iter()
    .filter(|e| !matches!(e, Operand::None))
    .count();
  let axis = c.axis(consumed as i64, shape.len() as i64)?;
  let size = axis_size(&shape, axis);
  match entry {
    Operand::Int(i) => {
      let start = if *i < 0 { i + size } else { *i };
      if !(0..size).contains(&start) {
        return Err(c.invalid(format!("index {} out of range for size {}", i, size)));
      }
      Ok(index(c, axis, start, start + 1, 1))
    }
    Operand::Slice { start, stop, step } => {
      let step = step.unwrap_or(1);
      if step <= 0 {
        return Err(c.invalid(format!("step {} is not positive", step)));
      }
      let start = clamp_position(start.unwrap_or(0), size);
      let stop = clamp_position(stop.unwrap_or(size), size);
      Ok(index(c, axis, start, stop, step))
    }
    other => Err(c.invalid(format!("unsupported index entry {:?}", other))),
  }
}

/// Attributes are the normalized axis, taken against the output, and the input rank.
/// The rank attribute is the rank of the operand, the one the target op reads before
/// inserting the axis.
pub(super) fn unsqueeze(c: &Call) -> Result<Translation> {
  c.arity(2..=2)?;
  let input = c.tensor(0)?;
  let in_rank = c.input_meta(0)?.rank();
  let dim = c.axis(c.int(1)?, c.output_meta()?.rank())?;
  Ok(c.with_attrs(ints([dim, in_rank]), vec![input]))
}

fn reshaped(c: &Call, input: Operand, volume: usize, dims: &[i64]) -> Result<Translation> {
  let dims = resolve_wildcard(volume, dims).map_err(|e| c.invalid(e))?;
  Ok(c.with_attrs(ints(dims), vec![input]))
}

pub(super) fn reshape(c: &Call) -> Result<Translation> {
  c.arity(2..=usize::MAX)?;
  let input = c.tensor(0)?;
  let volume = c.input_shape(0)?.iter().product();
  reshaped(c, input, volume, &c.int_list(1)?)
}

/// Axes `start_dim..=end_dim` collapse into one.
pub(super) fn flatten(c: &Call) -> Result<Translation> {
  c.arity(1..=3)?;
  let input = c.tensor(0)?;
  let shape = c.input_shape(0)?;
  let volume = shape.iter().product();
  let rank = shape.len() as i64;
  if rank == 0 {
    return reshaped(c, input, volume, &[-1]);
  }
  let start = c.axis(c.opt_int(1, "start_dim", 0)?, rank)? + rank;
  let end = c.axis(c.opt_int(2, "end_dim", -1)?, rank)? + rank;
  if start > end {
    return Err(c.invalid(format!("start_dim {} after end_dim {}", start, end)));
  }
  let dims: Vec<i64> = shape[..start as usize]
    .iter()
    .map(|d| *d as i64)
    .chain([-1])
    .chain(shape[end as usize + 1..].iter().map(|d| *d as i64))
    .collect();
  reshaped(c, input, volume, &dims)
}

/// Broadcast along at most one axis.
pub(super) fn expand(c: &Call) -> Result<Translation> {
  c.arity(2..=usize::MAX)?;
  let input = c.tensor(0)?;
  let from = c.input_shape(0)?;
  let to = c.output_meta()?.concrete_shape(&c.node.name)?;
  if from == to {
    return Ok(Translation::nop(input));
  }
  if from.len() != to.len() {
    return Err(c.invalid(format!("expanding {:?} to {:?} changes the rank", from, to)));
  }
  let moved: Vec<usize> = (0..from.len()).filter(|i| from[*i] != to[*i]).collect();
  match moved[..] {
    [axis] if from[axis] == 1 => {
      let axis = normalize_axis(axis as i64, from.len() as i64);
      Ok(c.with_attrs(ints([axis, to[moved[0]] as i64]), vec![input]))
    }
    _ => Err(c.invalid(format!(
      "expanding {:?} to {:?} broadcasts more than one axis",
      from, to
    ))),
  }
}

pub(super) fn identity(c: &Call) -> Result<Translation> {
  c.arity(1..=usize::MAX)?;
  Ok(Translation::nop(c.tensor(0)?))
}

/// Conversions within a dtype category keep the values, others become a cast.
pub(super) fn cast(c: &Call) -> Result<Translation> {
  c.arity(1..=usize::MAX)?;
  let input = c.tensor(0)?;
  let from = c.input_meta(0)?.dtype;
  let to = c.output_meta()?.dtype;
  if from.category() == to.category() {
    return Ok(Translation::nop(input));
  }
  let format = to.data_format().to_string();
  Ok(c.with_attrs(vec![Attr::Str(format)], vec![input]))
}

/// `native_layer_norm(input, normalized_shape, weight, bias, eps)` yields
/// `(output, mean, rstd)`, only the output is lowered.
pub(super) fn layernorm(c: &Call) -> Result<Translation> {
  c.arity(5..=5)?;
  let eps = c
    .arg(4)?
    .as_float()
    .ok_or_else(|| c.invalid("epsilon is not a number"))?;
  let operands = vec![c.tensor(0)?, c.tensor(2)?, c.tensor(3)?];
  let primary = match &c.node.meta {
    Some(NodeMeta::Tuple(ms)) => ms.first(),
    Some(NodeMeta::Tensor(m)) => Some(m),
    None => None,
  }
  .ok_or_else(|| LowerError::MissingMetadata {
    node: c.node.name.clone(),
  })?;
  Ok(Translation {
    op: OpType::new(c.target, vec![Attr::Int(-1), Attr::Float(eps)]),
    operands,
    meta: Some(primary.clone()),
    multi_output: true,
  })
}

/// Exponents outside the `i64` range stay floats.
fn integral(x: f64) -> Option<i64> {
  let r = x.round();
  let representable = r >= i64::MIN as f64 && r < i64::MAX as f64;
  (x.is_finite() && representable && (x - r).abs() <= INTEGRAL_TOLERANCE * x.abs().max(1.0))
    .then_some(r as i64)
}

/// Integral literal exponents become an attribute, anything else is a second operand.
pub(super) fn pow(c: &Call) -> Result<Translation> {
  c.arity(2..=2)?;
  let (base, exponent) = (c.arg(0)?, c.arg(1)?);
  let fixed = match (base, exponent) {
    (Operand::Node(_), Operand::Int(e)) => Some(*e),
    (Operand::Node(_), Operand::Float(e)) => integral(*e),
    _ => None,
  };
  match fixed {
    Some(e) => Ok(c.with_attrs(ints([e]), vec![base.clone()])),
    None => Ok(Translation::new(
      OpType::plain("power"),
      vec![base.clone(), exponent.clone()],
    )),
  }
}
