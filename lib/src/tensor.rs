use std::fmt;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Element type as reported by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
  Float32,
  Float16,
  Bfloat16,
  Int64,
  Int32,
  Int8,
  Uint8,
  Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeCategory {
  Float,
  Integer,
  Bool,
}

impl DType {
  pub fn category(self) -> DTypeCategory {
    use DType::*;
    match self {
      Float32 | Float16 | Bfloat16 => DTypeCategory::Float,
      Int64 | Int32 | Int8 | Uint8 => DTypeCategory::Integer,
      Bool => DTypeCategory::Bool,
    }
  }

  /// Storage format the downstream compiler uses for this element type.
  pub fn data_format(self) -> DataFormat {
    use DType::*;
    match self {
      Float32 => DataFormat::Float32,
      Float16 => DataFormat::Float16,
      Bfloat16 => DataFormat::Float16B,
      Int64 | Int32 => DataFormat::Int32,
      Int8 | Uint8 | Bool => DataFormat::Int8,
    }
  }
}

/// Data formats of the target IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
  Float32,
  Float16,
  #[serde(rename = "Float16_b")]
  Float16B,
  Int32,
  Int8,
}

impl fmt::Display for DataFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      DataFormat::Float32 => "Float32",
      DataFormat::Float16 => "Float16",
      DataFormat::Float16B => "Float16_b",
      DataFormat::Int32 => "Int32",
      DataFormat::Int8 => "Int8",
    };
    write!(f, "{}", s)
  }
}

/// Concrete tensor value, row major. Integer and boolean tensors are kept as floats too,
/// these values only serve as golden references and constant payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
  pub shape: Vec<usize>,
  pub dtype: DType,
  pub data: Vec<f32>,
}

/// Hashable identity of a tensor value: equal keys mean equal values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstKey {
  shape: Vec<usize>,
  dtype: DType,
  bits: Vec<u32>,
}

impl Tensor {
  /// Returns None if `data` does not fill `shape`.
  pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<f32>) -> Option<Self> {
    if shape.iter().product::<usize>() != data.len() {
      return None;
    }
    Some(Tensor { shape, dtype, data })
  }

  /// A literal broadcast into a single element float tensor.
  pub fn scalar(val: f64) -> Self {
    Tensor {
      shape: vec![1],
      dtype: DType::Float32,
      data: vec![val as f32],
    }
  }

  pub fn full(shape: Vec<usize>, val: f64, dtype: DType) -> Self {
    let n = shape.iter().product();
    Tensor {
      shape,
      dtype,
      data: vec![val as f32; n],
    }
  }

  pub fn ones(shape: Vec<usize>, dtype: DType) -> Self {
    Self::full(shape, 1.0, dtype)
  }

  pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
    Self::full(shape, 0.0, dtype)
  }

  /// Values `start, start + step, ...` strictly before `end`. None for a zero step.
  pub fn arange(start: f64, end: f64, step: f64, dtype: DType) -> Option<Self> {
    if step == 0.0 || !step.is_finite() {
      return None;
    }
    let n = ((end - start) / step).ceil().max(0.0) as usize;
    let data = (0..n).map(|i| (start + i as f64 * step) as f32).collect();
    Some(Tensor {
      shape: vec![n],
      dtype,
      data,
    })
  }

  /// Values drawn uniformly from [-1, 1), deterministic for a given seed.
  pub fn random(shape: Vec<usize>, dtype: DType, seed: u64) -> Self {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = shape.iter().product();
    let data = (0..n)
      .map(|_| match dtype.category() {
        DTypeCategory::Float => rng.gen_range(-1.0f32..1.0),
        DTypeCategory::Integer => rng.gen_range(0..8) as f32,
        DTypeCategory::Bool => rng.gen_range(0..2) as f32,
      })
      .collect();
    Tensor { shape, dtype, data }
  }

  pub fn numel(&self) -> usize {
    self.data.len()
  }

  /// Rank zero tensors become single element vectors.
  pub fn promote_scalar(mut self) -> Self {
    if self.shape.is_empty() {
      self.shape = vec![1];
    }
    self
  }

  pub fn to_float(mut self) -> Self {
    if self.dtype.category() != DTypeCategory::Float {
      self.dtype = DType::Float32;
    }
    self
  }

  pub fn key(&self) -> ConstKey {
    ConstKey {
      shape: self.shape.clone(),
      dtype: self.dtype,
      // -0.0 and 0.0 are the same constant
      bits: self
        .data
        .iter()
        .map(|x| if *x == 0.0 { 0 } else { x.to_bits() })
        .collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_arange_matches_half_open_range() {
    let t = Tensor::arange(1.0, 4.0, 1.0, DType::Int64).unwrap();
    assert_eq!(t.shape, vec![3]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0]);

    let t = Tensor::arange(0.0, 1.0, 0.3, DType::Float32).unwrap();
    assert_eq!(t.shape, vec![4]);

    assert!(Tensor::arange(0.0, 1.0, 0.0, DType::Float32).is_none());
    assert_eq!(Tensor::arange(3.0, 0.0, 1.0, DType::Int64).unwrap().numel(), 0);
  }

  #[test]
  fn test_key_ignores_sign_of_zero() {
    assert_eq!(Tensor::scalar(0.0).key(), Tensor::scalar(-0.0).key());
    assert_ne!(Tensor::scalar(1.0).key(), Tensor::scalar(2.0).key());
    assert_ne!(
      Tensor::ones(vec![2], DType::Float32).key(),
      Tensor::ones(vec![1, 2], DType::Float32).key()
    );
  }

  #[test]
  fn test_random_is_seeded() {
    let a = Tensor::random(vec![2, 3], DType::Float32, 7);
    let b = Tensor::random(vec![2, 3], DType::Float32, 7);
    assert_eq!(a, b);
    assert!(a.data.iter().all(|x| (-1.0..1.0).contains(x)));
  }

  #[test]
  fn test_new_checks_volume() {
    assert!(Tensor::new(vec![2, 2], DType::Float32, vec![0.0; 3]).is_none());
    assert!(Tensor::new(vec![], DType::Float32, vec![5.0]).is_some());
  }
}
