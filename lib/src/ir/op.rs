use std::{collections::BTreeMap, fmt};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

impl From<i64> for Attr {
  fn from(x: i64) -> Self {
    Attr::Int(x)
  }
}

impl From<f64> for Attr {
  fn from(x: f64) -> Self {
    Attr::Float(x)
  }
}

impl From<&str> for Attr {
  fn from(x: &str) -> Self {
    Attr::Str(x.to_string())
  }
}

impl From<bool> for Attr {
  fn from(x: bool) -> Self {
    Attr::Bool(x)
  }
}

impl fmt::Display for Attr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Attr::Bool(b) => write!(f, "{}", b),
      Attr::Int(i) => write!(f, "{}", i),
      Attr::Float(x) => write!(f, "{:?}", x),
      Attr::Str(s) => write!(f, "{:?}", s),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attrs {
  Positional(Vec<Attr>),
  Named(BTreeMap<String, Attr>),
}

/// Target operator: canonical name plus its attributes. Built once per lowered node and
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpType {
  name: String,
  attrs: Attrs,
}

impl OpType {
  pub fn new(name: &str, attrs: Vec<Attr>) -> Self {
    OpType {
      name: name.to_string(),
      attrs: Attrs::Positional(attrs),
    }
  }

  pub fn named(name: &str, attrs: impl IntoIterator<Item = (&'static str, Attr)>) -> Self {
    OpType {
      name: name.to_string(),
      attrs: Attrs::Named(attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
    }
  }

  pub fn plain(name: &str) -> Self {
    Self::new(name, vec![])
  }

  /// Pass-through identity.
  pub fn nop() -> Self {
    Self::plain("nop")
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn attrs(&self) -> &Attrs {
    &self.attrs
  }

  pub fn attr(&self, i: usize) -> Option<&Attr> {
    match &self.attrs {
      Attrs::Positional(xs) => xs.get(i),
      Attrs::Named(_) => None,
    }
  }

  pub fn named_attr(&self, key: &str) -> Option<&Attr> {
    match &self.attrs {
      Attrs::Named(m) => m.get(key),
      Attrs::Positional(_) => None,
    }
  }

  pub fn int_attrs(&self) -> Vec<i64> {
    match &self.attrs {
      Attrs::Positional(xs) => xs
        .iter()
        .filter_map(|a| match a {
          Attr::Int(i) => Some(*i),
          _ => None,
        })
        .collect(),
      Attrs::Named(_) => vec![],
    }
  }
}

impl fmt::Display for OpType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.attrs {
      Attrs::Positional(xs) if xs.is_empty() => write!(f, "{}", self.name),
      Attrs::Positional(xs) => write!(f, "{}({})", self.name, xs.iter().join(", ")),
      Attrs::Named(m) => write!(
        f,
        "{}({})",
        self.name,
        m.iter().map(|(k, v)| format!("{}: {}", k, v)).join(", ")
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display() {
    assert_eq!(OpType::nop().to_string(), "nop");
    assert_eq!(
      OpType::new("index", vec![Attr::Int(-2), Attr::Int(0), Attr::Int(4), Attr::Int(1)]).to_string(),
      "index(-2, 0, 4, 1)"
    );
    let t = OpType::named(
      "transpose",
      [("dim0", Attr::Int(-2)), ("dim1", Attr::Int(-1)), ("z_dim_slice", Attr::Int(-1))],
    );
    assert_eq!(t.to_string(), "transpose(dim0: -2, dim1: -1, z_dim_slice: -1)");
    assert_eq!(t.named_attr("dim1"), Some(&Attr::Int(-1)));
    assert_eq!(t.attr(0), None);
  }

  #[test]
  fn test_attr_json() {
    let attrs: Vec<Attr> = serde_json::from_str(r#"[true, 3, 1e-5, "none"]"#).unwrap();
    assert_eq!(
      attrs,
      vec![
        Attr::Bool(true),
        Attr::Int(3),
        Attr::Float(1e-5),
        Attr::Str("none".to_string())
      ]
    );
  }
}
