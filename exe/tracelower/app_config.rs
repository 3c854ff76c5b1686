use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Config file format. Every field can be omitted, command line flags take precedence.
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
  /// Subgraph index to lower into
  pub subgraph: Option<usize>,
  /// Directory to save the IR, Graphviz and GraphML renderings into
  pub artifacts: Option<PathBuf>,
  /// Seed for sample activations of bundles that carry none
  pub seed: Option<u64>,
}

impl AppConfig {
  pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
    let s = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&s)?)
  }

  // merge configs where the second overwrites the first
  pub fn merge(self, other: Self) -> Self {
    Self {
      subgraph: other.subgraph.or(self.subgraph),
      artifacts: other.artifacts.or(self.artifacts),
      seed: other.seed.or(self.seed),
    }
  }

  pub fn lower_config(self) -> lib::LowerConfig {
    lib::LowerConfig {
      subgraph: self.subgraph.unwrap_or(0),
      artifacts: self.artifacts,
      seed: self.seed.unwrap_or(0),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cli_overrides_file() {
    let file: AppConfig = serde_yaml::from_str("subgraph: 2\nseed: 7\n").unwrap();
    let cli = AppConfig {
      subgraph: Some(5),
      ..Default::default()
    };
    let c = file.merge(cli).lower_config();
    assert_eq!(c.subgraph, 5);
    assert_eq!(c.seed, 7);
    assert_eq!(c.artifacts, None);
  }
}
