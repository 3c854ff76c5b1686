use std::{
  error::Error,
  path::{Path, PathBuf},
};

use tracing::info;

use crate::{compile_and_save, utils, LowerConfig, TraceBundle};

/// Lowers a trace bundle read from disk.
pub struct Lower {
  trace: PathBuf,
  out: Option<PathBuf>,
  config: LowerConfig,
}

impl Lower {
  pub fn new(trace: &Path, out: Option<PathBuf>, config: LowerConfig) -> Self {
    Self {
      trace: trace.to_path_buf(),
      out,
      config,
    }
  }

  pub fn run(self) -> Result<(), Box<dyn Error>> {
    let bundle: TraceBundle = utils::deserialize_from_file(&self.trace)?;
    info!("{}: {} nodes", self.trace.display(), bundle.graph.len());
    let compiled = compile_and_save(bundle, &self.config)?;
    match &self.out {
      Some(path) => utils::serialize_to_file(path, &compiled.dump())?,
      None => println!("{}", serde_json::to_string_pretty(&compiled.dump())?),
    }
    Ok(())
  }
}
