//!
//! Target operator graph: the IR consumed by the downstream compiler.
//!
pub mod export;
mod graph;
mod op;

pub use graph::*;
pub use op::*;
