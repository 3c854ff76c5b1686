use thiserror::Error;

/// Every way a single lowering invocation can fail.
///
/// None of these are recoverable: the IR handed to the downstream compiler has to be complete,
/// so the first error aborts the whole compilation and is handed back to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LowerError {
  #[error("unsupported operator `{op}` at node `{node}`")]
  UnsupportedOperator { node: String, op: String },

  #[error("node `{node}` indexes {axes} non-trivial axes, only one is supported")]
  UnsupportedIndexing { node: String, axes: usize },

  #[error("model reports {named} named parameters and buffers but {flattened} flattened parameters")]
  ParameterCountMismatch { named: usize, flattened: usize },

  #[error("node `{node}` of kind `{kind}` has no lowering")]
  UnimplementedNodeKind { node: String, kind: String },

  #[error("permutation {permutation:?} at node `{node}` swaps more than two axes")]
  AmbiguousAxisPermutation { node: String, permutation: Vec<i64> },

  #[error("node `{node}` uses `{operand}` before it was lowered")]
  UnresolvedOperand { node: String, operand: String },

  #[error("invalid arguments to `{op}` at node `{node}`: {reason}")]
  InvalidArguments { node: String, op: String, reason: String },

  #[error("node `{node}` carries no shape metadata")]
  MissingMetadata { node: String },

  #[error("node `{node}` has a non-concrete shape {shape:?}")]
  SymbolicShape { node: String, shape: Vec<i64> },

  #[error("node `{node}` takes element {index} of a {len}-tuple")]
  TupleIndex { node: String, index: i64, len: usize },

  #[error("node `{node}` appears twice in the traced graph")]
  DuplicateNode { node: String },

  #[error("module {what} of subgraph {subgraph} were already registered")]
  AlreadyRegistered { subgraph: usize, what: &'static str },
}

impl LowerError {
  pub fn invalid(node: &str, op: &str, reason: impl Into<String>) -> Self {
    LowerError::InvalidArguments {
      node: node.to_string(),
      op: op.to_string(),
      reason: reason.into(),
    }
  }

  /// Short machine readable tag, used in structured error replies.
  pub fn kind(&self) -> &'static str {
    use LowerError::*;
    match self {
      UnsupportedOperator { .. } => "unsupported_operator",
      UnsupportedIndexing { .. } => "unsupported_indexing",
      ParameterCountMismatch { .. } => "parameter_count_mismatch",
      UnimplementedNodeKind { .. } => "unimplemented_node_kind",
      AmbiguousAxisPermutation { .. } => "ambiguous_axis_permutation",
      UnresolvedOperand { .. } => "unresolved_operand",
      InvalidArguments { .. } => "invalid_arguments",
      MissingMetadata { .. } => "missing_metadata",
      SymbolicShape { .. } => "symbolic_shape",
      TupleIndex { .. } => "tuple_index",
      DuplicateNode { .. } => "duplicate_node",
      AlreadyRegistered { .. } => "already_registered",
    }
  }
}

pub type Result<T> = std::result::Result<T, LowerError>;
