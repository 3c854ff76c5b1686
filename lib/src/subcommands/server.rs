use std::error::Error;

use axum::{http::StatusCode, routing::post, Json, Router};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{compile, error::LowerError, LowerConfig, TraceBundle};

/// Lowering service: `POST /lower` with a trace bundle, answered with the lowered IR.
pub struct Server {
  port: u16,
}

#[derive(Debug, Serialize)]
pub struct ErrorReply {
  pub error: &'static str,
  pub message: String,
}

impl From<&LowerError> for ErrorReply {
  fn from(e: &LowerError) -> Self {
    ErrorReply {
      error: e.kind(),
      message: e.to_string(),
    }
  }
}

impl Server {
  pub fn new(port: u16) -> Self {
    Self { port }
  }

  pub fn router() -> Router {
    Router::new().route("/lower", post(Self::handle_request))
  }

  pub async fn run(self) -> Result<(), Box<dyn Error>> {
    let server_addr = format!("0.0.0.0:{}", self.port);
    let tcp_listener = tokio::net::TcpListener::bind(&server_addr).await?;
    info!("listening on {}", server_addr);
    axum::serve(tcp_listener, Self::router()).await?;
    Ok(())
  }

  async fn handle_request(Json(bundle): Json<TraceBundle>) -> (StatusCode, Json<Value>) {
    let (status, body) = Self::respond(bundle);
    (status, Json(body))
  }

  /// Every request is lowered on its own, into subgraph 0 of a fresh graph.
  pub fn respond(bundle: TraceBundle) -> (StatusCode, Value) {
    let reply = compile(bundle, &LowerConfig::default())
      .map_err(|e| {
        warn!("lowering failed: {}", e);
        ErrorReply::from(&e)
      })
      .and_then(|c| {
        serde_json::to_value(c.dump()).map_err(|e| ErrorReply {
          error: "serialization",
          message: e.to_string(),
        })
      });
    match reply {
      Ok(ir) => (StatusCode::OK, ir),
      Err(e) => (
        StatusCode::UNPROCESSABLE_ENTITY,
        serde_json::json!({ "error": e.error, "message": e.message }),
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    lowering::ModelParameters,
    source::{TensorMeta, TracedGraph},
  };

  fn bundle(target: &str) -> TraceBundle {
    let mut g = TracedGraph::new();
    let x = g.placeholder("x", TensorMeta::f32(&[2]));
    let y = g.call("y", target, vec![x], TensorMeta::f32(&[2]));
    g.output(vec![y]);
    TraceBundle {
      graph: g,
      parameters: ModelParameters::default(),
      activations: None,
    }
  }

  #[test]
  fn test_lowered_reply() {
    let (status, body) = Server::respond(bundle("aten.sigmoid.default"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"][1]["op"], "sigmoid");
  }

  #[test]
  fn test_structured_error_reply() {
    let (status, body) = Server::respond(bundle("aten.lstm.input"));
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "unsupported_operator");
    assert!(body["message"].as_str().unwrap().contains("aten.lstm.input"));
  }
}
