use std::{error::Error, path::Path};

use crate::{utils::deserialize_from_file, TraceBundle};

/// Sends a trace bundle to a running lowering server and prints the reply.
pub struct Client {
  url: String,
  bundle: TraceBundle,
}

impl Client {
  pub fn new(trace_path: &Path, url: String) -> Result<Self, Box<dyn Error>> {
    let bundle = deserialize_from_file(trace_path)?;
    Ok(Self { url, bundle })
  }

  pub async fn run(self) -> Result<(), Box<dyn Error>> {
    let client = reqwest::Client::new();
    let body = serde_json::to_string(&self.bundle)?;
    let response = client
      .post(format!("{}lower", self.url))
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(body)
      .send()
      .await?;
    let status = response.status();
    let res = response.text().await?;
    println!("{}", res);
    if !status.is_success() {
      return Err(format!("server answered {}", status).into());
    }
    Ok(())
  }
}
