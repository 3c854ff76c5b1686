use lib::*;

use clap::{Parser, Subcommand};
use std::{error::Error, path::PathBuf};

mod app_config;

use app_config::AppConfig;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Lower a trace bundle to the operator-graph IR
  Lower {
    /// Trace bundle (JSON)
    #[arg(long, value_name = "PATH")]
    trace: PathBuf,
    /// Where to write the IR, stdout if omitted
    #[arg(short, long, value_name = "PATH")]
    out: Option<PathBuf>,
    #[arg(long, value_name = "INT")]
    subgraph: Option<usize>,
    /// Directory for IR, Graphviz and GraphML artifacts
    #[arg(long, value_name = "DIR")]
    artifacts: Option<PathBuf>,
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,
    /// YAML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
  },
  /// Lowering service
  Server {
    #[arg(short, long, default_value_t = 4545)]
    port: u16,
  },
  /// Send a trace bundle to a lowering service
  Client {
    /// Trace bundle (JSON)
    #[arg(long, value_name = "PATH")]
    trace: PathBuf,
    /// Host of the service
    #[arg(long)]
    url: String,
    #[arg(short, long, default_value_t = 4545)]
    port: u16,
  },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  utils::init_logging()?;
  let args = Cli::parse();

  match args.command {
    Command::Lower {
      trace,
      out,
      subgraph,
      artifacts,
      seed,
      config,
    } => {
      let file_config = match config {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::default(),
      };
      let cli_config = AppConfig {
        subgraph,
        artifacts,
        seed,
      };
      let config = file_config.merge(cli_config).lower_config();
      subcommands::Lower::new(&trace, out, config).run()?;
    }
    Command::Server { port } => {
      let app = subcommands::Server::new(port);
      app.run().await?;
    }
    Command::Client { trace, url, port } => {
      let true_url = format!("http://{}:{}/", url, port);
      let app = subcommands::Client::new(&trace, true_url)?;
      app.run().await?;
    }
  }
  Ok(())
}
