// rowflow-node/src/main.rs

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command};
use rowflow::{EngineConfig, EngineContext, NodeServer, Parameters, PipelineDefinition, Runner, StageRegistry};
use std::path::Path;
use std::process::ExitCode;
use tracing::{event, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
  // A missing .env file is fine; the environment and flags still apply.
  let _ = dotenvy::dotenv();
  init_tracing();

  let cli = Cli::parse();
  let outcome = match cli.command {
    Command::Serve { listen } => serve(&listen).await.map(|_| true),
    Command::Run {
      definition,
      safe_stop,
      compact,
      params,
    } => run(&definition, safe_stop, compact, params).await,
  };

  match outcome {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(e) => {
      event!(Level::ERROR, error = %format!("{:#}", e), "rowflow-node failed.");
      eprintln!("Error: {:#}", e);
      ExitCode::FAILURE
    }
  }
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_span_events(FmtSpan::CLOSE)
    .with_writer(std::io::stderr)
    .init();
}

fn engine() -> anyhow::Result<EngineContext> {
  let config = EngineConfig::from_env().context("invalid ROWFLOW_* configuration")?;
  Ok(EngineContext::new(config, StageRegistry::with_builtins()))
}

async fn serve(listen: &str) -> anyhow::Result<()> {
  let server = NodeServer::bind(listen, engine()?)
    .await
    .with_context(|| format!("failed to listen on {}", listen))?;
  event!(Level::INFO, version = env!("CARGO_PKG_VERSION"), addr = %server.local_addr()?, "Worker node ready.");

  tokio::select! {
    served = server.serve() => served.context("node server stopped")?,
    _ = tokio::signal::ctrl_c() => event!(Level::INFO, "Received Ctrl+C, shutting down."),
  }
  Ok(())
}

/// Runs a definition locally; `Ok(false)` when the run did not succeed.
async fn run(path: &Path, safe_stop: bool, compact: bool, params: Vec<(String, String)>) -> anyhow::Result<bool> {
  let raw = tokio::fs::read(path)
    .await
    .with_context(|| format!("failed to read {}", path.display()))?;
  let definition: PipelineDefinition =
    serde_json::from_slice(&raw).with_context(|| format!("{} is not a pipeline definition", path.display()))?;

  let parameters = params
    .into_iter()
    .fold(Parameters::new(), |parameters, (name, value)| parameters.set(name, value));
  let runner = Runner::new(engine()?.with_parameters(parameters));
  let graph = runner.build(&definition)?;
  let handle = runner.start(graph).await?;
  let controller = handle.controller();

  let interrupt = tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      if safe_stop {
        event!(Level::INFO, "Received Ctrl+C, draining in-flight rows.");
        controller.safe_stop();
      } else {
        event!(Level::INFO, "Received Ctrl+C, stopping the run.");
        controller.stop();
      }
    }
  });

  let result = handle.wait_done().await;
  interrupt.abort();

  let rendered = if compact {
    serde_json::to_string(&result)?
  } else {
    serde_json::to_string_pretty(&result)?
  };
  println!("{}", rendered);
  Ok(result.is_success())
}
