// rowflow-node/src/cli.rs

//! Command line of the worker binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7440";

#[derive(Debug, Parser)]
#[command(name = "rowflow-node", version, about = "Runs rowflow pipelines locally or as a cluster worker.")]
pub struct Cli {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Accept pipelines submitted by supervisors.
  Serve {
    /// Address to listen on.
    #[arg(long, env = "ROWFLOW_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: String,
  },
  /// Run a pipeline definition (JSON) to completion and print its result.
  Run {
    definition: PathBuf,
    /// Stop sources and let in-flight rows drain on Ctrl+C instead of stopping at once.
    #[arg(long)]
    safe_stop: bool,
    /// Print the result on one line.
    #[arg(long)]
    compact: bool,
    /// Parameter value as NAME=VALUE; repeatable. Overrides the definition's defaults.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_string(), value.to_string())),
    _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
  }
}
