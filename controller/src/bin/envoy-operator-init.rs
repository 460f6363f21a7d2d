#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use envoy_operator_controller::{deployment, downward::Values, init};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Renders an Envoy bootstrap config with downward-API data.
struct Args {
    /// The config template
    #[arg(long)]
    input: PathBuf,

    /// Where the rendered config is written
    #[arg(long)]
    output: PathBuf,

    /// Directory holding the downward-API `labels` and `annotations` files
    #[arg(long, default_value = deployment::DOWNWARD_PATH)]
    podinfo: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Args {
        input,
        output,
        podinfo,
    } = Args::parse();

    let values = Values::from_env_and_dir(&podinfo)
        .with_context(|| format!("failed to read podinfo from {}", podinfo.display()))?;
    init::render_file(&input, &output, &values)?;

    tracing::info!(input = %input.display(), output = %output.display(), "rendered config");
    Ok(())
}
