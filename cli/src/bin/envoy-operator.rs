use anyhow::{Context, Result};
use clap::Parser;
use envoy_operator_cli::{check, render, status};
use envoy_operator_controller::{deployment, Envoy};
use kube::CustomResourceExt;
use kubert::ClientArgs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Manages the Envoy operator.
struct Cli {
    #[command(flatten)]
    client: kubert::ClientArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone)]
enum OutputMode {
    Table,
    Json,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Output the Envoy custom resource definition
    Crd,

    /// Output the objects the operator creates for an Envoy manifest
    Render {
        /// Path to an Envoy manifest, in JSON
        #[arg(short, long)]
        file: PathBuf,

        /// Image of the config-rendering init container
        #[arg(long, default_value = deployment::DEFAULT_INIT_IMAGE)]
        init_image: String,
    },

    /// Check the operator installation for potential problems
    Check {
        /// Check a cluster before installation
        #[arg(long)]
        pre: bool,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: OutputMode,
    },

    /// Get the deployment status of Envoys in the cluster
    Status {
        /// Label selector for Envoys
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        output: OutputMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { client, command } = Cli::parse();

    match command {
        Commands::Crd => {
            serde_json::to_writer_pretty(std::io::stdout(), &Envoy::crd())?;
            println!();
        }

        Commands::Render { file, init_image } => {
            let envoy = render::read_envoy(&file)?;
            let list = render::render(&envoy, &init_image)?;
            serde_json::to_writer_pretty(std::io::stdout(), &list)?;
            println!();
        }

        Commands::Check { output, pre } => {
            let client = try_client(client).await?;

            let results = check::run_checks(client, pre).await;
            let success = match output {
                OutputMode::Table => check::print_checks(results),
                OutputMode::Json => check::json_print_checks(results)?,
            };

            if !success {
                std::process::exit(1);
            }
        }

        Commands::Status {
            output,
            label_selector,
        } => {
            let client = try_client(client).await?;

            let results = status::status(client, label_selector.as_deref()).await?;
            match output {
                OutputMode::Table => status::print_status(&results),
                OutputMode::Json => status::json_print_status(&results)?,
            }
        }
    };

    Ok(())
}

async fn try_client(client: ClientArgs) -> Result<kubert::client::Client> {
    client
        .try_client()
        .await
        .context("failed to load a Kubernetes client configuration")
}
