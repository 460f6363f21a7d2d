#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use envoy_operator_controller::{deployment, envoy, owned, Ctx, OWNED_SELECTOR};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::runtime::watcher;
use tokio::{sync::mpsc, time};
use tracing::Instrument;

#[derive(Parser)]
#[command(version)]
struct Args {
    #[arg(
        long,
        env = "ENVOY_OPERATOR_LOG_LEVEL",
        default_value = "envoy_operator_controller=info,warn"
    )]
    log_level: kubert::LogFilter,

    #[arg(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[command(flatten)]
    client: kubert::ClientArgs,

    #[command(flatten)]
    admin: kubert::AdminArgs,

    /// Only reconcile Envoy resources matching this label selector
    #[arg(long, short = 'l')]
    label_selector: Option<String>,

    /// Image of the init container that renders the bootstrap config
    #[arg(
        long,
        env = "ENVOY_OPERATOR_INIT_IMAGE",
        default_value = deployment::DEFAULT_INIT_IMAGE
    )]
    init_image: String,

    /// Timeout, in seconds, for each write to the API server
    #[arg(long, default_value = "10")]
    write_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        label_selector,
        init_image,
        write_timeout_secs,
    } = Args::parse();

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let envoys_config = match label_selector {
        Some(ref selector) => watcher::Config::default().labels(selector),
        None => watcher::Config::default(),
    };
    let (envoys, envoys_events) = runtime.cache_all(envoys_config);
    let (deployments, deployments_events) =
        runtime.cache_all::<Deployment>(watcher::Config::default().labels(OWNED_SELECTOR));
    let (config_maps, config_maps_events) =
        runtime.cache_all::<ConfigMap>(watcher::Config::default().labels(OWNED_SELECTOR));
    let (creates_tx, creates_rx) = mpsc::channel(1000);
    let ctx = Ctx {
        envoys,
        deployments,
        config_maps,
        creates: creates_tx,
        init_image: init_image.into(),
    };

    tokio::spawn(
        ctx.clone()
            .process(deployments_events, owned::handle::<Deployment>)
            .instrument(tracing::info_span!("deployments")),
    );
    tokio::spawn(
        ctx.clone()
            .process(config_maps_events, owned::handle::<ConfigMap>)
            .instrument(tracing::info_span!("configmaps")),
    );
    tokio::spawn(
        ctx.process(envoys_events, envoy::handle)
            .instrument(tracing::info_span!("envoy")),
    );

    // Spawn a task that creates owned objects when any of the above watches detect changes.
    // Serializing all writes on a single task avoids racing creates for the same envoy.
    let write_timeout = time::Duration::from_secs(write_timeout_secs);
    tokio::spawn(
        runtime
            .cancel_on_shutdown(envoy::apply_creates(
                creates_rx,
                runtime.client(),
                write_timeout,
            ))
            .instrument(tracing::info_span!("create")),
    );

    // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
    // complete before exiting.
    if runtime.run().await.is_err() {
        bail!("aborted");
    }

    Ok(())
}
