//! Pod Debug Controller
//!
//! Watches one Deployment or StatefulSet kind and relaunches a chosen
//! container under the Delve debug agent, exposing the agent through a
//! NodePort Service owned by the workload.

mod backoff;
mod client;
mod controller;
mod error;
mod launch;
mod mutator;
mod reconciler;
mod retry;
mod service;
mod watcher;
mod workload;
#[cfg(test)]
mod test_utils;

use anyhow::Context;
use clap::Parser;
use controller::Controller;
use debug_profile::DebugProfile;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Relaunch a workload container under a remote debug agent.
#[derive(Debug, Parser)]
#[command(name = "pod-debug", version, about)]
struct Args {
    /// Path to the debug profile
    #[arg(short = 'c', long, env = "POD_DEBUG_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Log observations only; never modify workloads or Services
    #[arg(short = 'w', long, env = "POD_DEBUG_OBSERVE_ONLY")]
    observe_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // kube's rustls backend needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting pod debug controller");

    let profile = match DebugProfile::load(&args.config) {
        Ok(profile) => Arc::new(profile),
        Err(e) => {
            error!("Invalid debug profile {}: {}", args.config.display(), e);
            return Err(e).with_context(|| format!("loading {}", args.config.display()));
        }
    };

    info!("Configuration:");
    info!("  Profile: {}", profile.name);
    info!("  Namespace: {}", profile.namespace);
    info!("  Workload kind: {}", profile.workload_kind);
    info!("  Container: {}", profile.container_name);
    info!("  Debug port: {}", profile.debug_port);
    info!("  Observe only: {}", args.observe_only);

    match launch::write_attach_config(&profile) {
        Ok(path) => info!("Wrote IDE attach configuration to {}", path.display()),
        Err(e) => warn!("Could not write IDE attach configuration: {:#}", e),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let controller = Controller::new(profile, args.observe_only, shutdown)
        .await
        .context("starting controller")?;
    controller.run().await.context("running controller")?;

    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
