//! Kong service registrator entry point.

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info};
use tokio::signal;

mod commands;
mod config;
mod error;
mod extract;
mod gateway;
mod listener;
mod reconcile;
mod runtime;
mod types;

#[cfg(test)]
mod testing;

use config::{Config, Overrides};
use gateway::KongAdminClient;
use reconcile::Reconciler;
use runtime::{ContainerRuntime, DockerRuntime};

#[derive(Parser)]
#[command(name = "kong-registrator")]
#[command(
    about = "Manages the Kong upstream targets of the Docker containers running on this host",
    long_about = None
)]
struct Cli {
    /// Suffix appended to service names to form upstream names
    #[arg(long)]
    dns_name: Option<String>,
    /// Host name used in target addresses (defaults to $HOSTNAME)
    #[arg(long)]
    hostname: Option<String>,
    /// URL of the Kong admin API
    #[arg(long)]
    admin_url: Option<String>,
    /// Verify the TLS certificate of the admin API
    #[arg(long, overrides_with = "no_verify_ssl", action = ArgAction::SetTrue)]
    verify_ssl: bool,
    /// Accept any TLS certificate from the admin API
    #[arg(long, overrides_with = "verify_ssl", action = ArgAction::SetTrue)]
    no_verify_ssl: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronise the upstream targets with the running containers
    Sync,
    /// Keep targets up to date by following Docker container events
    Daemon,
    /// Remove all upstream targets pointing to this host
    #[command(alias = "remove_all")]
    RemoveAll,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let verify_ssl = match (self.verify_ssl, self.no_verify_ssl) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Overrides {
            admin_url: self.admin_url.clone(),
            dns_name: self.dns_name.clone(),
            hostname: self.hostname.clone(),
            verify_ssl,
        }
    }
}

/// Installs the SIGINT and SIGTERM handlers right away and returns a future
/// that resolves once either arrives.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut ctrl_c = signal::windows::ctrl_c()?;
    Ok(async move {
        ctrl_c.recv().await;
    })
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let cfg = Config::load(cli.overrides())?;
    info!("Starting Kong registrator with config: {:?}", cfg);

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect().context("Failed to connect to Docker")?);

    let mut kong = KongAdminClient::new(
        &cfg.admin_url,
        cfg.request_timeout(),
        cfg.verify_ssl,
        cfg.retry_policy(),
    )?;
    kong.probe()
        .await
        .with_context(|| format!("Kong admin API at {} is unreachable", cfg.admin_url))?;

    let reconciler = Arc::new(Reconciler::new(
        runtime.clone(),
        Arc::new(kong),
        cfg.host_identity(),
    ));

    let ok = match cli.command {
        Commands::Sync => commands::sync(&reconciler).await,
        Commands::RemoveAll => commands::remove_all(&reconciler).await,
        Commands::Daemon => {
            let shutdown = shutdown_signal().context("Failed to install signal handlers")?;
            commands::daemon(reconciler, runtime, cfg.shutdown_timeout(), shutdown).await
        }
    };
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
