//! bor-daemon - builds and tests submitted exercises over TCP
//!
//! Each connection carries one JSON request with gzip+base64 encoded
//! sources. The sources are built with `make` and every resulting test
//! executable runs in the configured sandbox; the daemon answers with one
//! JSON array of TAP results.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use bor_core::sandbox::DriverRegistry;
use bor_core::Service;
use config::DaemonArgs;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bor=info".parse()?))
        .init();

    let args = DaemonArgs::parse();
    let config = args.load().inspect_err(|e| {
        tracing::error!(error = %format!("{e:#}"), "invalid configuration");
    })?;
    tracing::info!(
        listen = %config.listen,
        build_driver = %config.build_driver,
        test_driver = %config.test_driver,
        max_connections = config.max_connections,
        "configuration loaded"
    );

    let registry = DriverRegistry::with_builtin(&config.easysandbox);
    tracing::debug!(drivers = ?registry.names(), "sandbox drivers registered");

    let listen = config.listen.clone();
    let service = Service::new(config, &registry).inspect_err(|e| {
        tracing::error!(error = %e, "cannot start service");
    })?;

    let listener = TcpListener::bind(&listen)
        .await
        .inspect_err(|e| tracing::error!(listen = %listen, error = %e, "cannot listen"))
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let shutdown = async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "shutdown requested");
        }
    };

    server::run(listener, service, shutdown).await?;
    signals_handle.close();

    tracing::info!("bor-daemon stopped");
    Ok(())
}
