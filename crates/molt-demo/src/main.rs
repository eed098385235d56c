use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod http;
mod shutdown;
mod telemetry;
mod udp;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    telemetry::init(config.log_format).context("Failed to init telemetry")?;

    info!("molt demo starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(pid = std::process::id(), "Process started");
    config.log_config();

    if config.http.is_empty() && config.udp.is_empty() {
        bail!("no listeners configured");
    }

    let handover = molt::Handover::from_env().context("Failed to read inherited listeners")?;
    if handover.is_inherited() {
        info!("Inherited listeners from parent process (graceful restart)");
    }

    // Subscribe before serving, so a reload sent as soon as a port answers is
    // handled rather than killing the process.
    let signals = molt::UnixSignals::subscribe().context("Failed to subscribe to signals")?;
    let respawner = molt::Respawner::for_current_process(Arc::clone(handover.registry()))
        .context("Failed to resolve the successor command")?;

    let stop = CancellationToken::new();
    let mut servers = JoinSet::new();

    for address in &config.http {
        let listener = handover
            .listen_tcp(address)
            .with_context(|| format!("Failed to acquire HTTP listener {address}"))?;
        servers.spawn(http::serve(listener, stop.clone()));
    }

    for address in &config.udp {
        let socket = handover
            .listen_udp(address)
            .with_context(|| format!("Failed to acquire UDP socket {address}"))?;
        servers.spawn(udp::serve(socket, stop.clone()));
    }

    let drain_timeout = config.drain_timeout();
    let signal = handover
        .on_signal_with(signals, respawner, move |hurry| {
            stop.cancel();
            shutdown::drain(servers, hurry, drain_timeout)
        })
        .await
        .context("Shutdown lifecycle failed")?;

    info!(signal = ?signal, "Shutdown lifecycle complete");
    Ok(())
}
