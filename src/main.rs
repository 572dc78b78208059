use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_core::IdGenerator;
use relay_server::ServerConfig;
use relay_telemetry::{MetricsRecorder, TelemetryConfig};

/// WebSocket publish/subscribe relay.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Datacenter id embedded in session identifiers (0-255).
    #[arg(long, env = "RELAY_DATACENTER_ID", default_value_t = 1, allow_negative_numbers = true)]
    datacenter_id: i64,

    /// Worker id embedded in session identifiers (0-255).
    #[arg(long, env = "RELAY_WORKER_ID", default_value_t = 1, allow_negative_numbers = true)]
    worker_id: i64,

    /// Outbound queue capacity per session before it is evicted.
    #[arg(long, env = "RELAY_SEND_QUEUE", default_value_t = 256)]
    send_queue: usize,

    #[arg(long, env = "RELAY_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// Emit JSON log lines.
    #[arg(long, env = "RELAY_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    relay_telemetry::init_telemetry(&TelemetryConfig {
        json: args.log_json,
        ..Default::default()
    });

    tracing::info!("Starting relay server");

    let ids = IdGenerator::new(args.datacenter_id, args.worker_id)
        .context("invalid identifier configuration")?;
    tracing::info!(
        datacenter_id = ids.datacenter_id(),
        worker_id = ids.worker_id(),
        "Identifier generator ready"
    );

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_send_queue: args.send_queue,
        ..Default::default()
    };
    let metrics = Arc::new(MetricsRecorder::new());
    let handle = relay_server::start(config, Arc::new(ids), metrics)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "Relay server ready");

    shutdown_signal().await;
    tracing::info!("Shutting down");

    handle
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await
        .context("forced shutdown")?;

    tracing::info!("Relay server exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
