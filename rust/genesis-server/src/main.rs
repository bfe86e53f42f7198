// genesis-control-plane: entry point

use std::net::SocketAddr;

use anyhow::Context;
use genesis_config::Settings;
use genesis_server::{router, ControlPlane};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            // Fail fast before any subsystem spins up.
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        dry_run = settings.dry_run,
        "genesis control plane starting"
    );

    let port = settings.port;
    let mut app = ControlPlane::build(settings)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("control plane construction failed")?;
    app.start();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    info!(%addr, "operational surface listening");

    let server = axum::serve(listener, router(app.health.clone()))
        .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!(error = %err, "http surface failed");
    }

    app.shutdown().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
