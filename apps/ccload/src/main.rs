use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("CCLOAD_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let boot = ccload_core::bootstrap_from_env().await?;
    let global = boot.state.config();
    let shutdown_timeout = Duration::from_secs(global.shutdown_timeout_secs);
    let bind = format!("{}:{}", global.host, global.port);

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let health_handle = ccload_core::spawn_health_refresh(boot.state.clone(), shutdown_tx.subscribe());
    let cleanup_handle = ccload_core::spawn_log_cleanup(boot.state.clone(), shutdown_tx.subscribe());
    let registry = boot.state.registry.clone();

    let router = ccload_router::build_router(boot.state.clone(), shutdown_tx.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(event = "listening", addr = %bind);

    let shutdown_signal = {
        let admin_shutdown = shutdown_tx.subscribe();
        let shutdown_tx = shutdown_tx.clone();
        async move {
            wait_for_shutdown_request(admin_shutdown).await;
            registry.cancel_all();
            let _ = shutdown_tx.send(true);
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Drop our own handle on the state so the telemetry sender's last
    // clone goes away once the spawned workers below also release
    // theirs, letting the writer loop observe channel closure and
    // flush its final batch instead of the process just exiting.
    drop(boot.state);

    let drain = async {
        let _ = health_handle.await;
        let _ = cleanup_handle.await;
        for handle in boot.worker_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        tracing::warn!(
            event = "shutdown_deadline_exceeded",
            "worker tasks did not exit before the configured shutdown deadline"
        );
    }

    Ok(())
}

/// Races OS signals against an admin-triggered restart request; either
/// source begins the same graceful shutdown sequence.
async fn wait_for_shutdown_request(mut admin_shutdown: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(event = "shutdown_signal", source = "ctrl_c"),
        _ = terminate => tracing::info!(event = "shutdown_signal", source = "sigterm"),
        _ = admin_shutdown.changed() => tracing::info!(event = "shutdown_signal", source = "admin_api"),
    }
}
