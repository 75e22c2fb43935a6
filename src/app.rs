//! Application lifecycle: initialization, task orchestration, and shutdown.
//! Structure mirrors the teacher's `app.rs`, trimmed to this service's
//! single long-running task (the public HTTP server).

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::ipecho;
use crate::manager::ClientManager;
use crate::state::{AppState, HubMetrics};

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.domain,
        bind_addr = %config.bind_addr,
        "tunnelhub starting"
    );

    let reqwest_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");

    if let Some(ip) = ipecho::public_ip(&reqwest_client, Duration::from_millis(config.public_ip_timeout_ms)).await {
        info!(public_ip = %ip, "resolved public IP");
    } else {
        info!("public IP lookup failed or timed out, continuing without it");
    }

    let manager = ClientManager::new(
        config.max_clients,
        config.max_tcp_sockets,
        Duration::from_millis(config.socket_timeout_ms),
        config.domain.clone(),
        config.url_scheme(),
    );

    let state = Arc::new(AppState {
        config: Arc::new(config),
        manager,
        reqwest_client,
        metrics: Arc::new(HubMetrics::new()),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_state = Arc::clone(&state);
    let server_handle = tokio::spawn(async move { crate::server::run(server_state, shutdown_rx).await });

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = server_handle.await? {
        tracing::error!(error = %e, "server task ended with error");
    }

    info!("tunnelhub stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
