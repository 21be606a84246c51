//! wshub CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wshub::server::{
    run_redirect_server, run_tls_websocket_server, run_websocket_server, Hub, TlsPaths, WsState,
};
use wshub::HubConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            cert,
            key,
            redirect_bind,
            max_message_size,
            send_buffer,
            broadcast_buffer,
            pong_wait_secs,
            write_wait_secs,
            max_sessions,
            no_echo,
        } => {
            let mut config = HubConfig::default()
                .max_message_size(max_message_size)
                .send_buffer(send_buffer)
                .broadcast_buffer(broadcast_buffer)
                .deadlines(Duration::from_secs(pong_wait_secs), Duration::from_secs(write_wait_secs))
                .echo_to_sender(!no_echo);
            if let Some(max) = max_sessions {
                config = config.max_sessions(max);
            }

            let tls = match (cert, key) {
                (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
                _ => None,
            };

            serve(bind, tls, redirect_bind, config).await
        }
        Commands::Connect { url, show_heartbeats } => cli::connect(&url, show_heartbeats).await,
    }
}

async fn serve(
    bind: SocketAddr,
    tls: Option<TlsPaths>,
    redirect_bind: Option<SocketAddr>,
    config: HubConfig,
) -> Result<()> {
    let (hub, handle) = Hub::new(&config);
    let hub_task = tokio::spawn(hub.run());

    let stop = CancellationToken::new();

    let redirect_task = redirect_bind.map(|addr| {
        let stop = stop.clone();
        tokio::spawn(async move { run_redirect_server(addr, stop.cancelled_owned()).await })
    });

    info!(addr = %bind, tls = tls.is_some(), "wshub starting");

    let state = WsState::new(handle.clone(), config);
    let shutdown = stop.clone().cancelled_owned();
    let server = async move {
        match tls {
            Some(tls) => run_tls_websocket_server(bind, tls, state, shutdown).await,
            None => run_websocket_server(bind, state, shutdown).await,
        }
    };
    tokio::pin!(server);

    // Run server with graceful shutdown on signals
    tokio::select! {
        result = &mut server => {
            result?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
            stop.cancel();
            // Closing the hub closes every outbound queue; pumps send a close frame on the way out
            handle.shutdown();
            server.await?;
        }
    }

    stop.cancel();
    if let Some(task) = redirect_task {
        task.await??;
    }

    handle.shutdown();
    hub_task.await?;

    info!("wshub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
