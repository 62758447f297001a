use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use callhub_server::{
    cli::{run_watch, Cli, Commands, WatchOptions},
    config::Config,
    router, telemetry,
    websocket::SignalingState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);
    telemetry::init_tracing(&config.log_filter)?;

    match cli.command {
        Some(Commands::Watch {
            url,
            room,
            name,
            role,
            listen_secs,
            accept_screen_share,
        }) => {
            run_watch(WatchOptions {
                url,
                room,
                name,
                role,
                listen: Duration::from_secs(listen_secs),
                accept_screen_share,
                join_timeout: config.join_timeout(),
            })
            .await
        }
        Some(Commands::Serve) | None => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let metrics = telemetry::init_metrics()?;
    let signaling = SignalingState::new(&config);
    let app = router(signaling, Some(metrics));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        max_display_name_len = config.max_display_name_len,
        max_chat_len = config.max_chat_len,
        "CallHub listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
