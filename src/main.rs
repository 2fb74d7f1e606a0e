mod api;
mod config;
mod dcc;
mod error;
mod irc;
mod log;
mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::log::{LogSink, RingBufferLayer};
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub log_sink: LogSink,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_sink = LogSink::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dccbot=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(RingBufferLayer::new(log_sink.clone()))
        .init();

    tracing::info!("starting dccbot");

    let config_path =
        std::env::var("DCCBOT_CONFIG_FILE").unwrap_or_else(|_| "config.json".to_string());
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("config error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "config loaded: {} server(s) configured, download_path={}",
        config.servers.len(),
        config.global.download_path
    );

    if let Err(e) = tokio::fs::create_dir_all(&config.global.download_path).await {
        tracing::error!("could not create download_path: {}", e);
        std::process::exit(1);
    }

    let transfer_list_timeout = config.global.transfer_list_timeout as i64;
    let supervisor = Supervisor::new(config);

    let reaper_registry = supervisor.registry().clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            reaper_registry.reap(transfer_list_timeout).await;
        }
    });

    let state = AppState {
        supervisor,
        log_sink,
    };

    let app = Router::new().merge(api::routes()).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!("listening on {}", addr);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("bind failed: {}", e);
            std::process::exit(2);
        }
    };

    axum::serve(listener, app).await?;

    Ok(())
}
