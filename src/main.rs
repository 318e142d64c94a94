use anyhow::Result;
use axum::routing::any;
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use taskmesh::api::ApiServer;
use taskmesh::chat::ChatClient;
use taskmesh::config::GatewayConfig;
use taskmesh::gateway::{ws_server, Gateway};
use tracing::info;

/// Cloud-side gateway process: accepts agent connections and the admin API.
#[derive(Parser, Debug)]
#[command(name = "taskmesh-gateway")]
struct Args {
    /// Overrides RUST_LOG / the default "info" level.
    #[arg(long)]
    log_level: Option<String>,
}

/// Placeholder chat collaborator: the real chat-platform integration (block
/// formatting, threading, reactions) is an external collaborator out of
/// scope for this crate. This logs what would have been posted/edited so the
/// gateway is runnable standalone.
struct LoggingChatClient;

#[async_trait::async_trait]
impl ChatClient for LoggingChatClient {
    async fn post(&self, origin: &taskmesh::models::ChatOrigin, text: &str) -> taskmesh::Result<String> {
        info!(channel = %origin.channel_id, len = text.len(), "chat post (no platform wired)");
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn edit(&self, origin: &taskmesh::models::ChatOrigin, message_id: &str, text: &str) -> taskmesh::Result<()> {
        info!(channel = %origin.channel_id, message_id, len = text.len(), "chat edit (no platform wired)");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = args
        .log_level
        .unwrap_or_else(|| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    info!("starting taskmesh gateway");

    let config = GatewayConfig::load()?;
    let addr = format!("{}:{}", config.host, config.port);

    let gateway = Arc::new(Gateway::new(config, Arc::new(LoggingChatClient)));
    gateway.spawn_background_loops();

    let api = ApiServer::new(gateway.clone());
    let admin_router: Router<()> = api.build_router();
    let ws_router: Router<()> = Router::new()
        .route("/agent", any(ws_server::upgrade))
        .with_state(gateway.clone());

    let app = admin_router.merge(ws_router);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
